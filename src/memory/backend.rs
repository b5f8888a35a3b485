//! 记忆后端统一接口
//!
//! 所有后端（ephemeral / filesystem / long-term / composite）实现 MemoryBackend：
//! append、read(range)、replace_range（仅供压缩使用：用一条摘要替换连续区间）。
//! 条目只追加，不原地修改。

use std::fmt;
use std::ops::Range;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::Message;

/// 记忆后端错误：对会话是致命的（无法可靠继续）
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("Corrupted record in {key}: {detail}")]
    Corrupted { key: String, detail: String },

    #[error("Invalid range {start}..{end} for {key} (len {len})")]
    InvalidRange {
        key: String,
        start: usize,
        end: usize,
        len: usize,
    },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// 记忆键：会话 id + 分段（如 "main"、"profile"）
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryKey {
    pub session_id: String,
    pub segment: String,
}

impl MemoryKey {
    pub fn new(session_id: impl Into<String>, segment: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            segment: segment.into(),
        }
    }

    /// 会话主日志分段
    pub fn main(session_id: impl Into<String>) -> Self {
        Self::new(session_id, "main")
    }
}

impl fmt::Display for MemoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.segment)
    }
}

/// 后端标签
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendTag {
    Ephemeral,
    Filesystem,
    LongTerm,
    Composite,
}

impl BackendTag {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "ephemeral" => Some(BackendTag::Ephemeral),
            "filesystem" => Some(BackendTag::Filesystem),
            "long-term" | "long_term" | "longterm" => Some(BackendTag::LongTerm),
            "composite" => Some(BackendTag::Composite),
            _ => None,
        }
    }
}

/// 读取范围
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadRange {
    All,
    /// 最近 n 条
    Tail(usize),
    /// [start, end)，越界部分被截断
    Span(Range<usize>),
}

impl ReadRange {
    /// 针对长度 len 解析为实际下标区间
    pub fn resolve(&self, len: usize) -> Range<usize> {
        match self {
            ReadRange::All => 0..len,
            ReadRange::Tail(n) => len.saturating_sub(*n)..len,
            ReadRange::Span(r) => {
                let start = r.start.min(len);
                let end = r.end.min(len).max(start);
                start..end
            }
        }
    }
}

/// 一个键下的完整记录（键 + 有序条目 + 后端标签）
#[derive(Clone, Debug)]
pub struct MemoryRecord {
    pub key: MemoryKey,
    pub entries: Vec<Message>,
    pub backend: BackendTag,
}

/// 记忆后端 trait
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    fn tag(&self) -> BackendTag;

    /// 追加一条，返回其下标
    async fn append(&self, key: &MemoryKey, entry: &Message) -> Result<usize, MemoryError>;

    async fn read(&self, key: &MemoryKey, range: ReadRange) -> Result<Vec<Message>, MemoryError>;

    /// 用 summary 替换 [range.start, range.end)；仅由压缩调用
    async fn replace_range(
        &self,
        key: &MemoryKey,
        range: Range<usize>,
        summary: &Message,
    ) -> Result<(), MemoryError>;

    async fn len(&self, key: &MemoryKey) -> Result<usize, MemoryError>;
}

/// 校验 replace 区间合法（非空且不越界）
pub(crate) fn check_range(key: &MemoryKey, range: &Range<usize>, len: usize) -> Result<(), MemoryError> {
    if range.start >= range.end || range.end > len {
        return Err(MemoryError::InvalidRange {
            key: key.to_string(),
            start: range.start,
            end: range.end,
            len,
        });
    }
    Ok(())
}
