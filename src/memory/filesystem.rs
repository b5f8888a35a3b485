//! 文件系统记忆后端：每个 (会话, 分段) 一个 JSON Lines 日志文件
//!
//! 追加只写一行；压缩把当前窗口整体写入临时文件再 rename 覆盖，文件大小随窗口收缩。
//! 各键的窗口首次访问时从文件加载并缓存，此后读取不再重放文件。
//! 末尾一行不完整（写到一半崩溃）时跳过并立即重写修复；中间行损坏则报 Corrupted。

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::memory::backend::check_range;
use crate::memory::{BackendTag, MemoryBackend, MemoryError, MemoryKey, Message, ReadRange};

/// 日志文件中的一行
#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    entry: Message,
}

/// 文件系统后端
pub struct FilesystemBackend {
    root: PathBuf,
    /// 串行化写入；缓存各键当前窗口
    windows: Mutex<HashMap<MemoryKey, Vec<Message>>>,
}

impl FilesystemBackend {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 键 -> 文件路径；会话 id 中的非安全字符做十六进制转义（子会话 id 含 '/'）
    fn path_for(&self, key: &MemoryKey) -> PathBuf {
        self.root
            .join(escape_component(&key.session_id))
            .join(format!("{}.jsonl", escape_component(&key.segment)))
    }

    /// 从文件加载窗口；不完整的末行被丢弃并重写文件
    async fn load(&self, key: &MemoryKey) -> Result<Vec<Message>, MemoryError> {
        let path = self.path_for(key);
        let data = match fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<(usize, &str)> = data
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .collect();
        let mut entries = Vec::with_capacity(lines.len());
        let mut torn = false;
        for (pos, (line_no, line)) in lines.iter().enumerate() {
            match serde_json::from_str::<LogRecord>(line) {
                Ok(record) => entries.push(record.entry),
                Err(e) if pos + 1 == lines.len() => {
                    tracing::warn!(
                        key = %key,
                        line = line_no + 1,
                        error = %e,
                        "skipping torn trailing line in memory log"
                    );
                    torn = true;
                }
                Err(e) => {
                    return Err(MemoryError::Corrupted {
                        key: key.to_string(),
                        detail: format!("line {}: {}", line_no + 1, e),
                    })
                }
            }
        }

        // 不完整的末行也可能缺换行符，必须先修复再追加
        if torn || (!data.is_empty() && !data.ends_with('\n')) {
            self.rewrite(key, &entries).await?;
        }
        Ok(entries)
    }

    /// 取缓存窗口，未命中时从文件加载
    async fn window<'m>(
        &self,
        windows: &'m mut HashMap<MemoryKey, Vec<Message>>,
        key: &MemoryKey,
    ) -> Result<&'m mut Vec<Message>, MemoryError> {
        match windows.entry(key.clone()) {
            Entry::Occupied(slot) => Ok(slot.into_mut()),
            Entry::Vacant(slot) => {
                let loaded = self.load(key).await?;
                Ok(slot.insert(loaded))
            }
        }
    }

    async fn append_line(&self, key: &MemoryKey, entry: &Message) -> Result<(), MemoryError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(&LogRecord { entry: entry.clone() })?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// 整体写入临时文件后 rename 覆盖原文件
    async fn rewrite(&self, key: &MemoryKey, entries: &[Message]) -> Result<(), MemoryError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut body = String::new();
        for entry in entries {
            body.push_str(&serde_json::to_string(&LogRecord { entry: entry.clone() })?);
            body.push('\n');
        }
        let tmp = path.with_extension("jsonl.tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(body.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;
        tracing::debug!(key = %key, entries = entries.len(), "memory log rewritten");
        Ok(())
    }
}

fn escape_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            out.push(c);
        } else {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{:02X}", b));
            }
        }
    }
    if out.is_empty() {
        out.push_str("%00");
    }
    out
}

#[async_trait]
impl MemoryBackend for FilesystemBackend {
    fn tag(&self) -> BackendTag {
        BackendTag::Filesystem
    }

    async fn append(&self, key: &MemoryKey, entry: &Message) -> Result<usize, MemoryError> {
        let mut windows = self.windows.lock().await;
        let index = self.window(&mut windows, key).await?.len();
        if let Err(e) = self.append_line(key, entry).await {
            // 文件末尾可能留下半行：丢弃缓存，下次访问时重新加载并修复
            windows.remove(key);
            return Err(e);
        }
        self.window(&mut windows, key).await?.push(entry.clone());
        Ok(index)
    }

    async fn read(&self, key: &MemoryKey, range: ReadRange) -> Result<Vec<Message>, MemoryError> {
        let mut windows = self.windows.lock().await;
        let entries = self.window(&mut windows, key).await?;
        Ok(entries[range.resolve(entries.len())].to_vec())
    }

    async fn replace_range(
        &self,
        key: &MemoryKey,
        range: Range<usize>,
        summary: &Message,
    ) -> Result<(), MemoryError> {
        let mut windows = self.windows.lock().await;
        let entries = self.window(&mut windows, key).await?;
        check_range(key, &range, entries.len())?;
        let mut compacted = entries.clone();
        compacted.splice(range, std::iter::once(summary.clone()));
        self.rewrite(key, &compacted).await?;
        *entries = compacted;
        Ok(())
    }

    async fn len(&self, key: &MemoryKey) -> Result<usize, MemoryError> {
        let mut windows = self.windows.lock().await;
        Ok(self.window(&mut windows, key).await?.len())
    }
}
