//! 长期记忆后端：SQLite（sqlx 连接池），跨会话保留
//!
//! 两张表：
//! - `entries`：按 (session_id, segment, seq) 存放会话日志条目，seq 始终连续 0..len
//! - `facts`：跨会话的用户事实（偏好、地址等），按 (subject, fact_key) 覆盖写
//!
//! 该后端被多个会话共享；写操作由内部互斥锁串行化并在事务中执行。

use std::ops::Range;
use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::Mutex;

use crate::memory::backend::check_range;
use crate::memory::{BackendTag, MemoryBackend, MemoryError, MemoryKey, Message, ReadRange};

pub struct LongTermBackend {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl LongTermBackend {
    /// 打开（不存在则创建）数据库文件
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;
        Self::from_pool(pool).await
    }

    /// 进程内数据库（单连接，否则每个连接各是一个独立库）
    pub async fn in_memory() -> Result<Self, MemoryError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, MemoryError> {
        let backend = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        backend.init_tables().await?;
        Ok(backend)
    }

    async fn init_tables(&self) -> Result<(), MemoryError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS entries (
                session_id TEXT NOT NULL,
                segment TEXT NOT NULL,
                seq INTEGER NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (session_id, segment, seq)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS facts (
                subject TEXT NOT NULL,
                fact_key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (subject, fact_key)
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// 记住一条跨会话事实（同键覆盖）
    pub async fn remember_fact(&self, subject: &str, key: &str, value: &str) -> Result<(), MemoryError> {
        let _guard = self.write_lock.lock().await;
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO facts (subject, fact_key, value, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(subject, fact_key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(subject)
        .bind(key)
        .bind(value)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 某主体的全部事实，按键排序
    pub async fn recall_facts(&self, subject: &str) -> Result<Vec<(String, String)>, MemoryError> {
        let rows = sqlx::query("SELECT fact_key, value FROM facts WHERE subject = ? ORDER BY fact_key ASC")
            .bind(subject)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("fact_key"), r.get::<String, _>("value")))
            .collect())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn count(&self, key: &MemoryKey) -> Result<usize, MemoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM entries WHERE session_id = ? AND segment = ?")
            .bind(&key.session_id)
            .bind(&key.segment)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.get("n");
        Ok(n.max(0) as usize)
    }
}

fn decode(key: &MemoryKey, seq: i64, payload: &str) -> Result<Message, MemoryError> {
    serde_json::from_str(payload).map_err(|e| MemoryError::Corrupted {
        key: key.to_string(),
        detail: format!("seq {}: {}", seq, e),
    })
}

#[async_trait]
impl MemoryBackend for LongTermBackend {
    fn tag(&self) -> BackendTag {
        BackendTag::LongTerm
    }

    async fn append(&self, key: &MemoryKey, entry: &Message) -> Result<usize, MemoryError> {
        let _guard = self.write_lock.lock().await;
        let payload = serde_json::to_string(entry)?;
        let seq = self.count(key).await?;
        sqlx::query("INSERT INTO entries (session_id, segment, seq, payload) VALUES (?, ?, ?, ?)")
            .bind(&key.session_id)
            .bind(&key.segment)
            .bind(seq as i64)
            .bind(&payload)
            .execute(&self.pool)
            .await?;
        Ok(seq)
    }

    async fn read(&self, key: &MemoryKey, range: ReadRange) -> Result<Vec<Message>, MemoryError> {
        let len = self.count(key).await?;
        let span = range.resolve(len);
        if span.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT seq, payload FROM entries
             WHERE session_id = ? AND segment = ? AND seq >= ? AND seq < ?
             ORDER BY seq ASC",
        )
        .bind(&key.session_id)
        .bind(&key.segment)
        .bind(span.start as i64)
        .bind(span.end as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| decode(key, r.get("seq"), &r.get::<String, _>("payload")))
            .collect()
    }

    async fn replace_range(
        &self,
        key: &MemoryKey,
        range: Range<usize>,
        summary: &Message,
    ) -> Result<(), MemoryError> {
        let _guard = self.write_lock.lock().await;
        let len = self.count(key).await?;
        check_range(key, &range, len)?;

        let mut tx = self.pool.begin().await?;
        let tail_rows = sqlx::query(
            "SELECT payload FROM entries
             WHERE session_id = ? AND segment = ? AND seq >= ?
             ORDER BY seq ASC",
        )
        .bind(&key.session_id)
        .bind(&key.segment)
        .bind(range.end as i64)
        .fetch_all(&mut *tx)
        .await?;
        let tail: Vec<String> = tail_rows.iter().map(|r| r.get("payload")).collect();

        sqlx::query("DELETE FROM entries WHERE session_id = ? AND segment = ? AND seq >= ?")
            .bind(&key.session_id)
            .bind(&key.segment)
            .bind(range.start as i64)
            .execute(&mut *tx)
            .await?;

        let summary_payload = serde_json::to_string(summary)?;
        let renumbered = std::iter::once(summary_payload).chain(tail);
        for (offset, payload) in renumbered.enumerate() {
            sqlx::query("INSERT INTO entries (session_id, segment, seq, payload) VALUES (?, ?, ?, ?)")
                .bind(&key.session_id)
                .bind(&key.segment)
                .bind((range.start + offset) as i64)
                .bind(&payload)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn len(&self, key: &MemoryKey) -> Result<usize, MemoryError> {
        self.count(key).await
    }
}
