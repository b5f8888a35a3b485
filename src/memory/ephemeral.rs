//! 进程内记忆后端：生命周期同进程，适合单次运行与测试

use std::collections::HashMap;
use std::ops::Range;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::memory::backend::check_range;
use crate::memory::{BackendTag, MemoryBackend, MemoryError, MemoryKey, Message, ReadRange};

/// 内存实现：按键存放有序条目
#[derive(Default)]
pub struct EphemeralBackend {
    store: RwLock<HashMap<MemoryKey, Vec<Message>>>,
}

impl EphemeralBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 丢弃某个键下全部条目（会话关闭时调用）
    pub async fn drop_key(&self, key: &MemoryKey) {
        self.store.write().await.remove(key);
    }
}

#[async_trait]
impl MemoryBackend for EphemeralBackend {
    fn tag(&self) -> BackendTag {
        BackendTag::Ephemeral
    }

    async fn append(&self, key: &MemoryKey, entry: &Message) -> Result<usize, MemoryError> {
        let mut store = self.store.write().await;
        let entries = store.entry(key.clone()).or_default();
        entries.push(entry.clone());
        Ok(entries.len() - 1)
    }

    async fn read(&self, key: &MemoryKey, range: ReadRange) -> Result<Vec<Message>, MemoryError> {
        let store = self.store.read().await;
        let Some(entries) = store.get(key) else {
            return Ok(Vec::new());
        };
        Ok(entries[range.resolve(entries.len())].to_vec())
    }

    async fn replace_range(
        &self,
        key: &MemoryKey,
        range: Range<usize>,
        summary: &Message,
    ) -> Result<(), MemoryError> {
        let mut store = self.store.write().await;
        let entries = store.entry(key.clone()).or_default();
        check_range(key, &range, entries.len())?;
        entries.splice(range, std::iter::once(summary.clone()));
        Ok(())
    }

    async fn len(&self, key: &MemoryKey) -> Result<usize, MemoryError> {
        Ok(self.store.read().await.get(key).map(Vec::len).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_read_replace() {
        let backend = EphemeralBackend::new();
        let key = MemoryKey::main("s1");
        for i in 0..4 {
            let idx = backend.append(&key, &Message::user(format!("m{i}"))).await.unwrap();
            assert_eq!(idx, i);
        }
        let tail = backend.read(&key, ReadRange::Tail(2)).await.unwrap();
        assert_eq!(tail[0].content, "m2");

        backend
            .replace_range(&key, 0..2, &Message::system("summary"))
            .await
            .unwrap();
        let all = backend.read(&key, ReadRange::All).await.unwrap();
        let contents: Vec<_> = all.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["summary", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_replace_rejects_bad_range() {
        let backend = EphemeralBackend::new();
        let key = MemoryKey::main("s1");
        backend.append(&key, &Message::user("only")).await.unwrap();
        let err = backend
            .replace_range(&key, 0..3, &Message::system("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidRange { .. }));
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let backend = EphemeralBackend::new();
        backend.append(&MemoryKey::main("parent"), &Message::user("secret")).await.unwrap();
        let child = backend.read(&MemoryKey::main("parent/sub-1"), ReadRange::All).await.unwrap();
        assert!(child.is_empty());
    }
}
