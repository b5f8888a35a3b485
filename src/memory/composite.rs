//! 组合后端：按分段前缀路由到具体后端，未命中时落到默认后端
//!
//! 例如 `profile` 分段落到 long-term，`main` 落到 filesystem。路由按声明顺序匹配首个前缀。

use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;

use crate::memory::{BackendTag, MemoryBackend, MemoryError, MemoryKey, Message, ReadRange};

pub struct CompositeBackend {
    routes: Vec<(String, Arc<dyn MemoryBackend>)>,
    fallback: Arc<dyn MemoryBackend>,
}

impl CompositeBackend {
    pub fn new(fallback: Arc<dyn MemoryBackend>) -> Self {
        Self {
            routes: Vec::new(),
            fallback,
        }
    }

    /// 追加一条前缀路由
    pub fn route(mut self, segment_prefix: impl Into<String>, backend: Arc<dyn MemoryBackend>) -> Self {
        self.routes.push((segment_prefix.into(), backend));
        self
    }

    /// 某个键实际落到的后端
    pub fn resolve(&self, key: &MemoryKey) -> &Arc<dyn MemoryBackend> {
        self.routes
            .iter()
            .find(|(prefix, _)| key.segment.starts_with(prefix.as_str()))
            .map(|(_, backend)| backend)
            .unwrap_or(&self.fallback)
    }
}

#[async_trait]
impl MemoryBackend for CompositeBackend {
    fn tag(&self) -> BackendTag {
        BackendTag::Composite
    }

    async fn append(&self, key: &MemoryKey, entry: &Message) -> Result<usize, MemoryError> {
        self.resolve(key).append(key, entry).await
    }

    async fn read(&self, key: &MemoryKey, range: ReadRange) -> Result<Vec<Message>, MemoryError> {
        self.resolve(key).read(key, range).await
    }

    async fn replace_range(
        &self,
        key: &MemoryKey,
        range: Range<usize>,
        summary: &Message,
    ) -> Result<(), MemoryError> {
        self.resolve(key).replace_range(key, range, summary).await
    }

    async fn len(&self, key: &MemoryKey) -> Result<usize, MemoryError> {
        self.resolve(key).len(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::EphemeralBackend;

    #[tokio::test]
    async fn test_routes_by_segment_prefix() {
        let fallback: Arc<dyn MemoryBackend> = Arc::new(EphemeralBackend::new());
        let profile: Arc<dyn MemoryBackend> = Arc::new(EphemeralBackend::new());
        let composite = CompositeBackend::new(fallback.clone()).route("profile", profile.clone());

        let main = MemoryKey::main("s1");
        let prefs = MemoryKey::new("s1", "profile:prefs");
        composite.append(&main, &Message::user("hello")).await.unwrap();
        composite.append(&prefs, &Message::system("likes blue")).await.unwrap();

        assert_eq!(fallback.len(&main).await.unwrap(), 1);
        assert_eq!(fallback.len(&prefs).await.unwrap(), 0);
        assert_eq!(profile.len(&prefs).await.unwrap(), 1);
        assert_eq!(composite.tag(), BackendTag::Composite);
    }
}
