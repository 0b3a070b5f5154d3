use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A capability record learned from upstream behavior: whether the model
/// accepts `max_completion_tokens` in place of `max_tokens`.
#[derive(Debug, Clone, Copy)]
pub struct ModelCapability {
    pub uses_max_completion_tokens: bool,
    pub last_checked: DateTime<Utc>,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CacheKey {
    pub base_url: String,
    pub model: String,
}

impl CacheKey {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

/// Process-wide `(base_url, model)` capability map. Entries are only ever
/// added or overwritten; the timestamp is informational. The cache is
/// advisory: callers override it whenever they observe an upstream error.
#[derive(Clone, Default)]
pub struct CapabilityCache {
    inner: Arc<RwLock<HashMap<CacheKey, ModelCapability>>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &CacheKey) -> Option<ModelCapability> {
        self.inner.read().await.get(key).copied()
    }

    pub async fn put(&self, key: CacheKey, uses_max_completion_tokens: bool) {
        let record = ModelCapability {
            uses_max_completion_tokens,
            last_checked: Utc::now(),
        };
        self.inner.write().await.insert(key, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_returns_absent_until_put() {
        let cache = CapabilityCache::new();
        let key = CacheKey::new("https://api.openai.com/v1", "gpt-4o");
        assert!(cache.get(&key).await.is_none());

        cache.put(key.clone(), false).await;
        let record = cache.get(&key).await.expect("record");
        assert!(!record.uses_max_completion_tokens);
    }

    #[tokio::test]
    async fn put_overwrites_previous_record() {
        let cache = CapabilityCache::new();
        let key = CacheKey::new("base", "model");
        cache.put(key.clone(), true).await;
        cache.put(key.clone(), false).await;
        let record = cache.get(&key).await.expect("record");
        assert!(!record.uses_max_completion_tokens);
    }

    #[tokio::test]
    async fn concurrent_readers_and_writers_settle() {
        let cache = CapabilityCache::new();
        let mut tasks = Vec::new();
        for i in 0..32 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                let key = CacheKey::new("base", format!("model-{}", i % 4));
                cache.put(key.clone(), i % 2 == 0).await;
                cache.get(&key).await
            }));
        }
        for task in tasks {
            assert!(task.await.expect("join").is_some());
        }
    }
}
