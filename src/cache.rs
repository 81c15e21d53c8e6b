//! Caching wrapper around a document loader
//!
//! Cache storage goes through the pluggable [KvStore]; a failing store
//! degrades the cache to a pass-through, it never breaks loading.

use crate::contexts::preloaded_context;
use crate::error::Error;
use crate::fetch::loader::{DocumentLoader, RemoteDocument};
use crate::kv::{KvKey, KvStore};
use crate::template::{MatchOptions, Template};
use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;
use tracing::warn;
use url::Url;

/// Upper bound on any cache rule's TTL.
const MAX_TTL_DAYS: i64 = 30;

/// What a [CacheRule] applies to.
#[derive(Clone, Debug)]
pub enum RuleMatcher {
    /// Exact string comparison against the URL
    Exact(String),
    /// Comparison against a parsed absolute URL
    Url(Url),
    /// A URI template the URL must match
    Pattern(Template),
}

/// A cache rule: which URLs to cache and for how long.
#[derive(Clone, Debug)]
pub struct CacheRule {
    matcher: RuleMatcher,
    ttl: Duration,
}

impl CacheRule {
    /// Creates a rule. TTLs above 30 days are clamped down.
    pub fn new(matcher: RuleMatcher, ttl: Duration) -> CacheRule {
        let ttl = ttl.min(Duration::days(MAX_TTL_DAYS));
        CacheRule { matcher, ttl }
    }

    /// Rule matching one URL given as a string.
    pub fn exact<S: Into<String>>(url: S, ttl: Duration) -> CacheRule {
        CacheRule::new(RuleMatcher::Exact(url.into()), ttl)
    }

    /// Rule matching one absolute URL.
    pub fn url(url: Url, ttl: Duration) -> CacheRule {
        CacheRule::new(RuleMatcher::Url(url), ttl)
    }

    /// Rule matching every URL the template matches.
    pub fn pattern(template: Template, ttl: Duration) -> CacheRule {
        CacheRule::new(RuleMatcher::Pattern(template), ttl)
    }

    fn applies_to(&self, url: &Url) -> bool {
        match &self.matcher {
            RuleMatcher::Exact(s) => s == url.as_str(),
            RuleMatcher::Url(u) => u == url,
            RuleMatcher::Pattern(t) => t.matches(url.as_str(), &MatchOptions::default()).is_some(),
        }
    }

    /// The rule's time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// A [DocumentLoader] that caches responses in a [KvStore].
///
/// Rules are consulted in declaration order; the first match decides the
/// TTL, no match means no caching. Bundled JSON-LD contexts short-circuit
/// both the store and the network.
pub struct CachedLoader {
    inner: Arc<dyn DocumentLoader>,
    kv: Arc<dyn KvStore>,
    prefix: KvKey,
    rules: Vec<CacheRule>,
}

impl CachedLoader {
    /// Wraps `inner`, storing documents under `[prefix..., "remoteDocument", url]`.
    pub fn new(
        inner: Arc<dyn DocumentLoader>,
        kv: Arc<dyn KvStore>,
        prefix: KvKey,
        rules: Vec<CacheRule>,
    ) -> CachedLoader {
        CachedLoader {
            inner,
            kv,
            prefix: prefix.with("remoteDocument"),
            rules,
        }
    }

    fn rule_for(&self, url: &Url) -> Option<&CacheRule> {
        self.rules.iter().find(|r| r.applies_to(url))
    }

    fn key_for(&self, url: &Url) -> KvKey {
        self.prefix.with(url.as_str())
    }
}

#[async_trait]
impl DocumentLoader for CachedLoader {
    async fn load(&self, url: &Url) -> Result<RemoteDocument, Error> {
        if let Some(context) = preloaded_context(url.as_str()) {
            return Ok(RemoteDocument {
                document_url: url.clone(),
                context_url: None,
                document: context.clone(),
            });
        }

        let Some(rule) = self.rule_for(url) else {
            return self.inner.load(url).await;
        };
        let key = self.key_for(url);

        match self.kv.get(&key).await {
            Ok(Some(value)) => match serde_json::from_value::<RemoteDocument>(value) {
                Ok(document) => return Ok(document),
                Err(error) => warn!("Discarding malformed cache entry for {url}: {error}"),
            },
            Ok(None) => {}
            Err(error) => warn!("Document cache read failed for {url}: {error}"),
        }

        let document = self.inner.load(url).await?;
        match serde_json::to_value(&document) {
            Ok(value) => {
                if let Err(error) = self.kv.set(&key, value, Some(rule.ttl)).await {
                    warn!("Document cache write failed for {url}: {error}");
                }
            }
            Err(error) => warn!("Document cache serialisation failed for {url}: {error}"),
        }
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLoader {
        calls: AtomicUsize,
    }

    impl CountingLoader {
        fn new() -> Arc<CountingLoader> {
            Arc::new(CountingLoader {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl DocumentLoader for CountingLoader {
        async fn load(&self, url: &Url) -> Result<RemoteDocument, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RemoteDocument {
                document_url: url.clone(),
                context_url: None,
                document: json!({"id": url.as_str()}),
            })
        }
    }

    struct FailingKv;

    #[async_trait]
    impl KvStore for FailingKv {
        async fn get(&self, _: &KvKey) -> Result<Option<Value>, Error> {
            Err(Error::Kv("backend down".to_string()))
        }
        async fn set(&self, _: &KvKey, _: Value, _: Option<Duration>) -> Result<(), Error> {
            Err(Error::Kv("backend down".to_string()))
        }
        async fn delete(&self, _: &KvKey) -> Result<(), Error> {
            Err(Error::Kv("backend down".to_string()))
        }
    }

    fn prefix() -> KvKey {
        KvKey::new(["_fedify"]).unwrap()
    }

    #[tokio::test]
    async fn test_caches_matching_urls() {
        let inner = CountingLoader::new();
        let cache = CachedLoader::new(
            inner.clone(),
            Arc::new(MemoryKvStore::new()),
            prefix(),
            vec![CacheRule::pattern(
                Template::parse("https://example.com/{path}").unwrap(),
                Duration::hours(1),
            )],
        );
        let url = Url::parse("https://example.com/actor").unwrap();

        cache.load(&url).await.unwrap();
        cache.load(&url).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_rule_means_no_caching() {
        let inner = CountingLoader::new();
        let cache = CachedLoader::new(
            inner.clone(),
            Arc::new(MemoryKvStore::new()),
            prefix(),
            vec![CacheRule::exact("https://example.com/only-this", Duration::hours(1))],
        );
        let url = Url::parse("https://example.com/other").unwrap();

        cache.load(&url).await.unwrap();
        cache.load(&url).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_kv_failure_degrades_to_miss() {
        let inner = CountingLoader::new();
        let cache = CachedLoader::new(
            inner.clone(),
            Arc::new(FailingKv),
            prefix(),
            vec![CacheRule::exact("https://example.com/actor", Duration::hours(1))],
        );
        let url = Url::parse("https://example.com/actor").unwrap();

        // Loads succeed despite the broken store.
        cache.load(&url).await.unwrap();
        cache.load(&url).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_preloaded_context_bypasses_cache_and_loader() {
        let inner = CountingLoader::new();
        let kv = Arc::new(MemoryKvStore::new());
        let cache = CachedLoader::new(
            inner.clone(),
            kv,
            prefix(),
            vec![CacheRule::exact(
                "https://www.w3.org/ns/activitystreams",
                Duration::hours(1),
            )],
        );
        let url = Url::parse("https://www.w3.org/ns/activitystreams").unwrap();

        let document = cache.load(&url).await.unwrap();
        assert!(document.document.get("@context").is_some());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_ttl_clamped_to_thirty_days() {
        let rule = CacheRule::exact("https://example.com/", Duration::days(365));
        assert_eq!(rule.ttl(), Duration::days(30));
    }
}
