//! Configuration for this library, with various federation settings
//!
//! Use [FederationConfig::builder] to initialize it.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use fedify::config::FederationConfig;
//! # use fedify::kv::MemoryKvStore;
//! let config = FederationConfig::builder()
//!     .app_data(())
//!     .kv(Arc::new(MemoryKvStore::new()))
//!     .build()?;
//! # Ok::<(), fedify::error::Error>(())
//! ```

use crate::cache::{CachedLoader, CacheRule};
use crate::error::Error;
use crate::fetch::loader::{DocumentLoader, HttpDocumentLoader, UserAgentPolicy};
use crate::kv::{KvKey, KvStore};
use crate::queue::MessageQueue;
use crate::sending::RetryPolicy;
use crate::signatures::{
    CachingKeyResolver,
    KvSpecDeterminer,
    SignatureSpec,
    SigningKey,
    SpecDeterminer,
    TimeWindow,
};
use crate::template::Template;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use derive_builder::Builder;
use dyn_clone::{clone_trait_object, DynClone};
use reqwest_middleware::ClientWithMiddleware;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

fn default_cache_rules() -> Vec<CacheRule> {
    let catch_all = Template::parse("{+url}").expect("catch-all template is valid");
    vec![CacheRule::pattern(catch_all, ChronoDuration::hours(1))]
}

/// Configuration for this library, with various federation related settings
#[derive(Builder, Clone)]
#[builder(build_fn(private, name = "partial_build"), pattern = "owned")]
pub struct FederationConfig<T: Clone> {
    /// Data which the application requires in handlers, such as database
    /// connection or configuration.
    pub(crate) app_data: T,
    /// Key-value store backing caches, idempotence keys and the signature
    /// spec memory.
    pub(crate) kv: Arc<dyn KvStore>,
    /// Queue for background fan-out and delivery. Without one, sending
    /// runs inline.
    #[builder(default)]
    pub(crate) queue: Option<Arc<dyn MessageQueue>>,
    /// Namespace prefix for every key this library writes.
    #[builder(default = "KvKey::new([\"_fedify\"]).expect(\"default prefix\")")]
    pub(crate) kv_prefix: KvKey,
    /// HTTP client used for all outgoing requests. Middleware can be used
    /// to add functionality like log tracing or retry of failed requests.
    #[builder(default = "reqwest::Client::default().into()")]
    pub(crate) client: ClientWithMiddleware,
    /// Timeout for all outgoing HTTP requests.
    #[builder(default = "Duration::from_secs(10)")]
    pub(crate) request_timeout: Duration,
    /// User-agent policy for outgoing requests.
    #[builder(default)]
    pub(crate) user_agent: UserAgentPolicy,
    /// Allow fetching from private and loopback addresses, and build http
    /// URLs instead of https. Only enable for tests.
    #[builder(default = "false")]
    pub(crate) allow_private_address: bool,
    /// Caching rules for the document loader.
    #[builder(default = "default_cache_rules()")]
    pub(crate) cache_rules: Vec<CacheRule>,
    /// Signature suite tried first against unknown origins.
    #[builder(default)]
    pub(crate) first_knock: SignatureSpec,
    /// Acceptance window for inbound signature timestamps.
    #[builder(default)]
    pub(crate) time_window: TimeWindow,
    /// Skip signature verification on inbound activities. Only enable for
    /// tests.
    #[builder(default = "false")]
    pub(crate) skip_signature_verification: bool,
    /// Canonical origin; constructed URLs use it instead of the request's
    /// `Host` header when set.
    #[builder(default)]
    pub(crate) canonical_origin: Option<Url>,
    /// Retry policy for outgoing deliveries.
    #[builder(default)]
    pub(crate) outbox_retry_policy: RetryPolicy,
    /// Retry policy for failed inbox listeners.
    #[builder(default)]
    pub(crate) inbox_retry_policy: RetryPolicy,
    /// Maximum number of outgoing HTTP requests per incoming request,
    /// bounding recursive fetches.
    #[builder(default = "20")]
    pub(crate) http_fetch_limit: u32,
    /// Hook validating URLs before fetching from or delivering to them.
    /// See [UrlVerifier].
    #[builder(default = "Box::new(DefaultUrlVerifier)")]
    pub(crate) url_verifier: Box<dyn UrlVerifier>,

    /// Document loader; assembled by `build` from the settings above.
    #[builder(setter(skip))]
    pub(crate) loader: Option<Arc<dyn DocumentLoader>>,
    /// Parsed signing keys, cached because PEM parsing is expensive.
    #[builder(setter(skip))]
    pub(crate) signing_key_cache: Option<moka::future::Cache<String, SigningKey>>,
    /// Spec determiner backing double-knocking.
    #[builder(setter(skip))]
    pub(crate) spec_determiner: Option<Arc<dyn SpecDeterminer>>,
    /// Key resolver for signature verification.
    #[builder(setter(skip))]
    pub(crate) key_resolver: Option<Arc<CachingKeyResolver>>,
}

impl<T: Clone> FederationConfig<T> {
    /// Returns a new config builder with default values.
    pub fn builder() -> FederationConfigBuilder<T> {
        FederationConfigBuilder::default()
    }

    /// Creates a new request-scoped [Data] from this config.
    pub fn to_request_data(&self) -> Data<T> {
        Data {
            config: self.clone(),
            request_counter: Default::default(),
        }
    }

    pub(crate) fn loader(&self) -> Arc<dyn DocumentLoader> {
        self.loader.clone().expect("loader is set by build")
    }

    pub(crate) fn spec_determiner(&self) -> Arc<dyn SpecDeterminer> {
        self.spec_determiner
            .clone()
            .expect("spec determiner is set by build")
    }

    pub(crate) fn key_resolver(&self) -> Arc<CachingKeyResolver> {
        self.key_resolver
            .clone()
            .expect("key resolver is set by build")
    }

    /// Parses a PEM signing key through the in-process cache.
    pub(crate) async fn signing_key(&self, pem: &str) -> Result<SigningKey, Error> {
        let cache = self
            .signing_key_cache
            .as_ref()
            .expect("key cache is set by build");
        cache
            .try_get_with_by_ref(pem, async { SigningKey::from_pem(pem) })
            .await
            .map_err(|e| Error::Other(e.to_string()))
    }

    /// Runs the application's URL verifier.
    pub(crate) async fn verify_url(&self, url: &Url) -> Result<(), Error> {
        self.url_verifier.verify(url).await.map_err(Error::Url)
    }

    /// The scheme matching the private-address allowance: plain http is
    /// only spoken in test setups.
    pub(crate) fn scheme(&self) -> &'static str {
        if self.allow_private_address {
            "http"
        } else {
            "https"
        }
    }
}

impl<T: Clone> FederationConfigBuilder<T> {
    /// Constructs a config instance with the values supplied to builder.
    ///
    /// Also assembles the document loader stack (HTTP loader wrapped in
    /// the KV-backed cache), the key resolver and the signature spec
    /// memory, which live inside the config afterwards.
    pub fn build(self) -> Result<FederationConfig<T>, Error> {
        let mut config = self
            .partial_build()
            .map_err(|e| Error::Other(e.to_string()))?;

        let http_loader = HttpDocumentLoader::new(
            &config.user_agent,
            config.allow_private_address,
            config.request_timeout,
        )?;
        let loader: Arc<dyn DocumentLoader> = Arc::new(CachedLoader::new(
            Arc::new(http_loader),
            config.kv.clone(),
            config.kv_prefix.clone(),
            config.cache_rules.clone(),
        ));
        config.key_resolver = Some(Arc::new(CachingKeyResolver::new(
            loader.clone(),
            config.kv.clone(),
            config.kv_prefix.clone(),
        )));
        config.loader = Some(loader);
        config.spec_determiner = Some(Arc::new(KvSpecDeterminer::new(
            config.kv.clone(),
            config.kv_prefix.clone(),
        )));
        config.signing_key_cache = Some(moka::future::Cache::new(64));
        Ok(config)
    }
}

/// Handler for validating URLs.
///
/// Used for implementing domain blocklists and similar functionality. It
/// is called before fetching remote data from a URL and before delivering
/// an activity to an inbox URL. Return an error to abort processing for
/// that URL.
#[async_trait]
pub trait UrlVerifier: DynClone + Send + Sync {
    /// Should return Ok iff the given url is valid for processing.
    async fn verify(&self, url: &Url) -> Result<(), &'static str>;
}

clone_trait_object!(UrlVerifier);

/// Default URL verifier which does nothing.
#[derive(Clone)]
struct DefaultUrlVerifier;

#[async_trait]
impl UrlVerifier for DefaultUrlVerifier {
    async fn verify(&self, _url: &Url) -> Result<(), &'static str> {
        Ok(())
    }
}

/// Stores data for handling one specific HTTP request.
///
/// Gives access to the `app_data` passed to [FederationConfig::builder],
/// plus a counter for outgoing HTTP requests which bounds recursive
/// fetching triggered by hostile objects.
pub struct Data<T: Clone> {
    pub(crate) config: FederationConfig<T>,
    pub(crate) request_counter: AtomicU32,
}

impl<T: Clone> Data<T> {
    /// Returns the application data stored in the config.
    pub fn app_data(&self) -> &T {
        &self.config.app_data
    }

    /// Total number of outgoing HTTP requests made with this data.
    pub fn request_count(&self) -> u32 {
        self.request_counter.load(Ordering::Relaxed)
    }

    pub(crate) fn count_request(&self) -> Result<(), Error> {
        let counter = self.request_counter.fetch_add(1, Ordering::SeqCst);
        if counter > self.config.http_fetch_limit {
            return Err(Error::RequestLimit);
        }
        Ok(())
    }
}

impl<T: Clone> Deref for Data<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.config.app_data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    #[tokio::test]
    async fn test_builder_defaults() {
        let config = FederationConfig::builder()
            .app_data(())
            .kv(Arc::new(MemoryKvStore::new()))
            .build()
            .unwrap();

        assert_eq!(config.kv_prefix.parts(), ["_fedify"]);
        assert_eq!(config.first_knock, SignatureSpec::Rfc9421);
        assert!(!config.allow_private_address);
        assert!(config.loader.is_some());
        assert!(config.spec_determiner.is_some());
    }

    #[derive(Clone)]
    struct Blocklist;

    #[async_trait]
    impl UrlVerifier for Blocklist {
        async fn verify(&self, url: &Url) -> Result<(), &'static str> {
            if url.host_str() == Some("blocked.example") {
                Err("domain is blocked")
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_url_verifier() {
        let config = FederationConfig::builder()
            .app_data(())
            .kv(Arc::new(MemoryKvStore::new()))
            .url_verifier(Box::new(Blocklist))
            .build()
            .unwrap();

        let blocked = Url::parse("https://blocked.example/inbox").unwrap();
        assert!(matches!(config.verify_url(&blocked).await, Err(Error::Url(_))));
        let fine = Url::parse("https://example.com/inbox").unwrap();
        assert!(config.verify_url(&fine).await.is_ok());
    }

    #[tokio::test]
    async fn test_request_counter_limit() {
        let config = FederationConfig::builder()
            .app_data(())
            .kv(Arc::new(MemoryKvStore::new()))
            .http_fetch_limit(2u32)
            .build()
            .unwrap();
        let data = config.to_request_data();

        assert!(data.count_request().is_ok());
        assert!(data.count_request().is_ok());
        assert!(data.count_request().is_ok());
        assert!(data.count_request().is_err());
        assert_eq!(data.request_count(), 4);
    }
}
