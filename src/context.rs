//! Request and operation contexts handed to application callbacks

use crate::config::Data;
use crate::error::Error;
use crate::federation::router::RouteName;
use crate::federation::FederationInner;
use crate::fetch::loader::{DocumentLoader, SignedDocumentLoader};
use crate::fetch::lookup::{lookup_object, LookupOptions};
use crate::fetch::webfinger::WebFingerLookup;
use crate::sending::{send_activity, Recipient, SendOptions};
use crate::signatures::{cavage, rfc9421, FetchedKey, SigningKey, VerifyOptions};
use crate::template::{EncodingPolicy, MatchOptions, VarMap, VarValue};
use crate::vocab::actor::main_key_id;
use crate::vocab::value::CrossOriginPolicy;
use crate::vocab::{Activity, Entity, Resolver};
use bytes::Bytes;
use http::header::HeaderMap;
use http::Method;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use url::Url;

/// A context bound to a base URL: URL construction, lookups and sending.
pub struct Context<T: Clone> {
    pub(crate) inner: Arc<FederationInner<T>>,
    pub(crate) base_url: Url,
    pub(crate) data: Arc<Data<T>>,
}

impl<T: Clone> Clone for Context<T> {
    fn clone(&self) -> Self {
        Context {
            inner: self.inner.clone(),
            base_url: self.base_url.clone(),
            data: self.data.clone(),
        }
    }
}

impl<T: Clone> Deref for Context<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.data.app_data()
    }
}

impl<T: Clone + Send + Sync + 'static> Context<T> {
    /// The base URL this context builds URLs against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The application data.
    pub fn app_data(&self) -> &T {
        self.data.app_data()
    }

    /// The request-scoped [Data].
    pub fn data(&self) -> &Data<T> {
        &self.data
    }

    fn identifier_vars(identifier: &str) -> VarMap {
        [("identifier".to_string(), VarValue::from(identifier))].into()
    }

    fn url_for(&self, name: &RouteName, vars: &VarMap) -> Result<Url, Error> {
        self.inner
            .registrations
            .router
            .url_for(name, vars, &self.base_url)
    }

    /// URL of an actor document.
    pub fn actor_uri(&self, identifier: &str) -> Result<Url, Error> {
        self.url_for(&RouteName::Actor, &Self::identifier_vars(identifier))
    }

    /// URL of an actor's inbox.
    pub fn inbox_uri(&self, identifier: &str) -> Result<Url, Error> {
        self.url_for(&RouteName::Inbox, &Self::identifier_vars(identifier))
    }

    /// URL of the shared inbox.
    pub fn shared_inbox_uri(&self) -> Result<Url, Error> {
        self.url_for(&RouteName::SharedInbox, &VarMap::new())
    }

    /// URL of an actor's outbox.
    pub fn outbox_uri(&self, identifier: &str) -> Result<Url, Error> {
        self.url_for(&RouteName::Outbox, &Self::identifier_vars(identifier))
    }

    /// URL of an actor's following collection.
    pub fn following_uri(&self, identifier: &str) -> Result<Url, Error> {
        self.url_for(&RouteName::Following, &Self::identifier_vars(identifier))
    }

    /// URL of an actor's followers collection.
    pub fn followers_uri(&self, identifier: &str) -> Result<Url, Error> {
        self.url_for(&RouteName::Followers, &Self::identifier_vars(identifier))
    }

    /// URL of an actor's liked collection.
    pub fn liked_uri(&self, identifier: &str) -> Result<Url, Error> {
        self.url_for(&RouteName::Liked, &Self::identifier_vars(identifier))
    }

    /// URL of an actor's featured collection.
    pub fn featured_uri(&self, identifier: &str) -> Result<Url, Error> {
        self.url_for(&RouteName::Featured, &Self::identifier_vars(identifier))
    }

    /// URL of an actor's featured tags collection.
    pub fn featured_tags_uri(&self, identifier: &str) -> Result<Url, Error> {
        self.url_for(&RouteName::FeaturedTags, &Self::identifier_vars(identifier))
    }

    /// URL of an object document.
    pub fn object_uri(&self, type_id: &str, vars: &VarMap) -> Result<Url, Error> {
        self.url_for(&RouteName::Object(type_id.to_string()), vars)
    }

    /// URL of the versioned NodeInfo document.
    pub fn nodeinfo_uri(&self) -> Result<Url, Error> {
        self.url_for(&RouteName::NodeInfo, &VarMap::new())
    }

    /// The identifier captured by the actor route for `url`, when `url`
    /// is one of this server's actor URLs.
    pub fn match_actor_uri(&self, url: &Url) -> Option<String> {
        if url.origin() != self.base_url.origin() {
            return None;
        }
        let template = self.inner.registrations.router.template(&RouteName::Actor)?;
        let options = MatchOptions {
            policy: EncodingPolicy::Cooked,
            strict: false,
        };
        let vars = template.matches(url.path(), &options)?;
        vars.get("identifier")
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
    }

    /// Whether `url` belongs to this server.
    pub fn is_local_url(&self, url: &Url) -> bool {
        url.origin() == self.base_url.origin()
    }

    /// The document loader, caching included.
    pub fn loader(&self) -> Arc<dyn DocumentLoader> {
        self.inner.config.loader()
    }

    /// A resolver for lazy vocabulary accessors.
    pub fn resolver(&self, policy: CrossOriginPolicy) -> Resolver<'_> {
        Resolver {
            loader: self.loader_ref(),
            policy,
        }
    }

    pub(crate) fn loader_ref(&self) -> &dyn DocumentLoader {
        self.inner
            .config
            .loader
            .as_deref()
            .expect("loader is set by build")
    }

    /// Resolves a URL or handle to a vocabulary object; `None` on any
    /// failure or cancellation.
    pub async fn lookup_object(
        &self,
        target: &str,
        signal: Option<CancellationToken>,
    ) -> Option<Entity> {
        if let Ok(url) = Url::parse(target) {
            if self.inner.config.verify_url(&url).await.is_err() {
                return None;
            }
        }
        let webfinger = WebFingerLookup::new(
            self.inner.config.client.clone(),
            self.inner.config.allow_private_address,
        );
        self.data.count_request().ok()?;
        let options = LookupOptions {
            loader: self.loader_ref(),
            webfinger: &webfinger,
            policy: CrossOriginPolicy::default(),
            signal,
        };
        lookup_object(target, &options).await
    }

    /// The signing keys of a local actor, paired with their key ids.
    /// The first key gets the conventional `#main-key` id.
    pub async fn actor_key_pairs(
        &self,
        identifier: &str,
    ) -> Result<Vec<(SigningKey, Url)>, Error> {
        let Some(dispatcher) = &self.inner.registrations.key_pairs_dispatcher else {
            return Ok(Vec::new());
        };
        let actor_uri = self.actor_uri(identifier)?;
        let keys = dispatcher.dispatch(self, identifier).await?;
        keys.into_iter()
            .enumerate()
            .map(|(index, key)| {
                let key_id = if index == 0 {
                    main_key_id(&actor_uri)?
                } else {
                    Url::parse(&format!("{actor_uri}#key-{}", index + 1))?
                };
                Ok((key, key_id))
            })
            .collect()
    }

    /// A loader whose fetches carry an HTTP signature under
    /// `identifier`'s main key, for peers that require authorized fetch.
    /// `None` when the actor has no registered keys.
    pub async fn signed_loader(
        &self,
        identifier: &str,
    ) -> Result<Option<SignedDocumentLoader>, Error> {
        let Some((key, key_id)) = self.actor_key_pairs(identifier).await?.into_iter().next()
        else {
            return Ok(None);
        };
        Ok(Some(SignedDocumentLoader::new(
            self.inner.config.client.clone(),
            key,
            key_id,
        )))
    }

    /// Delivers `activity` from the local actor `sender` to `recipients`.
    pub async fn send_activity(
        &self,
        sender: &str,
        recipients: &[Recipient],
        activity: Activity,
        options: SendOptions,
    ) -> Result<(), Error> {
        send_activity(self, sender, recipients, activity, options).await
    }
}

/// A [Context] carrying the inbound HTTP request, with request-scoped
/// getters for the verified signature.
pub struct RequestContext<T: Clone> {
    pub(crate) context: Context<T>,
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    signed_key: OnceCell<Option<FetchedKey>>,
}

impl<T: Clone> Deref for RequestContext<T> {
    type Target = Context<T>;

    fn deref(&self) -> &Context<T> {
        &self.context
    }
}

impl<T: Clone + Send + Sync + 'static> RequestContext<T> {
    pub(crate) fn new(
        context: Context<T>,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Bytes,
    ) -> RequestContext<T> {
        RequestContext {
            context,
            method,
            url,
            headers,
            body,
            signed_key: OnceCell::new(),
        }
    }

    /// The plain context.
    pub fn context(&self) -> &Context<T> {
        &self.context
    }

    /// The URL of the inbound request.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The key that signed this request, verified on first use under
    /// whichever suite the request carries. `None` when the request is
    /// unsigned or verification fails.
    pub async fn signed_key(&self) -> Option<&FetchedKey> {
        self.signed_key
            .get_or_init(|| async {
                let resolver = self.context.inner.config.key_resolver();
                let options = VerifyOptions {
                    current_time: None,
                    time_window: self.context.inner.config.time_window,
                };
                let body = (!self.body.is_empty()).then_some(&self.body[..]);
                if self.headers.contains_key("signature-input") {
                    rfc9421::verify_request(
                        &self.method,
                        &self.url,
                        &self.headers,
                        body,
                        resolver.as_ref(),
                        &options,
                    )
                    .await
                } else {
                    cavage::verify_request(
                        &self.method,
                        &self.url,
                        &self.headers,
                        body,
                        resolver.as_ref(),
                        &options,
                    )
                    .await
                }
            })
            .await
            .as_ref()
    }

    /// The actor owning the signing key, when the signature verified.
    pub async fn signed_key_owner(&self) -> Option<&Url> {
        self.signed_key().await.and_then(|key| key.owner.as_ref())
    }
}
