//! The federation object: routes, dispatchers and workers in one place

pub mod builder;
pub(crate) mod handler;
pub mod router;

pub use builder::{
    ActorDispatcher,
    AuthorizePredicate,
    CollectionDispatcher,
    CollectionPage,
    FederationBuilder,
    HandleMapper,
    InboxErrorHandler,
    InboxListener,
    KeyPairsDispatcher,
    NodeInfoDispatcher,
    ObjectDispatcher,
    SharedKeyDispatcher,
};
pub use router::RouteName;

use crate::config::FederationConfig;
use crate::context::Context;
use crate::error::Error;
use builder::Registrations;
use bytes::Bytes;
use http::{Request, Response};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

pub(crate) struct FederationInner<T: Clone> {
    pub(crate) config: FederationConfig<T>,
    pub(crate) registrations: Registrations<T>,
}

/// An immutable, fully-registered federation.
///
/// Built by [FederationBuilder]; after `build` the registration table is
/// read-only. Handles inbound requests through [Federation::handle] and
/// drains the delivery queue through [Federation::start_queue].
pub struct Federation<T: Clone> {
    pub(crate) inner: Arc<FederationInner<T>>,
}

impl<T: Clone> Clone for Federation<T> {
    fn clone(&self) -> Self {
        Federation {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Federation<T> {
    /// Creates a context bound to `base_url` (or to the configured
    /// canonical origin, which takes precedence).
    pub fn create_context(&self, base_url: &Url) -> Context<T> {
        let base = self
            .inner
            .config
            .canonical_origin
            .clone()
            .unwrap_or_else(|| base_url.clone());
        Context {
            inner: self.inner.clone(),
            base_url: base,
            data: Arc::new(self.inner.config.to_request_data()),
        }
    }

    /// Handles one inbound HTTP request.
    ///
    /// `None` is the not-found sentinel: no federation route matched (or
    /// the dispatcher had nothing), and the caller should fall through to
    /// its own framework routing.
    pub async fn handle(&self, request: Request<Bytes>) -> Option<Response<Bytes>> {
        handler::handle(self, request).await
    }

    /// Drains the configured queue until `signal` fires: fan-out tasks
    /// split into deliveries, deliveries sign and POST, failed inbox
    /// handlers re-run.
    ///
    /// Run this from as many processes as desired; the queue backend
    /// distributes tasks among them.
    pub async fn start_queue(
        &self,
        base_url: &Url,
        signal: CancellationToken,
    ) -> Result<(), Error> {
        let queue = self
            .inner
            .config
            .queue
            .clone()
            .ok_or_else(|| Error::Queue("no queue configured".to_string()))?;
        let worker = handler::QueueWorker {
            ctx: self.create_context(base_url),
        };
        queue.listen(Arc::new(worker), signal).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FederationConfig;
    use crate::context::Context;
    use crate::kv::MemoryKvStore;
    use crate::queue::InMemoryMessageQueue;
    use crate::sending::{Recipient, SendOptions};
    use crate::signatures::tests::RSA_KEYPAIR;
    use crate::signatures::{cavage, SigningKey};
    use crate::template::VarMap;
    use crate::vocab::{Activity, ActivityKind, Actor, ActorKind, Object};
    use async_trait::async_trait;
    use http::header::HeaderValue;
    use http::{HeaderMap, Method, StatusCode};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct TestActors;

    #[async_trait]
    impl ActorDispatcher<()> for TestActors {
        async fn dispatch(
            &self,
            _ctx: &Context<()>,
            identifier: &str,
        ) -> Result<Option<Actor>, Error> {
            if identifier != "alice" {
                return Ok(None);
            }
            Ok(Some(Actor {
                kind: ActorKind::Person,
                name: Some("Alice".to_string()),
                ..Default::default()
            }))
        }
    }

    struct TestKeys;

    #[async_trait]
    impl KeyPairsDispatcher<()> for TestKeys {
        async fn dispatch(
            &self,
            _ctx: &Context<()>,
            _identifier: &str,
        ) -> Result<Vec<SigningKey>, Error> {
            Ok(vec![SigningKey::from_pem(&RSA_KEYPAIR.private_key)?])
        }
    }

    struct TestNotes;

    #[async_trait]
    impl ObjectDispatcher<()> for TestNotes {
        async fn dispatch(
            &self,
            _ctx: &Context<()>,
            values: &VarMap,
        ) -> Result<Option<Object>, Error> {
            let id = values.get("id").and_then(|v| v.as_str()).unwrap_or_default();
            if id != "1" {
                return Ok(None);
            }
            Ok(Some(Object {
                kinds: vec!["Note".to_string()],
                content: Some("Hello".to_string()),
                ..Default::default()
            }))
        }
    }

    struct TestFollowers;

    #[async_trait]
    impl CollectionDispatcher<()> for TestFollowers {
        async fn count(&self, _: &Context<()>, _: &str) -> Result<Option<u64>, Error> {
            Ok(Some(3))
        }

        async fn first_cursor(&self, _: &Context<()>, _: &str) -> Result<Option<String>, Error> {
            Ok(Some("0".to_string()))
        }

        async fn page(
            &self,
            _ctx: &Context<()>,
            _identifier: &str,
            cursor: Option<&str>,
        ) -> Result<Option<CollectionPage>, Error> {
            match cursor {
                Some("0") => Ok(Some(CollectionPage {
                    items: vec![
                        crate::vocab::Ref::Url("https://remote.example/u/1".parse().expect("url")),
                        crate::vocab::Ref::Url("https://remote.example/u/2".parse().expect("url")),
                    ],
                    next_cursor: Some("2".to_string()),
                    prev_cursor: None,
                })),
                Some("2") => Ok(Some(CollectionPage {
                    items: vec![crate::vocab::Ref::Url(
                        "https://remote.example/u/3".parse().expect("url"),
                    )],
                    next_cursor: None,
                    prev_cursor: Some("0".to_string()),
                })),
                _ => Ok(None),
            }
        }
    }

    struct CountingListener {
        count: Arc<AtomicUsize>,
        kinds: Arc<Mutex<Vec<ActivityKind>>>,
    }

    #[async_trait]
    impl InboxListener<()> for CountingListener {
        async fn handle(&self, _ctx: &Context<()>, activity: Activity) -> Result<(), Error> {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.kinds.lock().await.push(activity.kind);
            Ok(())
        }
    }

    struct TestHarness {
        federation: Federation<()>,
        listener_count: Arc<AtomicUsize>,
        listener_kinds: Arc<Mutex<Vec<ActivityKind>>>,
    }

    fn build_federation(skip_verification: bool) -> TestHarness {
        let config = FederationConfig::builder()
            .app_data(())
            .kv(Arc::new(MemoryKvStore::new()))
            .allow_private_address(true)
            .skip_signature_verification(skip_verification)
            .build()
            .expect("config");

        let listener_count = Arc::new(AtomicUsize::new(0));
        let listener_kinds = Arc::new(Mutex::new(Vec::new()));
        let federation = FederationBuilder::new()
            .actor_dispatcher("/users/{identifier}", Arc::new(TestActors))
            .expect("actor route")
            .key_pairs_dispatcher(Arc::new(TestKeys))
            .object_dispatcher("Note", "/notes/{id}", Arc::new(TestNotes))
            .expect("object route")
            .collection_dispatcher(
                RouteName::Followers,
                "/users/{identifier}/followers",
                Arc::new(TestFollowers),
            )
            .expect("collection route")
            .inbox("/users/{identifier}/inbox", Some("/inbox"))
            .expect("inbox routes")
            .on(
                ActivityKind::Follow,
                Arc::new(CountingListener {
                    count: listener_count.clone(),
                    kinds: listener_kinds.clone(),
                }),
            )
            .on(
                ActivityKind::Offer,
                Arc::new(CountingListener {
                    count: listener_count.clone(),
                    kinds: listener_kinds.clone(),
                }),
            )
            .build(config)
            .expect("federation");

        TestHarness {
            federation,
            listener_count,
            listener_kinds,
        }
    }

    fn get_request(path: &str, accept: &str) -> Request<Bytes> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .header("host", "example.com")
            .header("accept", accept)
            .body(Bytes::new())
            .expect("request")
    }

    fn body_json(response: &Response<Bytes>) -> Value {
        serde_json::from_slice(response.body()).expect("response body is JSON")
    }

    #[tokio::test]
    async fn test_actor_document() {
        let harness = build_federation(true);
        let response = harness
            .federation
            .handle(get_request("/users/alice", "application/activity+json"))
            .await
            .expect("a response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/activity+json"
        );
        let body = body_json(&response);
        assert_eq!(body["type"], "Person");
        assert_eq!(body["id"], "http://example.com/users/alice");
        assert_eq!(body["inbox"], "http://example.com/users/alice/inbox");
        assert_eq!(body["endpoints"]["sharedInbox"], "http://example.com/inbox");
        assert_eq!(body["followers"], "http://example.com/users/alice/followers");
        // Keys are filled in from the key-pairs dispatcher.
        assert_eq!(
            body["publicKey"]["id"],
            "http://example.com/users/alice#main-key"
        );
        assert!(body["publicKey"]["publicKeyPem"]
            .as_str()
            .unwrap()
            .starts_with("-----BEGIN PUBLIC KEY-----"));
    }

    #[tokio::test]
    async fn test_unknown_route_and_actor_are_sentinels() {
        let harness = build_federation(true);
        // No route.
        assert!(harness
            .federation
            .handle(get_request("/something/else", "application/activity+json"))
            .await
            .is_none());
        // Route matched, actor unknown.
        assert!(harness
            .federation
            .handle(get_request("/users/nobody", "application/activity+json"))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_content_negotiation() {
        let harness = build_federation(true);
        let response = harness
            .federation
            .handle(get_request("/users/alice", "text/html"))
            .await
            .expect("a response");
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);

        // The JSON-LD profile form is acceptable.
        let response = harness
            .federation
            .handle(get_request(
                "/users/alice",
                "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"",
            ))
            .await
            .expect("a response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let harness = build_federation(true);
        let request = Request::builder()
            .method(Method::POST)
            .uri("/users/alice")
            .header("host", "example.com")
            .body(Bytes::new())
            .expect("request");
        let response = harness.federation.handle(request).await.expect("a response");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let request = Request::builder()
            .method(Method::GET)
            .uri("/users/alice/inbox")
            .header("host", "example.com")
            .header("accept", "application/activity+json")
            .body(Bytes::new())
            .expect("request");
        let response = harness.federation.handle(request).await.expect("a response");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_object_document() {
        let harness = build_federation(true);
        let response = harness
            .federation
            .handle(get_request("/notes/1", "application/activity+json"))
            .await
            .expect("a response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(&response);
        assert_eq!(body["type"], "Note");
        assert_eq!(body["content"], "Hello");

        assert!(harness
            .federation
            .handle(get_request("/notes/2", "application/activity+json"))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_collection_index_and_pages() {
        let harness = build_federation(true);

        // Index: total count plus first/last cursors.
        let response = harness
            .federation
            .handle(get_request(
                "/users/alice/followers",
                "application/activity+json",
            ))
            .await
            .expect("a response");
        let body = body_json(&response);
        assert_eq!(body["type"], "OrderedCollection");
        assert_eq!(body["totalItems"], 3);
        assert_eq!(
            body["first"],
            "http://example.com/users/alice/followers?cursor=0"
        );

        // First page.
        let response = harness
            .federation
            .handle(get_request(
                "/users/alice/followers?cursor=0",
                "application/activity+json",
            ))
            .await
            .expect("a response");
        let body = body_json(&response);
        assert_eq!(body["type"], "OrderedCollectionPage");
        assert_eq!(
            body["orderedItems"],
            json!(["https://remote.example/u/1", "https://remote.example/u/2"])
        );
        assert_eq!(
            body["next"],
            "http://example.com/users/alice/followers?cursor=2"
        );

        // Last page.
        let response = harness
            .federation
            .handle(get_request(
                "/users/alice/followers?cursor=2",
                "application/activity+json",
            ))
            .await
            .expect("a response");
        let body = body_json(&response);
        assert_eq!(body["orderedItems"], "https://remote.example/u/3");
        assert!(body.get("next").is_none());
    }

    #[tokio::test]
    async fn test_webfinger() {
        let harness = build_federation(true);
        let response = harness
            .federation
            .handle(get_request(
                "/.well-known/webfinger?resource=acct:alice@example.com",
                "*/*",
            ))
            .await
            .expect("a response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/jrd+json"
        );
        let body = body_json(&response);
        assert_eq!(body["subject"], "acct:alice@example.com");
        let self_link = body["links"]
            .as_array()
            .unwrap()
            .iter()
            .find(|l| l["rel"] == "self")
            .unwrap();
        assert_eq!(self_link["href"], "http://example.com/users/alice");

        // Unknown user delegates to the framework.
        assert!(harness
            .federation
            .handle(get_request(
                "/.well-known/webfinger?resource=acct:nobody@example.com",
                "*/*",
            ))
            .await
            .is_none());
    }

    fn follow_activity(id: &str) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": id,
            "type": "Follow",
            "actor": "https://remote.example/users/bob",
            "object": "http://example.com/users/alice"
        })
    }

    fn inbox_post(path: &str, body: &Value) -> Request<Bytes> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("host", "example.com")
            .header("content-type", "application/activity+json")
            .body(Bytes::from(serde_json::to_vec(body).expect("body")))
            .expect("request")
    }

    #[tokio::test]
    async fn test_inbox_accepts_and_deduplicates() {
        let harness = build_federation(true);
        let activity = follow_activity("https://remote.example/activities/1");

        let response = harness
            .federation
            .handle(inbox_post("/users/alice/inbox", &activity))
            .await
            .expect("a response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(response.body().is_empty());
        assert_eq!(harness.listener_count.load(Ordering::SeqCst), 1);

        // The same activity id again is acknowledged without dispatch.
        let response = harness
            .federation
            .handle(inbox_post("/users/alice/inbox", &activity))
            .await
            .expect("a response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(harness.listener_count.load(Ordering::SeqCst), 1);

        // A different id dispatches again.
        let other = follow_activity("https://remote.example/activities/2");
        harness
            .federation
            .handle(inbox_post("/users/alice/inbox", &other))
            .await
            .expect("a response");
        assert_eq!(harness.listener_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_inbox_subtype_dispatch() {
        let harness = build_federation(true);
        // Invite has no listener of its own; the Offer listener takes it.
        let invite = json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": "https://remote.example/activities/3",
            "type": "Invite",
            "actor": "https://remote.example/users/bob",
            "object": "http://example.com/users/alice"
        });
        let response = harness
            .federation
            .handle(inbox_post("/inbox", &invite))
            .await
            .expect("a response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            *harness.listener_kinds.lock().await,
            vec![ActivityKind::Invite]
        );

        // Unhandled types are acknowledged without a listener.
        let like = json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": "https://remote.example/activities/4",
            "type": "Like",
            "actor": "https://remote.example/users/bob",
            "object": "http://example.com/notes/1"
        });
        let response = harness
            .federation
            .handle(inbox_post("/inbox", &like))
            .await
            .expect("a response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(harness.listener_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inbox_rejects_unsigned_when_verifying() {
        let harness = build_federation(false);
        let activity = follow_activity("https://remote.example/activities/9");
        let response = harness
            .federation
            .handle(inbox_post("/users/alice/inbox", &activity))
            .await
            .expect("a response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(harness.listener_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_inbox_rejects_malformed_activity() {
        let harness = build_federation(true);
        let response = harness
            .federation
            .handle(inbox_post("/users/alice/inbox", &json!({"type": "Follow"})))
            .await
            .expect("a response");
        // A Follow without an actor cannot be attributed.
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_inbox_rejects_spoofed_actor() {
        // Signature verification on, request signed by a key whose owner
        // lives on a different origin than the claimed actor.
        let config = FederationConfig::builder()
            .app_data(())
            .kv(Arc::new(MemoryKvStore::new()))
            .allow_private_address(true)
            .build()
            .expect("config");
        // Seed the key cache so verification finds the key without
        // fetching: key owner is on key.example, actor on remote.example.
        let kv_seed = json!({
            "pem": RSA_KEYPAIR.public_key,
            "owner": "https://key.example/users/mallory"
        });
        let key_id = "https://key.example/users/mallory#main-key";
        let kv_key = crate::kv::KvKey::new(["_fedify", "publicKey", key_id]).expect("key");
        config.kv.set(&kv_key, kv_seed, None).await.expect("seed");

        let federation = FederationBuilder::<()>::new()
            .actor_dispatcher("/users/{identifier}", Arc::new(TestActors))
            .expect("actor route")
            .inbox("/users/{identifier}/inbox", None)
            .expect("inbox route")
            .build(config)
            .expect("federation");

        let activity = follow_activity("https://remote.example/activities/5");
        let body = Bytes::from(serde_json::to_vec(&activity).expect("body"));
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/activity+json"));
        let url: url::Url = "http://example.com/users/alice/inbox".parse().expect("url");
        cavage::sign_request(
            &Method::POST,
            &url,
            &mut headers,
            Some(&body),
            &SigningKey::from_pem(&RSA_KEYPAIR.private_key).expect("key"),
            &key_id.parse().expect("key id"),
        )
        .expect("sign");

        let mut builder = Request::builder().method(Method::POST).uri("/users/alice/inbox");
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        let response = federation
            .handle(builder.body(body).expect("request"))
            .await
            .expect("a response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_send_activity_via_queue_fans_out() {
        use std::future::IntoFuture;

        // A remote inbox counting deliveries.
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        let app = axum::Router::new().route(
            "/inbox",
            axum::routing::post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { StatusCode::ACCEPTED }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(axum::serve(listener, app).into_future());

        let config = FederationConfig::builder()
            .app_data(())
            .kv(Arc::new(MemoryKvStore::new()))
            .queue(Some(Arc::new(InMemoryMessageQueue::new())))
            .allow_private_address(true)
            .build()
            .expect("config");
        let federation = FederationBuilder::<()>::new()
            .actor_dispatcher("/users/{identifier}", Arc::new(TestActors))
            .expect("actor route")
            .key_pairs_dispatcher(Arc::new(TestKeys))
            .inbox("/users/{identifier}/inbox", None)
            .expect("inbox route")
            .build(config)
            .expect("federation");

        let base: url::Url = "http://example.com/".parse().expect("base");
        let signal = CancellationToken::new();
        let worker = {
            let federation = federation.clone();
            let base = base.clone();
            let signal = signal.clone();
            tokio::spawn(async move { federation.start_queue(&base, signal).await })
        };

        let ctx = federation.create_context(&base);
        let inbox: url::Url = format!("http://{addr}/inbox").parse().expect("inbox");
        let mut activity = Activity::new(ActivityKind::Create);
        activity.to = vec![inbox.clone()];
        ctx.send_activity(
            "alice",
            &[
                Recipient::Inbox(inbox.clone()),
                // Duplicate target collapses into one delivery.
                Recipient::Inbox(inbox),
            ],
            activity,
            SendOptions::default(),
        )
        .await
        .expect("send");

        // Fan-out and delivery drain through the worker.
        for _ in 0..100 {
            if delivered.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        signal.cancel();
        worker.await.expect("worker").expect("listen");
    }

    struct TestNodeInfo;

    #[async_trait]
    impl NodeInfoDispatcher<()> for TestNodeInfo {
        async fn dispatch(&self, _ctx: &Context<()>) -> Result<crate::fetch::nodeinfo::NodeInfo, Error> {
            crate::fetch::nodeinfo::parse_node_info(
                &json!({
                    "version": "2.1",
                    "software": {"name": "fedify", "version": "0.1.0"},
                    "protocols": ["activitypub"],
                    "usage": {"users": {"total": 1}}
                }),
                crate::fetch::nodeinfo::NodeInfoParseMode::Strict,
            )
        }
    }

    #[tokio::test]
    async fn test_nodeinfo_routes() {
        let config = FederationConfig::builder()
            .app_data(())
            .kv(Arc::new(MemoryKvStore::new()))
            .allow_private_address(true)
            .build()
            .expect("config");
        let federation = FederationBuilder::<()>::new()
            .nodeinfo_dispatcher("/nodeinfo/2.1", Arc::new(TestNodeInfo))
            .expect("nodeinfo route")
            .build(config)
            .expect("federation");

        let response = federation
            .handle(get_request("/.well-known/nodeinfo", "*/*"))
            .await
            .expect("a response");
        let body = body_json(&response);
        assert_eq!(body["links"][0]["href"], "http://example.com/nodeinfo/2.1");

        let response = federation
            .handle(get_request("/nodeinfo/2.1", "*/*"))
            .await
            .expect("a response");
        let body = body_json(&response);
        assert_eq!(body["software"]["name"], "fedify");
        assert_eq!(body["software"]["version"], "0.1.0");
        assert_eq!(body["openRegistrations"], false);
    }

    struct DenyAll;

    #[async_trait]
    impl AuthorizePredicate<()> for DenyAll {
        async fn authorize(&self, _: &Context<()>, _: Option<&str>) -> Result<bool, Error> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_authorize_denial_is_unauthorized() {
        let config = FederationConfig::builder()
            .app_data(())
            .kv(Arc::new(MemoryKvStore::new()))
            .allow_private_address(true)
            .skip_signature_verification(true)
            .build()
            .expect("config");
        let federation = FederationBuilder::<()>::new()
            .actor_dispatcher("/users/{identifier}", Arc::new(TestActors))
            .expect("actor route")
            .inbox("/users/{identifier}/inbox", None)
            .expect("inbox route")
            .authorize(Arc::new(DenyAll))
            .build(config)
            .expect("federation");

        let response = federation
            .handle(get_request("/users/alice", "application/activity+json"))
            .await
            .expect("a response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_context_url_builders() {
        let harness = build_federation(true);
        let base: url::Url = "https://example.com/".parse().expect("base");
        let ctx = harness.federation.create_context(&base);

        assert_eq!(
            ctx.actor_uri("alice").expect("uri").as_str(),
            "https://example.com/users/alice"
        );
        assert_eq!(
            ctx.inbox_uri("alice").expect("uri").as_str(),
            "https://example.com/users/alice/inbox"
        );
        assert_eq!(
            ctx.shared_inbox_uri().expect("uri").as_str(),
            "https://example.com/inbox"
        );
        assert_eq!(
            ctx.followers_uri("alice").expect("uri").as_str(),
            "https://example.com/users/alice/followers"
        );
        // Unregistered routes raise a routing error.
        assert!(matches!(ctx.outbox_uri("alice"), Err(Error::Routing(_))));

        // Reverse matching recovers the identifier.
        let actor_url: url::Url = "https://example.com/users/alice".parse().expect("url");
        assert_eq!(ctx.match_actor_uri(&actor_url), Some("alice".to_string()));
    }

    #[tokio::test]
    async fn test_canonical_origin_rewrites_urls() {
        let config = FederationConfig::builder()
            .app_data(())
            .kv(Arc::new(MemoryKvStore::new()))
            .allow_private_address(true)
            .skip_signature_verification(true)
            .canonical_origin(Some("http://ap.example.com/".parse().expect("origin")))
            .build()
            .expect("config");
        let federation = FederationBuilder::<()>::new()
            .actor_dispatcher("/users/{identifier}", Arc::new(TestActors))
            .expect("actor route")
            .inbox("/users/{identifier}/inbox", None)
            .expect("inbox route")
            .build(config)
            .expect("federation");

        let response = federation
            .handle(get_request("/users/alice", "application/activity+json"))
            .await
            .expect("a response");
        let body = body_json(&response);
        // Constructed URLs carry the canonical host, not the request's.
        assert_eq!(body["id"], "http://ap.example.com/users/alice");
    }
}
