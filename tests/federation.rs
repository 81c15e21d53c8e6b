//! Two in-process instances federating over real HTTP: actor discovery,
//! signed delivery, inbox verification and deduplication.

use async_trait::async_trait;
use axum::Router;
use fedify::axum::{federation_handler, FederationMiddleware};
use fedify::config::FederationConfig;
use fedify::context::Context;
use fedify::error::Error;
use fedify::federation::{
    ActorDispatcher,
    Federation,
    FederationBuilder,
    InboxListener,
    KeyPairsDispatcher,
};
use fedify::kv::MemoryKvStore;
use fedify::sending::{Recipient, SendOptions};
use fedify::signatures::{generate_actor_keypair, Keypair, SigningKey};
use fedify::vocab::{Activity, ActivityKind, Actor, ActorKind, Refs};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use url::Url;

/// Per-instance application state: one local user and its key.
#[derive(Clone)]
struct AppState {
    username: &'static str,
    keypair: Arc<Keypair>,
    received: Arc<Mutex<Vec<(ActivityKind, Url)>>>,
}

struct Users;

#[async_trait]
impl ActorDispatcher<AppState> for Users {
    async fn dispatch(
        &self,
        ctx: &Context<AppState>,
        identifier: &str,
    ) -> Result<Option<Actor>, Error> {
        if identifier != ctx.app_data().username {
            return Ok(None);
        }
        Ok(Some(Actor {
            kind: ActorKind::Person,
            name: Some(identifier.to_string()),
            ..Default::default()
        }))
    }
}

struct Keys;

#[async_trait]
impl KeyPairsDispatcher<AppState> for Keys {
    async fn dispatch(
        &self,
        ctx: &Context<AppState>,
        _identifier: &str,
    ) -> Result<Vec<SigningKey>, Error> {
        Ok(vec![SigningKey::from_pem(&ctx.app_data().keypair.private_key)?])
    }
}

struct RecordActivity;

#[async_trait]
impl InboxListener<AppState> for RecordActivity {
    async fn handle(&self, ctx: &Context<AppState>, activity: Activity) -> Result<(), Error> {
        let actor = activity
            .actor_id()
            .ok_or_else(|| Error::Parse("activity has no actor".to_string()))?
            .clone();
        ctx.app_data()
            .received
            .lock()
            .await
            .push((activity.kind, actor));
        Ok(())
    }
}

/// Builds one instance and serves it on an ephemeral port.
async fn spawn_instance(username: &'static str) -> (Federation<AppState>, AppState, SocketAddr) {
    let state = AppState {
        username,
        keypair: Arc::new(generate_actor_keypair().expect("keygen")),
        received: Arc::new(Mutex::new(Vec::new())),
    };
    let config = FederationConfig::builder()
        .app_data(state.clone())
        .kv(Arc::new(MemoryKvStore::new()))
        .allow_private_address(true)
        .build()
        .expect("config");
    let federation = FederationBuilder::new()
        .actor_dispatcher("/users/{identifier}", Arc::new(Users))
        .expect("actor route")
        .key_pairs_dispatcher(Arc::new(Keys))
        .inbox("/users/{identifier}/inbox", Some("/inbox"))
        .expect("inbox routes")
        .on(ActivityKind::Follow, Arc::new(RecordActivity))
        .on(ActivityKind::Undo, Arc::new(RecordActivity))
        .build(config)
        .expect("federation");

    let app = Router::new()
        .fallback(federation_handler::<AppState>)
        .layer(FederationMiddleware::new(federation.clone()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(axum::serve(listener, app).into_future());

    (federation, state, addr)
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_follow_across_instances() {
    let (federation_a, _state_a, addr_a) = spawn_instance("alice").await;
    let (_federation_b, state_b, addr_b) = spawn_instance("bob").await;

    let base_a: Url = format!("http://{addr_a}/").parse().expect("base");
    let ctx_a = federation_a.create_context(&base_a);

    let bob_actor: Url = format!("http://{addr_b}/users/bob").parse().expect("url");
    let bob_inbox: Url = format!("http://{addr_b}/users/bob/inbox").parse().expect("url");

    let mut follow = Activity::new(ActivityKind::Follow);
    follow.id = Some(
        format!("http://{addr_a}/activities/1").parse().expect("id"),
    );
    follow.object = Refs::url(bob_actor.clone());
    follow.to = vec![bob_actor];

    ctx_a
        .send_activity(
            "alice",
            &[Recipient::Inbox(bob_inbox.clone())],
            follow.clone(),
            SendOptions::default(),
        )
        .await
        .expect("send");

    // Bob's instance verifies the signature by fetching Alice's actor
    // document (and her key with it) from instance A.
    let received = state_b.received.clone();
    wait_for(|| received.try_lock().map(|r| !r.is_empty()).unwrap_or(false)).await;

    let received = state_b.received.lock().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, ActivityKind::Follow);
    assert_eq!(
        received[0].1.as_str(),
        format!("http://{addr_a}/users/alice")
    );
    drop(received);

    // The same activity id delivered again is collapsed by the inbox
    // idempotence key.
    ctx_a
        .send_activity(
            "alice",
            &[Recipient::Inbox(bob_inbox)],
            follow,
            SendOptions::default(),
        )
        .await
        .expect("send again");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(state_b.received.lock().await.len(), 1);
}

#[tokio::test]
async fn test_unsigned_delivery_is_rejected() {
    let (_federation_b, state_b, addr_b) = spawn_instance("bob").await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr_b}/users/bob/inbox"))
        .header("content-type", "application/activity+json")
        .body(
            serde_json::json!({
                "id": "http://elsewhere.example/activities/1",
                "type": "Follow",
                "actor": "http://elsewhere.example/users/mallory",
                "object": format!("http://{addr_b}/users/bob")
            })
            .to_string(),
        )
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert!(state_b.received.lock().await.is_empty());
}

#[tokio::test]
async fn test_remote_actor_fetch() {
    let (federation_b, _state_b, addr_b) = spawn_instance("bob").await;
    let (_federation_a, _state_a, addr_a) = spawn_instance("alice").await;

    let base_b: Url = format!("http://{addr_b}/").parse().expect("base");
    let ctx_b = federation_b.create_context(&base_b);

    let entity = ctx_b
        .lookup_object(&format!("http://{addr_a}/users/alice"), None)
        .await
        .expect("alice resolves");
    let actor = entity.into_actor().expect("an actor");
    assert_eq!(actor.name.as_deref(), Some("alice"));
    assert_eq!(
        actor.inbox.as_ref().map(Url::as_str),
        Some(format!("http://{addr_a}/users/alice/inbox").as_str())
    );
    assert!(!actor.key_ids().is_empty());
}
