//! Receiving activities: verification, idempotence and dispatch

use crate::context::{Context, RequestContext};
use crate::error::Error;
use crate::fetch::loader::SignedDocumentLoader;
use crate::sending::QueueMessage;
use crate::signatures::{cavage, rfc9421, CachingKeyResolver, FetchedKey, KeyResolver, VerifyOptions};
use crate::vocab::Activity;
use chrono::Duration;
use http::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Which inbox a POST landed in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum InboxKind {
    /// The inbox of one local actor
    Personal(String),
    /// The shared inbox
    Shared,
}

impl InboxKind {
    fn identifier(&self) -> Option<&str> {
        match self {
            InboxKind::Personal(identifier) => Some(identifier),
            InboxKind::Shared => None,
        }
    }
}

/// The inbox pipeline. Returns the response status; errors map to HTTP
/// statuses in the request handler.
pub(crate) async fn receive_activity<T: Clone + Send + Sync + 'static>(
    ctx: &RequestContext<T>,
    kind: &InboxKind,
) -> Result<StatusCode, Error> {
    let config = &ctx.context().inner.config;

    // 1. Signature.
    let key = if config.skip_signature_verification {
        None
    } else {
        Some(verify_inbox_signature(ctx, kind).await?)
    };

    // 2. Body must parse as an activity.
    let document: Value = serde_json::from_slice(&ctx.body)
        .map_err(|e| Error::Parse(format!("inbox body: {e}")))?;
    let activity = Activity::from_json_ld(&document)?;
    let actor_id = activity
        .actor_id()
        .ok_or_else(|| Error::Parse("activity has no actor".to_string()))?
        .clone();

    // A signature from one origin must not vouch for an actor on
    // another (spoofed-actor check).
    if let Some(key) = &key {
        let owner = key
            .owner
            .as_ref()
            .ok_or(Error::Signature("signing key has no owner"))?;
        if owner.origin() != actor_id.origin() {
            return Err(Error::Signature("activity actor does not match the signing key owner"));
        }
    }

    // 3. Idempotence on the activity id.
    if let Some(id) = &activity.id {
        let inbox_id = kind.identifier().unwrap_or("");
        let kv_key = config
            .kv_prefix
            .with("inboxIdempotence")
            .with(inbox_id)
            .with(id.as_str());
        match config.kv.get(&kv_key).await {
            Ok(Some(_)) => {
                debug!("Activity {id} was already processed, acknowledging");
                return Ok(StatusCode::ACCEPTED);
            }
            Ok(None) => {
                if let Err(error) = config
                    .kv
                    .set(&kv_key, json!(true), Some(Duration::weeks(2)))
                    .await
                {
                    warn!("Failed to record idempotence key for {id}: {error}");
                }
            }
            Err(error) => warn!("Idempotence lookup failed for {id}: {error}"),
        }
    }

    debug!("Receiving {:?} activity {:?}", activity.kind, activity.id);

    // 4. Dispatch to the most specific listener.
    match dispatch_activity(ctx.context(), activity).await {
        Ok(true) => Ok(StatusCode::ACCEPTED),
        Ok(false) => {
            debug!("No listener registered for this activity type");
            Ok(StatusCode::ACCEPTED)
        }
        Err(error) => {
            report_inbox_error(ctx.context(), &error).await;
            // 5. Retriable listener failures go back through the queue.
            if let Some(queue) = &config.queue {
                if let Some(delay) = config.inbox_retry_policy.delay(1) {
                    let retry = QueueMessage::Inbox {
                        activity: document,
                        identifier: kind.identifier().map(ToString::to_string),
                        attempt: 1,
                    };
                    queue
                        .enqueue(serde_json::to_value(&retry)?, Some(delay))
                        .await?;
                    return Ok(StatusCode::ACCEPTED);
                }
            }
            Err(error)
        }
    }
}

/// Verifies the request under whichever suite it carries. The shared
/// inbox resolves keys through a signed loader when a shared-key
/// dispatcher is configured, to cope with authorized-fetch servers.
async fn verify_inbox_signature<T: Clone + Send + Sync + 'static>(
    ctx: &RequestContext<T>,
    kind: &InboxKind,
) -> Result<FetchedKey, Error> {
    let config = &ctx.context().inner.config;

    let resolver: Arc<dyn KeyResolver> = match kind {
        InboxKind::Shared => match shared_signing_identity(ctx.context()).await? {
            Some((key, key_id)) => {
                let loader =
                    SignedDocumentLoader::new(config.client.clone(), key, key_id);
                Arc::new(CachingKeyResolver::new(
                    Arc::new(loader),
                    config.kv.clone(),
                    config.kv_prefix.clone(),
                ))
            }
            None => config.key_resolver(),
        },
        InboxKind::Personal(_) => config.key_resolver(),
    };

    let options = VerifyOptions {
        current_time: None,
        time_window: config.time_window,
    };
    let body = Some(&ctx.body[..]);
    let key = if ctx.headers.contains_key("signature-input") {
        rfc9421::verify_request(&ctx.method, &ctx.url, &ctx.headers, body, resolver.as_ref(), &options)
            .await
    } else {
        cavage::verify_request(&ctx.method, &ctx.url, &ctx.headers, body, resolver.as_ref(), &options)
            .await
    };
    key.ok_or(Error::Signature("inbox request signature could not be verified"))
}

/// The instance actor's first key pair, per the shared-key dispatcher.
async fn shared_signing_identity<T: Clone + Send + Sync + 'static>(
    ctx: &Context<T>,
) -> Result<Option<(crate::signatures::SigningKey, url::Url)>, Error> {
    let Some(dispatcher) = &ctx.inner.registrations.shared_key else {
        return Ok(None);
    };
    let Some(identifier) = dispatcher.dispatch(ctx).await? else {
        return Ok(None);
    };
    Ok(ctx.actor_key_pairs(&identifier).await?.into_iter().next())
}

/// Walks the activity's type lineage, most specific first, and runs the
/// first registered listener. Returns whether one was found.
pub(crate) async fn dispatch_activity<T: Clone + Send + Sync + 'static>(
    ctx: &Context<T>,
    activity: Activity,
) -> Result<bool, Error> {
    let listeners = &ctx.inner.registrations.listeners;
    for kind in activity.kind.lineage() {
        if let Some((_, listener)) = listeners.iter().find(|(k, _)| *k == kind) {
            listener.handle(ctx, activity).await?;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Reports a listener error through the registered callback, or logs it.
pub(crate) async fn report_inbox_error<T: Clone + Send + Sync + 'static>(
    ctx: &Context<T>,
    error: &Error,
) {
    match &ctx.inner.registrations.inbox_error {
        Some(handler) => handler.handle(ctx, error).await,
        None => warn!("Inbox listener failed: {error}"),
    }
}
