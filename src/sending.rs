//! Fan-out and delivery of outgoing activities with retry
//!
//! `Context::send_activity` normalises recipients to deduplicated inbox
//! URLs and enqueues one fan-out task; the fan-out worker splits it into
//! per-inbox outbox tasks; each outbox task signs (double-knocking
//! against unknown origins) and POSTs, re-enqueueing itself with an
//! exponential delay on retriable failures. Without a queue, delivery
//! runs inline.

use crate::context::Context;
use crate::error::Error;
use crate::signatures::double_knock::{send_signed, SignedRequest};
use crate::vocab::{Activity, Actor};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue};
use http::{Method, StatusCode};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

/// Retry schedule for failed deliveries: exponential backoff with a hard
/// cap on both the delay and the number of attempts.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included
    pub max_attempts: usize,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Multiplier applied per retry
    pub factor: u32,
    /// Upper bound on any delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_secs(60),
            factor: 4,
            max_delay: Duration::from_secs(12 * 60 * 60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` failed tries, or `None`
    /// when the task is out of attempts.
    pub fn delay(&self, attempt: usize) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = self.factor.saturating_pow(attempt.saturating_sub(1) as u32);
        Some(
            self.initial_delay
                .saturating_mul(factor)
                .min(self.max_delay),
        )
    }
}

/// A delivery target: a bare inbox URL or an actor to derive one from.
#[derive(Clone, Debug)]
pub enum Recipient {
    /// Deliver straight to this inbox
    Inbox(Url),
    /// Deliver to this actor's (shared) inbox
    Actor(Box<Actor>),
}

/// Options for `Context::send_activity`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SendOptions {
    /// Collapse recipients on the same server into their shared inbox
    pub prefer_shared_inbox: bool,
    /// Deliver inline even when a queue is attached
    pub immediate: bool,
}

/// Sender key material carried inside queue tasks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct SenderKey {
    pub(crate) key_id: Url,
    pub(crate) private_key_pem: String,
}

/// The task envelopes exchanged over the message queue.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub(crate) enum QueueMessage {
    /// Expand recipients into per-inbox deliveries
    Fanout {
        activity: Value,
        recipients: Vec<Url>,
        sender: SenderKey,
    },
    /// Sign and POST one activity to one inbox
    Outbox {
        activity: Value,
        inbox: Url,
        #[serde(rename = "keyId")]
        key_id: Url,
        #[serde(rename = "privateKeyPem")]
        private_key_pem: String,
        attempt: usize,
    },
    /// Re-run inbox listeners for an activity that failed before
    Inbox {
        activity: Value,
        identifier: Option<String>,
        attempt: usize,
    },
}

/// Normalises recipients to inbox URLs: shared inbox when preferred and
/// advertised, personal inbox otherwise; deduplicated; local inboxes and
/// actors without any inbox dropped.
pub(crate) fn expand_recipients<T: Clone + Send + Sync + 'static>(
    ctx: &Context<T>,
    recipients: &[Recipient],
    prefer_shared_inbox: bool,
) -> Vec<Url> {
    recipients
        .iter()
        .filter_map(|recipient| match recipient {
            Recipient::Inbox(url) => Some(url.clone()),
            Recipient::Actor(actor) => {
                let inbox = if prefer_shared_inbox {
                    actor.shared_inbox_or_inbox()
                } else {
                    actor.inbox.as_ref()
                };
                if inbox.is_none() {
                    debug!("Recipient {:?} has no inbox, skipping", actor.id);
                }
                inbox.cloned()
            }
        })
        .unique()
        .filter(|inbox| {
            let local = ctx.is_local_url(inbox);
            if local {
                debug!("Skipping local inbox {inbox}");
            }
            !local
        })
        .collect()
}

/// Implementation of `Context::send_activity`.
pub(crate) async fn send_activity<T: Clone + Send + Sync + 'static>(
    ctx: &Context<T>,
    sender: &str,
    recipients: &[Recipient],
    mut activity: Activity,
    options: SendOptions,
) -> Result<(), Error> {
    let key_pairs = ctx.actor_key_pairs(sender).await?;
    let Some((key, key_id)) = key_pairs.into_iter().next() else {
        return Err(Error::Other(format!(
            "actor {sender} has no signing keys registered"
        )));
    };

    if activity.id.is_none() {
        activity.id = Some(Url::parse(&format!("urn:uuid:{}", Uuid::new_v4()))?);
    }
    if activity.actor.is_empty() {
        activity.actor = crate::vocab::Refs::url(ctx.actor_uri(sender)?);
    }
    activity.strip_hidden_recipients();

    let mut inboxes = Vec::new();
    for inbox in expand_recipients(ctx, recipients, options.prefer_shared_inbox) {
        if let Err(error) = ctx.inner.config.verify_url(&inbox).await {
            debug!("Inbox url rejected, skipping {inbox}: {error}");
            continue;
        }
        inboxes.push(inbox);
    }
    if inboxes.is_empty() {
        debug!("Activity {:?} has no remote recipients", activity.id);
        return Ok(());
    }
    let activity_json = activity.to_json_ld(Default::default())?;

    let sender_key = SenderKey {
        key_id,
        private_key_pem: key.to_pem()?,
    };

    match &ctx.inner.config.queue {
        Some(queue) if !options.immediate => {
            let message = QueueMessage::Fanout {
                activity: activity_json,
                recipients: inboxes,
                sender: sender_key,
            };
            queue
                .enqueue(serde_json::to_value(&message)?, None)
                .await
        }
        _ => {
            // Inline delivery: one attempt per inbox, failures logged.
            // No ordering across recipients is guaranteed either way.
            for inbox in inboxes {
                let outcome = deliver(ctx, &activity_json, &inbox, &sender_key).await;
                if let Err(error) = outcome {
                    warn!("Failed to deliver {:?} to {inbox}: {error}", activity.id);
                }
            }
            Ok(())
        }
    }
}

/// Whether a response status is worth another attempt.
fn retriable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Signs and POSTs one activity to one inbox. An error means the
/// delivery may be retried; a terminal rejection returns `Ok`.
pub(crate) async fn deliver<T: Clone + Send + Sync + 'static>(
    ctx: &Context<T>,
    activity: &Value,
    inbox: &Url,
    sender: &SenderKey,
) -> Result<(), Error> {
    let key = ctx.inner.config.signing_key(&sender.private_key_pem).await?;
    let body = Bytes::from(serde_json::to_vec(activity)?);

    let mut headers = HeaderMap::new();
    headers.insert(
        "content-type",
        HeaderValue::from_static(crate::FEDERATION_CONTENT_TYPE),
    );
    let request = SignedRequest {
        method: Method::POST,
        url: inbox.clone(),
        headers,
        body: Some(body),
    };

    let config = &ctx.inner.config;
    let response = send_signed(
        &config.client,
        &request,
        &key,
        &sender.key_id,
        config.first_knock,
        config.spec_determiner().as_ref(),
    )
    .await?;

    let status = response.status();
    if status.is_success() {
        debug!("Delivered activity to {inbox}");
        return Ok(());
    }
    if retriable(status) {
        return Err(Error::fetch(inbox, status));
    }
    // Terminal client error: the receiver rejected the activity for
    // good, retrying cannot help.
    warn!("Delivery to {inbox} rejected with {status}, dropping");
    Ok(())
}

/// Handles one queue message; the queue worker loops over this.
pub(crate) async fn process_queue_message<T: Clone + Send + Sync + 'static>(
    ctx: &Context<T>,
    message: Value,
) -> Result<(), Error> {
    let message: QueueMessage = serde_json::from_value(message)?;
    let queue = ctx
        .inner
        .config
        .queue
        .clone()
        .ok_or_else(|| Error::Queue("no queue configured".to_string()))?;

    match message {
        QueueMessage::Fanout {
            activity,
            recipients,
            sender,
        } => {
            let tasks: Vec<Value> = recipients
                .into_iter()
                .map(|inbox| {
                    serde_json::to_value(&QueueMessage::Outbox {
                        activity: activity.clone(),
                        inbox,
                        key_id: sender.key_id.clone(),
                        private_key_pem: sender.private_key_pem.clone(),
                        attempt: 0,
                    })
                })
                .collect::<Result<_, _>>()?;
            queue.enqueue_many(tasks, None).await
        }
        QueueMessage::Outbox {
            activity,
            inbox,
            key_id,
            private_key_pem,
            attempt,
        } => {
            let sender = SenderKey {
                key_id,
                private_key_pem,
            };
            let Err(error) = deliver(ctx, &activity, &inbox, &sender).await else {
                return Ok(());
            };

            let next_attempt = attempt + 1;
            match ctx.inner.config.outbox_retry_policy.delay(next_attempt) {
                Some(delay) => {
                    debug!(
                        "Delivery to {inbox} failed ({error}), retry {next_attempt} in {delay:?}"
                    );
                    let retry = QueueMessage::Outbox {
                        activity,
                        inbox,
                        key_id: sender.key_id,
                        private_key_pem: sender.private_key_pem,
                        attempt: next_attempt,
                    };
                    queue
                        .enqueue(serde_json::to_value(&retry)?, Some(delay))
                        .await
                }
                None => {
                    warn!("Delivery to {inbox} failed terminally after {attempt} retries: {error}");
                    Ok(())
                }
            }
        }
        QueueMessage::Inbox {
            activity,
            identifier,
            attempt,
        } => {
            let parsed = Activity::from_json_ld(&activity)?;
            let Err(error) = crate::inbox::dispatch_activity(ctx, parsed).await else {
                return Ok(());
            };
            crate::inbox::report_inbox_error(ctx, &error).await;

            let next_attempt = attempt + 1;
            match ctx.inner.config.inbox_retry_policy.delay(next_attempt) {
                Some(delay) => {
                    let retry = QueueMessage::Inbox {
                        activity,
                        identifier,
                        attempt: next_attempt,
                    };
                    queue
                        .enqueue(serde_json::to_value(&retry)?, Some(delay))
                        .await
                }
                None => {
                    warn!("Inbox handler failed terminally after {attempt} retries: {error}");
                    Ok(())
                }
            }
        }
    }
}
