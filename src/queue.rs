//! Message queue abstraction backing the delivery pipeline
//!
//! Queue bodies are opaque JSON; the federation serialises its own task
//! envelopes (see [crate::sending]) into them. Delivery is at-least-once:
//! a backend may hand the same message to the handler more than once, and
//! handlers stay correct through the inbox idempotence key.

use crate::error::Error;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Receives messages from a queue listener.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one message. Errors are logged by the listener; retry is
    /// the responsibility of the enqueueing pipeline.
    async fn handle(&self, message: Value) -> Result<(), Error>;
}

/// Queue contract the delivery pipeline runs against.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueues one message, optionally delaying its visibility.
    /// A delay of zero means "as soon as possible".
    async fn enqueue(&self, message: Value, delay: Option<Duration>) -> Result<(), Error>;

    /// Enqueues several messages with the same delay.
    async fn enqueue_many(&self, messages: Vec<Value>, delay: Option<Duration>) -> Result<(), Error> {
        for message in messages {
            self.enqueue(message, delay).await?;
        }
        Ok(())
    }

    /// Drains the queue into `handler` until `signal` is cancelled.
    ///
    /// After cancellation no further handler invocations begin; an
    /// invocation already running is awaited.
    async fn listen(
        &self,
        handler: Arc<dyn MessageHandler>,
        signal: CancellationToken,
    ) -> Result<(), Error>;
}

/// In-memory [MessageQueue] over an unbounded channel.
///
/// Delayed messages are re-posted by a spawned sleep, so equal-delay
/// messages keep their enqueue order while delayed ones surface later.
pub struct InMemoryMessageQueue {
    sender: UnboundedSender<Value>,
    receiver: Mutex<Option<UnboundedReceiver<Value>>>,
}

impl Default for InMemoryMessageQueue {
    fn default() -> Self {
        InMemoryMessageQueue::new()
    }
}

impl InMemoryMessageQueue {
    /// Creates an empty queue.
    pub fn new() -> InMemoryMessageQueue {
        let (sender, receiver) = unbounded_channel();
        InMemoryMessageQueue {
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn enqueue(&self, message: Value, delay: Option<Duration>) -> Result<(), Error> {
        let sender = self.sender.clone();
        match delay.filter(|d| !d.is_zero()) {
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    // The queue may be gone by now; a lost delayed message
                    // is indistinguishable from process shutdown.
                    sender.send(message).ok();
                });
            }
            None => {
                sender
                    .send(message)
                    .map_err(|e| Error::Queue(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn listen(
        &self,
        handler: Arc<dyn MessageHandler>,
        signal: CancellationToken,
    ) -> Result<(), Error> {
        let mut receiver = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Queue("queue is already being listened on".to_string()))?;

        loop {
            tokio::select! {
                _ = signal.cancelled() => break,
                message = receiver.recv() => {
                    match message {
                        Some(message) => {
                            if let Err(error) = handler.handle(message).await {
                                warn!("queue handler failed: {error}");
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // Hand the receiver back so a later listen can resume.
        *self.receiver.lock().await = Some(receiver);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Collector {
        seen: Mutex<Vec<Value>>,
        count: AtomicUsize,
    }

    impl Collector {
        fn new() -> Arc<Collector> {
            Arc::new(Collector {
                seen: Mutex::new(Vec::new()),
                count: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MessageHandler for Collector {
        async fn handle(&self, message: Value) -> Result<(), Error> {
            self.seen.lock().await.push(message);
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_listen() {
        let queue = Arc::new(InMemoryMessageQueue::new());
        let handler = Collector::new();
        let signal = CancellationToken::new();

        queue.enqueue(json!({"n": 1}), None).await.unwrap();
        queue
            .enqueue_many(vec![json!({"n": 2}), json!({"n": 3})], None)
            .await
            .unwrap();

        let listener = {
            let queue = queue.clone();
            let handler = handler.clone();
            let signal = signal.clone();
            tokio::spawn(async move { queue.listen(handler, signal).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        signal.cancel();
        listener.await.unwrap().unwrap();

        let seen = handler.seen.lock().await;
        assert_eq!(*seen, vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);
    }

    #[tokio::test]
    async fn test_delayed_message_surfaces_later() {
        let queue = Arc::new(InMemoryMessageQueue::new());
        let handler = Collector::new();
        let signal = CancellationToken::new();

        queue
            .enqueue(json!("late"), Some(Duration::from_millis(100)))
            .await
            .unwrap();
        queue.enqueue(json!("early"), None).await.unwrap();

        let listener = {
            let queue = queue.clone();
            let handler = handler.clone();
            let signal = signal.clone();
            tokio::spawn(async move { queue.listen(handler, signal).await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        signal.cancel();
        listener.await.unwrap().unwrap();

        let seen = handler.seen.lock().await;
        assert_eq!(*seen, vec![json!("early"), json!("late")]);
    }

    #[tokio::test]
    async fn test_cancelled_listener_stops() {
        let queue = Arc::new(InMemoryMessageQueue::new());
        let handler = Collector::new();
        let signal = CancellationToken::new();
        signal.cancel();

        queue.listen(handler.clone(), signal).await.unwrap();
        queue.enqueue(json!(1), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.count.load(Ordering::SeqCst), 0);
    }
}
