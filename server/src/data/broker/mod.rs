//! Message broker abstraction
//!
//! Driver-neutral producer/consumer contract with pluggable backends:
//! - In-memory (default) - local-only, for development and tests
//! - Redis Streams - distributed, ZSTD capable
//!
//! The core speaks only in terms of `defer_duration` and [`Compression`];
//! delay-level mapping and codec support stay inside each driver. A driver that
//! cannot honor a requested feature fails at factory time.
//!
//! ## Delivery
//!
//! At-least-once: a handler error makes the driver redeliver the message after
//! a driver-defined backoff, so handlers must be idempotent.

mod address;
mod codec;
mod config;
pub mod delay;
mod error;
mod memory;
mod redis;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::utils::retry::{DEFAULT_BASE_DELAY_MS, retry_async};

pub use address::{resolve_address, resolve_addresses};
pub use config::{Compression, ConsumerConfig, ProducerConfig};
pub use error::BrokerError;
pub use memory::MemoryBrokerFactory;
pub use redis::RedisBrokerFactory;

/// Default capacity of a producer's async-send queue
const DEFAULT_ASYNC_QUEUE_CAPACITY: usize = 10_000;

// ============================================================================
// MESSAGES
// ============================================================================

/// Unit of transport
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// Target topic; empty means the producer's configured topic
    pub topic: String,
    pub body: Vec<u8>,
    /// Server-side filter tag
    pub tag: Option<String>,
    /// Messages sharing a key are delivered in send order
    pub partition_key: Option<String>,
    pub properties: HashMap<String, String>,
    /// Delivery delay hint; zero or none means immediate
    pub defer_duration: Option<Duration>,
}

impl Message {
    pub fn new(topic: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            body,
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_defer(mut self, defer: Duration) -> Self {
        self.defer_duration = Some(defer);
        self
    }

}

/// A message as seen by a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct MessageExt {
    pub message: Message,
    /// Broker-assigned ID
    pub message_id: String,
    /// How many times this message was redelivered
    pub reconsume_times: u32,
}

/// Outcome of an accepted send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub message_id: String,
    pub offset: i64,
}

/// Completion callback of [`Producer::send_async`]
pub type SendCallback = Box<dyn FnOnce(Result<SendResult, BrokerError>) + Send + 'static>;

// ============================================================================
// CAPABILITIES
// ============================================================================

#[async_trait]
pub trait Producer: Send + Sync {
    async fn start(&self) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;

    /// Send and wait for the broker to accept the message
    async fn send(&self, msg: Message) -> Result<SendResult, BrokerError>;

    /// Send in order; the result describes the last message
    async fn send_batch(&self, msgs: Vec<Message>) -> Result<SendResult, BrokerError>;

    /// Queue a send without waiting. Fails immediately when the local queue is
    /// full; otherwise the callback later receives the broker outcome.
    fn send_async(&self, msg: Message, callback: SendCallback) -> Result<(), BrokerError>;
}

/// User message handler
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn handle_message(&self, msg: &MessageExt) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Consumer: Send + Sync {
    async fn start(&self) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;

    fn register_handler(&self, handler: Arc<dyn ConsumerHandler>);
}

/// Builds producers and consumers for one driver
#[async_trait]
pub trait BrokerFactory: Send + Sync {
    async fn create_producer(
        &self,
        config: ProducerConfig,
    ) -> Result<Arc<dyn Producer>, BrokerError>;

    async fn create_consumer(
        &self,
        config: ConsumerConfig,
    ) -> Result<Arc<dyn Consumer>, BrokerError>;

    fn driver_name(&self) -> &'static str;
}

// ============================================================================
// SHARED DRIVER HELPERS
// ============================================================================

type AsyncSend = (Message, SendCallback);

/// Spawn the worker draining a producer's async-send queue.
///
/// Sends run one at a time so per-key order matches enqueue order.
fn spawn_async_sender<F, Fut>(capacity: Option<usize>, send: F) -> mpsc::Sender<AsyncSend>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SendResult, BrokerError>> + Send + 'static,
{
    let (tx, mut rx) =
        mpsc::channel::<AsyncSend>(capacity.unwrap_or(DEFAULT_ASYNC_QUEUE_CAPACITY).max(1));
    tokio::spawn(async move {
        while let Some((msg, callback)) = rx.recv().await {
            let result = send(msg).await;
            callback(result);
        }
    });
    tx
}

/// Push onto an async-send queue, mapping a full queue to backpressure
fn enqueue_async(
    tx: Option<&mpsc::Sender<AsyncSend>>,
    topic: &str,
    msg: Message,
    callback: SendCallback,
) -> Result<(), BrokerError> {
    let tx = tx.ok_or(BrokerError::Closed)?;
    tx.try_send((msg, callback)).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => BrokerError::QueueFull(topic.to_string()),
        mpsc::error::TrySendError::Closed(_) => BrokerError::Closed,
    })
}

/// Run one send under the producer's timeout, retrying `retry_times` extra times
async fn send_with_retry<F, Fut>(
    config: &ProducerConfig,
    mut attempt: F,
) -> Result<SendResult, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<SendResult, BrokerError>>,
{
    let timeout = config.produce_timeout();
    retry_async(config.retry_times, DEFAULT_BASE_DELAY_MS, || {
        let send = attempt();
        async move {
            tokio::time::timeout(timeout, send).await.map_err(|_| {
                BrokerError::Timeout(format!("send exceeded {}ms", timeout.as_millis()))
            })?
        }
    })
    .await
}

/// Resolve the topic a message goes to
fn target_topic<'a>(msg: &'a Message, config: &'a ProducerConfig) -> Result<&'a str, BrokerError> {
    let topic = if msg.topic.is_empty() {
        config.topic.as_str()
    } else {
        msg.topic.as_str()
    };
    if topic.is_empty() {
        return Err(BrokerError::InvalidMessage("message has no topic".to_string()));
    }
    Ok(topic)
}

// ============================================================================
// FACTORY SELECTION
// ============================================================================

/// Broker driver selection, resolved from application config
#[derive(Debug, Clone)]
pub enum BrokerSettings {
    Memory { backlog_capacity: usize },
    Redis { url: String, stream_max_len: usize },
}

/// Build the factory for the configured driver
pub async fn create_factory(settings: &BrokerSettings) -> Result<Arc<dyn BrokerFactory>, BrokerError> {
    match settings {
        BrokerSettings::Memory { backlog_capacity } => Ok(Arc::new(
            MemoryBrokerFactory::with_backlog_capacity(*backlog_capacity),
        )),
        BrokerSettings::Redis {
            url,
            stream_max_len,
        } => {
            let factory = RedisBrokerFactory::new(url, *stream_max_len).await?;
            Ok(Arc::new(factory))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_builder() {
        let mut msg = Message::new("t", b"x".to_vec())
            .with_tag("create")
            .with_partition_key("trace-1")
            .with_defer(Duration::from_secs(5));
        msg.properties.insert("caller".to_string(), "eval".to_string());
        assert_eq!(msg.tag.as_deref(), Some("create"));
        assert_eq!(msg.partition_key.as_deref(), Some("trace-1"));
        assert_eq!(msg.defer_duration, Some(Duration::from_secs(5)));
        assert_eq!(msg.properties.get("caller").map(String::as_str), Some("eval"));
    }

    #[test]
    fn test_target_topic_falls_back_to_config() {
        let cfg = ProducerConfig {
            topic: "configured".to_string(),
            ..Default::default()
        };
        let msg = Message::new("", vec![]);
        assert_eq!(target_topic(&msg, &cfg).unwrap(), "configured");

        let explicit = Message::new("explicit", vec![]);
        assert_eq!(target_topic(&explicit, &cfg).unwrap(), "explicit");

        assert!(target_topic(&msg, &ProducerConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_enqueue_async_reports_full_queue() {
        let (tx, _rx) = mpsc::channel::<AsyncSend>(1);
        enqueue_async(Some(&tx), "t", Message::default(), Box::new(|_| {})).unwrap();
        let err = enqueue_async(Some(&tx), "t", Message::default(), Box::new(|_| {})).unwrap_err();
        assert!(matches!(err, BrokerError::QueueFull(_)));
        let closed = enqueue_async(None, "t", Message::default(), Box::new(|_| {})).unwrap_err();
        assert!(matches!(closed, BrokerError::Closed));
    }
}
