//! In-memory broker driver
//!
//! Local-only delivery for development and tests:
//! - Each consumer group owns a queue per topic; every group sees every message
//! - Messages published before any group subscribes wait in a bounded backlog
//! - Each group queue is bounded too; a full queue rejects sends with `QueueFull`
//! - Delays are honored by sleeping for the mapped delay level
//! - Failed handlers are redelivered with a growing delay level
//!
//! ## Limitations
//!
//! Process crash = all messages lost. ZSTD is rejected at factory time since
//! nothing leaves the process.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;

use super::config::{Compression, ConsumerConfig, ProducerConfig};
use super::delay::{effective_delay, level_duration};
use super::error::BrokerError;
use super::{
    AsyncSend, BrokerFactory, Consumer, ConsumerHandler, Message, MessageExt, Producer,
    SendCallback, SendResult, enqueue_async, send_with_retry, spawn_async_sender, target_topic,
};
use crate::core::constants::{DEFAULT_MEMORY_BACKLOG, REDELIVERY_START_LEVEL};

const DRIVER_NAME: &str = "memory";

// ============================================================================
// SHARED STATE
// ============================================================================

/// Pending messages of one consumer group
struct GroupQueue {
    queue: Mutex<VecDeque<MessageExt>>,
    notify: Notify,
    capacity: usize,
}

impl GroupQueue {
    fn new(initial: VecDeque<MessageExt>, capacity: usize) -> Self {
        Self {
            queue: Mutex::new(initial),
            notify: Notify::new(),
            capacity,
        }
    }

    fn is_full(&self) -> bool {
        self.queue.lock().len() >= self.capacity
    }

    /// Redeliveries skip the bound so a failed message is never lost
    fn push(&self, msg: MessageExt) {
        self.queue.lock().push_back(msg);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<MessageExt> {
        self.queue.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

#[derive(Default)]
struct TopicState {
    groups: RwLock<HashMap<String, Arc<GroupQueue>>>,
    /// Messages published while no group existed
    backlog: Mutex<VecDeque<MessageExt>>,
    next_offset: AtomicI64,
}

impl TopicState {
    /// Get or create a group queue; a new group takes over the backlog
    fn group(&self, name: &str, capacity: usize) -> Arc<GroupQueue> {
        if let Some(group) = self.groups.read().get(name) {
            return Arc::clone(group);
        }
        let mut groups = self.groups.write();
        if let Some(group) = groups.get(name) {
            return Arc::clone(group);
        }
        let initial = std::mem::take(&mut *self.backlog.lock());
        let group = Arc::new(GroupQueue::new(initial, capacity));
        if group.len() > 0 {
            group.notify.notify_one();
        }
        groups.insert(name.to_string(), Arc::clone(&group));
        group
    }

    fn deliver(&self, topic: &str, msg: MessageExt, backlog_capacity: usize) -> Result<(), BrokerError> {
        let groups = self.groups.read();
        if groups.is_empty() {
            let mut backlog = self.backlog.lock();
            if backlog.len() >= backlog_capacity {
                return Err(BrokerError::QueueFull(topic.to_string()));
            }
            backlog.push_back(msg);
            return Ok(());
        }
        if groups.values().any(|g| g.is_full()) {
            return Err(BrokerError::QueueFull(topic.to_string()));
        }
        for group in groups.values() {
            group.push(msg.clone());
        }
        Ok(())
    }
}

struct BrokerState {
    topics: RwLock<HashMap<String, Arc<TopicState>>>,
    backlog_capacity: usize,
}

impl BrokerState {
    fn topic(&self, name: &str) -> Arc<TopicState> {
        if let Some(topic) = self.topics.read().get(name) {
            return Arc::clone(topic);
        }
        let mut topics = self.topics.write();
        Arc::clone(topics.entry(name.to_string()).or_default())
    }

    /// Accept a message, scheduling it for later when it carries a delay
    fn publish(self: &Arc<Self>, msg: Message, topic: &str) -> Result<SendResult, BrokerError> {
        let state = self.topic(topic);
        let offset = state.next_offset.fetch_add(1, Ordering::Relaxed);
        let message_id = uuid::Uuid::new_v4().simple().to_string();
        let delay = effective_delay(msg.defer_duration);
        let ext = MessageExt {
            message: msg,
            message_id: message_id.clone(),
            reconsume_times: 0,
        };

        match delay {
            None => state.deliver(topic, ext, self.backlog_capacity)?,
            Some(delay) => {
                let capacity = self.backlog_capacity;
                let topic = topic.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = state.deliver(&topic, ext, capacity) {
                        tracing::warn!(error = %e, topic = %topic, "Dropping delayed message");
                    }
                });
            }
        }

        Ok(SendResult { message_id, offset })
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Factory for in-process producers and consumers sharing one broker state
#[derive(Clone)]
pub struct MemoryBrokerFactory {
    state: Arc<BrokerState>,
}

impl Default for MemoryBrokerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBrokerFactory {
    pub fn new() -> Self {
        Self::with_backlog_capacity(DEFAULT_MEMORY_BACKLOG)
    }

    /// Create with a custom bound on messages waiting in the backlog or in any group
    pub fn with_backlog_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(BrokerState {
                topics: RwLock::new(HashMap::new()),
                backlog_capacity: capacity.max(1),
            }),
        }
    }

    /// Messages waiting for a group (including the backlog when no group exists)
    pub fn pending(&self, topic: &str, group: &str) -> usize {
        let state = self.state.topic(topic);
        let groups = state.groups.read();
        match groups.get(group) {
            Some(g) => g.len(),
            None => state.backlog.lock().len(),
        }
    }
}

fn reject_compression(compression: Compression) -> Result<(), BrokerError> {
    match compression {
        Compression::None => Ok(()),
        other => Err(BrokerError::UnsupportedCompression(format!(
            "{} driver does not support {}",
            DRIVER_NAME,
            other.as_str()
        ))),
    }
}

#[async_trait]
impl BrokerFactory for MemoryBrokerFactory {
    async fn create_producer(
        &self,
        config: ProducerConfig,
    ) -> Result<Arc<dyn Producer>, BrokerError> {
        reject_compression(config.compression)?;
        Ok(Arc::new(MemoryProducer::new(Arc::clone(&self.state), config)))
    }

    async fn create_consumer(
        &self,
        config: ConsumerConfig,
    ) -> Result<Arc<dyn Consumer>, BrokerError> {
        reject_compression(config.compression)?;
        if config.topic.is_empty() || config.consumer_group.is_empty() {
            return Err(BrokerError::Config(
                "consumer requires a topic and a consumer group".to_string(),
            ));
        }
        Ok(Arc::new(MemoryConsumer::new(Arc::clone(&self.state), config)))
    }

    fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }
}

// ============================================================================
// PRODUCER
// ============================================================================

pub struct MemoryProducer {
    state: Arc<BrokerState>,
    config: ProducerConfig,
    async_tx: Mutex<Option<mpsc::Sender<AsyncSend>>>,
    closed: AtomicBool,
}

impl MemoryProducer {
    fn new(state: Arc<BrokerState>, config: ProducerConfig) -> Self {
        Self {
            state,
            config,
            async_tx: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn send_now(
        state: &Arc<BrokerState>,
        config: &ProducerConfig,
        msg: Message,
    ) -> Result<SendResult, BrokerError> {
        let topic = target_topic(&msg, config)?.to_string();
        state.publish(msg, &topic)
    }
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn start(&self) -> Result<(), BrokerError> {
        let mut tx = self.async_tx.lock();
        if tx.is_none() {
            let state = Arc::clone(&self.state);
            let config = self.config.clone();
            *tx = Some(spawn_async_sender(self.config.queue_capacity, move |msg| {
                let result = Self::send_now(&state, &config, msg);
                async move { result }
            }));
        }
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        self.async_tx.lock().take();
        Ok(())
    }

    async fn send(&self, msg: Message) -> Result<SendResult, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        send_with_retry(&self.config, || {
            let result = Self::send_now(&self.state, &self.config, msg.clone());
            async move { result }
        })
        .await
    }

    async fn send_batch(&self, msgs: Vec<Message>) -> Result<SendResult, BrokerError> {
        let mut last = None;
        for msg in msgs {
            last = Some(self.send(msg).await?);
        }
        last.ok_or_else(|| BrokerError::InvalidMessage("empty batch".to_string()))
    }

    fn send_async(&self, msg: Message, callback: SendCallback) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let tx = self.async_tx.lock();
        enqueue_async(tx.as_ref(), &self.config.topic, msg, callback)
    }
}

// ============================================================================
// CONSUMER
// ============================================================================

/// What a worker needs to run one delivery
struct Delivery {
    handler: Arc<dyn ConsumerHandler>,
    group: Arc<GroupQueue>,
    consume_timeout: Duration,
    max_reconsume_times: u32,
    topic: String,
    consumer_group: String,
}

impl Delivery {
    async fn run_handler(&self, msg: &MessageExt) -> Result<(), String> {
        match tokio::time::timeout(self.consume_timeout, self.handler.handle_message(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err(format!(
                "handler exceeded {}ms",
                self.consume_timeout.as_millis()
            )),
        }
    }

    /// Unordered delivery: a failure re-queues the message after a backoff
    async fn consume(&self, msg: MessageExt) {
        let Err(error) = self.run_handler(&msg).await else {
            return;
        };
        if msg.reconsume_times >= self.max_reconsume_times {
            tracing::error!(
                topic = %self.topic,
                group = %self.consumer_group,
                message_id = %msg.message_id,
                reconsume_times = msg.reconsume_times,
                error = %error,
                "Message exhausted redeliveries, dropping"
            );
            return;
        }
        let level = REDELIVERY_START_LEVEL.saturating_add(msg.reconsume_times.min(u8::MAX as u32) as u8);
        let delay = level_duration(level);
        tracing::warn!(
            topic = %self.topic,
            group = %self.consumer_group,
            message_id = %msg.message_id,
            reconsume_times = msg.reconsume_times,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Handler failed, scheduling redelivery"
        );
        let group = Arc::clone(&self.group);
        let mut next = msg;
        next.reconsume_times += 1;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            group.push(next);
        });
    }

    /// Ordered delivery: retry in place so later messages of the key wait
    async fn consume_in_order(&self, mut msg: MessageExt) {
        loop {
            let Err(error) = self.run_handler(&msg).await else {
                return;
            };
            if msg.reconsume_times >= self.max_reconsume_times {
                tracing::error!(
                    topic = %self.topic,
                    group = %self.consumer_group,
                    message_id = %msg.message_id,
                    error = %error,
                    "Ordered message exhausted redeliveries, dropping"
                );
                return;
            }
            tracing::warn!(
                topic = %self.topic,
                message_id = %msg.message_id,
                reconsume_times = msg.reconsume_times,
                error = %error,
                "Ordered handler failed, retrying"
            );
            msg.reconsume_times += 1;
            tokio::time::sleep(level_duration(1)).await;
        }
    }
}

pub struct MemoryConsumer {
    state: Arc<BrokerState>,
    config: ConsumerConfig,
    handler: RwLock<Option<Arc<dyn ConsumerHandler>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl MemoryConsumer {
    fn new(state: Arc<BrokerState>, config: ConsumerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state,
            config,
            handler: RwLock::new(None),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    fn lane_for(key: &str, lanes: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % lanes as u64) as usize
    }
}

/// Wait for the next message, returning `None` on shutdown
async fn next_message(
    group: &GroupQueue,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<MessageExt> {
    loop {
        if *shutdown.borrow() {
            return None;
        }
        if let Some(msg) = group.pop() {
            return Some(msg);
        }
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
            _ = group.notify.notified() => {}
        }
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn start(&self) -> Result<(), BrokerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(handler) = self.handler.read().clone() else {
            self.started.store(false, Ordering::SeqCst);
            return Err(BrokerError::Config(format!(
                "no handler registered for topic '{}'",
                self.config.topic
            )));
        };
        self.shutdown.send_replace(false);

        let group = self
            .state
            .topic(&self.config.topic)
            .group(&self.config.consumer_group, self.state.backlog_capacity);
        let concurrency = self.config.concurrency();
        let delivery = Arc::new(Delivery {
            handler,
            group: Arc::clone(&group),
            consume_timeout: self.config.consume_timeout(),
            max_reconsume_times: self.config.max_reconsume_times(),
            topic: self.config.topic.clone(),
            consumer_group: self.config.consumer_group.clone(),
        });
        let config = self.config.clone();
        let mut shutdown = self.shutdown.subscribe();
        let mut tasks = Vec::new();

        if config.orderly {
            let mut lanes = Vec::with_capacity(concurrency);
            for _ in 0..concurrency {
                let (tx, mut rx) = mpsc::channel::<MessageExt>(1);
                let delivery = Arc::clone(&delivery);
                tasks.push(tokio::spawn(async move {
                    while let Some(msg) = rx.recv().await {
                        delivery.consume_in_order(msg).await;
                    }
                }));
                lanes.push(tx);
            }
            tasks.push(tokio::spawn(async move {
                let mut round_robin = 0usize;
                while let Some(msg) = next_message(&group, &mut shutdown).await {
                    if !config.accepts_tag(msg.message.tag.as_deref()) {
                        continue;
                    }
                    let lane = match msg.message.partition_key.as_deref() {
                        Some(key) => Self::lane_for(key, lanes.len()),
                        None => {
                            round_robin = round_robin.wrapping_add(1);
                            round_robin % lanes.len()
                        }
                    };
                    if lanes[lane].send(msg).await.is_err() {
                        break;
                    }
                }
            }));
        } else {
            let permits = Arc::new(Semaphore::new(concurrency));
            tasks.push(tokio::spawn(async move {
                while let Some(msg) = next_message(&group, &mut shutdown).await {
                    if !config.accepts_tag(msg.message.tag.as_deref()) {
                        continue;
                    }
                    let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                        break;
                    };
                    let delivery = Arc::clone(&delivery);
                    tokio::spawn(async move {
                        delivery.consume(msg).await;
                        drop(permit);
                    });
                }
            }));
        }

        tracing::debug!(
            topic = %self.config.topic,
            group = %self.config.consumer_group,
            concurrency,
            orderly = self.config.orderly,
            "Memory consumer started"
        );
        *self.tasks.lock() = tasks;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn register_handler(&self, handler: Arc<dyn ConsumerHandler>) {
        *self.handler.write() = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// Forwards every delivery to a channel, failing the first `fail_first` attempts
    struct Recorder {
        tx: mpsc::UnboundedSender<MessageExt>,
        fail_first: u32,
        attempts: AtomicU32,
    }

    impl Recorder {
        fn new(fail_first: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<MessageExt>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    tx,
                    fail_first,
                    attempts: AtomicU32::new(0),
                }),
                rx,
            )
        }
    }

    #[async_trait]
    impl ConsumerHandler for Recorder {
        async fn handle_message(&self, msg: &MessageExt) -> anyhow::Result<()> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            let _ = self.tx.send(msg.clone());
            if n < self.fail_first {
                anyhow::bail!("attempt {} failed", n);
            }
            Ok(())
        }
    }

    fn producer_config(topic: &str) -> ProducerConfig {
        ProducerConfig {
            topic: topic.to_string(),
            ..Default::default()
        }
    }

    fn consumer_config(topic: &str, group: &str) -> ConsumerConfig {
        ConsumerConfig {
            topic: topic.to_string(),
            consumer_group: group.to_string(),
            ..Default::default()
        }
    }

    async fn started_consumer(
        factory: &MemoryBrokerFactory,
        config: ConsumerConfig,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Arc<dyn Consumer> {
        let consumer = factory.create_consumer(config).await.unwrap();
        consumer.register_handler(handler);
        consumer.start().await.unwrap();
        consumer
    }

    #[tokio::test]
    async fn test_zstd_rejected_at_factory_time() {
        let factory = MemoryBrokerFactory::new();
        let mut cfg = producer_config("t");
        cfg.compression = Compression::Zstd;
        let err = factory.create_producer(cfg).await.err().unwrap();
        assert!(matches!(err, BrokerError::UnsupportedCompression(_)));

        let mut ccfg = consumer_config("t", "g");
        ccfg.compression = Compression::Zstd;
        assert!(factory.create_consumer(ccfg).await.is_err());
    }

    #[tokio::test]
    async fn test_send_delivers_to_consumer() {
        let factory = MemoryBrokerFactory::new();
        let (handler, mut rx) = Recorder::new(0);
        let consumer = started_consumer(&factory, consumer_config("spans", "g"), handler).await;

        let producer = factory.create_producer(producer_config("spans")).await.unwrap();
        producer.start().await.unwrap();
        let result = producer
            .send(Message::new("", b"hello".to_vec()))
            .await
            .unwrap();
        assert_eq!(result.offset, 0);

        let got = rx.recv().await.unwrap();
        assert_eq!(got.message.body, b"hello");
        assert_eq!(got.message_id, result.message_id);
        assert_eq!(got.reconsume_times, 0);
        consumer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_backlog_drains_to_first_group() {
        let factory = MemoryBrokerFactory::new();
        let producer = factory.create_producer(producer_config("t")).await.unwrap();
        producer.start().await.unwrap();
        producer.send(Message::new("t", b"early".to_vec())).await.unwrap();
        assert_eq!(factory.pending("t", "g"), 1);

        let (handler, mut rx) = Recorder::new(0);
        let consumer = started_consumer(&factory, consumer_config("t", "g"), handler).await;
        assert_eq!(rx.recv().await.unwrap().message.body, b"early");
        consumer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_backlog_capacity_applies_backpressure() {
        let factory = MemoryBrokerFactory::with_backlog_capacity(1);
        let producer = factory.create_producer(producer_config("t")).await.unwrap();
        producer.start().await.unwrap();
        producer.send(Message::new("t", vec![1])).await.unwrap();
        let err = producer.send(Message::new("t", vec![2])).await.unwrap_err();
        assert!(matches!(err, BrokerError::QueueFull(_)));
    }

    #[tokio::test]
    async fn test_idle_group_queue_applies_backpressure() {
        let factory = MemoryBrokerFactory::with_backlog_capacity(2);
        let (handler, _rx) = Recorder::new(0);
        // Subscribed, then no longer pulling
        let consumer = started_consumer(&factory, consumer_config("t", "g"), handler).await;
        consumer.close().await.unwrap();

        let mut cfg = producer_config("t");
        cfg.retry_times = 0;
        let producer = factory.create_producer(cfg).await.unwrap();
        producer.start().await.unwrap();
        producer.send(Message::new("t", vec![1])).await.unwrap();
        producer.send(Message::new("t", vec![2])).await.unwrap();
        let err = producer.send(Message::new("t", vec![3])).await.unwrap_err();
        assert!(matches!(err, BrokerError::QueueFull(_)));
        assert_eq!(factory.pending("t", "g"), 2);
    }

    #[tokio::test]
    async fn test_send_batch_empty_is_invalid() {
        let factory = MemoryBrokerFactory::new();
        let producer = factory.create_producer(producer_config("t")).await.unwrap();
        producer.start().await.unwrap();
        assert!(matches!(
            producer.send_batch(vec![]).await.unwrap_err(),
            BrokerError::InvalidMessage(_)
        ));
        let last = producer
            .send_batch(vec![Message::new("t", vec![1]), Message::new("t", vec![2])])
            .await
            .unwrap();
        assert_eq!(last.offset, 1);
    }

    #[tokio::test]
    async fn test_closed_producer_rejects_sends() {
        let factory = MemoryBrokerFactory::new();
        let producer = factory.create_producer(producer_config("t")).await.unwrap();
        producer.start().await.unwrap();
        producer.close().await.unwrap();
        assert!(matches!(
            producer.send(Message::new("t", vec![])).await.unwrap_err(),
            BrokerError::Closed
        ));
        assert!(matches!(
            producer
                .send_async(Message::new("t", vec![]), Box::new(|_| {}))
                .unwrap_err(),
            BrokerError::Closed
        ));
    }

    #[tokio::test]
    async fn test_send_async_invokes_callback() {
        let factory = MemoryBrokerFactory::new();
        let producer = factory.create_producer(producer_config("t")).await.unwrap();
        producer.start().await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        producer
            .send_async(
                Message::new("t", vec![9]),
                Box::new(move |result| {
                    let _ = tx.send(result.is_ok());
                }),
            )
            .unwrap();
        assert!(rx.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_message_waits_for_level() {
        let factory = MemoryBrokerFactory::new();
        let (handler, mut rx) = Recorder::new(0);
        let consumer = started_consumer(&factory, consumer_config("t", "g"), handler).await;
        let producer = factory.create_producer(producer_config("t")).await.unwrap();
        producer.start().await.unwrap();

        let started = tokio::time::Instant::now();
        producer
            .send(Message::new("t", vec![1]).with_defer(Duration::from_secs(7)))
            .await
            .unwrap();
        rx.recv().await.unwrap();
        // 7s maps to the 10s level
        assert!(started.elapsed() >= Duration::from_secs(10));
        consumer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_handler_is_redelivered() {
        let factory = MemoryBrokerFactory::new();
        let (handler, mut rx) = Recorder::new(2);
        let consumer = started_consumer(&factory, consumer_config("t", "g"), handler).await;
        let producer = factory.create_producer(producer_config("t")).await.unwrap();
        producer.start().await.unwrap();
        producer.send(Message::new("t", vec![1])).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();
        assert_eq!(first.reconsume_times, 0);
        assert_eq!(second.reconsume_times, 1);
        assert_eq!(third.reconsume_times, 2);
        assert_eq!(first.message_id, third.message_id);
        consumer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_stops_at_max_reconsume_times() {
        let factory = MemoryBrokerFactory::new();
        let (handler, mut rx) = Recorder::new(u32::MAX);
        let mut cfg = consumer_config("t", "g");
        cfg.max_reconsume_times = Some(1);
        let consumer = started_consumer(&factory, cfg, handler).await;
        let producer = factory.create_producer(producer_config("t")).await.unwrap();
        producer.start().await.unwrap();
        producer.send(Message::new("t", vec![1])).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().reconsume_times, 0);
        assert_eq!(rx.recv().await.unwrap().reconsume_times, 1);
        let extra = tokio::time::timeout(Duration::from_secs(3600), rx.recv()).await;
        assert!(extra.is_err());
        consumer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_tag_expression_filters_messages() {
        let factory = MemoryBrokerFactory::new();
        let (handler, mut rx) = Recorder::new(0);
        let mut cfg = consumer_config("t", "g");
        cfg.tag_expression = Some("keep".to_string());
        let consumer = started_consumer(&factory, cfg, handler).await;
        let producer = factory.create_producer(producer_config("t")).await.unwrap();
        producer.start().await.unwrap();
        producer
            .send(Message::new("t", vec![1]).with_tag("skip"))
            .await
            .unwrap();
        producer
            .send(Message::new("t", vec![2]).with_tag("keep"))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().message.body, vec![2]);
        consumer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_every_group_sees_every_message() {
        let factory = MemoryBrokerFactory::new();
        let (h1, mut rx1) = Recorder::new(0);
        let (h2, mut rx2) = Recorder::new(0);
        let c1 = started_consumer(&factory, consumer_config("t", "a"), h1).await;
        let c2 = started_consumer(&factory, consumer_config("t", "b"), h2).await;
        let producer = factory.create_producer(producer_config("t")).await.unwrap();
        producer.start().await.unwrap();
        producer.send(Message::new("t", vec![5])).await.unwrap();
        assert_eq!(rx1.recv().await.unwrap().message.body, vec![5]);
        assert_eq!(rx2.recv().await.unwrap().message.body, vec![5]);
        c1.close().await.unwrap();
        c2.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_orderly_preserves_key_order() {
        let factory = MemoryBrokerFactory::new();
        let (handler, mut rx) = Recorder::new(0);
        let mut cfg = consumer_config("t", "g");
        cfg.orderly = true;
        cfg.concurrency = Some(4);
        let consumer = started_consumer(&factory, cfg, handler).await;
        let producer = factory.create_producer(producer_config("t")).await.unwrap();
        producer.start().await.unwrap();
        for i in 0..20u8 {
            producer
                .send(Message::new("t", vec![i]).with_partition_key("trace-1"))
                .await
                .unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..20 {
            seen.push(rx.recv().await.unwrap().message.body[0]);
        }
        assert_eq!(seen, (0..20u8).collect::<Vec<_>>());
        consumer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_without_handler_fails() {
        let factory = MemoryBrokerFactory::new();
        let consumer = factory
            .create_consumer(consumer_config("t", "g"))
            .await
            .unwrap();
        assert!(matches!(
            consumer.start().await.unwrap_err(),
            BrokerError::Config(_)
        ));
    }
}
