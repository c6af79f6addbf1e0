//! Consumer registry and supervisor
//!
//! Workers are started in registration order, each behind a panic-recovering
//! handler so a programming bug acks the message instead of looping through
//! redeliveries.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Mutex;

use crate::data::broker::{BrokerFactory, Consumer, ConsumerConfig, ConsumerHandler, MessageExt};
use crate::domain::error::ServiceResult;

/// Supplies the consumer config a worker runs under
pub trait ConsumerConfigProvider: Send + Sync {
    fn consumer_config(&self) -> ServiceResult<ConsumerConfig>;
}

/// A handler together with the config it consumes with
pub trait ConsumerWorker: ConsumerHandler + ConsumerConfigProvider {}

impl<T: ConsumerHandler + ConsumerConfigProvider> ConsumerWorker for T {}

/// Decorator that turns a handler panic into a logged success
pub struct RecoverHandler {
    inner: Arc<dyn ConsumerWorker>,
    topic: String,
}

impl RecoverHandler {
    pub fn new(inner: Arc<dyn ConsumerWorker>, topic: impl Into<String>) -> Self {
        Self {
            inner,
            topic: topic.into(),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl ConsumerHandler for RecoverHandler {
    async fn handle_message(&self, msg: &MessageExt) -> anyhow::Result<()> {
        match AssertUnwindSafe(self.inner.handle_message(msg))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                tracing::error!(
                    topic = %self.topic,
                    message_id = %msg.message_id,
                    panic = %panic_message(panic.as_ref()),
                    "Consumer handler panicked, message acknowledged"
                );
                Ok(())
            }
        }
    }
}

struct RegistryState {
    workers: Vec<Arc<dyn ConsumerWorker>>,
    /// Workers before this index have been started
    started: usize,
    consumers: Vec<Arc<dyn Consumer>>,
}

pub struct ConsumerRegistry {
    factory: Arc<dyn BrokerFactory>,
    state: Mutex<RegistryState>,
}

impl ConsumerRegistry {
    pub fn new(factory: Arc<dyn BrokerFactory>) -> Self {
        Self {
            factory,
            state: Mutex::new(RegistryState {
                workers: Vec::new(),
                started: 0,
                consumers: Vec::new(),
            }),
        }
    }

    pub async fn register(&self, worker: Arc<dyn ConsumerWorker>) {
        self.state.lock().await.workers.push(worker);
    }

    pub async fn worker_count(&self) -> usize {
        self.state.lock().await.workers.len()
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.consumers.len()
    }

    /// Start every worker not started yet, in registration order.
    ///
    /// The first failure aborts; consumers started before it keep running.
    pub async fn start_all(&self) -> ServiceResult<()> {
        let mut state = self.state.lock().await;
        while state.started < state.workers.len() {
            let worker = Arc::clone(&state.workers[state.started]);
            let config = worker.consumer_config()?;
            let topic = config.topic.clone();
            let group = config.consumer_group.clone();

            let consumer = self.factory.create_consumer(config).await?;
            consumer.register_handler(Arc::new(RecoverHandler::new(worker, topic.clone())));
            consumer.start().await?;

            tracing::info!(
                topic = %topic,
                group = %group,
                driver = self.factory.driver_name(),
                "Consumer started"
            );
            state.consumers.push(consumer);
            state.started += 1;
        }
        Ok(())
    }

    /// Close every running consumer; errors are logged
    pub async fn close_all(&self) {
        let consumers = std::mem::take(&mut self.state.lock().await.consumers);
        for consumer in consumers {
            if let Err(e) = consumer.close().await {
                tracing::warn!(error = %e, "Failed to close consumer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::data::broker::{Compression, Message, MemoryBrokerFactory, Producer, ProducerConfig};
    use crate::domain::error::ErrorKind;

    struct Worker {
        topic: String,
        calls: AtomicU32,
        panic_on: Option<&'static [u8]>,
        compression: Compression,
    }

    impl Worker {
        fn new(topic: &str) -> Arc<Self> {
            Arc::new(Self {
                topic: topic.to_string(),
                calls: AtomicU32::new(0),
                panic_on: None,
                compression: Compression::None,
            })
        }
    }

    #[async_trait]
    impl ConsumerHandler for Worker {
        async fn handle_message(&self, msg: &MessageExt) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic_on == Some(msg.message.body.as_slice()) {
                panic!("bad payload");
            }
            Ok(())
        }
    }

    impl ConsumerConfigProvider for Worker {
        fn consumer_config(&self) -> ServiceResult<ConsumerConfig> {
            Ok(ConsumerConfig {
                topic: self.topic.clone(),
                consumer_group: "cg".to_string(),
                compression: self.compression,
                ..Default::default()
            })
        }
    }

    async fn producer(factory: &MemoryBrokerFactory, topic: &str) -> Arc<dyn Producer> {
        let producer = factory
            .create_producer(ProducerConfig {
                topic: topic.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        producer.start().await.unwrap();
        producer
    }

    async fn wait_for(calls: &AtomicU32, n: u32) {
        for _ in 0..200 {
            if calls.load(Ordering::SeqCst) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("handler was not called {n} times");
    }

    #[tokio::test]
    async fn test_recover_handler_swallows_panic() {
        let worker = Arc::new(Worker {
            panic_on: Some(b"boom"),
            ..Arc::into_inner(Worker::new("t")).unwrap()
        });
        let handler = RecoverHandler::new(worker.clone(), "t");
        let msg = MessageExt {
            message: Message::new("t", b"boom".to_vec()),
            message_id: "1".to_string(),
            reconsume_times: 0,
        };
        assert!(handler.handle_message(&msg).await.is_ok());
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_all_delivers_and_isolates_panics() {
        let factory = MemoryBrokerFactory::new();
        let registry = ConsumerRegistry::new(Arc::new(factory.clone()));
        let worker = Arc::new(Worker {
            panic_on: Some(b"boom"),
            ..Arc::into_inner(Worker::new("spans")).unwrap()
        });
        registry.register(worker.clone()).await;
        registry.start_all().await.unwrap();
        assert_eq!(registry.running_count().await, 1);

        let producer = producer(&factory, "spans").await;
        producer.send(Message::new("", b"boom".to_vec())).await.unwrap();
        producer.send(Message::new("", b"ok".to_vec())).await.unwrap();
        wait_for(&worker.calls, 2).await;

        // The panicking message is acknowledged, not redelivered.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(worker.calls.load(Ordering::SeqCst), 2);

        registry.close_all().await;
        assert_eq!(registry.running_count().await, 0);
    }

    #[tokio::test]
    async fn test_start_all_does_not_restart_workers() {
        let factory = MemoryBrokerFactory::new();
        let registry = ConsumerRegistry::new(Arc::new(factory));
        registry.register(Worker::new("a")).await;
        registry.start_all().await.unwrap();
        registry.register(Worker::new("b")).await;
        registry.start_all().await.unwrap();
        assert_eq!(registry.worker_count().await, 2);
        assert_eq!(registry.running_count().await, 2);
        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_start_all_aborts_on_first_error() {
        let factory = MemoryBrokerFactory::new();
        let registry = ConsumerRegistry::new(Arc::new(factory));
        registry.register(Worker::new("a")).await;
        registry
            .register(Arc::new(Worker {
                compression: Compression::Zstd,
                ..Arc::into_inner(Worker::new("b")).unwrap()
            }))
            .await;
        registry.register(Worker::new("c")).await;

        let err = registry.start_all().await.unwrap_err();
        assert!(err.is(ErrorKind::Rpc));
        // The worker started before the failure keeps running.
        assert_eq!(registry.running_count().await, 1);
        registry.close_all().await;
    }
}
