//! Broker error types

use std::fmt;

/// Error type for broker operations
#[derive(Debug)]
pub enum BrokerError {
    /// Producer or consumer already closed
    Closed,
    /// Local queue full (backpressure)
    QueueFull(String),
    /// Send or handler deadline exceeded
    Timeout(String),
    /// Connection error (Redis, DNS)
    Connection(String),
    /// Invalid or unsatisfiable configuration
    Config(String),
    /// Requested codec is not supported by the driver
    UnsupportedCompression(String),
    /// Serialization/compression error
    Serialization(String),
    /// Stream operation error
    Stream(String),
    /// Consumer group error
    ConsumerGroup(String),
    /// Message rejected before send
    InvalidMessage(String),
}

impl std::error::Error for BrokerError {}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Closed => write!(f, "broker client closed"),
            BrokerError::QueueFull(topic) => write!(f, "send queue full for topic '{}'", topic),
            BrokerError::Timeout(msg) => write!(f, "timeout: {}", msg),
            BrokerError::Connection(msg) => write!(f, "connection error: {}", msg),
            BrokerError::Config(msg) => write!(f, "configuration error: {}", msg),
            BrokerError::UnsupportedCompression(msg) => {
                write!(f, "unsupported compression: {}", msg)
            }
            BrokerError::Serialization(msg) => write!(f, "serialization error: {}", msg),
            BrokerError::Stream(msg) => write!(f, "stream error: {}", msg),
            BrokerError::ConsumerGroup(msg) => write!(f, "consumer group error: {}", msg),
            BrokerError::InvalidMessage(msg) => write!(f, "invalid message: {}", msg),
        }
    }
}

impl From<deadpool_redis::PoolError> for BrokerError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        BrokerError::Connection(err.to_string())
    }
}

impl From<deadpool_redis::redis::RedisError> for BrokerError {
    fn from(err: deadpool_redis::redis::RedisError) -> Self {
        BrokerError::Stream(err.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}
