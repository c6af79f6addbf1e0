//! Producer and consumer configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::constants::{
    DEFAULT_CONSUME_CONCURRENCY, DEFAULT_CONSUME_TIMEOUT_MS, DEFAULT_MAX_RECONSUME_TIMES,
    DEFAULT_PRODUCE_TIMEOUT_MS,
};

/// Payload codec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zstd => "zstd",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" | "" => Some(Compression::None),
            "zstd" => Some(Compression::Zstd),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// `host:port` or bare `host` entries
    #[serde(default)]
    pub addresses: Vec<String>,
    pub topic: String,
    #[serde(default)]
    pub producer_group: String,
    #[serde(default)]
    pub produce_timeout_ms: Option<u64>,
    /// Extra attempts after a failed send
    #[serde(default)]
    pub retry_times: u32,
    #[serde(default)]
    pub compression: Compression,
    /// Capacity of the async-send queue
    #[serde(default)]
    pub queue_capacity: Option<usize>,
}

impl ProducerConfig {
    pub fn produce_timeout(&self) -> Duration {
        Duration::from_millis(self.produce_timeout_ms.unwrap_or(DEFAULT_PRODUCE_TIMEOUT_MS))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub addresses: Vec<String>,
    pub topic: String,
    pub consumer_group: String,
    /// `*` or `tagA||tagB`
    #[serde(default)]
    pub tag_expression: Option<String>,
    #[serde(default)]
    pub consume_timeout_ms: Option<u64>,
    /// Handlers running at once (ConsumeGoroutineNums)
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Deliver messages sharing a partition key one at a time, in order
    #[serde(default)]
    pub orderly: bool,
    #[serde(default)]
    pub max_reconsume_times: Option<u32>,
    /// Codec the consumer must be able to read
    #[serde(default)]
    pub compression: Compression,
}

impl ConsumerConfig {
    pub fn consume_timeout(&self) -> Duration {
        Duration::from_millis(self.consume_timeout_ms.unwrap_or(DEFAULT_CONSUME_TIMEOUT_MS))
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_CONSUME_CONCURRENCY)
    }

    pub fn max_reconsume_times(&self) -> u32 {
        self.max_reconsume_times.unwrap_or(DEFAULT_MAX_RECONSUME_TIMES)
    }

    /// Whether a message tag passes the tag expression
    pub fn accepts_tag(&self, tag: Option<&str>) -> bool {
        let expr = match self.tag_expression.as_deref().map(str::trim) {
            None | Some("") | Some("*") => return true,
            Some(expr) => expr,
        };
        let Some(tag) = tag else {
            return false;
        };
        expr.split("||").map(str::trim).any(|t| t == tag)
    }
}
