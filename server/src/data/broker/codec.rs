//! Payload compression

use super::config::Compression;
use super::error::BrokerError;

const ZSTD_LEVEL: i32 = 3;

pub fn encode(compression: Compression, body: &[u8]) -> Result<Vec<u8>, BrokerError> {
    match compression {
        Compression::None => Ok(body.to_vec()),
        Compression::Zstd => zstd::encode_all(body, ZSTD_LEVEL)
            .map_err(|e| BrokerError::Serialization(format!("zstd encode failed: {e}"))),
    }
}

pub fn decode(compression: Compression, body: &[u8]) -> Result<Vec<u8>, BrokerError> {
    match compression {
        Compression::None => Ok(body.to_vec()),
        Compression::Zstd => zstd::decode_all(body)
            .map_err(|e| BrokerError::Serialization(format!("zstd decode failed: {e}"))),
    }
}
