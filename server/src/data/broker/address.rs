//! Broker address resolution
//!
//! Each configured address is `host:port` or a bare `host`. Numeric hosts pass
//! through untouched; hostnames are resolved once at start-up and the first
//! returned address wins.

use std::net::{IpAddr, SocketAddr};

use super::error::BrokerError;

/// Split an address into host and optional port
fn split_host_port(addr: &str) -> Result<(String, Option<u16>), BrokerError> {
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return Ok((sock.ip().to_string(), Some(sock.port())));
    }
    if addr.parse::<IpAddr>().is_ok() {
        return Ok((addr.to_string(), None));
    }
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| BrokerError::Config(format!("invalid port in address '{addr}'")))?;
            Ok((host.to_string(), Some(port)))
        }
        None => Ok((addr.to_string(), None)),
    }
}

/// Resolve one address to a socket address
pub async fn resolve_address(addr: &str, default_port: u16) -> Result<SocketAddr, BrokerError> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(BrokerError::Config("empty broker address".to_string()));
    }
    let (host, port) = split_host_port(addr)?;
    let port = port.unwrap_or(default_port);

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let mut resolved = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| BrokerError::Connection(format!("failed to resolve '{host}': {e}")))?;
    let first = resolved
        .next()
        .ok_or_else(|| BrokerError::Connection(format!("no address found for '{host}'")))?;
    tracing::debug!(host = %host, resolved = %first, "Resolved broker address");
    Ok(first)
}

/// Resolve every configured address, failing on the first unresolvable one
pub async fn resolve_addresses(
    addresses: &[String],
    default_port: u16,
) -> Result<Vec<SocketAddr>, BrokerError> {
    let mut out = Vec::with_capacity(addresses.len());
    for addr in addresses {
        out.push(resolve_address(addr, default_port).await?);
    }
    Ok(out)
}
