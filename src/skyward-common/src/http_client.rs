//! Centralized HTTP client factory for Skyward.
//!
//! Provides factory functions to create HTTP clients with consistent configuration:
//! - `create_download_client(timeout, proxy)` - Mirror downloads with an explicit proxy policy
//! - `create_direct_client(timeout)` - Same as above but never goes through a proxy
//!
//! All clients include: User-Agent, tcp_nodelay, read timeout and pool limits.

use reqwest::{Client, Proxy};
use std::time::Duration;

/// User-Agent string for all HTTP requests
pub const USER_AGENT: &str = concat!("skyward/", env!("CARGO_PKG_VERSION"));

/// Connection pool idle timeout to ensure DNS is re-resolved periodically.
pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How a client should reach the network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProxySetting {
    /// Honour the environment (`HTTPS_PROXY`, `ALL_PROXY`, ...).
    #[default]
    System,
    /// Send every request through this proxy URL.
    Explicit(String),
    /// Never use a proxy.
    Disabled,
}

/// Creates a client for mirror downloads.
///
/// The timeout applies per request, so a mirror that stalls is reported as a
/// transport failure and the caller moves on to the next mirror.
pub fn create_download_client(timeout: Duration, proxy: &ProxySetting) -> Result<Client, String> {
    let mut builder = create_client_builder(timeout);
    match proxy {
        ProxySetting::System => {}
        ProxySetting::Explicit(url) => {
            let proxy = Proxy::all(url.as_str())
                .map_err(|e| format!("Invalid proxy URL {url}: {e}"))?;
            builder = builder.proxy(proxy);
        }
        ProxySetting::Disabled => {
            builder = builder.no_proxy();
        }
    }
    builder
        .build()
        .map_err(|e| format!("Failed to build HTTP client: {e}"))
}

/// Creates a client that bypasses every configured proxy.
pub fn create_direct_client(timeout: Duration) -> Result<Client, String> {
    create_download_client(timeout, &ProxySetting::Disabled)
}

/// Builder with the settings shared by every client.
///
/// Includes a read timeout to prevent hangs on truncated responses.
fn create_client_builder(timeout: Duration) -> reqwest::ClientBuilder {
    // Content-Length mismatches would otherwise hang until the overall timeout
    let read_timeout = timeout.min(Duration::from_secs(60));

    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .read_timeout(read_timeout)
        .tcp_nodelay(true)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_proxy_client_succeeds() {
        let result = create_download_client(Duration::from_secs(30), &ProxySetting::System);
        assert!(result.is_ok(), "create_download_client should succeed");
    }

    #[test]
    fn test_create_direct_client_succeeds() {
        let result = create_direct_client(Duration::from_secs(5));
        assert!(result.is_ok(), "create_direct_client should succeed");
    }

    #[test]
    fn test_explicit_proxy_is_accepted() {
        let proxy = ProxySetting::Explicit("http://127.0.0.1:3128".to_string());
        assert!(create_download_client(Duration::from_secs(30), &proxy).is_ok());
    }

    #[test]
    fn test_user_agent_constant_is_set() {
        assert!(USER_AGENT.starts_with("skyward/"));
    }
}
