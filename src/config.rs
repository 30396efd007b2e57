//! Configuration for the relay server

use crate::error::{RelayError, Result};
use std::time::Duration;

/// Relay server configuration builder
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the HTTP control plane binds to
    pub http_address: String,
    /// Port the HTTP control plane binds to
    pub http_port: u16,
    /// Whether the control plane should terminate TLS itself
    pub use_https: bool,
    /// Port the KCP data plane binds to
    pub kcp_port: u16,
    /// Bind the UDP socket dual-stack (IPv6 + IPv4)
    pub kcp_dual_mode: bool,
    /// Enable KCP no-delay mode
    pub kcp_nodelay: bool,
    /// KCP update interval in milliseconds
    pub kcp_interval: u32,
    /// Idle timeout in milliseconds before a connection is dropped
    pub kcp_timeout: u64,
    /// Requested receive buffer size for the UDP socket
    pub kcp_recv_buffer_size: usize,
    /// Requested send buffer size for the UDP socket
    pub kcp_send_buffer_size: usize,
    /// Fast resend threshold (number of duplicate ACKs)
    pub kcp_fast_resend: u32,
    /// Receive window size in segments
    pub kcp_receive_window_size: u16,
    /// Send window size in segments
    pub kcp_send_window_size: u16,
    /// Retransmission bound before a link is declared dead
    pub kcp_max_retransmit: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            http_address: "0.0.0.0".to_string(),
            http_port: 8080,
            use_https: false,
            kcp_port: 7777,
            kcp_dual_mode: true,
            kcp_nodelay: true,
            kcp_interval: 10,
            kcp_timeout: 10_000,
            kcp_recv_buffer_size: 7 * 1024 * 1024,
            kcp_send_buffer_size: 7 * 1024 * 1024,
            kcp_fast_resend: 2,
            kcp_receive_window_size: 4096,
            kcp_send_window_size: 4096,
            kcp_max_retransmit: 40,
        }
    }
}

impl RelayConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the HTTP bind address
    pub fn http_address(mut self, addr: impl Into<String>) -> Self {
        self.http_address = addr.into();
        self
    }

    /// Set the HTTP port
    pub fn http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    /// Set the KCP port
    pub fn kcp_port(mut self, port: u16) -> Self {
        self.kcp_port = port;
        self
    }

    /// Set the KCP update interval in milliseconds
    pub fn kcp_interval(mut self, interval: u32) -> Self {
        self.kcp_interval = interval;
        self
    }

    /// Set the idle timeout in milliseconds
    pub fn kcp_timeout(mut self, timeout: u64) -> Self {
        self.kcp_timeout = timeout;
        self
    }

    /// Set both window sizes
    pub fn kcp_window_size(mut self, send: u16, receive: u16) -> Self {
        self.kcp_send_window_size = send;
        self.kcp_receive_window_size = receive;
        self
    }

    /// Idle timeout as a [`Duration`]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.kcp_timeout)
    }

    /// Load configuration from `RELAY_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(key: &str, default: T) -> T {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        let d = Self::default();
        Self {
            http_address: std::env::var("RELAY_HTTP_ADDRESS").unwrap_or(d.http_address),
            http_port: var("RELAY_HTTP_PORT", d.http_port),
            use_https: var("RELAY_USE_HTTPS", d.use_https),
            kcp_port: var("RELAY_KCP_PORT", d.kcp_port),
            kcp_dual_mode: var("RELAY_KCP_DUAL_MODE", d.kcp_dual_mode),
            kcp_nodelay: var("RELAY_KCP_NODELAY", d.kcp_nodelay),
            kcp_interval: var("RELAY_KCP_INTERVAL", d.kcp_interval),
            kcp_timeout: var("RELAY_KCP_TIMEOUT", d.kcp_timeout),
            kcp_recv_buffer_size: var("RELAY_KCP_RECV_BUFFER_SIZE", d.kcp_recv_buffer_size),
            kcp_send_buffer_size: var("RELAY_KCP_SEND_BUFFER_SIZE", d.kcp_send_buffer_size),
            kcp_fast_resend: var("RELAY_KCP_FAST_RESEND", d.kcp_fast_resend),
            kcp_receive_window_size: var("RELAY_KCP_RECEIVE_WINDOW_SIZE", d.kcp_receive_window_size),
            kcp_send_window_size: var("RELAY_KCP_SEND_WINDOW_SIZE", d.kcp_send_window_size),
            kcp_max_retransmit: var("RELAY_KCP_MAX_RETRANSMIT", d.kcp_max_retransmit),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.http_address.trim().is_empty() {
            return Err(RelayError::config("HTTP address must not be empty"));
        }

        if self.use_https {
            return Err(RelayError::config(
                "TLS termination is not supported; front the relay with a TLS proxy",
            ));
        }

        if self.kcp_interval == 0 {
            return Err(RelayError::config("Update interval must be greater than 0"));
        }

        if self.kcp_timeout == 0 {
            return Err(RelayError::config("Idle timeout must be greater than 0"));
        }

        if self.kcp_receive_window_size == 0 || self.kcp_send_window_size == 0 {
            return Err(RelayError::config("Window sizes must be greater than 0"));
        }

        if self.kcp_recv_buffer_size == 0 || self.kcp_send_buffer_size == 0 {
            return Err(RelayError::config("Buffer sizes must be greater than 0"));
        }

        if self.kcp_max_retransmit == 0 {
            return Err(RelayError::config("Max retransmit must be greater than 0"));
        }

        Ok(())
    }
}
