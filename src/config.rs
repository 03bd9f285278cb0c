//! Client configuration
//!
//! Role configuration is checked at construction time: a responder needs
//! either a trusted initiator key or the public key / auth token pair, and
//! never both. Transport settings carry the connect timeout, retry policy
//! and keepalive interval.

use std::time::Duration;

use crate::crypto::{AuthToken, KeyStore, KEY_LEN};

/// Default WebSocket connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default WebSocket ping interval
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);

/// Configuration for the initiator role
#[derive(Debug)]
pub struct InitiatorConfig {
    pub permanent_key: KeyStore,
    /// Responder key pinned from an earlier session; skips the token round
    pub responder_trusted_key: Option<[u8; KEY_LEN]>,
    /// Pinned server permanent key; enables signed-keys verification
    pub expected_server_key: Option<[u8; KEY_LEN]>,
    /// Ping interval announced to the server in seconds, 0 disables
    pub ping_interval: u32,
}

impl InitiatorConfig {
    pub fn new(permanent_key: KeyStore) -> Self {
        Self {
            permanent_key,
            responder_trusted_key: None,
            expected_server_key: None,
            ping_interval: DEFAULT_PING_INTERVAL.as_secs() as u32,
        }
    }

    pub fn with_trusted_responder(mut self, key: [u8; KEY_LEN]) -> Self {
        self.responder_trusted_key = Some(key);
        self
    }

    pub fn with_expected_server_key(mut self, key: [u8; KEY_LEN]) -> Self {
        self.expected_server_key = Some(key);
        self
    }

    pub fn with_ping_interval(mut self, seconds: u32) -> Self {
        self.ping_interval = seconds;
        self
    }
}

/// Configuration for the responder role
#[derive(Debug)]
pub struct ResponderConfig {
    pub permanent_key: KeyStore,
    /// The initiator's permanent public key (untrusted first contact)
    pub initiator_public_key: Option<[u8; KEY_LEN]>,
    /// The one-use token received out-of-band (untrusted first contact)
    pub auth_token: Option<AuthToken>,
    /// Initiator key pinned from an earlier session; replaces the pair above
    pub initiator_trusted_key: Option<[u8; KEY_LEN]>,
    /// Pinned server permanent key; enables signed-keys verification
    pub expected_server_key: Option<[u8; KEY_LEN]>,
    /// Ping interval announced to the server in seconds, 0 disables
    pub ping_interval: u32,
}

impl ResponderConfig {
    pub fn new(permanent_key: KeyStore) -> Self {
        Self {
            permanent_key,
            initiator_public_key: None,
            auth_token: None,
            initiator_trusted_key: None,
            expected_server_key: None,
            ping_interval: DEFAULT_PING_INTERVAL.as_secs() as u32,
        }
    }

    pub fn with_initiator_key(mut self, key: [u8; KEY_LEN], token: AuthToken) -> Self {
        self.initiator_public_key = Some(key);
        self.auth_token = Some(token);
        self
    }

    pub fn with_trusted_initiator(mut self, key: [u8; KEY_LEN]) -> Self {
        self.initiator_trusted_key = Some(key);
        self
    }

    pub fn with_expected_server_key(mut self, key: [u8; KEY_LEN]) -> Self {
        self.expected_server_key = Some(key);
        self
    }

    pub fn with_ping_interval(mut self, seconds: u32) -> Self {
        self.ping_interval = seconds;
        self
    }
}

/// WebSocket transport settings
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    /// Timeout for a single connect attempt
    pub connect_timeout: Duration,
    /// Maximum number of connect attempts
    pub connect_attempts_max: u32,
    /// Wait `attempt * connect_timeout` between attempts
    pub connect_linear_backoff: bool,
    /// Interval for WebSocket keepalive pings
    pub ping_interval: Duration,
}

impl ConnectionSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connect_attempts_max: 1,
            connect_linear_backoff: false,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_connect_retry(mut self, attempts: u32, linear_backoff: bool) -> Self {
        self.connect_attempts_max = attempts.max(1);
        self.connect_linear_backoff = linear_backoff;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ConnectionSettings::new("localhost", 8765);
        assert_eq!(settings.connect_timeout, Duration::from_secs(2));
        assert_eq!(settings.ping_interval, Duration::from_secs(20));
        assert_eq!(settings.connect_attempts_max, 1);

        let config = InitiatorConfig::new(KeyStore::new());
        assert_eq!(config.ping_interval, 20);
        assert!(config.responder_trusted_key.is_none());
    }

    #[test]
    fn test_retry_attempts_never_zero() {
        let settings = ConnectionSettings::new("localhost", 8765).with_connect_retry(0, true);
        assert_eq!(settings.connect_attempts_max, 1);
    }
}
