//! Networker and per-topic configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use chainnet_net_transport::{DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_FRAME_SIZE};
use chainnet_primitives::KeyPair;
use serde::{Deserialize, Serialize};

use crate::error::{NetworkerError, Result};

/// Configuration for a [`Networker`](crate::Networker).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkerConfig {
    /// Broadcast channel capacity for networker events.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Time allowed for the handshake and the admission verdict of one connection.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Upper bound for a single session frame.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Hex encoded ed25519 secret key. A fresh key is generated when absent.
    #[serde(default)]
    pub secret_key: Option<String>,
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

impl Default for NetworkerConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: default_event_channel_capacity(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_frame_size: default_max_frame_size(),
            secret_key: None,
        }
    }
}

impl NetworkerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| NetworkerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| NetworkerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_channel_capacity == 0 {
            return Err(NetworkerError::Config(
                "event_channel_capacity must be non-zero".into(),
            ));
        }
        if self.max_frame_size == 0 {
            return Err(NetworkerError::Config("max_frame_size must be non-zero".into()));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Key pair from `secret_key`, if one is configured.
    pub fn key_pair(&self) -> Result<Option<KeyPair>> {
        self.secret_key
            .as_deref()
            .map(|secret| {
                KeyPair::from_secret_hex(secret).map_err(|e| NetworkerError::Config(e.to_string()))
            })
            .transpose()
    }
}

/// Discovery options for one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicOptions {
    /// Publish this node under the topic.
    pub announce: bool,
    /// Search for other nodes under the topic.
    pub lookup: bool,
    /// Make `configure` wait until the discovery round has settled.
    pub flush: bool,
}

impl Default for TopicOptions {
    fn default() -> Self {
        Self {
            announce: true,
            lookup: true,
            flush: false,
        }
    }
}

impl TopicOptions {
    /// Look up without announcing, and wait for the round to settle.
    pub fn client() -> Self {
        Self {
            announce: false,
            lookup: true,
            flush: true,
        }
    }

    pub fn announce(mut self, announce: bool) -> Self {
        self.announce = announce;
        self
    }

    pub fn lookup(mut self, lookup: bool) -> Self {
        self.lookup = lookup;
        self
    }

    pub fn flush(mut self, flush: bool) -> Self {
        self.flush = flush;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = NetworkerConfig::from_toml_str("").unwrap();
        assert_eq!(config, NetworkerConfig::default());
        assert_eq!(config.handshake_timeout(), DEFAULT_HANDSHAKE_TIMEOUT);
        assert!(config.key_pair().unwrap().is_none());
    }

    #[test]
    fn test_partial_toml() {
        let config = NetworkerConfig::from_toml_str(
            r#"
            handshake_timeout_ms = 250
            event_channel_capacity = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.handshake_timeout(), Duration::from_millis(250));
        assert_eq!(config.event_channel_capacity, 8);
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err = NetworkerConfig::from_toml_str("event_channel_capacity = 0").unwrap_err();
        assert!(matches!(err, NetworkerError::Config(_)));
    }

    #[test]
    fn test_secret_key() {
        let kp = KeyPair::generate();
        let config = NetworkerConfig {
            secret_key: Some(kp.secret_key().iter().map(|b| format!("{b:02x}")).collect()),
            ..Default::default()
        };
        assert_eq!(config.key_pair().unwrap().unwrap().public_key(), kp.public_key());

        let bad = NetworkerConfig {
            secret_key: Some("nothex".into()),
            ..Default::default()
        };
        assert!(matches!(bad.key_pair(), Err(NetworkerError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_frame_size = 1024").unwrap();
        let config = NetworkerConfig::load(file.path()).unwrap();
        assert_eq!(config.max_frame_size, 1024);

        assert!(NetworkerConfig::load("/nonexistent/chainnet.toml").is_err());
    }

    #[test]
    fn test_topic_options() {
        let defaults = TopicOptions::default();
        assert!(defaults.announce && defaults.lookup && !defaults.flush);

        let client = TopicOptions::client();
        assert!(!client.announce && client.lookup && client.flush);

        let custom = TopicOptions::default().announce(false).flush(true);
        assert_eq!(custom, client);
    }
}
