//! Configuration types for the peer mesh

use crate::supervisor::BackoffPolicy;
use crate::types::Role;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Default label of the data channel opened on every self-initiated offer
pub const DEFAULT_CHANNEL_LABEL: &str = "mesh-data-main";

/// Main configuration for a PeerMesh
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Role forwarded with every registered offer (default: provider)
    pub role: Role,

    /// Signaling service connection
    pub signaling: SignalingConfig,

    /// Bearer token source for the signaling service
    pub auth: Option<AuthConfig>,

    /// STUN/TURN and ICE gathering
    pub ice: IceConfig,

    /// Offer/answer cycle tuning
    pub negotiation: NegotiationConfig,

    /// Restart policy for failed negotiation cycles
    pub supervisor: BackoffPolicy,
}

/// Signaling service connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Base URL of the signaling service (http:// or https://)
    pub base_url: String,

    /// Identity sent as X-Client-Id (auto-generated if None)
    pub client_id: Option<Uuid>,

    /// Per-request timeout in seconds (default: 30)
    pub request_timeout_secs: u64,
}

/// ICE server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Upper bound on ICE gathering before a description is published (default: 5000ms)
    pub gathering_timeout_ms: u64,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Offer/answer cycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Interval between answer polls (default: 1000ms)
    pub poll_interval_ms: u64,

    /// How long an answered offer may take to reach Connected (default: 30000ms)
    pub connect_timeout_ms: u64,

    /// Label of the data channel created with each offer
    pub default_channel_label: String,

    /// Delivery mode of locally created data channels (default: Reliable)
    pub data_channel_mode: DataChannelMode,
}

/// Data channel mode
///
/// Determines the reliability of message delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataChannelMode {
    /// Reliable, ordered delivery (default)
    #[default]
    Reliable,

    /// Unreliable, unordered delivery (low latency)
    Unreliable,
}

impl DataChannelMode {
    /// Get the ordered setting for webrtc-rs
    pub fn ordered(&self) -> bool {
        match self {
            DataChannelMode::Reliable => true,
            DataChannelMode::Unreliable => false,
        }
    }

    /// Get the max retransmits setting for webrtc-rs
    pub fn max_retransmits(&self) -> Option<u16> {
        match self {
            DataChannelMode::Reliable => None,
            DataChannelMode::Unreliable => Some(0),
        }
    }
}

/// Where the signaling bearer token comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthConfig {
    /// A fixed token, never refreshed
    Static {
        /// Bearer token
        token: String,
    },

    /// The signaling service's own client_token endpoint
    ClientToken {
        /// PUT endpoint exchanging a refresh token for an access token
        refresh_url: String,
        /// Opaque refresh token
        refresh_token: String,
    },

    /// Firebase secure token service
    Firebase {
        /// Web API key
        api_key: String,
        /// Firebase refresh token
        refresh_token: String,
        /// Override of the token endpoint (emulators, tests)
        #[serde(default)]
        refresh_url: Option<String>,
    },
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            client_id: None,
            request_timeout_secs: 30,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            gathering_timeout_ms: 5000,
        }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            connect_timeout_ms: 30_000,
            default_channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            data_channel_mode: DataChannelMode::Reliable,
        }
    }
}

impl NegotiationConfig {
    /// Answer poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Connect timeout for answered offers
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl MeshConfig {
    /// Parse and validate a TOML configuration
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: MeshConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Create a configuration preset for in-process tests and local demos
    ///
    /// Settings:
    /// - Answer polling every 20ms
    /// - No STUN servers, short ICE gathering bound
    /// - Fast, jitter-free restart backoff
    pub fn local_testing() -> Self {
        Self {
            role: Role::Provider,
            signaling: SignalingConfig::default(),
            auth: None,
            ice: IceConfig {
                stun_servers: Vec::new(),
                turn_servers: Vec::new(),
                gathering_timeout_ms: 1000,
            },
            negotiation: NegotiationConfig {
                poll_interval_ms: 20,
                connect_timeout_ms: 2000,
                ..NegotiationConfig::default()
            },
            supervisor: BackoffPolicy {
                max_retries: None,
                backoff_initial_ms: 20,
                backoff_max_ms: 500,
                backoff_multiplier: 2.0,
                jitter_enabled: false,
            },
        }
    }

    /// Set the role
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `signaling.base_url` is not an http(s) URL
    /// - `poll_interval_ms` is below 10ms
    /// - `connect_timeout_ms` is shorter than the poll interval
    /// - `default_channel_label` is empty
    /// - the backoff policy is inconsistent
    /// - a STUN or TURN URL has the wrong scheme
    pub fn validate(&self) -> Result<()> {
        let base_url = self.signaling.base_url.trim();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::InvalidConfig(format!(
                "signaling.base_url must start with http:// or https://, got '{}'",
                self.signaling.base_url
            )));
        }

        if self.signaling.request_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "signaling.request_timeout_secs must be positive".to_string(),
            ));
        }

        if self.negotiation.poll_interval_ms < 10 {
            return Err(Error::InvalidConfig(format!(
                "negotiation.poll_interval_ms must be at least 10, got {}",
                self.negotiation.poll_interval_ms
            )));
        }

        if self.negotiation.connect_timeout_ms < self.negotiation.poll_interval_ms {
            return Err(Error::InvalidConfig(format!(
                "negotiation.connect_timeout_ms ({}) must not be shorter than poll_interval_ms ({})",
                self.negotiation.connect_timeout_ms, self.negotiation.poll_interval_ms
            )));
        }

        if self.negotiation.default_channel_label.is_empty() {
            return Err(Error::InvalidConfig(
                "negotiation.default_channel_label cannot be empty".to_string(),
            ));
        }

        self.supervisor.validate()?;

        for url in &self.ice.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN server URL must start with stun: or stuns:, got '{}'",
                    url
                )));
            }
        }

        for turn in &self.ice.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN server URL must start with turn: or turns:, got '{}'",
                    turn.url
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.negotiation.poll_interval(), Duration::from_millis(1000));
        assert_eq!(config.negotiation.default_channel_label, DEFAULT_CHANNEL_LABEL);
    }

    #[test]
    fn test_local_testing_preset_is_valid() {
        assert!(MeshConfig::local_testing().validate().is_ok());
    }

    #[test]
    fn test_invalid_base_url() {
        let mut config = MeshConfig::default();
        config.signaling.base_url = "ws://localhost:8080".to_string();
        assert!(config.validate().unwrap_err().is_config_error());
    }

    #[test]
    fn test_connect_timeout_shorter_than_poll_interval() {
        let mut config = MeshConfig::default();
        config.negotiation.connect_timeout_ms = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_stun_url() {
        let mut config = MeshConfig::default();
        config.ice.stun_servers = vec!["stun.l.google.com:19302".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_str() {
        let config = MeshConfig::from_toml_str(
            r#"
            role = "subscriber"

            [signaling]
            base_url = "https://signal.example.com/api/"
            client_id = "3f0c5c8e-9a7e-4c8e-8f39-5a1d2a7b9c10"

            [negotiation]
            poll_interval_ms = 250
            data_channel_mode = "unreliable"

            [auth]
            kind = "client_token"
            refresh_url = "https://signal.example.com/client_token"
            refresh_token = "opaque"
            "#,
        )
        .unwrap();

        assert_eq!(config.role, Role::Subscriber);
        assert_eq!(config.negotiation.poll_interval_ms, 250);
        assert_eq!(config.negotiation.connect_timeout_ms, 30_000);
        assert_eq!(
            config.negotiation.data_channel_mode,
            DataChannelMode::Unreliable
        );
        assert!(config.signaling.client_id.is_some());
        assert!(matches!(config.auth, Some(AuthConfig::ClientToken { .. })));
    }

    #[test]
    fn test_from_toml_rejects_invalid_values() {
        let err = MeshConfig::from_toml_str("[negotiation]\npoll_interval_ms = 1\n").unwrap_err();
        assert!(err.is_config_error());

        let err = MeshConfig::from_toml_str("role = 7").unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.toml");
        std::fs::write(&path, "[auth]\nkind = \"static\"\ntoken = \"abc\"\n").unwrap();

        let config = MeshConfig::from_file(&path).unwrap();
        assert!(matches!(config.auth, Some(AuthConfig::Static { ref token }) if token == "abc"));

        assert!(matches!(
            MeshConfig::from_file(dir.path().join("missing.toml")),
            Err(Error::IoError(_))
        ));
    }

    #[test]
    fn test_data_channel_mode() {
        assert!(DataChannelMode::Reliable.ordered());
        assert_eq!(DataChannelMode::Reliable.max_retransmits(), None);
        assert!(!DataChannelMode::Unreliable.ordered());
        assert_eq!(DataChannelMode::Unreliable.max_retransmits(), Some(0));
    }
}
