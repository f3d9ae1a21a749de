use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mesh: MeshConfig,
    pub ice: IceConfig,
    pub redis: RedisConfig,
    pub logging: LoggingConfig,
}

/// Mesh and negotiation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Maximum participants per room+modality mesh
    pub max_mesh_size: usize,
    /// Seconds alone in the mesh before auto-leave
    pub idle_leave_seconds: u64,
    /// Minimum spacing between forced escalations per peer
    pub escalation_debounce_ms: u64,
    /// How long a soft restart may run before escalating
    pub soft_restart_grace_ms: u64,
    /// Wait before the second capacity check when a join races a leave
    pub capacity_recheck_ms: u64,
    /// Audio level above which a participant counts as speaking
    pub speaking_threshold: f32,
    /// Debounce for speaking-state flips
    pub speaking_hold_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_mesh_size: 5,
            idle_leave_seconds: 120,
            escalation_debounce_ms: 1_000,
            soft_restart_grace_ms: 1_000,
            capacity_recheck_ms: 150,
            speaking_threshold: 0.12,
            speaking_hold_ms: 300,
        }
    }
}

impl MeshConfig {
    #[must_use]
    pub const fn idle_leave(&self) -> Duration {
        Duration::from_secs(self.idle_leave_seconds)
    }

    #[must_use]
    pub const fn escalation_debounce(&self) -> Duration {
        Duration::from_millis(self.escalation_debounce_ms)
    }

    #[must_use]
    pub const fn soft_restart_grace(&self) -> Duration {
        Duration::from_millis(self.soft_restart_grace_ms)
    }

    #[must_use]
    pub const fn capacity_recheck(&self) -> Duration {
        Duration::from_millis(self.capacity_recheck_ms)
    }

    #[must_use]
    pub const fn speaking_hold(&self) -> Duration {
        Duration::from_millis(self.speaking_hold_ms)
    }
}

/// ICE server configuration
///
/// Serves both sides: clients resolve STUN urls and the credential endpoint;
/// the relay mints time-limited TURN credentials from the static secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// STUN server URLs for NAT discovery
    pub stun_urls: Vec<String>,
    /// HTTP endpoint clients fetch relay credentials from (optional)
    pub credential_endpoint: Option<String>,
    /// TURN server URLs handed out with minted credentials
    pub turn_urls: Vec<String>,
    /// Static auth secret shared with the TURN deployment
    pub turn_static_secret: String,
    /// Credential time-to-live in seconds
    pub credential_ttl_seconds: u64,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            credential_endpoint: None,
            turn_urls: Vec::new(),
            turn_static_secret: String::new(),
            credential_ttl_seconds: 86_400,
        }
    }
}

impl IceConfig {
    #[must_use]
    pub const fn credential_ttl(&self) -> Duration {
        Duration::from_secs(self.credential_ttl_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub connect_timeout_seconds: u64,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connect_timeout_seconds: 5,
            key_prefix: "lockstep:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (LOCKSTEP_MESH_MAX_MESH_SIZE, etc.)
        builder = builder.add_source(
            Environment::with_prefix("LOCKSTEP")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }
}
