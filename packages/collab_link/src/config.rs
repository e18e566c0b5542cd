use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::backoff::ReconnectPolicy;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [reconnect]
//                    max_attempts = 3
//
//   env var:         COLLAB_RECONNECT__MAX_ATTEMPTS=3   (double underscore = nesting)

/// Which transport strategy to build.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Direct socket connection.
    #[default]
    WebSocket,
    /// Frames proxied through a privileged relay host.
    Relay,
}

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LinkFileConfig {
    #[serde(default)]
    pub link: LinkSection,
    #[serde(default)]
    pub keepalive: KeepaliveSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// Endpoint settings (lives under `[link]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub transport: TransportKind,
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            transport: TransportKind::default(),
        }
    }
}

/// Keepalive tunables (lives under `[keepalive]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepaliveSection {
    #[serde(default = "default_keepalive_secs")]
    pub interval_secs: u64,
}

impl Default for KeepaliveSection {
    fn default() -> Self {
        Self {
            interval_secs: default_keepalive_secs(),
        }
    }
}

/// Backoff tunables (lives under `[reconnect]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectSection {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_base_url() -> String {
    "ws://127.0.0.1:3000".to_string()
}
fn default_keepalive_secs() -> u64 {
    30
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    5
}

/// Build a figment that layers: defaults → config.toml → COLLAB_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `COLLAB_LINK__BASE_URL=wss://host`  →  `link.base_url = "wss://host"`
///   `COLLAB_KEEPALIVE__INTERVAL_SECS=10`  →  `keepalive.interval_secs = 10`
pub fn load_config(data_dir: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(LinkFileConfig::default()));
    if let Some(dir) = data_dir {
        figment = figment.merge(Toml::file(dir.join("config.toml")));
    }
    figment.merge(Env::prefixed("COLLAB_").split("__"))
}

// =============================================================================
// Runtime config (derived from LinkFileConfig, consumed by the state machine)
// =============================================================================

/// Longest keepalive period honoured. Larger values are clamped so the
/// timer deadline never overflows.
pub const MAX_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Timing configuration for one connection manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Period of the `ping` keepalive while connected
    pub keepalive_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(default_keepalive_secs()),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn from_file(fc: &LinkFileConfig) -> Self {
        Self {
            keepalive_interval: Duration::from_secs(fc.keepalive.interval_secs.max(1))
                .min(MAX_KEEPALIVE_INTERVAL),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(fc.reconnect.base_delay_ms),
                max_delay: Duration::from_millis(fc.reconnect.max_delay_ms),
                max_attempts: fc.reconnect.max_attempts,
            },
        }
    }
}
