//! Isolate configuration.
//!
//! Configuration is loaded in layers with the following precedence (lowest
//! to highest):
//! 1. Environment variables (`LARCH_*`)
//! 2. TOML configuration file
//! 3. Command-line arguments (applied by the binary)
//!
//! Every field has a default, so an empty configuration starts a working
//! isolate with a generated UID on the loopback interface.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use uuid::Uuid;

/// Errors loading the configuration file or environment.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ReadFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to parse config file {}: {source}", path.display()))]
    ParseFile { path: PathBuf, source: toml::de::Error },

    #[snafu(display("invalid configuration: {source}"))]
    Deserialize { source: toml::de::Error },

    #[snafu(display("environment variable {name} has an invalid value: {value}"))]
    InvalidEnv { name: String, value: String },
}

/// Validation errors for configuration fields.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ValidationError {
    #[snafu(display("isolate_uid cannot be empty"))]
    IsolateUidEmpty,

    #[snafu(display("send_timeout_ms must be greater than 0"))]
    SendTimeoutZero,

    #[snafu(display("resync_interval_secs must be greater than 0"))]
    ResyncIntervalZero,

    #[snafu(display("multicast group {group} is not a multicast address"))]
    NotMulticast { group: Ipv4Addr },

    #[snafu(display("multicast port cannot be 0"))]
    MulticastPortZero,

    #[snafu(display("beacon_interval_secs must be greater than 0"))]
    BeaconIntervalZero,

    #[snafu(display("registry_path must start with '/'"))]
    RegistryPathRelative,
}

mod defaults {
    use std::net::{Ipv4Addr, SocketAddr};

    pub fn isolate_uid() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn isolate_name() -> String {
        "isolate".to_string()
    }

    pub fn node() -> String {
        "localhost".to_string()
    }

    pub fn http_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9010))
    }

    pub fn send_timeout_ms() -> u64 {
        3_000
    }

    pub fn resync_interval_secs() -> u64 {
        30
    }

    pub fn registry_path() -> String {
        "/registry".to_string()
    }

    pub fn multicast_enabled() -> bool {
        false
    }

    pub fn multicast_group() -> Ipv4Addr {
        Ipv4Addr::new(239, 0, 0, 1)
    }

    pub fn multicast_port() -> u16 {
        42_000
    }

    pub fn beacon_interval_secs() -> u64 {
        30
    }
}

/// Multicast discovery settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastConfig {
    /// Whether the multicast discovery peer runs at all.
    #[serde(default = "defaults::multicast_enabled")]
    pub enabled: bool,

    /// IPv4 multicast group joined by every participating isolate.
    #[serde(default = "defaults::multicast_group")]
    pub group: Ipv4Addr,

    /// UDP port of the multicast group.
    #[serde(default = "defaults::multicast_port")]
    pub port: u16,

    /// Interval between periodic `discovery` beacons, in seconds.
    #[serde(default = "defaults::beacon_interval_secs")]
    pub beacon_interval_secs: u64,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::multicast_enabled(),
            group: defaults::multicast_group(),
            port: defaults::multicast_port(),
            beacon_interval_secs: defaults::beacon_interval_secs(),
        }
    }
}

/// Top-level configuration of one isolate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IsolateConfig {
    /// Unique identifier of this isolate. Generated when not configured.
    #[serde(default = "defaults::isolate_uid")]
    pub isolate_uid: String,

    /// Human-readable isolate name (informational).
    #[serde(default = "defaults::isolate_name")]
    pub isolate_name: String,

    /// Name of the node this isolate runs on, as known by the directory.
    #[serde(default = "defaults::node")]
    pub node: String,

    /// Bind address of the HTTP listener (signal receiver + registry).
    /// Use port 0 to request an OS-assigned port.
    #[serde(default = "defaults::http_addr")]
    pub http_addr: SocketAddr,

    /// TOML file backing the signal directory. When absent the directory
    /// starts empty and is populated at runtime.
    #[serde(default)]
    pub directory_file: Option<PathBuf>,

    /// Per-target timeout for outbound signal sends, in milliseconds.
    #[serde(default = "defaults::send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Interval between periodic re-announcements of the local
    /// registrations, in seconds.
    #[serde(default = "defaults::resync_interval_secs")]
    pub resync_interval_secs: u64,

    /// Intents the signal transport guarantees for exported services.
    #[serde(default)]
    pub transport_intents: Vec<String>,

    /// Mount path of the read-only registry endpoint.
    #[serde(default = "defaults::registry_path")]
    pub registry_path: String,

    #[serde(default)]
    pub multicast: MulticastConfig,
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            isolate_uid: defaults::isolate_uid(),
            isolate_name: defaults::isolate_name(),
            node: defaults::node(),
            http_addr: defaults::http_addr(),
            directory_file: None,
            send_timeout_ms: defaults::send_timeout_ms(),
            resync_interval_secs: defaults::resync_interval_secs(),
            transport_intents: Vec::new(),
            registry_path: defaults::registry_path(),
            multicast: MulticastConfig::default(),
        }
    }
}

impl IsolateConfig {
    /// Loads configuration with environment < file precedence.
    ///
    /// Missing keys fall back to the serde defaults; CLI overrides are the
    /// binary's responsibility.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut table = env_overrides()?;

        if let Some(path) = path {
            let text = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
            let file_table: toml::Table =
                toml::from_str(&text).context(ParseFileSnafu { path })?;
            merge_tables(&mut table, file_table);
        }

        IsolateConfig::deserialize(toml::Value::Table(table)).context(DeserializeSnafu)
    }

    /// Checks the field invariants. Fail fast before anything is started.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.isolate_uid.is_empty() {
            return Err(ValidationError::IsolateUidEmpty);
        }
        if self.send_timeout_ms == 0 {
            return Err(ValidationError::SendTimeoutZero);
        }
        if self.resync_interval_secs == 0 {
            return Err(ValidationError::ResyncIntervalZero);
        }
        if !self.registry_path.starts_with('/') {
            return Err(ValidationError::RegistryPathRelative);
        }
        if self.multicast.enabled {
            if !self.multicast.group.is_multicast() {
                return Err(ValidationError::NotMulticast {
                    group: self.multicast.group,
                });
            }
            if self.multicast.port == 0 {
                return Err(ValidationError::MulticastPortZero);
            }
            if self.multicast.beacon_interval_secs == 0 {
                return Err(ValidationError::BeaconIntervalZero);
            }
        }
        Ok(())
    }

    /// Convenience constructor for an isolate with a fresh UID.
    pub fn generated() -> Self {
        Self {
            isolate_uid: Uuid::new_v4().to_string(),
            ..Self::default()
        }
    }
}

/// Reads the `LARCH_*` environment into a TOML table.
fn env_overrides() -> Result<toml::Table, ConfigError> {
    let mut table = toml::Table::new();
    let mut multicast = toml::Table::new();

    // (env var, config key, lives in [multicast], integer-typed)
    let known = [
        ("LARCH_ISOLATE_UID", "isolate_uid", false, false),
        ("LARCH_ISOLATE_NAME", "isolate_name", false, false),
        ("LARCH_NODE", "node", false, false),
        ("LARCH_HTTP_ADDR", "http_addr", false, false),
        ("LARCH_DIRECTORY_FILE", "directory_file", false, false),
        ("LARCH_REGISTRY_PATH", "registry_path", false, false),
        ("LARCH_SEND_TIMEOUT_MS", "send_timeout_ms", false, true),
        ("LARCH_RESYNC_INTERVAL_SECS", "resync_interval_secs", false, true),
        ("LARCH_MULTICAST_GROUP", "group", true, false),
        ("LARCH_MULTICAST_PORT", "port", true, true),
    ];

    for (name, key, in_multicast, integer) in known {
        let Ok(raw) = std::env::var(name) else {
            continue;
        };
        let value = if integer {
            let parsed: i64 = raw.parse().map_err(|_| ConfigError::InvalidEnv {
                name: name.to_string(),
                value: raw.clone(),
            })?;
            toml::Value::Integer(parsed)
        } else {
            toml::Value::String(raw)
        };
        if in_multicast {
            multicast.insert(key.to_string(), value);
        } else {
            table.insert(key.to_string(), value);
        }
    }

    if !multicast.is_empty() {
        multicast.insert("enabled".to_string(), toml::Value::Boolean(true));
        table.insert("multicast".to_string(), toml::Value::Table(multicast));
    }
    Ok(table)
}

/// Merges `overlay` over `base`, recursing into nested tables.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        let merged = match (base.remove(&key), value) {
            (Some(toml::Value::Table(mut existing)), toml::Value::Table(incoming)) => {
                merge_tables(&mut existing, incoming);
                toml::Value::Table(existing)
            }
            (_, value) => value,
        };
        base.insert(key, merged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        assert_eq!(IsolateConfig::default().validate(), Ok(()));
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
isolate_uid = "iso-test"
http_addr = "127.0.0.1:0"
resync_interval_secs = 5

[multicast]
enabled = true
port = 42001
"#
        )
        .unwrap();
        file.flush().unwrap();

        let config = IsolateConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.isolate_uid, "iso-test");
        assert_eq!(config.resync_interval_secs, 5);
        assert!(config.multicast.enabled);
        assert_eq!(config.multicast.port, 42001);
        // Untouched fields keep their defaults.
        assert_eq!(config.send_timeout_ms, 3_000);
        assert_eq!(config.multicast.group, Ipv4Addr::new(239, 0, 0, 1));
    }

    #[test]
    fn validation_rejects_bad_fields() {
        let mut config = IsolateConfig::default();
        config.isolate_uid.clear();
        assert_eq!(config.validate(), Err(ValidationError::IsolateUidEmpty));

        let mut config = IsolateConfig::default();
        config.send_timeout_ms = 0;
        assert_eq!(config.validate(), Err(ValidationError::SendTimeoutZero));

        let mut config = IsolateConfig::default();
        config.multicast.enabled = true;
        config.multicast.group = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(
            config.validate(),
            Err(ValidationError::NotMulticast {
                group: Ipv4Addr::new(10, 0, 0, 1)
            })
        );

        let mut config = IsolateConfig::default();
        config.registry_path = "registry".into();
        assert_eq!(
            config.validate(),
            Err(ValidationError::RegistryPathRelative)
        );
    }
}
