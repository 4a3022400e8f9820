//! Daemon configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (PRESIO_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use presio_core::{ClientConfig, PresenceTemplate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application id used during the presence service handshake.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Connection behavior.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Text formatting.
    #[serde(default)]
    pub formatting: FormattingConfig,

    /// Icon configuration.
    #[serde(default)]
    pub icons: IconsConfig,

    /// Presence templates.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// User variables installed under the `custom.` namespace.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// Connection behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Connect attempts per retry loop before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Transmit structurally identical payloads anyway.
    #[serde(default)]
    pub allow_duplicates: bool,

    /// Tick interval in milliseconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

/// Text formatting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormattingConfig {
    /// Word-casing passes applied to text fields; zero disables.
    #[serde(default = "default_word_passes")]
    pub word_passes: u32,
}

/// Icon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IconsConfig {
    /// Icon the resolver degrades to when a chain is exhausted.
    #[serde(default = "default_icon")]
    pub default: String,

    /// Canonical icons known to the presence service: name → asset id.
    #[serde(default)]
    pub canonical: BTreeMap<String, String>,

    /// Custom icons: name → image URL. Override canonical entries,
    /// except `default`.
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
}

/// Presence templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// The default template.
    #[serde(default)]
    pub default: PresenceTemplate,

    /// Forced-override templates keyed by identifier.
    #[serde(default)]
    pub overrides: BTreeMap<String, PresenceTemplate>,
}

// Default value functions
fn default_client_id() -> String {
    std::env::var("PRESIO_CLIENT_ID").unwrap_or_default()
}

fn default_max_attempts() -> u32 {
    10
}

fn default_tick_interval() -> u64 {
    1_000
}

fn default_word_passes() -> u32 {
    1
}

fn default_icon() -> String {
    "default".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            connection: ConnectionConfig::default(),
            formatting: FormattingConfig::default(),
            icons: IconsConfig::default(),
            presence: PresenceConfig::default(),
            variables: BTreeMap::new(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            allow_duplicates: false,
            tick_interval_ms: default_tick_interval(),
        }
    }
}

impl Default for FormattingConfig {
    fn default() -> Self {
        Self {
            word_passes: default_word_passes(),
        }
    }
}

impl Default for IconsConfig {
    fn default() -> Self {
        Self {
            default: default_icon(),
            canonical: BTreeMap::new(),
            custom: BTreeMap::new(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            default: PresenceTemplate::default(),
            overrides: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from the first file found, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "presio.toml",
            "/etc/presio/presio.toml",
            "~/.config/presio/presio.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// The engine configuration derived from this file.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            client_id: self.client_id.clone(),
            max_connection_attempts: self.connection.max_attempts,
            allow_duplicate_activities: self.connection.allow_duplicates,
            word_format_passes: self.formatting.word_passes,
            default_icon: self.icons.default.clone(),
            ..ClientConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.connection.max_attempts, 10);
        assert!(!config.connection.allow_duplicates);
        assert_eq!(config.icons.default, "default");
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            client_id = "1234567890"

            [connection]
            max_attempts = 3
            allow_duplicates = true

            [icons]
            default = "world"

            [icons.custom]
            banner = "https://example.com/banner.png"

            [presence.default]
            details = "Playing {custom.level}"

            [presence.default.buttons.site]
            label = "Visit"
            url = "https://example.com"

            [presence.overrides.menu]
            use_as_main = true
            details = "In the menu"

            [variables]
            level = "5"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.client_id, "1234567890");
        assert_eq!(config.connection.max_attempts, 3);
        assert_eq!(config.icons.custom["banner"], "https://example.com/banner.png");
        assert_eq!(config.presence.default.details, "Playing {custom.level}");
        assert_eq!(config.presence.default.buttons["site"].label, "Visit");
        assert!(config.presence.overrides["menu"].use_as_main);
        assert_eq!(config.variables["level"], "5");
    }

    #[test]
    fn test_client_config_mapping() {
        let config = Config {
            client_id: "app".to_string(),
            ..Default::default()
        };
        let client = config.client_config();
        assert_eq!(client.client_id, "app");
        assert_eq!(client.max_connection_attempts, 10);
        assert_eq!(client.default_icon, "default");
    }
}
