//! Configuration storage and server limit lookup

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Server limit holding the ring timeout, in seconds.
pub const CALL_TIMEOUT_LIMIT: &str = "callTimeout";

/// Lookup of server-provided limits.
pub trait ServerLimits {
    fn server_limit(&self, name: &str, default: u64) -> u64;
}

/// Application configuration
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Endpoint that receives outbound call notes. Notes are only logged when unset.
    pub signal_url: Option<String>,
    /// Bearer token for `signal_url`
    pub auth_token: Option<String>,
    /// Limits advertised by the server, by name (e.g. `callTimeout`)
    #[serde(default)]
    pub server_limits: BTreeMap<String, u64>,
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("co", "callctl", "callctl")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        // Set restrictive permissions on config file (contains the auth token)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    pub fn set_server_limit(&mut self, name: impl Into<String>, value: u64) {
        self.server_limits.insert(name.into(), value);
    }

    /// Parse and apply a `NAME=VALUE` limit assignment.
    pub fn apply_limit_assignment(&mut self, assignment: &str) -> Result<()> {
        let (name, value) = assignment
            .split_once('=')
            .with_context(|| format!("Expected NAME=SECONDS, got '{}'", assignment))?;
        let name = name.trim();
        anyhow::ensure!(!name.is_empty(), "Limit name is empty");
        let value: u64 = value
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for limit '{}'", name))?;
        self.set_server_limit(name, value);
        Ok(())
    }
}

impl ServerLimits for Config {
    fn server_limit(&self, name: &str, default: u64) -> u64 {
        self.server_limits.get(name).copied().unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limit_when_unset() {
        let config = Config::default();
        assert_eq!(config.server_limit(CALL_TIMEOUT_LIMIT, 30), 30);
    }

    #[test]
    fn test_parse_config() {
        let config = Config::from_toml(
            r#"
signal_url = "https://example.com/v0/note"

[server_limits]
callTimeout = 45
"#,
        )
        .unwrap();
        assert_eq!(config.server_limit(CALL_TIMEOUT_LIMIT, 30), 45);
        assert_eq!(config.signal_url.as_deref(), Some("https://example.com/v0/note"));
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn test_empty_config_parses() {
        let config = Config::from_toml("").unwrap();
        assert!(config.server_limits.is_empty());
    }

    #[test]
    fn test_limit_assignment() {
        let mut config = Config::default();
        config.apply_limit_assignment("callTimeout=12").unwrap();
        assert_eq!(config.server_limit(CALL_TIMEOUT_LIMIT, 30), 12);

        assert!(config.apply_limit_assignment("callTimeout").is_err());
        assert!(config.apply_limit_assignment("=5").is_err());
        assert!(config.apply_limit_assignment("callTimeout=soon").is_err());
    }

    #[test]
    fn test_config_roundtrips_through_toml() {
        let mut config = Config::default();
        config.set_server_limit(CALL_TIMEOUT_LIMIT, 20);
        config.auth_token = Some("secret".to_string());
        let text = toml::to_string_pretty(&config).unwrap();
        let back = Config::from_toml(&text).unwrap();
        assert_eq!(back.server_limit(CALL_TIMEOUT_LIMIT, 30), 20);
        assert_eq!(back.auth_token.as_deref(), Some("secret"));
    }
}
