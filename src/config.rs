//! Configuration loading and precedence merging.
//!
//! Precedence (highest wins): CLI > environment > file > defaults. The
//! file and defaults are loaded first, then each environment variable
//! that is set overrides the matching field, then CLI flags (applied by
//! the caller via [`Config::apply_cli`]) override everything.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::tunnel::TunnelMode;

/// Default listening port for the server child / standby HTTP server.
pub const DEFAULT_PORT: u16 = 8787;

/// Merged configuration for a `stationhub` run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Shared secret clients must present in the `auth` frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    /// Whether the broker requires the `auth` handshake at all.
    #[serde(default = "default_true")]
    pub auth_required: bool,
    /// TCP port the child server listens on (and the supervisor's standby server).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Default external source identifier (e.g. a tmux session name) to auto-attach.
    #[serde(default)]
    pub external_source: Option<String>,
    /// Shell used when spawning terminal-kind sessions.
    #[serde(default)]
    pub shell: Option<String>,
    /// Default working directory for new sessions.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Default agent model identifier.
    #[serde(default)]
    pub model: Option<String>,
    /// Default permission mode passed to new sessions.
    #[serde(default)]
    pub permission_mode: Option<String>,
    /// Tunnel mode: `quick` or `named`.
    #[serde(default)]
    pub tunnel_mode: TunnelMode,
    /// Hostname to use in `named` tunnel mode.
    #[serde(default)]
    pub tunnel_hostname: Option<String>,
    /// Stable tunnel name used by some tunnel providers to pin the hostname.
    #[serde(default)]
    pub tunnel_name: Option<String>,
    /// Maximum concurrent sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_sessions() -> usize {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_token: None,
            auth_required: true,
            port: DEFAULT_PORT,
            external_source: None,
            shell: None,
            cwd: None,
            model: None,
            permission_mode: None,
            tunnel_mode: TunnelMode::Quick,
            tunnel_hostname: None,
            tunnel_name: None,
            max_sessions: default_max_sessions(),
        }
    }
}

impl Config {
    /// Returns the per-user config directory, creating it if necessary.
    ///
    /// Honors `STATIONHUB_CONFIG_DIR` for tests and CI before falling back
    /// to the platform-standard config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("STATIONHUB_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("could not determine platform config directory")?
                .join("stationhub")
        };
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("create config dir: {}", dir.display()))?;
        }
        Ok(dir)
    }

    fn config_file_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load defaults, overlay the config file (if present), then overlay
    /// environment variables. CLI overlay is the caller's job via
    /// [`Config::apply_cli`] since `clap::Parser` output is caller-specific.
    pub fn load() -> Result<Self> {
        let mut config = Self::from_file().unwrap_or_default();
        config.apply_env();
        Ok(config)
    }

    fn from_file() -> Result<Self> {
        let path = Self::config_file_path()?;
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse config file: {}", path.display()))
    }

    /// Overlay `STATIONHUB_*` environment variables onto this config.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("STATIONHUB_TOKEN") {
            self.api_token = Some(v);
        }
        if let Ok(v) = std::env::var("STATIONHUB_PORT") {
            if let Ok(port) = v.parse() {
                self.port = port;
            }
        }
        if let Ok(v) = std::env::var("STATIONHUB_SOURCE") {
            self.external_source = Some(v);
        }
        if let Ok(v) = std::env::var("STATIONHUB_SHELL") {
            self.shell = Some(v);
        }
        if let Ok(v) = std::env::var("STATIONHUB_CWD") {
            self.cwd = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("STATIONHUB_MODEL") {
            self.model = Some(v);
        }
        if let Ok(v) = std::env::var("STATIONHUB_PERMISSION_MODE") {
            self.permission_mode = Some(v);
        }
        if let Ok(v) = std::env::var("STATIONHUB_TUNNEL_MODE") {
            if let Some(mode) = TunnelMode::parse(&v) {
                self.tunnel_mode = mode;
            }
        }
        if let Ok(v) = std::env::var("STATIONHUB_TUNNEL_HOSTNAME") {
            self.tunnel_hostname = Some(v);
        }
        if let Ok(v) = std::env::var("STATIONHUB_TUNNEL_NAME") {
            self.tunnel_name = Some(v);
        }
    }

    /// Persist to the config file (does not write `api_token` to disk).
    pub fn save(&self) -> Result<()> {
        let path = Self::config_file_path()?;
        let json = serde_json::to_string_pretty(self).context("serialize config")?;
        crate::atomic::write_atomic(&path, json.as_bytes())
    }

    /// Returns a [`ConfigError::MissingToken`] error if no token is set anywhere.
    pub fn require_token(&self) -> Result<&str, ConfigError> {
        self.api_token.as_deref().ok_or(ConfigError::MissingToken)
    }

    /// Validate the tunnel configuration, returning `MissingTunnelHostname`
    /// if `named` mode has no hostname.
    pub fn require_tunnel_hostname(&self) -> Result<(), ConfigError> {
        if self.tunnel_mode == TunnelMode::Named && self.tunnel_hostname.is_none() {
            return Err(ConfigError::MissingTunnelHostname);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_quick_tunnel_and_auth_required() {
        let config = Config::default();
        assert_eq!(config.tunnel_mode, TunnelMode::Quick);
        assert!(config.auth_required);
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn require_token_fails_when_unset() {
        let config = Config::default();
        assert!(config.require_token().is_err());
    }

    #[test]
    fn require_tunnel_hostname_fails_for_named_without_host() {
        let mut config = Config::default();
        config.tunnel_mode = TunnelMode::Named;
        assert!(config.require_tunnel_hostname().is_err());
        config.tunnel_hostname = Some("example.com".to_string());
        assert!(config.require_tunnel_hostname().is_ok());
    }
}
