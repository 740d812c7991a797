//! Configuration for the Area display server
//!
//! Loads configuration from TOML file at `~/.config/area/server.toml`
//! Auto-generates default config file on first run if missing.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// Load from an explicit path, writing defaults there if it is missing
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            if let Err(e) = Self::save_default(config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .context("Failed to read config file")?;

        let config: Config = toml::from_str(&content)
            .context("Failed to parse config file")?;
        config.validate()?;

        info!("Configuration loaded from {:?}", config_path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("area");

        Ok(config_dir.join("server.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let toml_string = toml::to_string_pretty(&Self::default())
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string)
            .context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.server.threads == 0 {
            bail!("server.threads must be at least 1");
        }
        if self.server.handshake_timeout_ms == 0 {
            bail!("server.handshake_timeout_ms must be at least 1");
        }
        Ok(())
    }

    /// Apply `--socket PATH` and `--threads N` from the command line
    pub fn apply_args(&mut self, args: &[String]) -> Result<()> {
        let mut args = args.iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--socket" | "-s" => {
                    let path = args.next().context("--socket needs a path")?;
                    self.server.socket_path = Some(PathBuf::from(path));
                }
                "--threads" | "-t" => {
                    let value = args.next().context("--threads needs a number")?;
                    self.server.threads = value
                        .parse()
                        .with_context(|| format!("Invalid thread count {value:?}"))?;
                }
                other => warn!("Ignoring unknown argument {:?}", other),
            }
        }
        self.validate()
    }
}

/// Listening socket and worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket path; `@name` selects the abstract namespace.
    /// Defaults to `$XDG_RUNTIME_DIR/area_socket`.
    pub socket_path: Option<PathBuf>,
    /// Worker threads accepting and negotiating connections
    pub threads: usize,
    /// Deadline for a client's handshake, in milliseconds
    pub handshake_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            threads: 4,
            handshake_timeout_ms: 500,
        }
    }
}

impl ServerConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(area_ipc::socket_path)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "area_server=info,area_ipc=info".to_string(),
        }
    }
}
