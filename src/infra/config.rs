//! Configuration management infrastructure.
//!
//! Persists the session settings (port, speed, secret source, app binary,
//! idle delay) as TOML and turns them into a ready-to-use provider.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapters::pinentry::{PinentryPrompt, DEFAULT_PINENTRY};
use crate::adapters::transport::TransportFactory;
use crate::domain::constants::{DEFAULT_SERIAL_SPEED, IDLE_DISCONNECT};
use crate::domain::AppBinary;
use crate::infra::error::{SessionError, SessionResult};
use crate::services::lifecycle;
use crate::services::provider::{self, SignatureProvider};
use crate::services::secret_source::SecretSource;

/// Session settings as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfiguration {
    /// Serial port of the token; empty means auto-discover
    pub port: String,

    /// Serial speed in bits per second
    pub speed: u32,

    /// Path of the signer app binary loaded onto tokens in firmware mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_path: Option<PathBuf>,

    /// Delay before an idle connection is closed
    pub idle_disconnect_ms: u64,

    /// Close the token and exit on SIGINT/SIGTERM
    pub handle_signals: bool,

    /// Where the personalization secret comes from
    pub secret: SecretConfig,
}

/// Serialized form of the secret source.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SecretConfig {
    #[default]
    None,
    Prompt {
        #[serde(default = "default_pinentry")]
        pinentry: String,
    },
    File {
        path: PathBuf,
    },
}

fn default_pinentry() -> String {
    DEFAULT_PINENTRY.to_string()
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            port: String::new(),
            speed: DEFAULT_SERIAL_SPEED,
            app_path: None,
            idle_disconnect_ms: IDLE_DISCONNECT.as_millis() as u64,
            handle_signals: true,
            secret: SecretConfig::None,
        }
    }
}

impl SessionConfiguration {
    /// Configured port, `None` for auto-discovery.
    #[must_use]
    pub fn port(&self) -> Option<&str> {
        Some(self.port.trim()).filter(|p| !p.is_empty())
    }

    #[must_use]
    pub fn idle_disconnect(&self) -> Duration {
        Duration::from_millis(self.idle_disconnect_ms)
    }

    #[must_use]
    pub fn secret_source(&self) -> SecretSource {
        match &self.secret {
            SecretConfig::None => SecretSource::None,
            SecretConfig::Prompt { pinentry } => {
                SecretSource::Prompt(Arc::new(PinentryPrompt::new(pinentry.clone())))
            }
            SecretConfig::File { path } => SecretSource::File(path.clone()),
        }
    }

    /// Read the configured signer app binary.
    pub fn load_app(&self) -> SessionResult<AppBinary> {
        let path = self.app_path.as_ref().ok_or_else(|| {
            SessionError::Configuration(
                "no signer app configured (set app_path to the device app binary)".to_string(),
            )
        })?;
        AppBinary::from_file(path)
    }

    /// Build a provider from these settings around transports made by
    /// `new_transport`.
    pub fn provider(&self, new_transport: TransportFactory) -> SessionResult<SignatureProvider> {
        validate(self)?;
        Ok(SignatureProvider::new(new_transport, self.load_app()?)
            .with_port(self.port().map(str::to_string))
            .with_speed(self.speed)
            .with_idle_disconnect(self.idle_disconnect())
            .with_secret_source(self.secret_source()))
    }

    /// Build the provider, install it process-wide and, when
    /// `handle_signals` is set, hook it up to interrupt and terminate.
    pub fn install(
        &self,
        new_transport: TransportFactory,
    ) -> SessionResult<&'static SignatureProvider> {
        let installed = provider::install(self.provider(new_transport)?)?;
        self.install_signal_hooks(installed)?;
        Ok(installed)
    }

    /// Register the signal hooks for `provider` if `handle_signals` is set.
    /// Returns whether hooks were registered.
    pub fn install_signal_hooks(
        &self,
        provider: &'static SignatureProvider,
    ) -> SessionResult<bool> {
        if !self.handle_signals {
            log::debug!("Signal handling disabled by configuration");
            return Ok(false);
        }
        lifecycle::install_for_provider(provider)?;
        Ok(true)
    }
}

/// Configuration manager for handling config files
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new configuration manager with default path
    #[must_use]
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a configuration manager with custom path
    pub fn with_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            config_path: path.as_ref().to_path_buf(),
        }
    }

    /// Get the default configuration file path
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        match dirs::config_dir() {
            Some(config_dir) => config_dir.join("tkey-session").join("config.toml"),
            None => PathBuf::from("tkey-session-config.toml"),
        }
    }

    /// Load configuration from file, creating default if it doesn't exist
    pub fn load_or_create_default(&self) -> SessionResult<SessionConfiguration> {
        if self.config_path.exists() {
            self.load()
        } else {
            log::info!(
                "Configuration file not found, creating default: {}",
                self.config_path.display()
            );
            let default_config = SessionConfiguration::default();
            self.save(&default_config)?;
            Ok(default_config)
        }
    }

    /// Load configuration from file
    pub fn load(&self) -> SessionResult<SessionConfiguration> {
        log::debug!("Loading configuration from: {}", self.config_path.display());

        let content = fs::read_to_string(&self.config_path).map_err(|e| {
            SessionError::Configuration(format!(
                "Failed to read config file {}: {e}",
                self.config_path.display()
            ))
        })?;

        let config: SessionConfiguration = toml::from_str(&content).map_err(|e| {
            SessionError::Configuration(format!("Failed to parse config file: {e}"))
        })?;

        validate(&config)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, config: &SessionConfiguration) -> SessionResult<()> {
        validate(config)?;
        log::info!("Saving configuration to: {}", self.config_path.display());

        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                SessionError::Configuration(format!(
                    "Failed to create config directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let content = toml::to_string_pretty(config).map_err(|e| {
            SessionError::Configuration(format!("Failed to serialize config: {e}"))
        })?;

        fs::write(&self.config_path, content).map_err(|e| {
            SessionError::Configuration(format!(
                "Failed to write config file {}: {e}",
                self.config_path.display()
            ))
        })
    }

    /// Update a specific configuration value
    ///
    /// `secret` takes `none`, `prompt`, `prompt:<program>` or `file:<path>`.
    pub fn update_value(&self, key: &str, value: &str) -> SessionResult<()> {
        let mut config = self.load_or_create_default()?;

        match key {
            "port" => config.port = value.trim().to_string(),
            "speed" => config.speed = parse_number(key, value)?,
            "app_path" => {
                config.app_path = Some(PathBuf::from(value)).filter(|p| !p.as_os_str().is_empty());
            }
            "idle_disconnect_ms" => config.idle_disconnect_ms = parse_number(key, value)?,
            "handle_signals" => {
                config.handle_signals = value.parse().map_err(|_| {
                    SessionError::Configuration(format!("Invalid boolean value: {value}"))
                })?;
            }
            "secret" => config.secret = parse_secret(value)?,
            _ => {
                return Err(SessionError::Configuration(format!(
                    "Unknown configuration key: {key}"
                )));
            }
        }

        self.save(&config)
    }

    /// Get the configuration file path
    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Export configuration as a portable format
    pub fn export_config(&self, format: ExportFormat) -> SessionResult<String> {
        let config = self.load()?;

        match format {
            ExportFormat::Toml => toml::to_string_pretty(&config)
                .map_err(|e| SessionError::Configuration(format!("TOML export failed: {e}"))),
            ExportFormat::Json => serde_json::to_string_pretty(&config)
                .map_err(|e| SessionError::Configuration(format!("JSON export failed: {e}"))),
        }
    }

    /// Import configuration from a string
    pub fn import_config(&self, content: &str, format: ExportFormat) -> SessionResult<()> {
        let config: SessionConfiguration = match format {
            ExportFormat::Toml => toml::from_str(content).map_err(|e| {
                SessionError::Configuration(format!("TOML import failed: {e}"))
            })?,
            ExportFormat::Json => serde_json::from_str(content).map_err(|e| {
                SessionError::Configuration(format!("JSON import failed: {e}"))
            })?,
        };

        self.save(&config)
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration export/import formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Toml,
    Json,
}

/// Validate configuration values
pub fn validate(config: &SessionConfiguration) -> SessionResult<()> {
    if config.speed == 0 {
        return Err(SessionError::Configuration(
            "Serial speed must be greater than 0".to_string(),
        ));
    }

    if config.idle_disconnect_ms == 0 {
        return Err(SessionError::Configuration(
            "Idle disconnect delay must be greater than 0".to_string(),
        ));
    }

    match &config.secret {
        SecretConfig::File { path } if path.as_os_str().is_empty() => Err(
            SessionError::Configuration("Secret file mode needs a path".to_string()),
        ),
        SecretConfig::Prompt { pinentry } if pinentry.trim().is_empty() => Err(
            SessionError::Configuration("Secret prompt mode needs a pinentry program".to_string()),
        ),
        _ => Ok(()),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> SessionResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SessionError::Configuration(format!("Invalid number for {key}: {value}")))
}

fn parse_secret(value: &str) -> SessionResult<SecretConfig> {
    match value.split_once(':') {
        None if value == "none" => Ok(SecretConfig::None),
        None if value == "prompt" => Ok(SecretConfig::Prompt {
            pinentry: default_pinentry(),
        }),
        Some(("prompt", program)) => Ok(SecretConfig::Prompt {
            pinentry: program.to_string(),
        }),
        Some(("file", path)) => Ok(SecretConfig::File {
            path: PathBuf::from(path),
        }),
        _ => Err(SessionError::Configuration(format!(
            "Invalid secret source: {value} (expected none, prompt[:program] or file:<path>)"
        ))),
    }
}
