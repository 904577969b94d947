//! TKey session CLI
//!
//! Operator commands around the session library: find the token, inspect the
//! configured signer app and manage the configuration file.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use miette::{IntoDiagnostic, Result};
use tkey_session::infra::config::{ConfigManager, ExportFormat, SecretConfig};
use tkey_session::infra::logging;
use tkey_session::{AppBinary, PortDiscovery, SessionError};

#[derive(Parser)]
#[command(name = "tkey-session")]
#[command(about = "Manage the TKey hardware signer session")]
#[command(long_about = "
TKey session - discovery, app inspection and configuration for TKey signers

EXAMPLES:
    # List TKeys plugged into this machine
    tkey-session detect

    # Show name and digest of the signer app that will be loaded
    tkey-session app-info --app signer.bin

    # Ask for the personalization secret with pinentry
    tkey-session config set secret prompt

ENVIRONMENT VARIABLES:
    TKEY_SESSION_CONFIG    Configuration file path
    RUST_LOG               Logging level (debug, info, warn, error)
")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true, env = "TKEY_SESSION_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports that carry a TKey
    Detect,

    /// Show name, size and SHA-512 digest of the signer app
    AppInfo {
        /// App binary (defaults to app_path from the configuration)
        #[arg(long, value_name = "FILE")]
        app: Option<PathBuf>,
    },

    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Create default configuration file
    Init,

    /// Print the configuration file path
    Path,

    /// Set a configuration value
    Set {
        /// Configuration key (port, speed, app_path, idle_disconnect_ms, handle_signals, secret)
        key: String,
        /// Configuration value
        value: String,
    },

    /// Export configuration
    Export {
        /// Export format
        #[arg(short, long, value_enum, default_value = "toml")]
        format: ExportFormatArg,
        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Import configuration
    Import {
        /// Configuration file to import
        file: PathBuf,
        /// Import format
        #[arg(short, long, value_enum, default_value = "toml")]
        format: ExportFormatArg,
    },
}

#[derive(ValueEnum, Clone, Copy)]
enum ExportFormatArg {
    Toml,
    Json,
}

impl From<ExportFormatArg> for ExportFormat {
    fn from(arg: ExportFormatArg) -> Self {
        match arg {
            ExportFormatArg::Toml => ExportFormat::Toml,
            ExportFormatArg::Json => ExportFormat::Json,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config_manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new(),
    };

    match cli.command {
        Commands::Detect => handle_detect_command()?,
        Commands::AppInfo { app } => handle_app_info_command(&config_manager, app)?,
        Commands::Config(config_cmd) => handle_config_command(&config_manager, config_cmd)?,
    }

    Ok(())
}

#[cfg(feature = "serial-discovery")]
fn discovery() -> Box<dyn PortDiscovery> {
    Box::new(tkey_session::adapters::serial::SerialPortDiscovery)
}

#[cfg(not(feature = "serial-discovery"))]
fn discovery() -> Box<dyn PortDiscovery> {
    Box::new(tkey_session::StaticDiscovery::default())
}

fn handle_detect_command() -> Result<()> {
    let ports = discovery().candidates().into_diagnostic()?;

    for port in &ports {
        println!("{port}");
    }

    let problem = match ports.len() {
        0 => Some(SessionError::DeviceNotFound),
        1 => None,
        n => Some(SessionError::AmbiguousDevice(n)),
    };
    if let Some(error) = problem {
        if let Some(hint) = error.user_hint() {
            eprintln!("{hint}");
        }
        return Err(error.into());
    }
    Ok(())
}

fn handle_app_info_command(config_manager: &ConfigManager, app: Option<PathBuf>) -> Result<()> {
    let binary = match app {
        Some(path) => AppBinary::from_file(path)?,
        None => config_manager.load()?.load_app()?,
    };

    println!("Name:   {}", binary.name());
    println!("Size:   {} bytes", binary.len());
    println!("SHA512: {}", binary.digest_hex());
    Ok(())
}

fn handle_config_command(
    config_manager: &ConfigManager,
    config_cmd: ConfigCommands,
) -> Result<()> {
    match config_cmd {
        ConfigCommands::Show => match config_manager.load() {
            Ok(config) => {
                println!("Current configuration:");
                println!("  Port: {}", config.port().unwrap_or("(auto-detect)"));
                println!("  Speed: {}", config.speed);
                match &config.app_path {
                    Some(path) => println!("  Signer app: {}", path.display()),
                    None => println!("  Signer app: (not set)"),
                }
                println!("  Idle disconnect: {} ms", config.idle_disconnect_ms);
                println!("  Handle signals: {}", config.handle_signals);
                match &config.secret {
                    SecretConfig::None => println!("  Secret: none"),
                    SecretConfig::Prompt { pinentry } => {
                        println!("  Secret: prompt via {pinentry}");
                    }
                    SecretConfig::File { path } => println!("  Secret: file {}", path.display()),
                }
                println!(
                    "  Configuration file: {}",
                    config_manager.config_path().display()
                );
            }
            Err(_) => {
                println!("No configuration file found. Use 'config init' to create one.");
            }
        },

        ConfigCommands::Init => {
            config_manager.load_or_create_default()?;
            println!(
                "Configuration initialized: {}",
                config_manager.config_path().display()
            );
        }

        ConfigCommands::Path => println!("{}", config_manager.config_path().display()),

        ConfigCommands::Set { key, value } => {
            config_manager.update_value(&key, &value)?;
            println!("Configuration updated: {key} = {value}");
        }

        ConfigCommands::Export { format, output } => {
            let content = config_manager.export_config(format.into())?;

            if let Some(output_path) = output {
                std::fs::write(&output_path, content).into_diagnostic()?;
                println!("Configuration exported to: {}", output_path.display());
            } else {
                println!("{content}");
            }
        }

        ConfigCommands::Import { file, format } => {
            let content = std::fs::read_to_string(&file).into_diagnostic()?;
            config_manager.import_config(&content, format.into())?;
            println!("Configuration imported from: {}", file.display());
        }
    }

    Ok(())
}
