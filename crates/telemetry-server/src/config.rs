use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use telemetry_engine::EngineConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "telemetry-server")]
#[command(about = "OTLP telemetry collector with a live metrics stream")]
#[command(version)]
pub struct Cli {
    /// Verbose logging when RUST_LOG is not set
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,

    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value = "2025")]
    pub port: u16,

    /// SQLite file holding one row per ingested data point
    #[arg(long, env = "DATABASE_PATH", default_value = "telemetry.db")]
    pub database_path: PathBuf,

    /// Seconds without data before a session stops counting as active
    #[arg(long, env = "SESSION_TIMEOUT_SECS", default_value = "600")]
    pub session_timeout_secs: u64,

    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "60")]
    pub sweep_interval_secs: u64,

    #[arg(long, env = "RUST_LOG")]
    pub log_level: Option<String>,
}

impl Cli {
    pub fn into_config(self) -> ServerConfig {
        let engine = EngineConfig {
            session_timeout: Duration::from_secs(self.session_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            ..EngineConfig::default()
        };

        ServerConfig {
            host: self.host,
            port: self.port,
            database_path: self.database_path,
            engine,
        }
    }
}

/// Resolved server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_path: PathBuf,
    pub engine: EngineConfig,
}

impl ServerConfig {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 2025,
            database_path: database_path.into(),
            engine: EngineConfig::default(),
        }
    }
}
