use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "simplebank", about = "SimpleBank - accounts and money transfers over HTTP")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "simplebank.toml")]
    pub config: String,

    /// Address to listen on as host:port (overrides config file)
    #[arg(long, env = "SIMPLEBANK_SERVER_ADDRESS")]
    pub server_address: Option<String>,

    /// Port to listen on (overrides config file and server address)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Storage backend: memory, sqlite or postgres (overrides config file)
    #[arg(long, env = "SIMPLEBANK_BACKEND")]
    pub backend: Option<Backend>,

    /// Database URL or path (overrides config file)
    #[arg(long, env = "SIMPLEBANK_DATABASE_URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_server")]
    pub server: ServerConfig,

    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub transfer: TransferConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: Backend,

    /// SQLite path (or `:memory:`) or PostgreSQL connection string.
    /// Ignored by the memory backend.
    #[serde(default)]
    pub url: String,

    /// PostgreSQL pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            backend: Backend::default(),
            url: String::new(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransferConfig {
    /// Upper bound on one request's work against the store, lock waits
    /// included.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl TransferConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_server() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
    }
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        json: false,
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_max_connections() -> u32 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: default_server(),
            logging: default_logging(),
            database: DatabaseConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl Config {
    pub fn load(cli: &CliArgs) -> Self {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Config::default()
            }),
            Err(_) => Config::default(),
        };

        // CLI and environment overrides
        if let Some(ref address) = cli.server_address {
            match address.rsplit_once(':').map(|(host, port)| (host, port.parse::<u16>())) {
                Some((host, Ok(port))) => {
                    config.server.host = host.to_string();
                    config.server.port = port;
                }
                _ => eprintln!("Warning: Ignoring invalid server address: {}", address),
            }
        }
        if let Some(port) = cli.port {
            config.server.port = port;
        }
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }
        if let Some(backend) = cli.backend {
            config.database.backend = backend;
        }
        if let Some(ref url) = cli.database_url {
            config.database.url = url.clone();
        }

        config
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.server.host, self.server.port).parse()
    }
}
