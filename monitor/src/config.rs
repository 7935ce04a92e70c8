use anyhow::{Context, Result};
use clap::Parser;
use lib_engagement::EngineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Engagement hub monitor", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "ENGAGE_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "ENGAGE_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "ENGAGE_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "ENGAGE_API_URL", help = "Base URL of the REST API and hub host.")]
    pub api_base_url: Option<String>,

    #[clap(long, env = "ENGAGE_HUB_PATH", help = "Path of the hub below the API URL.")]
    pub hub_path: Option<String>,

    #[clap(long, env = "ENGAGE_ACCESS_TOKEN", help = "Bearer token for REST calls and the hub.")]
    pub access_token: Option<String>,

    #[clap(long, env = "ENGAGE_AUTHENTICATED", help = "Whether the token belongs to a signed-in user.")]
    pub authenticated: Option<bool>,

    #[clap(
        long = "resource",
        env = "ENGAGE_RESOURCES",
        value_delimiter = ',',
        help = "Resource (template) ids to observe. Repeat or separate with commas."
    )]
    pub resources: Option<Vec<String>>,

    #[clap(
        long,
        env = "ENGAGE_RECONNECT_DELAYS_MS",
        value_delimiter = ',',
        help = "Delays in milliseconds before each automatic reconnect attempt."
    )]
    pub reconnect_delays_ms: Option<Vec<u64>>,

    #[clap(long, env = "ENGAGE_START_ATTEMPTS", help = "Initial connection attempts before giving up.")]
    pub start_attempts: Option<u32>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            api_base_url: other.api_base_url.or(self.api_base_url),
            hub_path: other.hub_path.or(self.hub_path),
            access_token: other.access_token.or(self.access_token),
            authenticated: other.authenticated.or(self.authenticated),
            resources: other.resources.or(self.resources),
            reconnect_delays_ms: other.reconnect_delays_ms.or(self.reconnect_delays_ms),
            start_attempts: other.start_attempts.or(self.start_attempts),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn resources(&self) -> Vec<String> {
        self.resources
            .iter()
            .flatten()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect()
    }

    pub fn start_attempts(&self) -> u32 {
        self.start_attempts.unwrap_or(3).max(1)
    }

    /// Engine settings: library defaults overridden by whatever is set here.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut engine = EngineConfig::default();
        if let Some(url) = &self.api_base_url {
            engine.api_base_url = url.clone();
        }
        if let Some(path) = &self.hub_path {
            engine.hub_path = path.clone();
        }
        if let Some(delays) = &self.reconnect_delays_ms {
            engine.reconnect_delays_ms = delays.clone();
        }
        engine.access_token = self.access_token.clone();
        engine.authenticated = self.authenticated.unwrap_or(self.access_token.is_some());
        engine.validate()?;
        Ok(engine)
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("engagement_monitor").join("monitor.json"))
        .unwrap_or_else(|| PathBuf::from("engagement_monitor.json"))
}

/// Layers defaults, the JSON config file (if present) and `cli` (flags and
/// environment), later layers winning.
pub fn load_config(cli: Config) -> Result<Config> {
    // 1. Load defaults
    let default_config = Config {
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        start_attempts: Some(3),
        ..Default::default()
    };

    // 2. Load from the config file if present
    let config_file_path = cli.config_path.clone().unwrap_or_else(default_config_path);
    let mut current_config = default_config;

    if config_file_path.exists() {
        let config_str = fs::read_to_string(&config_file_path)
            .with_context(|| format!("Failed to read config file {}", config_file_path.display()))?;
        let file_config: Config = serde_json::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file {}", config_file_path.display()))?;
        current_config = current_config.merge(file_config);
    } else if cli.config_path.is_some() {
        anyhow::bail!("Config file not found at {}", config_file_path.display());
    }

    // 3. CLI arguments (which include env vars) override the file
    Ok(current_config.merge(cli))
}
