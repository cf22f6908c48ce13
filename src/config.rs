use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Environment variable that overrides `postgres_url`
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// PostgreSQL connection URL for the ledger store
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
    /// Row-lock wait bound per transaction; 0 waits forever
    pub lock_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            acquire_timeout_ms: 5_000,
            lock_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    pub fn lock_timeout(&self) -> Option<Duration> {
        (self.lock_timeout_ms > 0).then(|| Duration::from_millis(self.lock_timeout_ms))
    }
}

impl AppConfig {
    /// Load `config/<env>.yaml`
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config yaml: {}", config_path))?;
        Ok(config.with_env_overrides(std::env::var(DATABASE_URL_ENV).ok()))
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    fn with_env_overrides(mut self, database_url: Option<String>) -> Self {
        if let Some(url) = database_url.filter(|u| !u.is_empty()) {
            self.postgres_url = Some(url);
        }
        self
    }
}
