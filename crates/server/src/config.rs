use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub llm: LlmConfig,
    pub workers: WorkerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
    pub request_timeout_secs: u64,
    /// Upload cap in bytes (multipart body limit).
    pub max_upload_bytes: usize,
    pub upload_dir: String,
    pub enable_cors: bool,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    pub token_ttl_hours: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// Applied to users that have not configured their own endpoint.
    pub default_endpoint: Option<String>,
    pub default_model: String,
    pub default_embedding_model: String,
    pub health_timeout_secs: u64,
    /// Per-job generate timeout bounds (seconds).
    pub default_call_timeout_secs: u64,
    pub min_call_timeout_secs: u64,
    pub max_call_timeout_secs: u64,
    /// Capacity of the in-memory call ring.
    pub call_log_size: usize,
    /// Estimated token budget per analysis chunk.
    pub chunk_token_budget: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Concurrent parsing tasks.
    pub parse_pool: usize,
    /// Concurrent analysis orchestrations.
    pub rca_pool: usize,
    /// Bounded dispatch queue depth per pool.
    pub queue_depth: usize,
    /// Grace period for in-flight jobs at shutdown (seconds).
    pub drain_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    File { path: String },
}

impl AppConfig {
    /// Load configuration from server.toml and environment variables.
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        // Compile-time defaults are the foundation; files and env override
        let defaults = config::Config::try_from(&AppConfig::default())
            .context("Failed to serialize default configuration")?;

        let mut builder = config::Config::builder().add_source(defaults);

        // Layer config files (first match wins per key)
        let config_paths = vec!["/etc/autocause/server", "config/server", "crates/server/config/server"];
        for path in config_paths {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // Environment overrides everything. Double underscore separates
        // nested keys: AUTOCAUSE__SERVER__BIND_ADDRESS
        builder = builder.add_source(
            config::Environment::with_prefix("AUTOCAUSE")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    pub fn validate(&self) -> Result<()> {
        self.server
            .bind_address
            .parse::<std::net::SocketAddr>()
            .context("Invalid bind_address")?;

        if self.workers.parse_pool == 0 || self.workers.rca_pool == 0 {
            anyhow::bail!("worker pool sizes must be at least 1");
        }
        if self.workers.queue_depth == 0 {
            anyhow::bail!("workers.queue_depth must be at least 1");
        }
        if self.llm.min_call_timeout_secs > self.llm.max_call_timeout_secs {
            anyhow::bail!("llm.min_call_timeout_secs exceeds llm.max_call_timeout_secs");
        }
        if self.llm.chunk_token_budget < 500 {
            anyhow::bail!("llm.chunk_token_budget is too small to hold a single entry");
        }
        if self.llm.call_log_size == 0 {
            anyhow::bail!("llm.call_log_size must be at least 1");
        }
        Ok(())
    }

    /// Clamp a user-supplied generate timeout into the configured range.
    pub fn clamp_call_timeout(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.llm.default_call_timeout_secs)
            .clamp(self.llm.min_call_timeout_secs, self.llm.max_call_timeout_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_address: "0.0.0.0:8080".to_string(),
                request_timeout_secs: 30,
                max_upload_bytes: 5 * 1024 * 1024,
                upload_dir: "data/uploads".to_string(),
                enable_cors: true,
                cors_origins: vec![
                    "http://localhost:3000".to_string(),
                    "http://localhost:5173".to_string(),
                ],
            },
            database: DatabaseConfig {
                path: "data/autocause.db".to_string(),
            },
            auth: AuthConfig { token_ttl_hours: 24 },
            llm: LlmConfig {
                default_endpoint: None,
                default_model: "llama3.1".to_string(),
                default_embedding_model: "nomic-embed-text".to_string(),
                health_timeout_secs: 10,
                default_call_timeout_secs: 300,
                min_call_timeout_secs: 30,
                max_call_timeout_secs: 1800,
                call_log_size: 500,
                chunk_token_budget: 6000,
            },
            workers: WorkerConfig {
                parse_pool: 2,
                rca_pool: 2,
                queue_depth: 64,
                drain_secs: 30,
            },
            logging: LoggingConfig {
                level: "info,server=debug".to_string(),
                format: LogFormat::Pretty,
                output: LogOutput::Stdout,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_bind_address_rejected() {
        let mut config = AppConfig::default();
        config.server.bind_address = "not an address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_pool_rejected() {
        let mut config = AppConfig::default();
        config.workers.rca_pool = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_clamping() {
        let config = AppConfig::default();
        assert_eq!(config.clamp_call_timeout(None), 300);
        assert_eq!(config.clamp_call_timeout(Some(5)), 30);
        assert_eq!(config.clamp_call_timeout(Some(600)), 600);
        assert_eq!(config.clamp_call_timeout(Some(99_999)), 1800);
    }
}
