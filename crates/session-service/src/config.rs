//! Configuration management for the session service
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use execution_engine::OrchestratorConfig;
use security_gate::AssessorConfig;

/// Largest accepted container memory limit (1 TiB)
const MAX_MEMORY_LIMIT_MB: u64 = 1024 * 1024;

/// Where sessions are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Redis,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(StorageBackend::Redis),
            "memory" => Ok(StorageBackend::Memory),
            other => anyhow::bail!("Unknown STORAGE_BACKEND: {} (expected redis or memory)", other),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API server host
    pub api_host: String,

    /// API server port
    pub api_port: u16,

    pub storage_backend: StorageBackend,

    /// Redis connection URL
    pub redis_url: String,

    /// Parent directory of ephemeral build contexts
    pub work_dir: PathBuf,

    /// Minimal runtime image for base images and fallback builds
    pub base_runtime_image: String,

    pub execution_timeout_secs: u64,
    pub memory_limit_mb: u64,
    pub cpu_shares: i64,

    pub image_verify_retries: u32,
    pub image_verify_delay_ms: u64,

    pub monitor_interval_ms: u64,

    /// PBKDF2 rounds for code encryption
    pub kdf_iterations: u32,

    /// Build missing base images in the background at startup
    pub warmup_on_start: bool,

    pub risk_assessor_url: String,

    /// Without a key the static analyzer is used
    pub risk_assessor_api_key: Option<String>,

    pub risk_assessor_model: String,
    pub risk_assessor_timeout_secs: u64,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var_or(name, default)
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .with_context(|| format!("Invalid {}", name))
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        let config = Config {
            api_host: var_or("API_HOST", "0.0.0.0"),
            api_port: parse_var("API_PORT", "8090")?,
            storage_backend: var_or("STORAGE_BACKEND", "redis").parse()?,
            redis_url: var_or("REDIS_URL", "redis://127.0.0.1:6379"),
            work_dir: var_or("WORK_DIR", "/tmp/secure-exec").into(),
            base_runtime_image: var_or("BASE_RUNTIME_IMAGE", "python:3.9-slim"),
            execution_timeout_secs: parse_var("EXECUTION_TIMEOUT_SECS", "30")?,
            memory_limit_mb: parse_var("MEMORY_LIMIT_MB", "512")?,
            cpu_shares: parse_var("CPU_SHARES", "512")?,
            image_verify_retries: parse_var("IMAGE_VERIFY_RETRIES", "3")?,
            image_verify_delay_ms: parse_var("IMAGE_VERIFY_DELAY_MS", "2000")?,
            monitor_interval_ms: parse_var("MONITOR_INTERVAL_MS", "1000")?,
            kdf_iterations: parse_var("KDF_ITERATIONS", "100000")?,
            warmup_on_start: parse_var("WARMUP_ON_START", "true")?,
            risk_assessor_url: var_or(
                "RISK_ASSESSOR_URL",
                "https://api.groq.com/openai/v1/chat/completions",
            ),
            risk_assessor_api_key: env::var("RISK_ASSESSOR_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            risk_assessor_model: var_or("RISK_ASSESSOR_MODEL", "llama-3.3-70b-versatile"),
            risk_assessor_timeout_secs: parse_var("RISK_ASSESSOR_TIMEOUT_SECS", "20")?,
        };

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("API_PORT must be greater than 0");
        }
        if self.execution_timeout_secs == 0 {
            anyhow::bail!("EXECUTION_TIMEOUT_SECS must be greater than 0");
        }
        if self.memory_limit_mb == 0 {
            anyhow::bail!("MEMORY_LIMIT_MB must be greater than 0");
        }
        if self.memory_limit_mb > MAX_MEMORY_LIMIT_MB {
            anyhow::bail!("MEMORY_LIMIT_MB must be at most {}", MAX_MEMORY_LIMIT_MB);
        }
        if self.cpu_shares <= 0 {
            anyhow::bail!("CPU_SHARES must be greater than 0");
        }
        if self.image_verify_retries == 0 {
            anyhow::bail!("IMAGE_VERIFY_RETRIES must be at least 1");
        }
        if self.kdf_iterations < 1000 {
            anyhow::bail!("KDF_ITERATIONS must be at least 1000");
        }

        Ok(())
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    /// Ensure the build context directory exists
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.work_dir).with_context(|| {
            format!("Failed to create work directory: {}", self.work_dir.display())
        })
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            work_dir: self.work_dir.clone(),
            runtime_image: self.base_runtime_image.clone(),
            timeout: Duration::from_secs(self.execution_timeout_secs),
            memory_limit_mb: self.memory_limit_mb,
            cpu_shares: self.cpu_shares,
            verify_retries: self.image_verify_retries,
            verify_delay: Duration::from_millis(self.image_verify_delay_ms),
            monitor_interval: Duration::from_millis(self.monitor_interval_ms),
        }
    }

    /// `None` when no API key is configured
    pub fn assessor_config(&self) -> Option<AssessorConfig> {
        self.risk_assessor_api_key
            .as_ref()
            .map(|api_key| AssessorConfig {
                url: self.risk_assessor_url.clone(),
                api_key: api_key.clone(),
                model: self.risk_assessor_model.clone(),
                timeout: Duration::from_secs(self.risk_assessor_timeout_secs),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: &[&str] = &[
        "API_HOST",
        "API_PORT",
        "STORAGE_BACKEND",
        "REDIS_URL",
        "WORK_DIR",
        "BASE_RUNTIME_IMAGE",
        "EXECUTION_TIMEOUT_SECS",
        "MEMORY_LIMIT_MB",
        "CPU_SHARES",
        "IMAGE_VERIFY_RETRIES",
        "IMAGE_VERIFY_DELAY_MS",
        "MONITOR_INTERVAL_MS",
        "KDF_ITERATIONS",
        "WARMUP_ON_START",
        "RISK_ASSESSOR_URL",
        "RISK_ASSESSOR_API_KEY",
        "RISK_ASSESSOR_MODEL",
        "RISK_ASSESSOR_TIMEOUT_SECS",
    ];

    fn config() -> Config {
        Config {
            api_host: "127.0.0.1".to_string(),
            api_port: 9000,
            storage_backend: StorageBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            work_dir: PathBuf::from("/tmp/secure-exec-test"),
            base_runtime_image: "python:3.9-slim".to_string(),
            execution_timeout_secs: 30,
            memory_limit_mb: 512,
            cpu_shares: 512,
            image_verify_retries: 3,
            image_verify_delay_ms: 2000,
            monitor_interval_ms: 1000,
            kdf_iterations: 100_000,
            warmup_on_start: false,
            risk_assessor_url: "http://localhost/v1/chat/completions".to_string(),
            risk_assessor_api_key: None,
            risk_assessor_model: "model".to_string(),
            risk_assessor_timeout_secs: 20,
        }
    }

    #[test]
    fn test_config_defaults() {
        // Clear any existing environment variables
        for var in VARS {
            env::remove_var(var);
        }

        let config = Config::from_env().expect("Failed to load config");

        assert_eq!(config.api_host, "0.0.0.0");
        assert_eq!(config.api_port, 8090);
        assert_eq!(config.storage_backend, StorageBackend::Redis);
        assert_eq!(config.work_dir, PathBuf::from("/tmp/secure-exec"));
        assert_eq!(config.execution_timeout_secs, 30);
        assert_eq!(config.memory_limit_mb, 512);
        assert_eq!(config.cpu_shares, 512);
        assert_eq!(config.image_verify_retries, 3);
        assert_eq!(config.kdf_iterations, 100_000);
        assert!(config.warmup_on_start);
        assert!(config.assessor_config().is_none());
    }

    #[test]
    fn test_api_address() {
        assert_eq!(config().api_address(), "127.0.0.1:9000");
    }

    #[test]
    fn test_validate_invalid_values() {
        let mut c = config();
        c.api_port = 0;
        assert!(c
            .validate()
            .unwrap_err()
            .to_string()
            .contains("API_PORT must be greater than 0"));

        let mut c = config();
        c.execution_timeout_secs = 0;
        assert!(c.validate().is_err());

        let mut c = config();
        c.memory_limit_mb = u64::MAX;
        assert!(c
            .validate()
            .unwrap_err()
            .to_string()
            .contains("MEMORY_LIMIT_MB must be at most"));

        let mut c = config();
        c.memory_limit_mb = MAX_MEMORY_LIMIT_MB;
        assert!(c.validate().is_ok());

        let mut c = config();
        c.image_verify_retries = 0;
        assert!(c.validate().is_err());

        let mut c = config();
        c.kdf_iterations = 10;
        assert!(c.validate().is_err());

        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_storage_backend_parsing() {
        assert_eq!("redis".parse::<StorageBackend>().unwrap(), StorageBackend::Redis);
        assert_eq!("Memory".parse::<StorageBackend>().unwrap(), StorageBackend::Memory);
        assert!("postgres".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn test_derived_configs() {
        let mut c = config();
        let orchestrator = c.orchestrator_config();
        assert_eq!(orchestrator.timeout, Duration::from_secs(30));
        assert_eq!(orchestrator.verify_delay, Duration::from_millis(2000));

        c.risk_assessor_api_key = Some("secret".to_string());
        let assessor = c.assessor_config().unwrap();
        assert_eq!(assessor.timeout, Duration::from_secs(20));
        assert_eq!(assessor.model, "model");
    }
}
