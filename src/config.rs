//! Configuration for CareLink
//!
//! CLI arguments and environment variable handling using clap.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;

use crate::auth::TokenSigner;
use crate::services::{EngineConfig, RetryPolicy};
use crate::types::CarelinkError;

/// Which document store backs the engine
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local store, lost on restart (dev mode only)
    Memory,
    Mongo,
}

/// Log output format
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
    /// JSON when stdout is not a terminal, text otherwise
    Auto,
}

impl LogFormat {
    pub fn use_json(self, stdout_is_terminal: bool) -> bool {
        match self {
            Self::Text => false,
            Self::Json => true,
            Self::Auto => !stdout_is_terminal,
        }
    }
}

/// CareLink - identity and linking reconciliation engine
#[derive(Parser, Debug, Clone)]
#[command(name = "carelink")]
#[command(about = "Account, email claim, linking code and assignment progress service")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8090")]
    pub listen: SocketAddr,

    /// Enable development mode (in-memory store, dev JWT secret)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Document store backend
    #[arg(long = "store", env = "STORE_BACKEND", value_enum, default_value = "mongo")]
    pub store: StoreBackend,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "carelink")]
    pub mongodb_db: String,

    /// JWT secret for credential signing (required in production)
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// Credential lifetime in seconds
    #[arg(long, env = "JWT_EXPIRY_SECONDS", default_value = "3600")]
    pub jwt_expiry_seconds: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Per-request deadline in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "15000")]
    pub request_timeout_ms: u64,

    /// Attempts per store interaction, including the first
    #[arg(long, env = "RETRY_MAX_ATTEMPTS", default_value = "5")]
    pub retry_max_attempts: u32,

    #[arg(long, env = "RETRY_INITIAL_BACKOFF_MS", default_value = "50")]
    pub retry_initial_backoff_ms: u64,

    #[arg(long, env = "RETRY_MAX_BACKOFF_MS", default_value = "2000")]
    pub retry_max_backoff_ms: u64,

    /// How long a linking code stays redeemable
    #[arg(long, env = "LINK_CODE_TTL_HOURS", default_value = "24")]
    pub link_code_ttl_hours: u32,

    /// Progress percentage added per completed session
    #[arg(long, env = "PROGRESS_INCREMENT", default_value = "20")]
    pub progress_increment: u8,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode {
            match self.jwt_secret.as_deref() {
                None | Some("") => {
                    return Err("JWT_SECRET is required in production mode".to_string())
                }
                Some(secret) if secret.len() < 32 => {
                    return Err("JWT_SECRET must be at least 32 characters".to_string())
                }
                Some(_) => {}
            }

            if self.store == StoreBackend::Memory {
                return Err("STORE_BACKEND=memory is only allowed in dev mode".to_string());
            }
        }

        if !(1..=10).contains(&self.retry_max_attempts) {
            return Err("RETRY_MAX_ATTEMPTS must be between 1 and 10".to_string());
        }

        if self.retry_initial_backoff_ms > self.retry_max_backoff_ms {
            return Err(
                "RETRY_INITIAL_BACKOFF_MS must not exceed RETRY_MAX_BACKOFF_MS".to_string(),
            );
        }

        if !(1..=100).contains(&self.progress_increment) {
            return Err("PROGRESS_INCREMENT must be between 1 and 100".to_string());
        }

        if self.link_code_ttl_hours == 0 {
            return Err("LINK_CODE_TTL_HOURS must be at least 1".to_string());
        }

        if self.request_timeout_ms == 0 {
            return Err("REQUEST_TIMEOUT_MS must be at least 1".to_string());
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            retry: self.retry_policy(),
            link_code_ttl: chrono::Duration::hours(i64::from(self.link_code_ttl_hours)),
            progress_increment: self.progress_increment,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Token signer for the local credential provider.
    ///
    /// Dev mode falls back to a fixed secret when none is configured.
    pub fn token_signer(&self) -> Result<TokenSigner, CarelinkError> {
        match &self.jwt_secret {
            Some(secret) => TokenSigner::new(secret.clone(), self.jwt_expiry_seconds),
            None if self.dev_mode => Ok(TokenSigner::new_dev()),
            None => Err(CarelinkError::Config(
                "JWT_SECRET is required in production mode".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["carelink"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_production_requires_long_secret() {
        let args = parse(&["--jwt-secret", "short"]);
        assert!(args.validate().unwrap_err().contains("32"));

        let args = parse(&["--jwt-secret", "0123456789abcdef0123456789abcdef"]);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_memory_store_needs_dev_mode() {
        let args = parse(&[
            "--store",
            "memory",
            "--jwt-secret",
            "0123456789abcdef0123456789abcdef",
        ]);
        assert!(args.validate().is_err());

        let args = parse(&["--store", "memory", "--dev-mode"]);
        assert!(args.validate().is_ok());
        assert!(args.token_signer().is_ok());
    }

    #[test]
    fn test_bounds_are_enforced() {
        assert!(parse(&["--dev-mode", "--retry-max-attempts", "0"]).validate().is_err());
        assert!(parse(&["--dev-mode", "--retry-max-attempts", "11"]).validate().is_err());
        assert!(parse(&["--dev-mode", "--progress-increment", "0"]).validate().is_err());
        assert!(parse(&["--dev-mode", "--link-code-ttl-hours", "0"]).validate().is_err());
    }

    #[test]
    fn test_log_format() {
        let args = parse(&["--dev-mode"]);
        assert_eq!(args.log_format, LogFormat::Text);
        assert!(!args.log_format.use_json(false));

        let args = parse(&["--dev-mode", "--log-format", "json"]);
        assert!(args.log_format.use_json(true));

        let auto = parse(&["--dev-mode", "--log-format", "auto"]).log_format;
        assert!(auto.use_json(false));
        assert!(!auto.use_json(true));
    }

    #[test]
    fn test_engine_config_follows_flags() {
        let args = parse(&[
            "--dev-mode",
            "--retry-max-attempts",
            "3",
            "--link-code-ttl-hours",
            "2",
            "--progress-increment",
            "25",
        ]);
        let config = args.engine_config();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(50));
        assert_eq!(config.link_code_ttl, chrono::Duration::hours(2));
        assert_eq!(config.progress_increment, 25);
    }
}
