//! Configuration module for topicflow
//!
//! Settings are read from environment variables, with a `.env` file loaded
//! first when one exists.

use envconfig::Envconfig;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::kafka::KafkaConfig;

/// Main configuration structure for topicflow
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct Config {
    #[serde(flatten)]
    #[envconfig(nested = true)]
    pub logging: LoggingConfig,

    #[serde(flatten)]
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct LoggingConfig {
    /// Log level
    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    /// Environment (development, staging, production)
    #[envconfig(from = "ENVIRONMENT", default = "development")]
    pub environment: String,
}

impl LoggingConfig {
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenv::dotenv().ok();

        Config::init_from_env().map_err(Error::from)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers_list().is_empty() {
            return Err(Error::invalid_config("Kafka brokers cannot be empty"));
        }

        if self.kafka.group_id.trim().is_empty() {
            return Err(Error::invalid_config("Kafka group id cannot be empty"));
        }

        if !matches!(
            self.kafka.auto_offset_reset.as_str(),
            "earliest" | "latest" | "none"
        ) {
            return Err(Error::invalid_config(format!(
                "Unsupported auto offset reset: {}",
                self.kafka.auto_offset_reset
            )));
        }

        if self.kafka.read_timeout_ms == 0 {
            return Err(Error::invalid_config("Read timeout must be at least 1ms"));
        }

        Ok(())
    }

    pub fn log_config(&self) {
        tracing::info!(
            environment = %self.logging.environment,
            log_level = %self.logging.log_level,
            "Logging configuration"
        );

        tracing::info!(
            brokers = %self.kafka.brokers,
            group_id = %self.kafka.group_id,
            async_commit = %self.kafka.async_commit,
            auto_offset_reset = %self.kafka.auto_offset_reset,
            idempotent_producer = %self.kafka.idempotent_producer,
            "Kafka configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            logging: LoggingConfig {
                log_level: "debug".to_string(),
                environment: "production".to_string(),
            },
            kafka: KafkaConfig::default(),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = config();
        assert!(config.validate().is_ok());
        assert!(config.logging.is_production());
    }

    #[test]
    fn test_validate_rejects_empty_brokers() {
        let mut config = config();
        config.kafka.brokers = " , ".to_string();

        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "configuration error: Kafka brokers cannot be empty"
        );
    }

    #[test]
    fn test_validate_rejects_unknown_offset_reset() {
        let mut config = config();
        config.kafka.auto_offset_reset = "smallest-ish".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_env_uses_defaults() {
        let config = Config::from_env().unwrap();
        assert!(!config.kafka.group_id.is_empty());
        assert!(!config.logging.log_level.is_empty());
    }
}
