//! Configuration validation.

use super::{Config, EndpointConfig, MAX_BATCH_SIZE, MAX_WORKERS};
use crate::error::{MigrateError, Result};
use crate::migrator::dependency_order;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_endpoint("source", &config.source)?;
    validate_endpoint("destination", &config.destination)?;

    // Cannot migrate an instance onto itself
    if config.source.fingerprint() == config.destination.fingerprint() {
        return Err(MigrateError::Config(
            "source and destination cannot be the same instance".into(),
        ));
    }

    let migration = &config.migration;

    // Only check workers if explicitly set
    if let Some(workers) = migration.workers {
        if workers == 0 || workers > MAX_WORKERS {
            return Err(MigrateError::Config(format!(
                "migration.workers must be between 1 and {}, got {}",
                MAX_WORKERS, workers
            )));
        }
    }
    if migration.batch_size == 0 || migration.batch_size > MAX_BATCH_SIZE {
        return Err(MigrateError::Config(format!(
            "migration.batch_size must be between 1 and {}, got {}",
            MAX_BATCH_SIZE, migration.batch_size
        )));
    }
    if migration.max_attempts == 0 {
        return Err(MigrateError::Config(
            "migration.max_attempts must be at least 1".into(),
        ));
    }
    if migration.base_backoff_ms > migration.max_backoff_ms {
        return Err(MigrateError::Config(
            "migration.base_backoff_ms cannot exceed migration.max_backoff_ms".into(),
        ));
    }
    if migration.max_attachment_bytes == 0 {
        return Err(MigrateError::Config(
            "migration.max_attachment_bytes must be at least 1".into(),
        ));
    }

    // Rejects cycles among the selected kinds
    dependency_order(&migration.selected_kinds())?;

    Ok(())
}

fn validate_endpoint(name: &str, endpoint: &EndpointConfig) -> Result<()> {
    if endpoint.base_url.is_empty() {
        return Err(MigrateError::Config(format!("{}.base_url is required", name)));
    }
    if !endpoint.base_url.starts_with("http://") && !endpoint.base_url.starts_with("https://") {
        return Err(MigrateError::Config(format!(
            "{}.base_url must start with http:// or https://, got '{}'",
            name, endpoint.base_url
        )));
    }
    if endpoint.api_key.is_empty() {
        return Err(MigrateError::Config(format!(
            "{}.api_key is required (or set it in the environment)",
            name
        )));
    }
    Ok(())
}
