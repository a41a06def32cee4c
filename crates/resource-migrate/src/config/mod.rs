//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Environment variable consulted when `source.api_key` is empty.
pub const SOURCE_API_KEY_ENV: &str = "RESOURCE_MIGRATE_SOURCE_API_KEY";

/// Environment variable consulted when `destination.api_key` is empty.
pub const DEST_API_KEY_ENV: &str = "RESOURCE_MIGRATE_DEST_API_KEY";

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// Missing API keys are filled from the environment before validation;
    /// nothing reads the environment after this point.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.fill_keys_from_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Hash identifying the endpoint pair, used to guard resume and to key state signatures.
    ///
    /// Tuning knobs (workers, batch size) are excluded so a session can be
    /// resumed with different performance settings.
    pub fn resume_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source.fingerprint().as_bytes());
        hasher.update(b"->");
        hasher.update(self.destination.fingerprint().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn fill_keys_from_env(&mut self) {
        if self.source.api_key.is_empty() {
            if let Ok(key) = std::env::var(SOURCE_API_KEY_ENV) {
                self.source.api_key = key;
            }
        }
        if self.destination.api_key.is_empty() {
            if let Ok(key) = std::env::var(DEST_API_KEY_ENV) {
                self.destination.api_key = key;
            }
        }
    }
}

impl EndpointConfig {
    /// API root with a single `/api/v1` suffix.
    pub fn api_url(&self) -> String {
        let clean = self.base_url.trim_end_matches('/');
        if clean.ends_with("/api/v1") {
            clean.to_string()
        } else {
            format!("{}/api/v1", clean)
        }
    }

    /// SHA256 of the normalized API URL, stored in sessions to detect
    /// same-instance migrations and endpoint changes on resume.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.api_url().to_lowercase().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrator::ResourceKind;

    fn endpoint(url: &str) -> EndpointConfig {
        EndpointConfig {
            base_url: url.to_string(),
            api_key: "key".to_string(),
            verify_ssl: true,
            timeout_secs: 30,
        }
    }

    #[test]
    fn test_api_url_normalization() {
        assert_eq!(
            endpoint("https://api.example.com").api_url(),
            "https://api.example.com/api/v1"
        );
        assert_eq!(
            endpoint("https://api.example.com/").api_url(),
            "https://api.example.com/api/v1"
        );
        assert_eq!(
            endpoint("https://api.example.com/api/v1/").api_url(),
            "https://api.example.com/api/v1"
        );
    }

    #[test]
    fn test_fingerprint_ignores_suffix_and_case() {
        assert_eq!(
            endpoint("https://API.example.com").fingerprint(),
            endpoint("https://api.example.com/api/v1").fingerprint()
        );
        assert_ne!(
            endpoint("https://a.example.com").fingerprint(),
            endpoint("https://b.example.com").fingerprint()
        );
    }

    #[test]
    fn test_from_yaml_defaults() {
        let yaml = r#"
source:
  base_url: https://old.example.com
  api_key: src-key
destination:
  base_url: https://new.example.com
  api_key: dst-key
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.migration.batch_size, 100);
        assert_eq!(config.migration.max_attempts, 3);
        assert!(config.migration.skip_existing);
        assert!(!config.migration.dry_run);
        assert_eq!(config.migration.selected_kinds(), ResourceKind::DEFAULT.to_vec());
    }

    #[test]
    fn test_include_experiments_extends_default_kinds() {
        let yaml = r#"
source:
  base_url: https://old.example.com
  api_key: src-key
destination:
  base_url: https://new.example.com
  api_key: dst-key
migration:
  include_experiments: true
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let kinds = config.migration.selected_kinds();
        assert_eq!(kinds.len(), ResourceKind::ALL.len());
        let ordered = crate::migrator::dependency_order(&kinds).unwrap();
        assert_eq!(ordered, ResourceKind::ALL.to_vec());
    }

    #[test]
    fn test_resume_hash_ignores_tuning() {
        let yaml = r#"
source:
  base_url: https://old.example.com
  api_key: src-key
destination:
  base_url: https://new.example.com
  api_key: dst-key
"#;
        let a = Config::from_yaml(yaml).unwrap();
        let mut b = a.clone();
        b.migration.workers = Some(8);
        b.migration.batch_size = 500;
        assert_eq!(a.resume_hash(), b.resume_hash());

        b.destination.base_url = "https://other.example.com".into();
        assert_ne!(a.resume_hash(), b.resume_hash());
    }

    #[test]
    fn test_selected_kinds_from_yaml() {
        let yaml = r#"
source:
  base_url: https://old.example.com
  api_key: src-key
destination:
  base_url: https://new.example.com
  api_key: dst-key
migration:
  resource_kinds: [dataset, example]
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(
            config.migration.selected_kinds(),
            vec![ResourceKind::Dataset, ResourceKind::Example]
        );
    }
}
