//! Configuration parser for loading stack files.
//!
//! This module handles loading the stack from YAML, applying environment
//! variable overrides and resolving secret interpolations, with proper
//! precedence and error handling.

use crate::error::{CirrusError, ConfigError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::secrets::{EnvSecretSource, SecretSource, resolve_spec_secrets};
use super::spec::{StackConfig, StateBackend};

/// Configuration parser for loading stack configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving `.env`.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// Secrets are not resolved; see [`ConfigParser::load_with_env`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(CirrusError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            CirrusError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackConfig> {
        debug!("Parsing YAML configuration");

        let config: StackConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            CirrusError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed configuration for project {} ({} resources)",
            config.project.name,
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides and secrets
    /// resolved from the process environment.
    ///
    /// Environment variables are checked in the format:
    /// `CIRRUS_<SECTION>_<KEY>` (e.g., `CIRRUS_PROJECT_NAME`)
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a
    /// referenced secret is unavailable.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let mut config = self.load_file(path)?;

        Self::apply_env_overrides(&mut config);
        Self::resolve_secrets(&mut config, &EnvSecretSource)?;

        Ok(config)
    }

    /// Resolves `${secret:NAME}` in every resource against `source`.
    ///
    /// # Errors
    ///
    /// Returns an error naming the resource whose secret is missing.
    pub fn resolve_secrets(config: &mut StackConfig, source: &dyn SecretSource) -> Result<()> {
        for spec in &mut config.resources {
            resolve_spec_secrets(spec, source)?;
        }
        Ok(())
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(config: &mut StackConfig) {
        // Project overrides
        if let Ok(name) = std::env::var("CIRRUS_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Ok(env) = std::env::var("CIRRUS_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        // State overrides
        if let Ok(bucket) = std::env::var("CIRRUS_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
            config.state.backend = StateBackend::S3;
        }

        if let Ok(prefix) = std::env::var("CIRRUS_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Ok(region) = std::env::var("CIRRUS_STATE_REGION") {
            debug!("Overriding state.region from environment");
            config.state.region = Some(region);
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                CirrusError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["cirrus.yaml", "cirrus.yml"];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(CirrusError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::secrets::StaticSecretSource;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
";
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).expect("should parse");

        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
project:
  name: web-stack
  environment: prod

state:
  backend: s3
  bucket: cirrus-state
  prefix: web-stack/prod

execution:
  max_parallel: 4
  max_retries: 5

resources:
  - provider: aws
    type: instance
    name: web
    attributes:
      ami: ami-0c55b159cbfafe1f0
      instance_type: t3.micro
      tags:
        role: frontend
  - provider: aws
    type: s3_bucket
    name: assets
    attributes:
      bucket: web-assets
      owner: "${aws.instance.web.id}"
"#;
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).expect("should parse");

        assert_eq!(config.project.name, "web-stack");
        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.execution.max_parallel, 4);
        assert_eq!(config.execution.initial_backoff_ms, 500);
        assert_eq!(config.resources.len(), 2);
        assert_eq!(config.resources[0].resource_type, "instance");
        assert_eq!(config.resources[0].attributes["tags"], json!({"role": "frontend"}));
        assert_eq!(config.resources[1].id().to_string(), "aws.s3_bucket.assets");
    }

    #[test]
    fn test_invalid_yaml() {
        let parser = ConfigParser::new();
        let result = parser.parse_yaml("project: [", None);
        assert!(matches!(
            result,
            Err(CirrusError::Config(ConfigError::ParseError { .. }))
        ));
    }

    #[test]
    fn test_resolve_secrets_on_stack() {
        let yaml = r#"
project:
  name: db
resources:
  - provider: azurerm
    type: virtual_machine
    name: vm
    attributes:
      admin_password: "${secret:VM_PASSWORD}"
"#;
        let parser = ConfigParser::new();
        let mut config = parser.parse_yaml(yaml, None).expect("should parse");
        let source = StaticSecretSource::new().with_secret("VM_PASSWORD", "s3cr3t");

        ConfigParser::resolve_secrets(&mut config, &source).expect("should resolve");

        assert_eq!(config.resources[0].attributes["admin_password"], json!("s3cr3t"));
        assert!(config.resources[0].is_sensitive("admin_password"));
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let nested = temp_dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("create nested");
        std::fs::write(temp_dir.path().join("cirrus.yaml"), "project: {name: x}\n")
            .expect("write config");

        let found = find_config_file(&nested).expect("should find config");
        assert_eq!(found, temp_dir.path().join("cirrus.yaml"));
    }

    #[test]
    fn test_load_file_missing() {
        let parser = ConfigParser::new();
        let result = parser.load_file("/nonexistent/cirrus.yaml");
        assert!(matches!(
            result,
            Err(CirrusError::Config(ConfigError::FileNotFound { .. }))
        ));
    }
}
