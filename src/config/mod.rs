//! Configuration module for the Cirrus engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `cirrus.yaml`
//! - Secret interpolation and environment overrides
//! - Validation of configuration values
//! - Computing hashes and record fingerprints

mod hash;
mod parser;
mod secrets;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use secrets::{EnvSecretSource, SecretSource, StaticSecretSource, resolve_spec_secrets};
pub use spec::{
    Attributes, ExecutionConfig, ProjectConfig, ResourceId, ResourceSpec, SandboxConfig,
    StackConfig, StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationIssue, ValidationResult};
