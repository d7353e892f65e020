//! Configuration loading from disk.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::schema::{BackendConfig, ProxyConfig};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Values given on the command line that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind_address: Option<String>,
    /// Comma-separated backend addresses; replaces the configured list.
    pub backends: Option<String>,
}

impl Overrides {
    pub fn apply(&self, config: &mut ProxyConfig) {
        if let Some(bind) = &self.bind_address {
            config.listener.bind_address = bind.clone();
        }
        if let Some(list) = &self.backends {
            config.backends = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(BackendConfig::new)
                .collect();
        }
    }
}

/// Parse a configuration document without validating it.
pub fn parse_config(content: &str) -> Result<ProxyConfig, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    load_with_overrides(Some(path), &Overrides::default())
}

/// Load an optional config file, apply CLI overrides, then validate.
pub fn load_with_overrides(
    path: Option<&Path>,
    overrides: &Overrides,
) -> Result<ProxyConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            parse_config(&content)?
        }
        None => ProxyConfig::default(),
    };

    overrides.apply(&mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;

    tracing::debug!(
        backends = config.backends.len(),
        bind = %config.listener.bind_address,
        "Configuration loaded"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_file_values() {
        let mut config = parse_config(
            r#"
            [[backends]]
            address = "127.0.0.1:1"
            "#,
        )
        .unwrap();

        Overrides {
            bind_address: Some("127.0.0.1:7000".into()),
            backends: Some("http://127.0.0.1:3001, http://127.0.0.1:3002,".into()),
        }
        .apply(&mut config);

        assert_eq!(config.listener.bind_address, "127.0.0.1:7000");
        let addresses: Vec<_> = config.backends.iter().map(|b| b.address.as_str()).collect();
        assert_eq!(addresses, ["http://127.0.0.1:3001", "http://127.0.0.1:3002"]);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/proxy.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn no_backends_fails_validation() {
        let err = load_with_overrides(None, &Overrides::default()).unwrap_err();
        match err {
            ConfigError::Validation(errors) => assert!(!errors.is_empty()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn bad_toml_is_parse_error() {
        assert!(matches!(parse_config("backends = 3"), Err(ConfigError::Parse(_))));
    }
}
