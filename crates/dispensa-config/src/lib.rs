//! Case catalog and service settings for dispensad
//!
//! One TOML file holds a versioned `[service]` table (socket, data dir,
//! recovery budget, scheduler poll, loss policy) and the `[[cases]]`
//! catalog. Every problem found is reported, not just the first.

mod catalog;
mod schema;
mod validation;

pub use catalog::*;
pub use schema::*;
pub use validation::*;

use std::path::Path;
use thiserror::Error;

/// Why a catalog could not be loaded
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read catalog file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Catalog is not valid TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Catalog has {} problem(s): {errors:?}", .errors.len())]
    ValidationFailed { errors: Vec<ValidationError> },

    #[error("config_version {0} is not supported")]
    UnsupportedVersion(u32),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Current supported config version
pub const CURRENT_CONFIG_VERSION: u32 = 1;

/// Load and validate configuration from a TOML file
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<Catalog> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let catalog = parse_config(&content)?;

    tracing::debug!(
        path = %path.display(),
        case_count = catalog.cases.len(),
        "Configuration parsed"
    );

    Ok(catalog)
}

/// Parse and validate configuration from a TOML string
pub fn parse_config(content: &str) -> ConfigResult<Catalog> {
    let raw: RawConfig = toml::from_str(content)?;

    if raw.config_version != CURRENT_CONFIG_VERSION {
        return Err(ConfigError::UnsupportedVersion(raw.config_version));
    }

    let errors = validate_config(&raw);
    if !errors.is_empty() {
        return Err(ConfigError::ValidationFailed { errors });
    }

    Ok(Catalog::from_raw(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_minimal_config() {
        let config = r#"
            config_version = 1

            [[cases]]
            id = "otc-advice"
            label = "OTC advice"
            duration_seconds = 120
        "#;

        let catalog = parse_config(config).unwrap();
        assert_eq!(catalog.cases.len(), 1);
        assert_eq!(catalog.cases[0].id.as_str(), "otc-advice");
        assert!(catalog.cases[0].dispense.is_empty());
    }

    #[test]
    fn reject_wrong_version() {
        let config = r#"
            config_version = 99
        "#;

        let result = parse_config(config);
        assert!(matches!(result, Err(ConfigError::UnsupportedVersion(99))));
    }

    #[test]
    fn reject_invalid_case() {
        let config = r#"
            config_version = 1

            [[cases]]
            id = "broken"
            label = "Broken"
            duration_seconds = 0
        "#;

        let result = parse_config(config);
        assert!(matches!(result, Err(ConfigError::ValidationFailed { errors }) if errors.len() == 1));
    }

    #[test]
    fn example_config_is_valid() {
        let catalog = parse_config(include_str!("../../../config.example.toml")).unwrap();
        assert_eq!(catalog.cases.len(), 2);
        assert_eq!(catalog.service.max_recovery_tokens, 50);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "config_version = 1\n[[cases]]\nid = \"a\"\nlabel = \"A\"\nduration_seconds = 60"
        )
        .unwrap();

        let catalog = load_config(file.path()).unwrap();
        assert_eq!(catalog.cases[0].duration_budget.as_secs(), 60);
    }
}
