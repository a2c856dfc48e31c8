//! Tunables for key management.
//!
//! Limits that define the on-disk format (key length, passphrase bounds)
//! and the interactive retry bound are constants, not configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::KeyError;

/// PBKDF2 iterations used when a passphrase root does not specify any.
pub const DEFAULT_PBKDF2_ITERATIONS: u64 = 350_000;

/// Smallest iteration count a caller may request.
pub const MIN_PBKDF2_ITERATIONS: u64 = 100_000;

/// Extra attempts offered after an incorrect interactively entered key.
pub const MAX_KEY_PROMPT_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Iterations stored on new passphrase roots without `pbkdf2iters`.
    pub default_pbkdf2_iterations: u64,
    /// Lower bound for a requested `pbkdf2iters`.
    pub min_pbkdf2_iterations: u64,
    /// Append audit records as JSON lines to this file.
    pub audit_log: Option<PathBuf>,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            default_pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
            min_pbkdf2_iterations: MIN_PBKDF2_ITERATIONS,
            audit_log: None,
        }
    }
}

impl KeyConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, KeyError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| KeyError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, KeyError> {
        let config: Self = serde_json::from_str(text).map_err(|e| KeyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), KeyError> {
        if self.min_pbkdf2_iterations == 0 {
            return Err(KeyError::Config("min_pbkdf2_iterations must be non-zero".into()));
        }
        if self.default_pbkdf2_iterations < self.min_pbkdf2_iterations {
            return Err(KeyError::Config(
                "default_pbkdf2_iterations is below min_pbkdf2_iterations".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        assert_eq!(
            KeyConfig::from_json_str("{}").unwrap(),
            KeyConfig::default()
        );
    }

    #[test]
    fn partial_override() {
        let config = KeyConfig::from_json_str(
            r#"{ "min_pbkdf2_iterations": 1000, "default_pbkdf2_iterations": 2000 }"#,
        )
        .unwrap();
        assert_eq!(config.min_pbkdf2_iterations, 1000);
        assert_eq!(config.default_pbkdf2_iterations, 2000);
        assert!(config.audit_log.is_none());
    }

    #[test]
    fn inconsistent_bounds_rejected() {
        assert!(KeyConfig::from_json_str(r#"{ "default_pbkdf2_iterations": 10 }"#).is_err());
        assert!(KeyConfig::from_json_str(r#"{ "min_pbkdf2_iterations": 0 }"#).is_err());
        assert!(KeyConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn reads_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::write(file.path(), r#"{ "audit_log": "/var/log/keyroot.jsonl" }"#).unwrap();
        let config = KeyConfig::from_json_file(file.path()).unwrap();
        assert_eq!(
            config.audit_log,
            Some(PathBuf::from("/var/log/keyroot.jsonl"))
        );
    }
}
