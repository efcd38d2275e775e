//! Configuration file loading for the Flashmark CLI.
//!
//! The configuration is a JSON object with the fields of [`SyncConfig`]; any
//! field may be left out.

use anyhow::{Context, Result};
use flashmark_core::SyncConfig;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Returns the path to the configuration file.
///
/// - macOS / Linux: `~/.config/flashmark/config.json`
/// - Windows: `%APPDATA%/Flashmark/config.json`
pub fn config_file_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("Flashmark").join("config.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".config").join("flashmark").join("config.json")
    }
}

/// Returns the collection used when neither the command line nor the
/// configuration names one: `<data dir>/flashmark/collection.db`.
pub fn default_collection_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local")
                .join("share")
        })
        .join("flashmark")
        .join("collection.db")
}

/// Loads the configuration from `path`; returns defaults if the file is missing.
///
/// # Errors
///
/// Fails if the file exists but cannot be read or is not valid JSON.
pub fn load_config(path: &Path) -> Result<SyncConfig> {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content)
            .with_context(|| format!("invalid configuration in {}", path.display())),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            log::debug!("no configuration at {}, using defaults", path.display());
            Ok(SyncConfig::default())
        }
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flashmark_core::TagPolicy;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"defaultModel": "Basic", "tagPolicy": "additive"}"#).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.default_model.as_deref(), Some("Basic"));
        assert_eq!(config.tag_policy, TagPolicy::Additive);
        assert_eq!(config.default_deck, "Default");
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("invalid configuration"));
    }

    #[test]
    fn test_config_path_ends_with_file_name() {
        assert!(config_file_path().ends_with("config.json"));
        assert!(default_collection_path().ends_with("flashmark/collection.db"));
    }
}
