//! Tool enablement file: `{ "enabledTools": ["pg_manage_functions", ...] }`.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolsConfig {
    #[serde(default)]
    pub enabled_tools: Option<Vec<String>>,
}

impl ToolsConfig {
    /// Parses the file contents. A missing `enabledTools` key means "no allow-list".
    pub fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(contents).map_err(|e| ConfigError::ToolsFile {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Loads the allow-list; any failure is a warning and yields `None` (all tools enabled).
    pub fn load(path: &Path) -> Option<Vec<String>> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(
                    "Cannot read tools config {}: {}. All tools enabled.",
                    path.display(),
                    e
                );
                return None;
            }
        };

        match Self::parse(path, &contents) {
            Ok(config) => {
                if let Some(tools) = &config.enabled_tools {
                    info!("Loaded tools config with {} enabled tools", tools.len());
                }
                config.enabled_tools
            }
            Err(e) => {
                warn!("{}. All tools enabled.", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_allow_list() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"enabledTools":["pg_manage_functions"]}}"#).unwrap();

        let tools = ToolsConfig::load(file.path()).unwrap();
        assert_eq!(tools, vec!["pg_manage_functions".to_string()]);
    }

    #[test]
    fn test_malformed_file_enables_everything() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();

        assert!(ToolsConfig::load(file.path()).is_none());
    }

    #[test]
    fn test_missing_file_enables_everything() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ToolsConfig::load(&dir.path().join("absent.json")).is_none());
    }

    #[test]
    fn test_wrong_shape_is_rejected() {
        let err = ToolsConfig::parse(Path::new("x.json"), r#"{"enabledTools":"all"}"#);
        assert!(err.is_err());
    }
}
