//! Configuration
//!
//! Read from a TOML file; every field has a default so an empty or missing
//! file yields a working setup for the default site.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Directory name under the platform config dir
pub const CONFIG_DIR_NAME: &str = "commentcap";
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub capture: CaptureSection,
    pub browser: BrowserSection,
    pub web: WebSection,
    pub scroll: ScrollSection,
}

/// Which site is tracked and which of its requests carry comments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    pub tracked_host: String,
    /// Glob handed to the browser as the interception filter
    pub api_pattern: String,
    /// Regex picking the subject out of a page path; whole path when unset
    pub subject_pattern: Option<String>,
    pub event_capacity: usize,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            tracked_host: "tiktok.com".to_string(),
            api_pattern: "*://*.tiktok.com/api/comment/list*".to_string(),
            subject_pattern: Some(r"/@[^/]+/(video|photo)/\d+".to_string()),
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    /// HTTP endpoint of the browser's remote debugging port
    pub devtools_url: String,
    pub command_timeout_ms: u64,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            devtools_url: "http://127.0.0.1:9222".to_string(),
            command_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub bind: String,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrollSection {
    pub interval_ms: u64,
    pub enabled_by_default: bool,
}

impl Default for ScrollSection {
    fn default() -> Self {
        Self {
            interval_ms: 1_500,
            enabled_by_default: false,
        }
    }
}

impl CaptureConfig {
    /// `<config_dir>/commentcap/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing default file is not an error; an explicit path must exist.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(CaptureConfig::parse("").unwrap(), CaptureConfig::default());
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config = CaptureConfig::parse(
            r#"
[capture]
tracked_host = "example.org"
subject_pattern = "/watch/\\d+"

[scroll]
enabled_by_default = true
"#,
        )
        .unwrap();

        assert_eq!(config.capture.tracked_host, "example.org");
        assert_eq!(config.capture.subject_pattern.as_deref(), Some(r"/watch/\d+"));
        assert_eq!(config.capture.api_pattern, CaptureSection::default().api_pattern);
        assert!(config.scroll.enabled_by_default);
        assert_eq!(config.scroll.interval_ms, 1_500);
        assert_eq!(config.browser.command_timeout_ms, 30_000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[web]\nbind = \"0.0.0.0:9000\"").unwrap();

        let config = CaptureConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.web.bind, "0.0.0.0:9000");
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = CaptureConfig::load(Some(&dir.path().join("nope.toml")));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_bad_toml_is_error() {
        let result = CaptureConfig::parse("[capture\ntracked_host = 1");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_default_site_rules_compile() {
        let config = CaptureConfig::default();
        assert!(crate::capture::SiteMatcher::from_config(&config.capture).is_ok());
    }
}
