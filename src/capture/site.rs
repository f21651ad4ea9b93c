//! Tracked Site Matching
//!
//! Decides which tabs are on the tracked site, which intercepted requests
//! are comment list calls, and what subject a page URL shows.

use glob::Pattern;
use regex::Regex;
use url::Url;

use crate::config::CaptureSection;

/// Compiled URL rules for the tracked site
#[derive(Debug, Clone)]
pub struct SiteMatcher {
    tracked_host: String,
    api_pattern: String,
    api_glob: Pattern,
    subject_regex: Option<Regex>,
}

impl SiteMatcher {
    pub fn new(
        tracked_host: impl Into<String>,
        api_pattern: impl Into<String>,
        subject_pattern: Option<&str>,
    ) -> Result<Self, SiteError> {
        let api_pattern = api_pattern.into();
        let api_glob = Pattern::new(&api_pattern)
            .map_err(|e| SiteError::InvalidApiPattern(format!("{}: {}", api_pattern, e)))?;
        let subject_regex = subject_pattern
            .map(Regex::new)
            .transpose()
            .map_err(|e| SiteError::InvalidSubjectPattern(e.to_string()))?;

        Ok(Self {
            tracked_host: tracked_host.into().trim_start_matches('.').to_ascii_lowercase(),
            api_pattern,
            api_glob,
            subject_regex,
        })
    }

    pub fn from_config(config: &CaptureSection) -> Result<Self, SiteError> {
        Self::new(
            config.tracked_host.clone(),
            config.api_pattern.clone(),
            config.subject_pattern.as_deref(),
        )
    }

    /// Interception pattern handed to the host
    pub fn api_pattern(&self) -> &str {
        &self.api_pattern
    }

    /// True when `url` is on the tracked host or one of its subdomains
    pub fn is_tracked(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        match parsed.host_str() {
            Some(host) => {
                let host = host.to_ascii_lowercase();
                host == self.tracked_host || host.ends_with(&format!(".{}", self.tracked_host))
            }
            None => false,
        }
    }

    /// True when an intercepted request URL is a comment list call
    pub fn matches_api(&self, url: &str) -> bool {
        self.api_glob.matches(url)
    }

    /// Identity of the content shown at `url`.
    ///
    /// With a subject pattern the first match within the path is the key, so
    /// query strings and trailing path segments do not count as a new
    /// subject. Without one, or when it does not match, the whole path is
    /// used.
    pub fn subject_key(&self, url: &str) -> String {
        let path = match Url::parse(url) {
            Ok(parsed) => parsed.path().to_string(),
            Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
        };

        if let Some(re) = &self.subject_regex {
            if let Some(found) = re.find(&path) {
                return found.as_str().to_string();
            }
        }
        path
    }
}

/// Invalid site rules in configuration
#[derive(Debug, thiserror::Error)]
pub enum SiteError {
    #[error("Invalid API pattern: {0}")]
    InvalidApiPattern(String),

    #[error("Invalid subject pattern: {0}")]
    InvalidSubjectPattern(String),
}
