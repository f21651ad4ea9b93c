//! Capture Types
//!
//! Shared data types for the capture subsystem: tab identity, comment
//! records, and the lifecycle/interception events the host feeds in.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Browser tab identifier.
///
/// Stable for the lifetime of a tab but may be handed out again by the host
/// once the tab is gone, so it never identifies a session on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub u64);

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A captured comment.
///
/// Only `cid` and `text` are interpreted; every other field of the payload
/// object is kept in `extra` and written back out unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    /// Unique comment id
    #[serde(deserialize_with = "deserialize_cid")]
    pub cid: String,
    /// Display text
    #[serde(default, deserialize_with = "deserialize_text")]
    pub text: String,
    /// Opaque passthrough fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Comment {
    pub fn new(cid: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            cid: cid.into(),
            text: text.into(),
            extra: Map::new(),
        }
    }
}

/// Comment ids arrive as strings from the site but numeric ids are accepted too.
fn deserialize_cid<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if !s.is_empty() => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid cid: {}", other))),
    }
}

fn deserialize_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Loading status reported by the host for a tab
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabStatus {
    Loading,
    Complete,
}

/// Current properties of a tab
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    pub id: Option<TabId>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub status: Option<TabStatus>,
}

/// Which properties changed in a tab-updated event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeInfo {
    pub url: Option<String>,
    pub status: Option<TabStatus>,
    pub title: Option<String>,
}

/// Tab lifecycle triggers consumed by the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Tab navigated or one of its properties changed
    TabUpdated {
        tab_id: TabId,
        change: ChangeInfo,
        tab: TabInfo,
    },
    /// Tab was brought to the foreground
    TabActivated { tab_id: TabId },
    /// Tab was closed
    TabRemoved { tab_id: TabId },
    /// Page changed what it shows without a full navigation
    SubjectChanged { tab_id: TabId, url: String },
}

impl LifecycleEvent {
    pub fn tab_id(&self) -> TabId {
        match self {
            Self::TabUpdated { tab_id, .. } => *tab_id,
            Self::TabActivated { tab_id } => *tab_id,
            Self::TabRemoved { tab_id } => *tab_id,
            Self::SubjectChanged { tab_id, .. } => *tab_id,
        }
    }
}

/// Response body as returned by the host for an intercepted exchange
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    pub body: String,
    pub base64_encoded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comment_passthrough() {
        let raw = r#"{"cid":"7301","text":"hello","digg_count":4,"user":{"nickname":"x"}}"#;
        let comment: Comment = serde_json::from_str(raw).unwrap();
        assert_eq!(comment.cid, "7301");
        assert_eq!(comment.text, "hello");
        assert_eq!(comment.extra["digg_count"], 4);

        let back: Value = serde_json::to_value(&comment).unwrap();
        let original: Value = serde_json::from_str(raw).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn test_numeric_cid_and_null_text() {
        let comment: Comment = serde_json::from_str(r#"{"cid":42,"text":null}"#).unwrap();
        assert_eq!(comment.cid, "42");
        assert_eq!(comment.text, "");
    }

    #[test]
    fn test_missing_cid_rejected() {
        assert!(serde_json::from_str::<Comment>(r#"{"text":"no id"}"#).is_err());
        assert!(serde_json::from_str::<Comment>(r#"{"cid":"","text":"empty id"}"#).is_err());
    }
}
