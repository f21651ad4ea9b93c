//! Response Decoder
//!
//! Turns an intercepted response body into the comments it carries.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::debug;
use serde_json::Value;

use super::error::CaptureResult;
use super::types::{Comment, ResponseBody};

/// Field of the comment list API response that holds the page of comments
pub const COMMENTS_FIELD: &str = "comments";

/// Decode a response body into comments.
///
/// Base64 bodies are decoded and read as UTF-8 before JSON parsing. A body
/// that parses but is not an object with a `comments` array yields an empty
/// list; only unparseable input is an error. Elements without a usable `cid`
/// are dropped.
pub fn decode_comments(response: &ResponseBody) -> CaptureResult<Vec<Comment>> {
    let text = if response.base64_encoded {
        let bytes = STANDARD.decode(response.body.trim())?;
        String::from_utf8(bytes)?
    } else {
        response.body.clone()
    };

    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let payload: Value = serde_json::from_str(&text)?;
    Ok(extract_comments(payload))
}

fn extract_comments(payload: Value) -> Vec<Comment> {
    let items = match payload {
        Value::Object(mut map) => match map.remove(COMMENTS_FIELD) {
            Some(Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<Comment>(item) {
            Ok(comment) => Some(comment),
            Err(e) => {
                debug!("Skipping malformed comment entry: {}", e);
                None
            }
        })
        .collect()
}
