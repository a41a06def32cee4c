//! Offset cursors and page decoding.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Opaque, persistable position in a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn offset(offset: usize) -> Self {
        Self(offset.to_string())
    }

    /// Offset encoded by [`Cursor::offset`]; anything else restarts at 0.
    pub fn as_offset(&self) -> usize {
        self.0.parse().unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One page of a listing and where the next one starts.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// None when this is the last page.
    pub next_cursor: Option<Cursor>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }

    pub fn is_last(&self) -> bool {
        self.next_cursor.is_none()
    }
}

/// Keys a listing response may carry its items under.
const LIST_KEYS: [&str; 5] = ["items", "data", "results", "runs", "feedback"];

/// Pull the item list out of a listing response.
///
/// Accepts a bare array or an object carrying the list under one of
/// [`LIST_KEYS`]. An object with none of those is treated as a single item.
pub fn extract_items(response: Value) -> Vec<Value> {
    match response {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            for key in LIST_KEYS {
                if let Some(Value::Array(items)) = map.remove(key) {
                    return items;
                }
            }
            if map.is_empty() {
                Vec::new()
            } else {
                vec![Value::Object(map)]
            }
        }
        _ => Vec::new(),
    }
}

/// Build the page for a response fetched at `offset` with `limit`.
pub fn page_from_response(response: Value, offset: usize, limit: usize) -> Page<Value> {
    let items = extract_items(response);
    let next_cursor = if items.is_empty() || items.len() < limit {
        None
    } else {
        Some(Cursor::offset(offset + items.len()))
    };
    Page { items, next_cursor }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_items_shapes() {
        assert_eq!(extract_items(json!([{"id": 1}, {"id": 2}])).len(), 2);
        assert_eq!(extract_items(json!({"items": [{"id": 1}]})).len(), 1);
        assert_eq!(extract_items(json!({"data": [{"id": 1}], "total": 1})).len(), 1);
        assert_eq!(extract_items(json!({"results": []})).len(), 0);
        assert_eq!(
            extract_items(json!({"runs": [{"id": 1}], "cursors": {"next": null}})).len(),
            1
        );
        assert_eq!(extract_items(json!({"feedback": [{"id": 1}, {"id": 2}]})).len(), 2);
        assert_eq!(extract_items(json!({"id": "single"})).len(), 1);
        assert!(extract_items(json!({})).is_empty());
        assert!(extract_items(json!(null)).is_empty());
    }

    #[test]
    fn test_short_page_ends_listing() {
        let page = page_from_response(json!([{"id": 1}, {"id": 2}]), 0, 3);
        assert!(page.is_last());

        let page = page_from_response(json!([{"id": 1}, {"id": 2}, {"id": 3}]), 6, 3);
        assert_eq!(page.next_cursor, Some(Cursor::offset(9)));
    }

    #[test]
    fn test_cursor_offset_parsing() {
        assert_eq!(Cursor::offset(42).as_offset(), 42);
        assert_eq!(Cursor::new("garbage").as_offset(), 0);
        let json = serde_json::to_string(&Cursor::offset(7)).unwrap();
        assert_eq!(json, "\"7\"");
    }
}
