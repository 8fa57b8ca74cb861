//! Ranges point into the analyzed trace.
//!
//! A range is either object-level (an entire event or sub-object is
//! relevant, `start` and `end` absent) or character-level (a substring of a
//! string node, `start < end`). After localization, a range carries the
//! dotted JSON path of its object; the serialized form is an *address* like
//! `messages.2.tool_calls.0.function.name:0-3`.

use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A pointer to an object or character span within the input trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    /// Identity of the referenced node. Absent for ranges deserialized
    /// from addresses.
    pub object_id: Option<NodeId>,
    pub start: Option<usize>,
    pub end: Option<usize>,
    /// Dotted JSON path, filled in by `Trace::locate`.
    pub json_path: Option<String>,
}

impl Range {
    /// Character-level range within the string node `object_id`.
    pub fn chars(object_id: NodeId, start: usize, end: usize) -> Self {
        Self {
            object_id: Some(object_id),
            start: Some(start),
            end: Some(end),
            json_path: None,
        }
    }

    /// Object-level range for the node `object_id`.
    pub fn object(object_id: NodeId) -> Self {
        Self {
            object_id: Some(object_id),
            start: None,
            end: None,
            json_path: None,
        }
    }

    /// Serializes this range as a stable address string.
    pub fn to_address(&self) -> String {
        let mut path = String::from("messages");
        if let Some(json_path) = &self.json_path {
            path.push('.');
            path.push_str(json_path);
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if !path.contains(':') {
                path.push_str(&format!(":{}-{}", start, end));
            }
        }
        path
    }

    /// Parses an address string back into a range. The object identity is
    /// not recoverable from an address.
    pub fn from_address(address: &str) -> Self {
        let (path_part, start, end) = match address.split_once(':') {
            Some((path, span)) => match span.split_once('-') {
                Some((s, e)) => (path, s.parse().ok(), e.parse().ok()),
                None => (path, None, None),
            },
            None => (address, None, None),
        };

        let json_path = path_part
            .strip_prefix("messages.")
            .map(|p| p.to_string())
            .or_else(|| {
                if path_part == "messages" {
                    None
                } else {
                    Some(path_part.to_string())
                }
            });

        Self {
            object_id: None,
            start,
            end,
            json_path,
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_level_address() {
        let mut r = Range::object(NodeId(3));
        r.json_path = Some("2".to_string());
        assert_eq!(r.to_address(), "messages.2");
    }

    #[test]
    fn character_level_address() {
        let mut r = Range::chars(NodeId(4), 7, 8);
        r.json_path = Some("0.content".to_string());
        assert_eq!(r.to_address(), "messages.0.content:7-8");
    }

    #[test]
    fn address_round_trip() {
        let mut r = Range::chars(NodeId(4), 7, 8);
        r.json_path = Some("1.tool_calls.0.function.name".to_string());
        let back = Range::from_address(&r.to_address());
        assert_eq!(back.json_path, r.json_path);
        assert_eq!(back.start, r.start);
        assert_eq!(back.end, r.end);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn addresses_round_trip(
                segments in proptest::collection::vec("[a-z0-9_]{1,10}", 1..5),
                span in proptest::option::of((0usize..1000, 1usize..100)),
            ) {
                let range = Range {
                    object_id: Some(NodeId(1)),
                    start: span.map(|(s, _)| s),
                    end: span.map(|(s, l)| s + l),
                    json_path: Some(segments.join(".")),
                };
                let back = Range::from_address(&range.to_address());
                prop_assert_eq!(back.json_path, range.json_path);
                prop_assert_eq!(back.start, range.start);
                prop_assert_eq!(back.end, range.end);
            }
        }
    }
}
