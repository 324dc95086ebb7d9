//! Serialization policy threaded through the bus and effect runners
//!
//! There is deliberately no process-wide configuration: the options value is
//! constructed once and handed to every component that renders JSON.

use serde::Serialize;

/// JSON rendering policy for parameters, step payloads and snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonOptions {
    /// Render multi-line, indented JSON instead of the compact form
    pub pretty: bool,
}

impl Default for JsonOptions {
    fn default() -> Self {
        Self { pretty: false }
    }
}

impl JsonOptions {
    pub fn pretty() -> Self {
        Self { pretty: true }
    }

    /// Serialize a value into a JSON tree.
    pub fn to_value<T: Serialize>(&self, value: &T) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(value)
    }

    /// Render a value as a string under this policy.
    pub fn render<T: Serialize>(&self, value: &T) -> String {
        let rendered = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };
        rendered.unwrap_or_else(|e| format!("<unserializable: {e}>"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compact_by_default() {
        let options = JsonOptions::default();
        assert_eq!(options.render(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[test]
    fn pretty_renders_indented() {
        let options = JsonOptions::pretty();
        assert!(options.render(&json!({"a": 1})).contains('\n'));
    }

    #[test]
    fn round_trip_preserves_value() {
        let options = JsonOptions::default();
        let original = json!({"nested": {"n": 42}, "list": [1, 2, 3]});
        let tree = options.to_value(&original).unwrap();
        assert_eq!(tree, original);
    }
}
