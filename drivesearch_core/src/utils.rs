use rmcp::model::CallToolResult;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::error::ConnectorError;

/// Wrap a serializable payload as a structured MCP tool result.
///
/// Non-object payloads are nested under a `data` key so the structured
/// content is always a JSON object.
pub fn structured_result<T: Serialize>(data: &T) -> Result<CallToolResult, ConnectorError> {
    let value = serde_json::to_value(data).map_err(|e| ConnectorError::Other(e.to_string()))?;

    let map: JsonMap<String, JsonValue> = match value {
        JsonValue::Object(m) => m,
        other => {
            let mut m = JsonMap::new();
            m.insert("data".to_string(), other);
            m
        }
    };

    Ok(CallToolResult {
        content: Vec::new(),
        structured_content: Some(JsonValue::Object(map)),
        is_error: Some(false),
        meta: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_payload_passes_through() {
        let result = structured_result(&json!({"ok": true})).unwrap();
        assert_eq!(result.structured_content, Some(json!({"ok": true})));
        assert_eq!(result.is_error, Some(false));
    }

    #[test]
    fn scalar_payload_is_wrapped() {
        let result = structured_result(&json!(42)).unwrap();
        assert_eq!(result.structured_content, Some(json!({"data": 42})));
    }
}
