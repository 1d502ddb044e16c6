//! Responses the transport manufactures on behalf of a peer that never answered.

use std::time::Duration;

use serde_json::{json, Value};

use crate::message::{Message, RequestId, RpcError};

/// JSON-RPC error code of a synthesized timeout.
pub const TIMEOUT_ERROR_CODE: i64 = -32000;

/// Error message of a synthesized timeout.
pub const TIMEOUT_MESSAGE: &str =
    "Request timeout - server may have navigated or become unresponsive";

/// Text content of a synthesized interrupt result.
pub const INTERRUPTED_TEXT: &str = "Tool execution interrupted by page navigation";

/// Error response delivered when a request got no answer within `timeout`.
pub fn timeout_response(id: RequestId, timeout: Duration, original_method: Option<&str>) -> Message {
    let mut data = serde_json::Map::new();
    data.insert("timeoutMs".to_string(), json!(timeout.as_millis() as u64));
    if let Some(method) = original_method {
        data.insert("originalMethod".to_string(), json!(method));
    }

    Message::error(
        id,
        RpcError {
            code: TIMEOUT_ERROR_CODE,
            message: TIMEOUT_MESSAGE.to_string(),
            data: Some(Value::Object(data)),
        },
    )
}

/// Result response delivered when the serving page unloads mid-request.
pub fn interrupted_response(id: RequestId, original_method: &str, timestamp_ms: u64) -> Message {
    Message::result(
        id,
        json!({
            "content": [{"type": "text", "text": INTERRUPTED_TEXT}],
            "metadata": {
                "navigationInterrupted": true,
                "originalMethod": original_method,
                "timestamp": timestamp_ms,
            }
        }),
    )
}
