//! Engine wire protocol (JSON-RPC 2.0 dialect).
//!
//! Requests carry the target object's handle next to the method:
//! ```json
//! {"jsonrpc": "2.0", "id": 7, "method": "GetLayout", "handle": 3, "params": []}
//! ```
//! Responses echo the id with either `result` or `error`. Frames without an id
//! are notifications pushed by the engine.

use engine_broker_core::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Engine method names used by the broker.
pub mod methods {
    pub const ENGINE_VERSION: &str = "EngineVersion";
    pub const OPEN_DOC: &str = "OpenDoc";
    pub const CREATE_SESSION_OBJECT: &str = "CreateSessionObject";
    pub const DESTROY_SESSION_OBJECT: &str = "DestroySessionObject";
    pub const CREATE_BOOKMARK: &str = "CreateBookmark";
    pub const DESTROY_BOOKMARK: &str = "DestroyBookmark";
    pub const CREATE_DIMENSION: &str = "CreateDimension";
    pub const DESTROY_DIMENSION: &str = "DestroyDimension";
    pub const CREATE_MEASURE: &str = "CreateMeasure";
    pub const DESTROY_MEASURE: &str = "DestroyMeasure";
    pub const CREATE_VARIABLE: &str = "CreateVariableEx";
    pub const DESTROY_VARIABLE: &str = "DestroyVariableById";
    pub const GET_PROPERTIES: &str = "GetProperties";
    pub const GET_LAYOUT: &str = "GetLayout";
    pub const CLEAR_ALL: &str = "ClearAll";
    pub const GET_FIELD: &str = "GetField";
    pub const SELECT_VALUES: &str = "SelectValues";
    pub const GET_VARIABLE_BY_NAME: &str = "GetVariableByName";
    pub const SET_STRING_VALUE: &str = "SetStringValue";
}

/// Outbound call frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub handle: i64,
    pub params: Value,
}

impl Request {
    #[must_use]
    pub fn new(id: u64, method: impl Into<String>, handle: i64, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            handle,
            params,
        }
    }
}

/// Error payload of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFault {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
}

/// Response to a call, matched by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteFault>,
}

impl Response {
    #[must_use]
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RemoteFault {
                code,
                message: message.into(),
                parameter: None,
            }),
        }
    }

    /// Convert into the caller-facing result.
    ///
    /// # Errors
    /// Returns `EngineError::Remote` for error frames.
    pub fn into_result(self) -> Result<Value, EngineError> {
        match self.error {
            Some(fault) => {
                let message = match fault.parameter {
                    Some(p) if !p.is_empty() => format!("{} ({p})", fault.message),
                    _ => fault.message,
                };
                Err(EngineError::Remote {
                    code: fault.code,
                    message,
                })
            }
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Unsolicited engine message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Any inbound frame.
///
/// Frames with an `id` are responses; the rest are notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
    Response(Response),
    Notification(Notification),
}

impl Inbound {
    /// Parse a text frame.
    ///
    /// # Errors
    /// Returns `EngineError::Protocol` if the frame is neither shape.
    pub fn parse(text: &str) -> Result<Self, EngineError> {
        serde_json::from_str(text).map_err(|e| EngineError::Protocol(format!("{e}: {text}")))
    }
}

/// Handle number of the object a call returned (`result.qReturn.qHandle`).
#[must_use]
pub fn returned_handle(result: &Value) -> Option<i64> {
    result
        .pointer("/qReturn/qHandle")
        .and_then(Value::as_i64)
}

/// Generic id of the object a call returned (`result.qReturn.qGenericId`).
#[must_use]
pub fn returned_generic_id(result: &Value) -> Option<&str> {
    result
        .pointer("/qReturn/qGenericId")
        .and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_format() {
        let request = Request::new(4, "OpenDoc", -1, json!(["D1"]));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": 4, "method": "OpenDoc", "handle": -1, "params": ["D1"]})
        );
    }

    #[test]
    fn test_inbound_response_vs_notification() {
        let response = Inbound::parse(r#"{"jsonrpc":"2.0","id":3,"result":{"qReturn":{"qHandle":1}},"change":[1]}"#)
            .unwrap();
        assert!(matches!(response, Inbound::Response(Response { id: 3, .. })));

        let note = Inbound::parse(r#"{"jsonrpc":"2.0","method":"OnConnected","params":{"qSessionState":"SESSION_CREATED"}}"#)
            .unwrap();
        match note {
            Inbound::Notification(n) => assert_eq!(n.method, "OnConnected"),
            Inbound::Response(_) => panic!("Expected notification"),
        }

        assert!(Inbound::parse(r#"{"change":[1,2]}"#).is_err());
        assert!(Inbound::parse("not json").is_err());
    }

    #[test]
    fn test_error_frame_becomes_remote_error() {
        let frame = r#"{"id":9,"error":{"code":-32602,"parameter":"qFieldName","message":"Invalid params"}}"#;
        let Inbound::Response(response) = Inbound::parse(frame).unwrap() else {
            panic!("Expected response");
        };
        match response.into_result() {
            Err(EngineError::Remote { code, message }) => {
                assert_eq!(code, -32602);
                assert_eq!(message, "Invalid params (qFieldName)");
            }
            other => panic!("Expected remote error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_result_is_null() {
        let response = Response {
            id: 1,
            result: None,
            error: None,
        };
        assert_eq!(response.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn test_returned_handle() {
        let result = json!({"qReturn": {"qType": "GenericObject", "qHandle": 5, "qGenericId": "abc"}});
        assert_eq!(returned_handle(&result), Some(5));
        assert_eq!(returned_generic_id(&result), Some("abc"));
        assert_eq!(returned_handle(&json!({})), None);
    }
}
