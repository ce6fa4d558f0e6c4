//! Line-delimited JSON-RPC 2.0 envelope types.
//!
//! Every message is one UTF-8 JSON object terminated by `\n`:
//!
//! ```text
//! Request:  {"jsonrpc":"2.0","id":<int|string>,"method":<string>,"params":{...}}
//! Response: {"jsonrpc":"2.0","id":<int|string>,"result":<any>}
//!        or {"jsonrpc":"2.0","id":<int|string>,"error":{"code":<int>,"message":<string>}}
//! ```
//!
//! Outgoing requests are built as [`RpcRequest`]. Incoming lines on the
//! dispatcher side go through [`parse_request`], which is deliberately
//! lenient about the `jsonrpc` field (absent is accepted) and strict about
//! everything the dispatcher needs to route the call.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::ErrorKind;

pub const JSONRPC_VERSION: &str = "2.0";

/// Caller-chosen request correlator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

/// Values above `i64::MAX` become their decimal string.
impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        match i64::try_from(n) {
            Ok(n) => RequestId::Number(n),
            Err(_) => RequestId::String(n.to_string()),
        }
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{:?}", s),
        }
    }
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl RpcRequest {
    pub fn new(id: impl Into<RequestId>, method: &str, params: Map<String, Value>) -> Self {
        Self {
            jsonrpc: default_version(),
            id: id.into(),
            method: method.to_string(),
            params,
        }
    }

    /// Serialize as a single wire line (no trailing newline).
    pub fn to_line(&self) -> String {
        // Serializing plain strings and JSON values cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn kind(&self) -> Option<ErrorKind> {
        ErrorKind::from_code(self.code)
    }
}

/// Deserialize a present field as `Some`, even when its value is `null`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// `result` and `error` are mutually exclusive and one must be present.
    pub fn is_well_formed(&self) -> bool {
        self.result.is_some() != self.error.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A request line accepted by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest {
    pub id: Option<RequestId>,
    pub method: String,
    pub params: Map<String, Value>,
}

/// Why an incoming line could not be routed.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedLine {
    /// The request id, when it could be recovered from the line.
    pub id: Option<RequestId>,
    pub message: String,
}

/// Parse one dispatcher input line.
pub fn parse_request(line: &str) -> Result<IncomingRequest, RejectedLine> {
    let value: Value = serde_json::from_str(line).map_err(|e| RejectedLine {
        id: None,
        message: format!("Parse error: {}", e),
    })?;

    let Value::Object(mut obj) = value else {
        return Err(RejectedLine {
            id: None,
            message: "Invalid request: expected a JSON object".to_string(),
        });
    };

    let id = match obj.remove("id") {
        None | Some(Value::Null) => None,
        Some(raw) => match serde_json::from_value::<RequestId>(raw) {
            Ok(id) => Some(id),
            Err(_) => {
                return Err(RejectedLine {
                    id: None,
                    message: "Invalid request: id must be an integer or a string".to_string(),
                })
            }
        },
    };
    let reject = |message: &str| RejectedLine {
        id: id.clone(),
        message: message.to_string(),
    };

    match obj.get("jsonrpc") {
        None => {}
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        Some(_) => return Err(reject("Invalid request: jsonrpc must be \"2.0\"")),
    }

    let method = match obj.remove("method") {
        Some(Value::String(m)) if !m.is_empty() => m,
        _ => return Err(reject("Invalid request: method must be a non-empty string")),
    };

    let params = match obj.remove("params") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(_) => return Err(reject("Invalid request: params must be an object")),
    };

    Ok(IncomingRequest { id, method, params })
}

/// Best-effort extraction of a request id from a raw line.
///
/// Used by the relay, which otherwise forwards bytes unparsed.
pub fn peek_id(line: &str) -> Option<RequestId> {
    let value: Value = serde_json::from_str(line).ok()?;
    serde_json::from_value(value.get("id")?.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_u64_ids_never_wrap() {
        assert_eq!(RequestId::from(42u64), RequestId::Number(42));
        assert_eq!(RequestId::from(i64::MAX as u64), RequestId::Number(i64::MAX));
        assert_eq!(
            RequestId::from(u64::MAX),
            RequestId::String("18446744073709551615".into())
        );
    }

    #[test]
    fn test_parse_minimal_request() {
        let req = parse_request(r#"{"id":1,"method":"ping","params":{}}"#).unwrap();
        assert_eq!(req.id, Some(RequestId::Number(1)));
        assert_eq!(req.method, "ping");
        assert!(req.params.is_empty());
    }

    #[test]
    fn test_parse_string_id_and_missing_params() {
        let req = parse_request(r#"{"jsonrpc":"2.0","id":"abc","method":"ping"}"#).unwrap();
        assert_eq!(req.id, Some(RequestId::String("abc".into())));
        assert!(req.params.is_empty());
    }

    #[test]
    fn test_parse_rejections_keep_id() {
        let err = parse_request(r#"{"id":5,"params":{}}"#).unwrap_err();
        assert_eq!(err.id, Some(RequestId::Number(5)));
        assert!(err.message.contains("method"));

        let err = parse_request(r#"{"id":6,"method":"ping","params":[1,2]}"#).unwrap_err();
        assert_eq!(err.id, Some(RequestId::Number(6)));

        let err = parse_request(r#"{"jsonrpc":"1.0","id":7,"method":"ping"}"#).unwrap_err();
        assert_eq!(err.id, Some(RequestId::Number(7)));
    }

    #[test]
    fn test_parse_garbage() {
        let err = parse_request("not json at all").unwrap_err();
        assert_eq!(err.id, None);
        assert!(err.message.starts_with("Parse error"));

        let err = parse_request("[1,2,3]").unwrap_err();
        assert_eq!(err.id, None);
    }

    #[test]
    fn test_error_response_has_no_result_key() {
        let resp = RpcResponse::failure(
            Some(RequestId::Number(2)),
            ErrorKind::MethodNotFound.rpc_error("Unknown method: bogus"),
        );
        let value: Value = serde_json::from_str(&resp.to_line()).unwrap();
        assert_eq!(
            value,
            json!({
                "jsonrpc": "2.0",
                "id": 2,
                "error": { "code": -32601, "message": "Unknown method: bogus" }
            })
        );
    }

    #[test]
    fn test_null_result_is_well_formed() {
        let resp: RpcResponse = serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap();
        assert_eq!(resp.result, Some(Value::Null));
        assert!(resp.is_well_formed());

        let resp: RpcResponse = serde_json::from_str(r#"{"jsonrpc":"2.0","id":1}"#).unwrap();
        assert!(!resp.is_well_formed());
    }

    #[test]
    fn test_peek_id() {
        assert_eq!(
            peek_id(r#"{"id":"x-1","method":"ping"}"#),
            Some(RequestId::String("x-1".into()))
        );
        assert_eq!(peek_id("garbage"), None);
    }
}
