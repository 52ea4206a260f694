/// Stratum wire types: newline-delimited JSON-RPC 2.0.
///
/// Requests carry an `id` and a `method`; responses echo the `id` and carry
/// `result`/`error`; notifications are requests with a null `id`. Errors are
/// encoded the way stratum miners expect: `[code, message, null]`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::StratumErrorCode;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StratumRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,

    #[serde(default)]
    pub id: Value,

    pub method: String,

    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StratumResponse {
    pub id: Value,

    pub result: Value,

    pub error: Value,
}

impl StratumResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result,
            error: Value::Null,
        }
    }

    pub fn err(id: Value, code: StratumErrorCode, message: &str) -> Self {
        Self {
            id,
            result: Value::Null,
            error: json!([code.code(), message, Value::Null]),
        }
    }
}

/// Server-to-client notification (no id).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StratumNotification {
    pub id: Value,

    pub method: String,

    pub params: Value,
}

impl StratumNotification {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            id: Value::Null,
            method: method.to_string(),
            params,
        }
    }
}

/// Methods the core routes structurally.
pub mod methods {
    pub const SUBSCRIBE: &str = "mining.subscribe";
    pub const AUTHORIZE: &str = "mining.authorize";
    pub const SUBMIT: &str = "mining.submit";
    pub const EXTRANONCE_SUBSCRIBE: &str = "mining.extranonce.subscribe";

    pub const SET_DIFFICULTY: &str = "mining.set_difficulty";
    pub const SET_TARGET: &str = "mining.set_target";
    pub const NOTIFY: &str = "mining.notify";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let req = StratumRequest {
            jsonrpc: None,
            id: json!(1),
            method: "mining.subscribe".to_string(),
            params: json!(["cgminer/4.9"]),
        };
        let line = serde_json::to_string(&req).unwrap();
        let back: StratumRequest = serde_json::from_str(&line).unwrap();
        assert_eq!(req, back);
    }

    #[test]
    fn response_roundtrip() {
        let resp = StratumResponse::ok(json!(7), json!(true));
        let line = serde_json::to_string(&resp).unwrap();
        let back: StratumResponse = serde_json::from_str(&line).unwrap();
        assert_eq!(resp, back);
    }

    #[test]
    fn notification_roundtrip() {
        let n = StratumNotification::new(methods::SET_DIFFICULTY, json!([16.0]));
        let line = serde_json::to_string(&n).unwrap();
        let back: StratumNotification = serde_json::from_str(&line).unwrap();
        assert_eq!(n, back);
    }

    #[test]
    fn error_shape_is_code_message_null() {
        let resp = StratumResponse::err(json!(3), StratumErrorCode::JobNotFound, "job not found");
        let line = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            line,
            r#"{"id":3,"result":null,"error":[21,"job not found",null]}"#
        );
    }

    #[test]
    fn request_without_id_parses_as_null_id() {
        let req: StratumRequest =
            serde_json::from_str(r#"{"method":"mining.ping","params":[]}"#).unwrap();
        assert_eq!(req.id, Value::Null);
    }
}
