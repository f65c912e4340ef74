//! JSON-RPC 2.0 request validation and response building.

use serde_json::{json, Value};

/// The request is not a valid JSON-RPC 2.0 request object.
pub const INVALID_REQUEST: i64 = -32600;
/// The requested method does not exist.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// The method exists but the parameters are unusable.
pub const INVALID_PARAMS: i64 = -32602;
/// Method-level failure (image not loadable, engine gone, ...).
pub const CALL_FAILED: i64 = -1;

/// Error half of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    #[must_use]
    pub fn invalid_request() -> Self {
        Self {
            code: INVALID_REQUEST,
            message: "Invalid Request".to_string(),
        }
    }

    #[must_use]
    pub fn method_not_found() -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: "Method not found".to_string(),
        }
    }

    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn call_failed(message: impl Into<String>) -> Self {
        Self {
            code: CALL_FAILED,
            message: message.into(),
        }
    }
}

/// A validated request.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub method: String,
    pub params: Value,
    pub id: Value,
}

/// Validates a decoded message as a JSON-RPC 2.0 request.
///
/// `jsonrpc`, `method` and `params` are all required; `id` is optional
/// and echoed back as `null` when absent.
///
/// # Errors
///
/// Returns the error to send plus whatever id could be salvaged from the
/// message, so the reply still correlates where possible.
pub fn parse_request(message: Value) -> Result<RpcRequest, (RpcError, Value)> {
    let Value::Object(object) = message else {
        return Err((RpcError::invalid_request(), Value::Null));
    };

    let id = object.get("id").cloned().unwrap_or(Value::Null);

    let version_ok = object.get("jsonrpc").and_then(Value::as_str) == Some("2.0");
    let method = object.get("method").and_then(Value::as_str);
    let params = object.get("params");

    match (version_ok, method, params) {
        (true, Some(method), Some(params)) => Ok(RpcRequest {
            method: method.to_string(),
            params: params.clone(),
            id,
        }),
        _ => Err((RpcError::invalid_request(), id)),
    }
}

/// Builds a success response mirroring the request id.
#[must_use]
pub fn ok_response(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Builds an error response mirroring the request id.
#[must_use]
pub fn error_response(id: &Value, error: &RpcError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": error.code, "message": error.message },
    })
}

/// Builds a server-initiated notification.
#[must_use]
pub fn notification(method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "method": method, "params": params })
}
