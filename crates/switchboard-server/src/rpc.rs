//! Wire envelopes for the RPC surface and typed access to request params.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use switchboard_core::ids::{ContactId, InstanceId, OwnerId};
use switchboard_engine::OrchestratorError;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub id: Option<Value>,
}

/// Response envelope: `{ id, success, result?, error?: { code, message } }`.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub id: Option<Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

/// Failures raised by the RPC layer itself. Orchestrator failures use
/// their own kind as the code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Parse,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parse => "PARSE_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::Internal => "INTERNAL_ERROR",
        }
    }
}

impl RpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Option<Value>, code: String, message: String) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(RpcError { code, message }),
        }
    }

    pub fn reject(id: Option<Value>, code: ErrorCode, message: impl fmt::Display) -> Self {
        Self::failure(id, code.as_str().to_string(), message.to_string())
    }

    /// e.g. `NOT_CONNECTED`, `FORBIDDEN`.
    pub fn from_orchestrator(id: Option<Value>, err: &OrchestratorError) -> Self {
        Self::failure(id, err.error_kind().to_ascii_uppercase(), err.to_string())
    }

    pub fn method_not_found(id: Option<Value>, method: &str) -> Self {
        Self::reject(id, ErrorCode::MethodNotFound, format_args!("Method not found: {method}"))
    }

    pub fn invalid_params(id: Option<Value>, message: impl fmt::Display) -> Self {
        Self::reject(id, ErrorCode::InvalidParams, message)
    }

    pub fn internal_error(id: Option<Value>, message: impl fmt::Display) -> Self {
        Self::reject(id, ErrorCode::Internal, message)
    }

    pub fn parse_error() -> Self {
        Self::reject(None, ErrorCode::Parse, "Parse error")
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParamError {
    #[error("Missing required parameter: {0}")]
    Missing(&'static str),

    #[error("Missing required parameter: {0} or {1}")]
    MissingEither(&'static str, &'static str),

    #[error("{0} must be {1}")]
    Invalid(&'static str, &'static str),
}

/// Who a `message.send` is addressed to. A contact id wins over an address.
#[derive(Debug, PartialEq, Eq)]
pub enum Recipient<'a> {
    Contact(ContactId),
    Address(&'a str),
}

/// Read-only view over a request's params object.
#[derive(Clone, Copy, Debug)]
pub struct Params<'a>(&'a Value);

impl<'a> Params<'a> {
    pub fn new(value: &'a Value) -> Self {
        Self(value)
    }

    pub fn str(self, key: &str) -> Option<&'a str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Present, a string, and not empty.
    pub fn require(self, key: &'static str) -> Result<&'a str, ParamError> {
        self.str(key)
            .filter(|s| !s.is_empty())
            .ok_or(ParamError::Missing(key))
    }

    pub fn owner_id(self) -> Result<OwnerId, ParamError> {
        self.require("owner_id").map(OwnerId::from_raw)
    }

    pub fn instance_id(self) -> Result<InstanceId, ParamError> {
        self.require("instance_id").map(InstanceId::from_raw)
    }

    pub fn contact_id(self) -> Option<ContactId> {
        self.str("contact_id").filter(|s| !s.is_empty()).map(ContactId::from_raw)
    }

    pub fn recipient(self) -> Result<Recipient<'a>, ParamError> {
        if let Some(contact_id) = self.contact_id() {
            return Ok(Recipient::Contact(contact_id));
        }
        self.str("address")
            .filter(|s| !s.trim().is_empty())
            .map(Recipient::Address)
            .ok_or(ParamError::MissingEither("contact_id", "address"))
    }

    /// Page size clamped to `1..=max`, or `None` when absent.
    pub fn limit(self, max: u32) -> Result<Option<u32>, ParamError> {
        match self.0.get("limit") {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_i64()
                .map(|n| Some(n.clamp(1, i64::from(max)) as u32))
                .ok_or(ParamError::Invalid("limit", "an integer")),
        }
    }
}
