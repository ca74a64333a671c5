use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One line of the wire protocol: a standalone JSON object carrying an
/// optional id, an optional method (present on requests and notifications),
/// optional params, and at most one of `result`/`error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// What a received message turns out to be once classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Notify,
    Reply,
    Error,
    /// Has neither a method nor a result/error body -- a protocol violation.
    Malformed,
}

impl JsonRpcMessage {
    pub fn request(id: Value, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self { id: Some(id), method: Some(method.into()), params: Some(params), result: None, error: None }
    }

    pub fn notify(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self { id: None, method: Some(method.into()), params: Some(params), result: None, error: None }
    }

    pub fn reply(id: Value, result: Value) -> Self {
        Self { id: Some(id), method: None, params: None, result: Some(result), error: None }
    }

    pub fn error_reply(id: Option<Value>, error: impl Into<String>) -> Self {
        Self { id, method: None, params: None, result: None, error: Some(Value::String(error.into())) }
    }

    pub fn kind(&self) -> MessageKind {
        match (&self.method, &self.result, &self.error) {
            (Some(_), _, _) if self.id.is_some() => MessageKind::Request,
            (Some(_), _, _) => MessageKind::Notify,
            (None, Some(_), None) => MessageKind::Reply,
            (None, _, Some(_)) => MessageKind::Error,
            _ => MessageKind::Malformed,
        }
    }

    pub fn params_or_empty(&self) -> &[Value] {
        self.params.as_deref().unwrap_or(&[])
    }
}

pub mod methods {
    pub const TRANSACT: &str = "transact";
    pub const MONITOR: &str = "monitor";
    pub const MONITOR_CANCEL: &str = "monitor_cancel";
    pub const GET_SCHEMA: &str = "get_schema";
    pub const LIST_DBS: &str = "list_dbs";
    pub const LOCK: &str = "lock";
    pub const STEAL: &str = "steal";
    pub const UNLOCK: &str = "unlock";
    pub const ECHO: &str = "echo";
    pub const CANCEL: &str = "cancel";
    pub const UPDATE: &str = "update";
    pub const LOCKED: &str = "locked";
    pub const STOLEN: &str = "stolen";
}
