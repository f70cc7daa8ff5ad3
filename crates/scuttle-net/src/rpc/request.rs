use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::RpcError;

/// Dot-separated procedure name, e.g. `blobs.get`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcedureName(Vec<String>);

impl ProcedureName {
    pub fn new(parts: &[&str]) -> Self {
        Self(parts.iter().map(|p| p.to_string()).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for ProcedureName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureType {
    Async,
    Source,
    Sink,
    Duplex,
}

impl ProcedureType {
    /// Whether packets of this procedure carry the stream flag.
    pub fn is_stream(self) -> bool {
        !matches!(self, ProcedureType::Async)
    }

    /// Whether the caller sends packets after the request.
    pub fn caller_streams(self) -> bool {
        matches!(self, ProcedureType::Sink | ProcedureType::Duplex)
    }
}

/// An outbound or inbound procedure call.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub name: ProcedureName,
    pub typ: ProcedureType,
    pub args: Value,
}

impl Request {
    pub fn new(name: &[&str], typ: ProcedureType, args: Value) -> Self {
        Self {
            name: ProcedureName::new(name),
            typ,
            args,
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "name": self.name,
            "type": self.typ,
            "args": self.args,
        })
    }

    pub fn from_value(value: &Value) -> Result<Self, RpcError> {
        let name = value
            .get("name")
            .cloned()
            .ok_or_else(|| RpcError::Protocol("request without name".to_string()))?;
        // Some clients send a bare string for single-part names.
        let name = match name {
            Value::String(s) => ProcedureName(s.split('.').map(str::to_string).collect()),
            other => serde_json::from_value(other)?,
        };
        let typ = match value.get("type") {
            Some(t) => serde_json::from_value(t.clone())?,
            None => ProcedureType::Async,
        };
        let args = value.get("args").cloned().unwrap_or(Value::Array(Vec::new()));
        Ok(Self { name, typ, args })
    }

    /// First element of the argument array, or the arguments themselves.
    pub fn first_arg(&self) -> &Value {
        match &self.args {
            Value::Array(items) => items.first().unwrap_or(&Value::Null),
            other => other,
        }
    }
}
