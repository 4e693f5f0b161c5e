// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State variable codec.
//!
//! State variables are stored as plain strings. The codec turns them into
//! typed values before a handler runs and back into strings afterwards.

use serde_json::Value;

use crate::error::{CoreError, Result};

/// Declared type of a handler variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    String,
    Integer,
    Boolean,
    /// Arbitrary JSON document.
    Json,
}

/// Maps raw variable strings to typed values and back.
pub trait VariableCodec: Send + Sync {
    /// Decode the stored string of variable `name` as `kind`.
    fn decode(&self, kind: VariableKind, name: &str, raw: &str) -> Result<Value>;

    /// Encode a value of variable `name` for storage.
    fn encode(&self, name: &str, value: &Value) -> Result<String>;
}

/// Default codec representing every variable as a `serde_json::Value`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonVariableCodec;

impl VariableCodec for JsonVariableCodec {
    fn decode(&self, kind: VariableKind, name: &str, raw: &str) -> Result<Value> {
        let codec_error = |reason: String| CoreError::VariableCodec {
            name: name.to_string(),
            reason,
        };
        match kind {
            VariableKind::String => Ok(Value::String(raw.to_string())),
            VariableKind::Integer => raw
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|e| codec_error(format!("'{}' is not an integer: {}", raw, e))),
            VariableKind::Boolean => raw
                .trim()
                .parse::<bool>()
                .map(Value::Bool)
                .map_err(|e| codec_error(format!("'{}' is not a boolean: {}", raw, e))),
            VariableKind::Json => {
                serde_json::from_str(raw).map_err(|e| codec_error(e.to_string()))
            }
        }
    }

    fn encode(&self, name: &str, value: &Value) -> Result<String> {
        match value {
            Value::String(s) => Ok(s.clone()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Number(n) => Ok(n.to_string()),
            other => serde_json::to_string(other).map_err(|e| CoreError::VariableCodec {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
