//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! The dynamic record value carried by every entry.

use crate::error::{FluentError, Result};
use rmpv::Value;

/// A MessagePack map whose keys are strings and whose values are arbitrary
/// MessagePack-representable data. Construction rejects anything that isn't
/// a map — scalars, arrays, and nil are user errors per the wire contract.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record(Vec<(Value, Value)>);

impl Record {
    pub fn new() -> Self {
        Record(Vec::new())
    }

    pub fn insert(&mut self, key: impl Into<Value>, value: impl Into<Value>) -> &mut Self {
        self.0.push((key.into(), value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> &[(Value, Value)] {
        &self.0
    }

    /// Validate and wrap a decoded `Value` as a `Record`. Fails with
    /// `DataType` if the value isn't a map.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Map(entries) => Ok(Record(entries)),
            other => Err(FluentError::data_type(format!(
                "record must be a map, got {other:?}"
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Map(self.0.clone())
    }

    /// Approximate serialized cost in bytes: key + value byte cost summed
    /// across the map, plus a fixed per-entry overhead. This is explicitly
    /// not a contract on exact byte count — only a monotonic approximation
    /// used to size-limit the send queue.
    pub fn size_estimate(&self) -> usize {
        self.0
            .iter()
            .map(|(k, v)| value_cost(k) + value_cost(v) + 16)
            .sum()
    }
}

fn value_cost(v: &Value) -> usize {
    match v {
        Value::Nil => 1,
        Value::Boolean(_) => 1,
        Value::Integer(_) => 8,
        Value::F32(_) => 4,
        Value::F64(_) => 8,
        Value::String(s) => s.as_str().map(|s| s.len()).unwrap_or(s.as_bytes().len()),
        Value::Binary(b) => b.len(),
        Value::Array(items) => items.iter().map(value_cost).sum::<usize>() + items.len(),
        Value::Map(entries) => entries
            .iter()
            .map(|(k, v)| value_cost(k) + value_cost(v))
            .sum::<usize>()
            + entries.len(),
        Value::Ext(_, bytes) => bytes.len() + 1,
    }
}
