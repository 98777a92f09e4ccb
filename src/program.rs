//! Program descriptors and admission
//!
//! A `ProgramRequest` is what arrives on the wire. `validate` turns it into an
//! immutable `Program` or a field-level problem map scoped to that one program.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::runtime::{RuntimeId, RuntimeRegistry};

/// A validated request to run `code` under `runtime`
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    runtime: RuntimeId,
    code: String,
    timeout_secs: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum ProgramError {
    #[error("timeout must be a positive number of seconds, got {0}")]
    InvalidTimeout(f64),
}

impl Program {
    pub fn new(
        runtime: RuntimeId,
        code: impl Into<String>,
        timeout_secs: f64,
    ) -> Result<Self, ProgramError> {
        if !timeout_secs.is_finite()
            || timeout_secs <= 0.0
            || Duration::try_from_secs_f64(timeout_secs).is_err()
        {
            return Err(ProgramError::InvalidTimeout(timeout_secs));
        }
        Ok(Self {
            runtime,
            code: code.into(),
            timeout_secs,
        })
    }

    pub fn runtime(&self) -> RuntimeId {
        self.runtime
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn timeout_secs(&self) -> f64 {
        self.timeout_secs
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }
}

/// Program as submitted by a client
///
/// Decoding never fails: fields of the wrong shape are recorded and reported by
/// `validate`, so one bad entry only rejects itself.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramRequest {
    /// Runtime token; kept raw so an unknown value only fails this program
    pub runtime: String,
    /// Source code to execute
    pub code: String,
    /// Wall-clock limit; missing or out-of-range values fall back to the maximum
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
    #[serde(skip)]
    decode_problems: Problems,
}

/// Field name -> problem description
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Problems(BTreeMap<String, String>);

impl Problems {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, problem: impl Into<String>) {
        self.0.insert(field.into(), problem.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }
}

impl fmt::Display for Problems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, problem) in &self.0 {
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", field, problem)?;
            first = false;
        }
        Ok(())
    }
}

/// Clamp a requested timeout into `(0, max]`; anything outside becomes `max`
pub fn effective_timeout(requested: Option<f64>, max_timeout_secs: f64) -> f64 {
    match requested {
        Some(t) if t.is_finite() && t > 0.0 && t <= max_timeout_secs => t,
        _ => max_timeout_secs,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn take_string(fields: &mut Map<String, Value>, field: &str, problems: &mut Problems) -> Option<String> {
    match fields.remove(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => {
            problems.add(field, format!("expected a string, got {}", json_kind(&other)));
            None
        }
    }
}

impl ProgramRequest {
    pub fn new(runtime: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            code: code.into(),
            timeout_secs: None,
            decode_problems: Problems::new(),
        }
    }

    #[cfg(test)]
    pub fn with_timeout(mut self, timeout_secs: f64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Read one batch entry, keeping shape errors for `validate`
    pub fn from_json(value: Value) -> Self {
        let mut request = Self::new("", "");
        let problems = &mut request.decode_problems;

        let mut fields = match value {
            Value::Object(fields) => fields,
            other => {
                problems.add("program", format!("expected an object, got {}", json_kind(&other)));
                return request;
            }
        };

        match take_string(&mut fields, "runtime", problems) {
            Some(runtime) => request.runtime = runtime,
            None if problems.get("runtime").is_none() => problems.add("runtime", "missing runtime"),
            None => {}
        }
        if let Some(code) = take_string(&mut fields, "code", problems) {
            request.code = code;
        }

        let timeout = fields
            .remove("timeoutSecs")
            .or_else(|| fields.remove("timeout_secs"));
        match timeout {
            None | Some(Value::Null) => {}
            Some(Value::Number(n)) => request.timeout_secs = n.as_f64(),
            Some(other) => problems.add(
                "timeoutSecs",
                format!("expected a number, got {}", json_kind(&other)),
            ),
        }

        request
    }

    /// Admit this request against the runtime table and timeout ceiling
    pub fn validate(
        &self,
        registry: &RuntimeRegistry,
        max_timeout_secs: f64,
    ) -> Result<Program, Problems> {
        let mut problems = self.decode_problems.clone();

        let runtime = match registry.resolve(&self.runtime) {
            Some(spec) => Some(spec.id()),
            None if problems.get("runtime").is_some() || problems.get("program").is_some() => None,
            None => {
                problems.add(
                    "runtime",
                    format!(
                        "unsupported runtime {:?} (supported: {})",
                        self.runtime,
                        registry.supported().join(", ")
                    ),
                );
                None
            }
        };

        let timeout_secs = effective_timeout(self.timeout_secs, max_timeout_secs);

        match runtime {
            Some(runtime) if problems.is_empty() => {
                Program::new(runtime, self.code.clone(), timeout_secs).map_err(|e| {
                    let mut problems = Problems::new();
                    problems.add("timeoutSecs", e.to_string());
                    problems
                })
            }
            _ => Err(problems),
        }
    }
}

impl<'de> Deserialize<'de> for ProgramRequest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_json)
    }
}
