use std::fmt::Display;
use std::fmt::Formatter;

use chrono::DateTime;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::Deserialize;
use serde_derive::Serialize as SerializeDerive;
use serde_json::Value;
use thiserror::Error;

pub mod reports;

/// The kind of work a task describes. Serialized as the lowercase tag in
/// the task's `type` field; workers dispatch on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, SerializeDerive, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Ping,
    Check,
    Probe,
    Complex,
}

impl Display for TaskKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskKind::Ping => "ping",
            TaskKind::Check => "check",
            TaskKind::Probe => "probe",
            TaskKind::Complex => "complex",
        };
        f.write_str(s)
    }
}

/// A unit of work submitted by a client.
///
/// Simple tasks (`ping`, `check`, `probe`) carry an opaque `payload` and
/// receive a single `result`. A `complex` task carries an ordered list of
/// subtasks in `payloads` and accumulates one entry in `results` per
/// completed step.
#[derive(Clone, Debug, PartialEq, SerializeDerive, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type")]
    pub kind: TaskKind,

    #[serde(default)]
    pub geo_location: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payloads: Vec<Task>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<TaskResult>,
}

/// Why a submitted task was rejected before it was assigned an id.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TaskValidationError {
    #[error("geo_location is empty")]
    GeoLocationEmpty,

    #[error("payload is empty")]
    PayloadEmpty,

    #[error("payloads is empty")]
    PayloadsEmpty,

    #[error("subtask #{0}: payload is empty")]
    SubtaskPayloadEmpty(usize),

    #[error("subtask #{0} is complex")]
    SubtaskComplex(usize),
}

impl Task {
    /// Checks the submission rules. Called by the coordinator before an id
    /// is minted; never called on the worker side.
    pub fn validate(&self) -> Result<(), TaskValidationError> {
        if self.geo_location.is_empty() {
            return Err(TaskValidationError::GeoLocationEmpty);
        }

        if self.kind == TaskKind::Complex {
            if self.payloads.is_empty() {
                return Err(TaskValidationError::PayloadsEmpty);
            }
            for (i, subtask) in self.payloads.iter().enumerate() {
                if subtask.kind == TaskKind::Complex {
                    return Err(TaskValidationError::SubtaskComplex(i));
                }
                if subtask.payload.is_none() {
                    return Err(TaskValidationError::SubtaskPayloadEmpty(i));
                }
            }
        } else if self.payload.is_none() {
            return Err(TaskValidationError::PayloadEmpty);
        }

        Ok(())
    }

    /// Decodes the opaque payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        let payload = self
            .payload
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("task payload is empty"))?;
        Ok(serde_json::from_value(payload.clone())?)
    }

    /// Builds the next subtask of a complex task, or `None` when all
    /// subtasks already have results.
    ///
    /// The subtask at index `len(results)` is dispatched carrying the
    /// parent's id and geo location, with any nested result fields
    /// cleared.
    pub fn next_subtask(&self) -> Option<Task> {
        let mut subtask = self.payloads.get(self.results.len())?.clone();
        subtask.id = self.id.clone();
        subtask.geo_location = self.geo_location.clone();
        subtask.result = None;
        subtask.results = Vec::new();
        Some(subtask)
    }
}

/// The outcome report for one (sub)task.
///
/// On success `payload` holds the kind-specific report; on failure it
/// holds a human-readable error string.
#[derive(Clone, Debug, PartialEq, SerializeDerive, Deserialize)]
pub struct TaskResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_id: String,

    pub time: DateTime<Utc>,

    pub ok: bool,

    #[serde(default)]
    pub payload: Value,
}

impl TaskResult {
    /// A successful result carrying `report` as its payload.
    pub fn success<T: Serialize>(task_id: &str, report: &T) -> anyhow::Result<Self> {
        Ok(Self {
            task_id: task_id.to_owned(),
            time: Utc::now(),
            ok: true,
            payload: serde_json::to_value(report)?,
        })
    }

    /// A failed result whose payload is the error text.
    pub fn failure(task_id: &str, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_owned(),
            time: Utc::now(),
            ok: false,
            payload: Value::String(message.into()),
        }
    }

    /// Decodes the payload into a concrete report type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}
