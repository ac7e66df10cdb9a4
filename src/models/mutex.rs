// Named cluster-wide mutex rows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::SchedulerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutexState {
    Ready,
    Locked,
}

impl MutexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutexState::Ready => "READY",
            MutexState::Locked => "LOCKED",
        }
    }
}

impl FromStr for MutexState {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "READY" => Ok(MutexState::Ready),
            "LOCKED" => Ok(MutexState::Locked),
            other => Err(SchedulerError::InvalidInput(format!(
                "unknown mutex state: {}",
                other
            ))),
        }
    }
}

/// Persisted mutex row. Not tied to any business entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutexRecord {
    pub name: String,
    pub state: MutexState,
    pub updated_at: DateTime<Utc>,
}

impl MutexRecord {
    pub fn ready(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: MutexState::Ready,
            updated_at: Utc::now(),
        }
    }
}

/// Well-known critical sections
pub struct Mutexes;

impl Mutexes {
    /// Guards job submission against the shared batch capacity
    pub const START_ENGINE_TASK: &'static str = "START_ENGINE_TASK";

    /// Guards terminating execution hosts
    pub const SCALE_DOWN: &'static str = "SCALE_DOWN";

    pub const ALL: [&'static str; 2] = [Self::START_ENGINE_TASK, Self::SCALE_DOWN];
}
