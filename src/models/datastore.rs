// Datastore - the resource actions execute against

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::SchedulerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatastoreState {
    #[default]
    Active,
    Inactive,
}

impl DatastoreState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatastoreState::Active => "ACTIVE",
            DatastoreState::Inactive => "INACTIVE",
        }
    }
}

impl FromStr for DatastoreState {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(DatastoreState::Active),
            "INACTIVE" => Ok(DatastoreState::Inactive),
            other => Err(SchedulerError::InvalidInput(format!(
                "unknown datastore state: {}",
                other
            ))),
        }
    }
}

/// A datastore and its admission-control limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datastore {
    pub id: String,
    pub version: i64,
    pub name: String,
    pub engine_name: String,

    /// Maximum number of in-flight (pending, running, finishing) actions
    pub concurrency: u32,

    pub state: DatastoreState,
    pub updated_at: DateTime<Utc>,
}

impl Datastore {
    pub fn new(name: impl Into<String>, engine_name: impl Into<String>, concurrency: u32) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            version: 0,
            name: name.into(),
            engine_name: engine_name.into(),
            concurrency,
            state: DatastoreState::Active,
            updated_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == DatastoreState::Active
    }
}
