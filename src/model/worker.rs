//! Execution workers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Busy,
    Offline,
    Error,
}

impl WorkerStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Busy => write!(f, "BUSY"),
            Self::Offline => write!(f, "OFFLINE"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IDLE" => Ok(Self::Idle),
            "BUSY" => Ok(Self::Busy),
            "OFFLINE" => Ok(Self::Offline),
            "ERROR" => Ok(Self::Error),
            _ => Err(format!("Invalid worker status: {s}")),
        }
    }
}

/// An execution slot that runs at most one test at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub name: String,
    pub status: WorkerStatus,
    pub current_test: Option<String>,
    pub error: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(status: WorkerStatus) -> Self {
        let id = super::test::new_id();
        let now = Utc::now();
        Self {
            name: format!("worker-{}", &id[..8]),
            id,
            status,
            current_test: None,
            error: None,
            last_activity: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn set_status(&mut self, status: WorkerStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        self.last_activity = now;
    }
}
