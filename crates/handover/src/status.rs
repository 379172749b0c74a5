//! JSON status file describing the supervisor and its processes.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::manager::ManagerState;
use crate::set::ProcessInfo;

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub state: ManagerState,
    /// Latest launched generation.
    pub generation: u64,
    /// Pid of the process currently serving, if any.
    pub current: Option<i32>,
    pub processes: Vec<ProcessInfo>,
    pub updated_at: DateTime<Utc>,
}

impl Status {
    pub fn new(
        state: ManagerState,
        generation: u64,
        current: Option<i32>,
        processes: Vec<ProcessInfo>,
    ) -> Self {
        Self {
            state,
            generation,
            current,
            processes,
            updated_at: Utc::now(),
        }
    }

    /// Replace `path` atomically: write a sibling temp file, then rename.
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)
    }
}
