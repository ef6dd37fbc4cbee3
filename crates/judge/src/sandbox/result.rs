//! The outcome of a single sandboxed execution (spec §3, §4.4.3).

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxStatus {
    Ok,
    WallTimeout,
    CpuTimeout,
    Signaled,
    Exited,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct BoxResult {
    pub status: Option<BoxStatus>,
    pub cpu_time: Duration,
    pub wall_time: Duration,
    pub memory_kb: u64,
    pub signal: Option<i32>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
}

impl BoxResult {
    pub fn status(&self) -> BoxStatus {
        self.status.unwrap_or(BoxStatus::Error)
    }

    pub(crate) fn error(message: impl Into<String>) -> Self {
        BoxResult {
            status: Some(BoxStatus::Error),
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}
