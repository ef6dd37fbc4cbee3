//! Per-run configuration (spec §4.4.3) and pool-wide sandbox settings.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a child's stdio stream should be connected.
pub enum Io {
    /// `/dev/null`.
    Null,
    /// Use this file directly as the fd; no copy task needed.
    File(std::fs::File),
    /// Feed these bytes in through a pipe, written by a background copy
    /// task (stdin only).
    Bytes(Vec<u8>),
}

/// Parameters for one `Sandbox::run` call. Not reusable across runs.
pub struct RunConfig {
    pub path: String,
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub stdin: Io,
    pub stdout: Io,
    pub stderr: Io,
    pub enable_cgroups: bool,
    pub cpu_time_limit: Duration,
    pub wall_time_limit: Duration,
    pub memory_limit_kb: Option<u64>,
    pub max_processes: Option<u32>,
}

impl RunConfig {
    pub fn new(path: impl Into<String>, argv: Vec<String>) -> Self {
        RunConfig {
            path: path.into(),
            argv,
            env: Vec::new(),
            stdin: Io::Null,
            stdout: Io::Null,
            stderr: Io::Null,
            enable_cgroups: false,
            cpu_time_limit: Duration::ZERO,
            wall_time_limit: Duration::ZERO,
            memory_limit_kb: None,
            max_processes: None,
        }
    }
}

/// Pool-wide sandbox identity/layout settings (spec §4.4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxCfg {
    pub box_root: PathBuf,
    pub n_boxes: u32,
    pub first_uid: u32,
    pub first_gid: u32,
    pub image_size_bytes: u64,
}

impl Default for SandboxCfg {
    fn default() -> Self {
        SandboxCfg {
            box_root: PathBuf::from("/obibox"),
            n_boxes: 2,
            first_uid: 60_000,
            first_gid: 60_000,
            image_size_bytes: 10 << 20,
        }
    }
}
