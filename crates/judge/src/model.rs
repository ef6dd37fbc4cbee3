//! Inbound job and task data model (spec §3).

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::lang::Language;

/// One test case belonging to a task, as decrypted from the archive.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub index: u32,
    pub input: Vec<u8>,
    pub output: Vec<u8>,
}

/// A named group of test indices scored together.
///
/// Scores `value` iff every listed test finishes `Correct`; otherwise 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub value: u32,
    pub tests: Vec<u32>,
}

/// Task metadata as read from `/tasks.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub title: String,
    pub time_limit_ms: u64,
    pub memory_limit_kb: u64,
    pub n_tests: u32,
    #[serde(default)]
    pub batches: Vec<Batch>,
}

impl Task {
    /// The batches to judge against: `self.batches` verbatim, or — if empty —
    /// a single synthetic full-value batch over every test. The synthetic
    /// batch is never persisted, only materialized here.
    pub fn effective_batches(&self) -> Vec<Batch> {
        if self.batches.is_empty() {
            vec![Batch {
                value: 100,
                tests: (0..self.n_tests).collect(),
            }]
        } else {
            self.batches.clone()
        }
    }
}

/// A contest: a name plus the ordered list of task names it exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contest {
    pub name: String,
    pub tasks: Vec<String>,
}

/// An accepted submission, queued for judging.
pub struct Submission {
    /// Assigned by the pool on acceptance; `0` until then.
    pub id: u32,
    pub session_id: String,
    pub when: SystemTime,
    pub task_ref: String,
    pub code: Vec<u8>,
    pub language: Language,
    /// AES-128 key used to decrypt this task's tests/statements. Lives only
    /// here and on the worker's stack; never written to the sandbox tree.
    pub key: Vec<u8>,
}

/// A one-shot, unscored evaluation against user-supplied input.
pub struct CustomTest {
    pub id: u32,
    pub session_id: String,
    pub when: SystemTime,
    /// Label used in place of a task name; defaults to `"_test"`.
    pub label: String,
    pub code: Vec<u8>,
    pub language: Language,
    pub input: Vec<u8>,
}
