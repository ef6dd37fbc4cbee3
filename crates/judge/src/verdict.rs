//! Verdict/scoring model (C8, spec §4.8, §3 and §7).

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use strum::EnumString;

/// Per-test / per-batch outcome taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString)]
pub enum ResultKind {
    Nothing,
    Timeout,
    Signal,
    Failed,
    Correct,
    Wrong,
}

/// Coarse classification of a compile step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString)]
pub enum CompilationKind {
    Nothing,
    Timeout,
    Signal,
    Failed,
    Success,
}

/// The judged outcome of one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchVerdict {
    pub result: ResultKind,
    pub score: u32,
    /// Max over the tests actually evaluated for this batch.
    pub time: Duration,
    /// Max over the tests actually evaluated for this batch, in KiB.
    pub memory: u64,
    /// Short human-readable hint: compiler stderr head, signal name, etc.
    pub extra: String,
}

impl BatchVerdict {
    pub fn nothing() -> Self {
        BatchVerdict {
            result: ResultKind::Nothing,
            score: 0,
            time: Duration::ZERO,
            memory: 0,
            extra: String::new(),
        }
    }
}

/// The terminal outcome record for one submission or custom test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskVerdict {
    pub id: u32,
    pub session_id: String,
    pub when: SystemTime,
    pub task_name: String,
    /// The source code that produced this verdict, echoed back for display.
    pub code_text: String,
    pub language_info: String,
    pub compilation: CompilationKind,
    pub batches: Vec<BatchVerdict>,
    /// Set when a host/sandbox-side `Error` aborted the job before judging
    /// could run to completion (as opposed to a program producing a bad
    /// result, which is not an error).
    pub error: bool,
    pub extra: String,
}

/// Total derivable score: sum of awarded batch scores.
pub fn total_score(verdict: &TaskVerdict) -> u32 {
    verdict.batches.iter().map(|b| b.score).sum()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn total_score_sums_batches() {
        let v = TaskVerdict {
            id: 1,
            session_id: "s".into(),
            when: SystemTime::UNIX_EPOCH,
            task_name: "echo".into(),
            code_text: String::new(),
            language_info: String::new(),
            compilation: CompilationKind::Success,
            batches: vec![
                BatchVerdict {
                    result: ResultKind::Wrong,
                    score: 0,
                    time: Duration::ZERO,
                    memory: 0,
                    extra: String::new(),
                },
                BatchVerdict {
                    result: ResultKind::Correct,
                    score: 70,
                    time: Duration::ZERO,
                    memory: 0,
                    extra: String::new(),
                },
            ],
            error: false,
            extra: String::new(),
        };
        assert_eq!(total_score(&v), 70);
    }
}
