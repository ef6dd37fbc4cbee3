//! Judge worker (C5, spec §4.5): owns one sandbox identity, drives the
//! compile→evaluate→compare pipeline for one job at a time.

use std::time::Duration;

use log::{debug, info, warn};

use crate::error::Error;
use crate::lang::Language;
use crate::model::{CustomTest, Submission, Task};
use crate::sandbox::{BoxResult, BoxStatus, Io, RunConfig, Sandbox, SandboxCfg};
use crate::store::TestStore;
use crate::verdict::{BatchVerdict, CompilationKind, ResultKind, TaskVerdict};

/// Fixed caps applied to every compile step and to custom tests (spec
/// §4.5 step 2, §4.5.2).
const FIXED_MEMORY_KB: u64 = 2_621_440; // 2.5 GiB
const FIXED_TIME: Duration = Duration::from_secs(120);
const CUSTOM_OUTPUT_TRUNCATE: usize = 1024;

const OUTPUT_FILE: &str = ".output";

pub struct Worker {
    box_id: u32,
    sandbox_cfg: SandboxCfg,
}

impl Worker {
    pub fn new(box_id: u32, sandbox_cfg: SandboxCfg) -> Self {
        Worker { box_id, sandbox_cfg }
    }

    pub fn judge_submission(&self, submission: &Submission, store: &TestStore) -> TaskVerdict {
        let result = self.judge_submission_inner(submission, store);
        match result {
            Ok(verdict) => verdict,
            Err(e) => fatal_verdict(submission, e),
        }
    }

    fn judge_submission_inner(&self, submission: &Submission, store: &TestStore) -> Result<TaskVerdict, Error> {
        info!("box {}: judging submission {}", self.box_id, submission.id);
        let task = store.task(&submission.task_ref)?;

        let sandbox = Sandbox::open(self.box_id, &self.sandbox_cfg)?;
        let source_name = source_name(&task.name, submission.language);
        std::fs::write(sandbox.box_dir().join(&source_name), &submission.code)?;
        submission.language.copy_extra_files(&sandbox.box_dir())?;

        let (compilation, comp_extra) = compile(&sandbox, submission.language, &source_name, &task.name)?;
        if !matches!(compilation, CompilationKind::Success) {
            sandbox.clear();
            return Ok(TaskVerdict {
                id: submission.id,
                session_id: submission.session_id.clone(),
                when: submission.when,
                task_name: task.name.clone(),
                code_text: String::from_utf8_lossy(&submission.code).to_string(),
                language_info: submission.language.name().to_string(),
                compilation,
                batches: Vec::new(),
                error: false,
                extra: comp_extra,
            });
        }

        let tests = store.tests(&task.name, task.n_tests, &submission.key)?;
        let batches = judge_batches(&sandbox, submission.language, &task, &tests)?;
        sandbox.clear();

        Ok(TaskVerdict {
            id: submission.id,
            session_id: submission.session_id.clone(),
            when: submission.when,
            task_name: task.name.clone(),
            code_text: String::from_utf8_lossy(&submission.code).to_string(),
            language_info: submission.language.name().to_string(),
            compilation,
            batches,
            error: false,
            extra: String::new(),
        })
    }

    pub fn judge_custom_test(&self, test: &CustomTest) -> TaskVerdict {
        match self.judge_custom_test_inner(test) {
            Ok(v) => v,
            Err(e) => TaskVerdict {
                id: test.id,
                session_id: test.session_id.clone(),
                when: test.when,
                task_name: test.label.clone(),
                code_text: String::from_utf8_lossy(&test.code).to_string(),
                language_info: test.language.name().to_string(),
                compilation: CompilationKind::Nothing,
                batches: Vec::new(),
                error: true,
                extra: e.to_string(),
            },
        }
    }

    fn judge_custom_test_inner(&self, test: &CustomTest) -> Result<TaskVerdict, Error> {
        info!("box {}: judging custom test {}", self.box_id, test.id);
        let sandbox = Sandbox::open(self.box_id, &self.sandbox_cfg)?;
        let source_name = source_name(&test.label, test.language);
        std::fs::write(sandbox.box_dir().join(&source_name), &test.code)?;
        test.language.copy_extra_files(&sandbox.box_dir())?;

        let (compilation, comp_extra) = compile(&sandbox, test.language, &source_name, &test.label)?;
        if !matches!(compilation, CompilationKind::Success) {
            sandbox.clear();
            return Ok(TaskVerdict {
                id: test.id,
                session_id: test.session_id.clone(),
                when: test.when,
                task_name: test.label.clone(),
                code_text: String::from_utf8_lossy(&test.code).to_string(),
                language_info: test.language.name().to_string(),
                compilation,
                batches: Vec::new(),
                error: false,
                extra: comp_extra,
            });
        }

        let output_path = sandbox.box_dir().join(OUTPUT_FILE);
        let output_file = std::fs::File::create(&output_path)?;
        let argv = test.language.evaluate_cmd(&test.label, &[], FIXED_MEMORY_KB);
        let run_config = RunConfig {
            stdin: Io::Bytes(test.input.clone()),
            stdout: Io::File(output_file.try_clone()?),
            stderr: Io::File(output_file),
            enable_cgroups: true,
            cpu_time_limit: FIXED_TIME,
            wall_time_limit: FIXED_TIME,
            memory_limit_kb: Some(FIXED_MEMORY_KB),
            max_processes: if test.language.requires_multithreading() { None } else { Some(64) },
            ..RunConfig::new(argv[0].clone(), argv[1..].to_vec())
        };
        let box_result = sandbox.run(run_config);
        let mut output = std::fs::read(&output_path).unwrap_or_default();
        if output.len() > CUSTOM_OUTPUT_TRUNCATE {
            output.truncate(CUSTOM_OUTPUT_TRUNCATE);
            output.extend_from_slice(b"(...)");
        }
        sandbox.clear();

        let (result, extra) = classify_run(&box_result);
        let batch = BatchVerdict {
            result,
            score: 0,
            time: box_result.wall_time,
            memory: box_result.memory_kb,
            extra: format!("{extra}{}", String::from_utf8_lossy(&output)),
        };

        Ok(TaskVerdict {
            id: test.id,
            session_id: test.session_id.clone(),
            when: test.when,
            task_name: test.label.clone(),
            code_text: String::from_utf8_lossy(&test.code).to_string(),
            language_info: test.language.name().to_string(),
            compilation,
            batches: vec![batch],
            error: matches!(box_result.status(), BoxStatus::Error),
            extra: box_result.error_message.unwrap_or_default(),
        })
    }
}

fn source_name(base: &str, lang: Language) -> String {
    format!("{base}{}", lang.source_extension())
}

fn compile(
    sandbox: &Sandbox,
    lang: Language,
    source_name: &str,
    exe: &str,
) -> Result<(CompilationKind, String), Error> {
    let Some(argv) = lang.compile_cmd(&[source_name.to_string()], exe) else {
        return Ok((CompilationKind::Success, String::new()));
    };

    let output_path = sandbox.box_dir().join(OUTPUT_FILE);
    let output_file = std::fs::File::create(&output_path)?;
    let run_config = RunConfig {
        stdin: Io::Null,
        stdout: Io::File(output_file.try_clone()?),
        stderr: Io::File(output_file),
        enable_cgroups: true,
        cpu_time_limit: FIXED_TIME,
        wall_time_limit: FIXED_TIME,
        memory_limit_kb: Some(FIXED_MEMORY_KB),
        max_processes: None,
        ..RunConfig::new(argv[0].clone(), argv[1..].to_vec())
    };

    let result = sandbox.run(run_config);
    let output = std::fs::read(&output_path).unwrap_or_default();

    let kind = match result.status() {
        BoxStatus::Ok => CompilationKind::Success,
        BoxStatus::WallTimeout | BoxStatus::CpuTimeout => CompilationKind::Timeout,
        BoxStatus::Signaled => CompilationKind::Signal,
        BoxStatus::Exited => CompilationKind::Failed,
        BoxStatus::Error => {
            return Err(Error::Sandbox(crate::sandbox::Error::Setup(
                result.error_message.unwrap_or_default(),
            )))
        }
    };

    let extra = match kind {
        CompilationKind::Signal => signal_name(result.signal),
        CompilationKind::Failed => format!(
            "Exit Code: {}\n{}",
            result.exit_code.unwrap_or(-1),
            String::from_utf8_lossy(&output)
        ),
        _ => String::new(),
    };

    if !matches!(kind, CompilationKind::Success) {
        warn!("box compile failed with {:?}", kind);
    } else {
        debug!("box compile succeeded");
    }

    Ok((kind, extra))
}

fn judge_batches(
    sandbox: &Sandbox,
    lang: Language,
    task: &Task,
    tests: &[crate::model::TestCase],
) -> Result<Vec<BatchVerdict>, Error> {
    struct Slot {
        result: ResultKind,
        extra: String,
        time: Duration,
        memory_kb: u64,
    }

    let mut slots: Vec<Slot> = (0..tests.len())
        .map(|_| Slot {
            result: ResultKind::Nothing,
            extra: String::new(),
            time: Duration::ZERO,
            memory_kb: 0,
        })
        .collect();

    let effective_batches = task.effective_batches();
    let mut batch_verdicts = Vec::with_capacity(effective_batches.len());

    for batch in &effective_batches {
        let mut verdict = BatchVerdict::nothing();
        let mut outcome = ResultKind::Correct;

        for &i in &batch.tests {
            let i = i as usize;
            if slots[i].result == ResultKind::Nothing {
                let (result, extra, box_result) = run_test(sandbox, lang, task, &tests[i])?;
                slots[i] = Slot {
                    result,
                    extra,
                    time: box_result.wall_time,
                    memory_kb: box_result.memory_kb,
                };
            }

            verdict.time = verdict.time.max(slots[i].time);
            verdict.memory = verdict.memory.max(slots[i].memory_kb);

            if slots[i].result != ResultKind::Correct {
                outcome = slots[i].result;
                verdict.extra = slots[i].extra.clone();
                break;
            }
        }

        verdict.result = outcome;
        verdict.score = if outcome == ResultKind::Correct { batch.value } else { 0 };
        batch_verdicts.push(verdict);
    }

    Ok(batch_verdicts)
}

fn run_test(
    sandbox: &Sandbox,
    lang: Language,
    task: &Task,
    test: &crate::model::TestCase,
) -> Result<(ResultKind, String, BoxResult), Error> {
    let output_path = sandbox.box_dir().join(OUTPUT_FILE);
    let output_file = std::fs::File::create(&output_path)?;

    let argv = lang.evaluate_cmd(&task.name, &[], task.memory_limit_kb);
    let run_config = RunConfig {
        stdin: Io::Bytes(test.input.clone()),
        stdout: Io::File(output_file.try_clone()?),
        stderr: Io::File(output_file),
        enable_cgroups: true,
        cpu_time_limit: Duration::from_millis(task.time_limit_ms),
        wall_time_limit: Duration::from_millis(task.time_limit_ms),
        memory_limit_kb: lang.use_memory_limit().then_some(task.memory_limit_kb),
        max_processes: if lang.requires_multithreading() { None } else { Some(64) },
        ..RunConfig::new(argv[0].clone(), argv[1..].to_vec())
    };

    let box_result = sandbox.run(run_config);
    if matches!(box_result.status(), BoxStatus::Error) {
        return Err(Error::Sandbox(crate::sandbox::Error::Setup(
            box_result.error_message.clone().unwrap_or_default(),
        )));
    }

    let answer = std::fs::read(&output_path).unwrap_or_default();
    let (mut result, extra) = classify_run(&box_result);

    if result == ResultKind::Correct && strip(&answer) != strip(&test.output) {
        result = ResultKind::Wrong;
    }

    Ok((result, extra, box_result))
}

fn classify_run(result: &BoxResult) -> (ResultKind, String) {
    match result.status() {
        BoxStatus::Ok => (ResultKind::Correct, String::new()),
        BoxStatus::WallTimeout | BoxStatus::CpuTimeout => (ResultKind::Timeout, String::new()),
        BoxStatus::Signaled => (ResultKind::Signal, signal_name(result.signal)),
        BoxStatus::Exited => (
            ResultKind::Failed,
            format!("Exit Code: {}", result.exit_code.unwrap_or(-1)),
        ),
        BoxStatus::Error => (ResultKind::Failed, result.error_message.clone().unwrap_or_default()),
    }
}

fn signal_name(signal: Option<i32>) -> String {
    match signal.and_then(|s| nix::sys::signal::Signal::try_from(s).ok()) {
        Some(s) => s.as_str().to_string(),
        None => "unknown signal".to_string(),
    }
}

/// Collapses every maximal run of Unicode whitespace (including the
/// leading/trailing ones) into a single ASCII space (spec §4.5.1).
fn strip(bytes: &[u8]) -> String {
    let s = String::from_utf8_lossy(bytes);
    let mut out = String::with_capacity(s.len());
    let mut was_white = false;
    for c in s.chars() {
        if c.is_whitespace() {
            if !was_white {
                out.push(' ');
            }
            was_white = true;
        } else {
            out.push(c);
            was_white = false;
        }
    }
    out
}

fn fatal_verdict(submission: &Submission, e: Error) -> TaskVerdict {
    TaskVerdict {
        id: submission.id,
        session_id: submission.session_id.clone(),
        when: submission.when,
        task_name: submission.task_ref.clone(),
        code_text: String::from_utf8_lossy(&submission.code).to_string(),
        language_info: submission.language.name().to_string(),
        compilation: CompilationKind::Nothing,
        batches: Vec::new(),
        error: true,
        extra: e.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn strip_collapses_whitespace_runs() {
        assert_eq!(strip(b"  1 2 \n 3\t\n"), " 1 2 3 ");
        assert_eq!(strip(b"1  2\n3\n"), "1 2 3 ");
    }

    #[test]
    fn strip_equal_after_normalization() {
        assert_eq!(strip(b"  1 2 \n 3\t\n"), strip(b"1  2\n3\n"));
    }
}
