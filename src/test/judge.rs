//! End-to-end judging scenarios, run against a real sandbox. These need
//! `CAP_SYS_ADMIN` (namespaces, loopback mounts, cgroups) and a working
//! `gcc`, so they don't run under a normal `cargo test` and are `#[ignore]`d;
//! run with `cargo test -- --ignored` as root to exercise them.

use std::fs;
use std::io::Write;
use std::sync::Mutex;

use arbiter_judge::lang::Language;
use arbiter_judge::model::{Contest, Submission, Task, TestCase};
use arbiter_judge::sandbox::SandboxCfg;
use arbiter_judge::store::TestStore;
use arbiter_judge::verdict::{CompilationKind, ResultKind};
use arbiter_judge::worker::Worker;

fn build_archive(path: &std::path::Path, task: &Task, tests: &[TestCase], key: &[u8]) {
    let file = fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);

    zip.start_file("hash", options).unwrap();
    zip.write_all(bcrypt::hash("irrelevant", 4).unwrap().as_bytes()).unwrap();

    zip.start_file("tasks.json", options).unwrap();
    zip.write_all(&serde_json::to_vec(&vec![task.clone()]).unwrap()).unwrap();

    zip.start_file("contests.json", options).unwrap();
    zip.write_all(
        &serde_json::to_vec(&vec![Contest { name: "main".into(), tasks: vec![task.name.clone()] }]).unwrap(),
    )
    .unwrap();

    for t in tests {
        let sealed_in = arbiter_judge::crypto::encrypt(&arbiter_judge::crypto::compress(&t.input), key).unwrap();
        zip.start_file(format!("{}/tests/{}.in", task.name, t.index), options).unwrap();
        zip.write_all(&sealed_in).unwrap();

        let sealed_out = arbiter_judge::crypto::encrypt(&arbiter_judge::crypto::compress(&t.output), key).unwrap();
        zip.start_file(format!("{}/tests/{}.out", task.name, t.index), options).unwrap();
        zip.write_all(&sealed_out).unwrap();
    }

    zip.finish().unwrap();
}

fn submission(task: &str, code: &str, key: &[u8]) -> Submission {
    Submission {
        id: 1,
        session_id: "test".into(),
        when: std::time::SystemTime::now(),
        task_ref: task.to_string(),
        code: code.as_bytes().to_vec(),
        language: Language::C,
        key: key.to_vec(),
    }
}

fn echo_task(n_tests: u32) -> Task {
    Task {
        name: "echo".into(),
        title: "Echo".into(),
        time_limit_ms: 1000,
        memory_limit_kb: 65536,
        n_tests,
        batches: Vec::new(),
    }
}

/// Only one sandbox id (0) is exercised per test, but `Sandbox::open` bind
/// mounts the same image path, so tests sharing a box id must not run
/// concurrently.
static BOX: Mutex<()> = Mutex::new(());

#[test]
#[ignore]
fn trivial_accept() {
    let _guard = BOX.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let key = arbiter_judge::crypto::new_key(16);
    let task = echo_task(1);
    let tests = vec![TestCase { index: 0, input: b"42\n".to_vec(), output: b"42\n".to_vec() }];
    let db = dir.path().join("db.zip");
    build_archive(&db, &task, &tests, &key);
    let store = TestStore::open(&db).unwrap();

    let code = "#include <stdio.h>\nint main(){int x;scanf(\"%d\",&x);printf(\"%d\\n\",x);return 0;}\n";
    let sub = submission("echo", code, &key);

    let worker = Worker::new(0, SandboxCfg::default());
    let verdict = worker.judge_submission(&sub, &store);

    assert!(matches!(verdict.compilation, CompilationKind::Success));
    assert_eq!(verdict.batches.len(), 1);
    assert!(matches!(verdict.batches[0].result, ResultKind::Correct));
    assert_eq!(verdict.batches[0].score, 100);
}

#[test]
#[ignore]
fn wrong_answer() {
    let _guard = BOX.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let key = arbiter_judge::crypto::new_key(16);
    let task = echo_task(1);
    let tests = vec![TestCase { index: 0, input: b"42\n".to_vec(), output: b"42\n".to_vec() }];
    let db = dir.path().join("db.zip");
    build_archive(&db, &task, &tests, &key);
    let store = TestStore::open(&db).unwrap();

    let code = "#include <stdio.h>\nint main(){printf(\"43\\n\");return 0;}\n";
    let sub = submission("echo", code, &key);

    let worker = Worker::new(0, SandboxCfg::default());
    let verdict = worker.judge_submission(&sub, &store);

    assert_eq!(verdict.batches[0].score, 0);
    assert!(matches!(verdict.batches[0].result, ResultKind::Wrong));
}

#[test]
#[ignore]
fn timeout() {
    let _guard = BOX.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let key = arbiter_judge::crypto::new_key(16);
    let mut task = echo_task(1);
    task.time_limit_ms = 500;
    let tests = vec![TestCase { index: 0, input: Vec::new(), output: Vec::new() }];
    let db = dir.path().join("db.zip");
    build_archive(&db, &task, &tests, &key);
    let store = TestStore::open(&db).unwrap();

    let code = "int main(){for(;;);}\n";
    let sub = submission("echo", code, &key);

    let worker = Worker::new(0, SandboxCfg::default());
    let verdict = worker.judge_submission(&sub, &store);

    assert!(matches!(verdict.batches[0].result, ResultKind::Timeout));
    assert!(verdict.batches[0].time.as_millis() >= 500);
    assert!(!verdict.error);
}

#[test]
#[ignore]
fn compile_error() {
    let _guard = BOX.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let key = arbiter_judge::crypto::new_key(16);
    let task = echo_task(1);
    let tests = vec![TestCase { index: 0, input: Vec::new(), output: Vec::new() }];
    let db = dir.path().join("db.zip");
    build_archive(&db, &task, &tests, &key);
    let store = TestStore::open(&db).unwrap();

    let sub = submission("echo", "int main(){ return", &key);

    let worker = Worker::new(0, SandboxCfg::default());
    let verdict = worker.judge_submission(&sub, &store);

    assert!(matches!(verdict.compilation, CompilationKind::Failed));
    assert!(verdict.extra.contains("Exit Code:"));
    assert!(verdict.batches.is_empty());
}

#[test]
#[ignore]
fn oom() {
    let _guard = BOX.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let key = arbiter_judge::crypto::new_key(16);
    let task = echo_task(1);
    let tests = vec![TestCase { index: 0, input: Vec::new(), output: Vec::new() }];
    let db = dir.path().join("db.zip");
    build_archive(&db, &task, &tests, &key);
    let store = TestStore::open(&db).unwrap();

    // task.memory_limit_kb is 65536 (64 MiB); touching 200 MiB of heap forces
    // the allocation to fail or the process to be killed over the limit.
    let code = r#"
        #include <stdlib.h>
        #include <string.h>
        int main(){
            size_t n = 200 * 1024 * 1024;
            char *p = malloc(n);
            if (!p) return 1;
            memset(p, 1, n);
            return 0;
        }
    "#;
    let sub = submission("echo", code, &key);

    let worker = Worker::new(0, SandboxCfg::default());
    let verdict = worker.judge_submission(&sub, &store);

    assert!(matches!(verdict.compilation, CompilationKind::Success));
    assert!(matches!(verdict.batches[0].result, ResultKind::Signal | ResultKind::Failed));
    assert_eq!(verdict.batches[0].score, 0);
}

#[test]
#[ignore]
fn batch_short_circuit() {
    let _guard = BOX.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let key = arbiter_judge::crypto::new_key(16);
    let mut task = echo_task(3);
    task.batches = vec![
        arbiter_judge::model::Batch { value: 30, tests: vec![0, 1] },
        arbiter_judge::model::Batch { value: 70, tests: vec![2] },
    ];
    let tests = vec![
        TestCase { index: 0, input: b"10\n".to_vec(), output: b"10\n".to_vec() },
        TestCase { index: 1, input: b"20\n".to_vec(), output: b"20\n".to_vec() },
        TestCase { index: 2, input: b"30\n".to_vec(), output: b"30\n".to_vec() },
    ];
    let db = dir.path().join("db.zip");
    build_archive(&db, &task, &tests, &key);
    let store = TestStore::open(&db).unwrap();

    // Echoes stdin unchanged except on test 1's input, where it prints a
    // wrong value, so batch B1 (tests 0,1) fails and B2 (test 2) passes.
    let code = r#"
        #include <stdio.h>
        int main(){
            int x; scanf("%d", &x);
            printf("%d\n", x == 20 ? 99 : x);
            return 0;
        }
    "#;
    let sub = submission("echo", code, &key);

    let worker = Worker::new(0, SandboxCfg::default());
    let verdict = worker.judge_submission(&sub, &store);

    assert_eq!(verdict.batches.len(), 2);
    assert_eq!(verdict.batches[0].score, 0);
    assert_eq!(verdict.batches[1].score, 70);
    assert_eq!(arbiter_judge::verdict::total_score(&verdict), 70);
}
