//! Archive builder round trip: source tree in, encrypted zip out, readable
//! back through `TestStore`. Needs no special privileges, unlike the
//! sandboxed judging tests.

use std::fs;

use arbiter_judge::store::TestStore;

fn write_source_tree(root: &std::path::Path) {
    fs::write(
        root.join("contests.yml"),
        "- name: main\n  tasks: [echo]\n",
    )
    .unwrap();

    let task_dir = root.join("echo");
    fs::create_dir_all(task_dir.join("tests")).unwrap();
    fs::create_dir_all(task_dir.join("statements")).unwrap();

    fs::write(
        task_dir.join("task.yml"),
        "name: echo\ntitle: Echo\ntime_limit_ms: 1000\nmemory_limit_kb: 65536\nn_tests: 1\n",
    )
    .unwrap();
    fs::write(task_dir.join("tests").join("0.in"), "42\n").unwrap();
    fs::write(task_dir.join("tests").join("0.out"), "42\n").unwrap();
    fs::write(task_dir.join("statements").join("statement.html"), "<p>echo 42</p>").unwrap();
}

#[test]
fn builds_and_reads_back() {
    let source = tempfile::tempdir().unwrap();
    write_source_tree(source.path());

    let output = tempfile::NamedTempFile::new().unwrap();
    let output_path = output.path().to_str().unwrap().to_string();

    crate::builddb::run(
        source.path().to_str().unwrap(),
        &output_path,
        Some("0123456789abcdef".to_string()),
        false,
    )
    .unwrap();

    let store = TestStore::open(output.path()).unwrap();
    assert!(store.authenticate("0123456789abcdef").unwrap());
    assert!(!store.authenticate("wrong-password").unwrap());

    let task = store.task("echo").unwrap();
    assert_eq!(task.n_tests, 1);
    assert!(task.batches.is_empty());

    let contest = store.contest("main").unwrap();
    assert_eq!(contest.tasks, vec!["echo".to_string()]);

    let key = b"0123456789abcdef";
    let tests = store.tests("echo", task.n_tests, key).unwrap();
    assert_eq!(tests[0].input, b"42\n");
    assert_eq!(tests[0].output, b"42\n");

    let statement = store.statement("echo", key).unwrap();
    assert_eq!(statement.html.unwrap(), b"<p>echo 42</p>");
    assert!(statement.pdf.is_none());
}

#[test]
fn rejects_wrong_length_password() {
    let source = tempfile::tempdir().unwrap();
    write_source_tree(source.path());
    let output = tempfile::NamedTempFile::new().unwrap();

    let result = crate::builddb::run(
        source.path().to_str().unwrap(),
        output.path().to_str().unwrap(),
        Some("short".to_string()),
        false,
    );
    assert!(result.is_err());
}
