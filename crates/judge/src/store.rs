//! TestStore (C2, spec §4.2 and §6): a read-only client over the encrypted
//! zip archive of contests, tasks, statements and tests.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;

use thiserror::Error;
use zip::read::ZipArchive;

use crate::crypto;
use crate::model::{Contest, Task, TestCase};

#[derive(Debug, Error)]
pub enum Error {
    #[error("opening archive: {0}")]
    Open(#[source] std::io::Error),
    #[error("archive is not a valid zip: {0}")]
    Zip(#[source] zip::result::ZipError),
    #[error("missing archive entry {0}")]
    MissingEntry(String),
    #[error("entry {0} is not valid UTF-8 JSON: {1}")]
    Json(String, #[source] serde_json::Error),
    #[error("no task named {0}")]
    NoSuchTask(String),
    #[error("no contest named {0}")]
    NoSuchContest(String),
    #[error(transparent)]
    Crypto(#[from] crypto::Error),
}

/// A task's statement, if either variant is present.
#[derive(Debug, Default, Clone)]
pub struct Statement {
    pub html: Option<Vec<u8>>,
    pub pdf: Option<Vec<u8>>,
}

pub struct TestStore {
    archive: Mutex<ZipArchive<File>>,
}

impl TestStore {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = File::open(path).map_err(Error::Open)?;
        let archive = ZipArchive::new(file).map_err(Error::Zip)?;
        Ok(TestStore {
            archive: Mutex::new(archive),
        })
    }

    /// Reads a raw entry, trying both the leading-slash and bare variants
    /// noted in spec §9. Returns `None` if neither is present.
    fn read_raw(&self, name: &str) -> Result<Option<Vec<u8>>, Error> {
        let mut archive = self.archive.lock().expect("archive mutex poisoned");
        let leading_slash = format!("/{name}");
        for candidate in [name, leading_slash.as_str()] {
            match archive.by_name(candidate) {
                Ok(mut entry) => {
                    let mut buf = Vec::with_capacity(entry.size() as usize);
                    entry.read_to_end(&mut buf).map_err(Error::Open)?;
                    return Ok(Some(buf));
                }
                Err(zip::result::ZipError::FileNotFound) => continue,
                Err(e) => return Err(Error::Zip(e)),
            }
        }
        Ok(None)
    }

    fn read_required(&self, name: &str) -> Result<Vec<u8>, Error> {
        self.read_raw(name)?
            .ok_or_else(|| Error::MissingEntry(name.to_string()))
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T, Error> {
        let raw = self.read_required(name)?;
        serde_json::from_slice(&raw).map_err(|e| Error::Json(name.to_string(), e))
    }

    /// Decrypts and decompresses `name` if present; `None` if the entry is
    /// absent rather than an error (per spec, statement variants are
    /// independently optional).
    fn read_sealed(&self, name: &str, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        match self.read_raw(name)? {
            Some(sealed) => {
                let plain = crypto::decrypt(&sealed, key)?;
                Ok(Some(crypto::decompress(&plain)?))
            }
            None => Ok(None),
        }
    }

    /// Constant-time bcrypt compare against `/hash`. A mismatch or wrong
    /// password is not an error, it simply returns `false`.
    pub fn authenticate(&self, password: &str) -> Result<bool, Error> {
        let hash = self.read_required("hash")?;
        let hash = String::from_utf8_lossy(&hash);
        Ok(bcrypt::verify(password, &hash).unwrap_or(false))
    }

    pub fn tasks(&self) -> Result<Vec<Task>, Error> {
        self.read_json("tasks.json")
    }

    pub fn task(&self, name: &str) -> Result<Task, Error> {
        self.tasks()?
            .into_iter()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::NoSuchTask(name.to_string()))
    }

    pub fn contests(&self) -> Result<Vec<Contest>, Error> {
        if let Some(raw) = self.read_raw("contests.json")? {
            return serde_json::from_slice(&raw).map_err(|e| Error::Json("contests.json".into(), e));
        }
        self.read_json("info.json")
    }

    pub fn contest(&self, name: &str) -> Result<Contest, Error> {
        self.contests()?
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::NoSuchContest(name.to_string()))
    }

    pub fn statement(&self, task: &str, key: &[u8]) -> Result<Statement, Error> {
        Ok(Statement {
            html: self.read_sealed(&format!("{task}/statements/statement.html"), key)?,
            pdf: self.read_sealed(&format!("{task}/statements/statement.pdf"), key)?,
        })
    }

    /// Tests indexed `0..task.n_tests`; an absent `.in`/`.out` entry decodes
    /// to an empty byte string rather than an error.
    pub fn tests(&self, task: &str, n_tests: u32, key: &[u8]) -> Result<Vec<TestCase>, Error> {
        let mut out = Vec::with_capacity(n_tests as usize);
        for i in 0..n_tests {
            let input = self
                .read_sealed(&format!("{task}/tests/{i}.in"), key)?
                .unwrap_or_default();
            let output = self
                .read_sealed(&format!("{task}/tests/{i}.out"), key)?
                .unwrap_or_default();
            out.push(TestCase {
                index: i,
                input,
                output,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn build_archive(path: &Path, password: &str, key: &[u8]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options =
            zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);

        let hash = bcrypt::hash(password, 4).unwrap();
        zip.start_file("hash", options).unwrap();
        zip.write_all(hash.as_bytes()).unwrap();

        let task = Task {
            name: "echo".into(),
            title: "Echo".into(),
            time_limit_ms: 1000,
            memory_limit_kb: 65536,
            n_tests: 1,
            batches: vec![],
        };
        zip.start_file("tasks.json", options).unwrap();
        zip.write_all(&serde_json::to_vec(&vec![task]).unwrap())
            .unwrap();

        zip.start_file("contests.json", options).unwrap();
        zip.write_all(
            &serde_json::to_vec(&vec![Contest {
                name: "main".into(),
                tasks: vec!["echo".into()],
            }])
            .unwrap(),
        )
        .unwrap();

        let sealed_in = crypto::encrypt(&crypto::compress(b"42\n"), key).unwrap();
        zip.start_file("echo/tests/0.in", options).unwrap();
        zip.write_all(&sealed_in).unwrap();

        let sealed_out = crypto::encrypt(&crypto::compress(b"42\n"), key).unwrap();
        zip.start_file("echo/tests/0.out", options).unwrap();
        zip.write_all(&sealed_out).unwrap();

        zip.finish().unwrap();
    }

    #[test]
    fn reads_task_and_tests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.zip");
        let key = crypto::new_key(16);
        build_archive(&path, "hunter2", &key);

        let store = TestStore::open(&path).unwrap();
        assert!(store.authenticate("hunter2").unwrap());
        assert!(!store.authenticate("wrong").unwrap());

        let task = store.task("echo").unwrap();
        assert_eq!(task.n_tests, 1);
        assert!(store.task("missing").is_err());

        let tests = store.tests("echo", task.n_tests, &key).unwrap();
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].input, b"42\n");
        assert_eq!(tests[0].output, b"42\n");

        let contest = store.contest("main").unwrap();
        assert_eq!(contest.tasks, vec!["echo".to_string()]);
    }

    #[test]
    fn missing_test_entries_decode_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.zip");
        let key = crypto::new_key(16);
        build_archive(&path, "hunter2", &key);

        let store = TestStore::open(&path).unwrap();
        let tests = store.tests("echo", 3, &key).unwrap();
        assert_eq!(tests.len(), 3);
        assert_eq!(tests[1].input, Vec::<u8>::new());
        assert_eq!(tests[2].output, Vec::<u8>::new());
    }
}
