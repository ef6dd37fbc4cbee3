//! Archive builder (spec §6 "Builder"), grounded in the prior
//! implementation's `database_build.go`: walks a source tree and writes the
//! zip archive `TestStore` reads.
//!
//! Source layout (not part of the runtime core, only this tool):
//! `contests.yml` at the root, and one subdirectory per task holding
//! `task.yml`, an optional `statements/` directory, and a `tests/` directory
//! of `<i>.in`/`<i>.out` pairs.

use std::error::Error;
use std::fs;
use std::io::Write;
use std::path::Path;

use arbiter_judge::crypto;
use arbiter_judge::model::{Contest, Task};

const KEY_LEN: usize = 16;

pub fn run(source: &str, output: &str, password: Option<String>, save_pass: bool) -> Result<(), Box<dyn Error>> {
    let source = Path::new(source);
    let contests: Vec<Contest> = serde_yaml::from_str(&fs::read_to_string(source.join("contests.yml"))?)?;

    let password = match password {
        Some(p) if p.len() == KEY_LEN => p,
        Some(p) => return Err(format!("password must be exactly {KEY_LEN} bytes, got {}", p.len()).into()),
        None => String::from_utf8(crypto::new_key(KEY_LEN)).expect("alphabet is ASCII"),
    };
    log::info!("archive will be encrypted with key '{password}' (write it down)");
    if save_pass {
        fs::write("pass", &password)?;
    }

    let file = fs::File::create(output)?;
    let mut zip = zip::ZipWriter::new(file);
    let stored = zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);

    let hash = bcrypt::hash(&password, 14)?;
    zip.start_file("hash", stored)?;
    zip.write_all(hash.as_bytes())?;

    zip.start_file("contests.json", stored)?;
    zip.write_all(&serde_json::to_vec(&contests)?)?;

    let mut tasks = Vec::new();
    for entry in walkdir::WalkDir::new(source).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let task_dir = entry.into_path();
        let task_yaml_path = task_dir.join("task.yml");
        if !task_yaml_path.exists() {
            continue;
        }

        let task: Task = serde_yaml::from_str(&fs::read_to_string(&task_yaml_path)?)?;
        log::info!("packing task '{}' ({} tests)", task.name, task.n_tests);

        for (file_name, entry_name) in [
            ("statement.html", "statements/statement.html"),
            ("statement.pdf", "statements/statement.pdf"),
        ] {
            let path = task_dir.join("statements").join(file_name);
            if let Ok(raw) = fs::read(&path) {
                seal_and_write(&mut zip, &format!("{}/{entry_name}", task.name), &raw, password.as_bytes())?;
            }
        }

        for i in 0..task.n_tests {
            for (suffix, ext) in [("in", "in"), ("out", "out")] {
                let path = task_dir.join("tests").join(format!("{i}.{suffix}"));
                let raw = fs::read(&path)
                    .map_err(|e| format!("reading {}: {e}", path.display()))?;
                seal_and_write(&mut zip, &format!("{}/tests/{i}.{ext}", task.name), &raw, password.as_bytes())?;
            }
        }

        tasks.push(task);
    }

    zip.start_file("tasks.json", stored)?;
    zip.write_all(&serde_json::to_vec(&tasks)?)?;

    zip.finish()?;
    Ok(())
}

fn seal_and_write<W: std::io::Write + std::io::Seek>(
    zip: &mut zip::ZipWriter<W>,
    entry_name: &str,
    raw: &[u8],
    key: &[u8],
) -> Result<(), Box<dyn Error>> {
    let sealed = crypto::encrypt(&crypto::compress(raw), key)?;
    let options = zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    zip.start_file(entry_name, options)?;
    zip.write_all(&sealed)?;
    Ok(())
}
