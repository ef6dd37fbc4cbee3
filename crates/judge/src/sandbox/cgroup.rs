//! Minimal cgroup v1 plumbing: memory, cpuacct and cpuset controllers only,
//! enough for accounting and a memory ceiling (spec §4.4.2, §4.4.3, §9).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::Error;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const CONTROLLERS: [&str; 3] = ["memory", "cpuacct", "cpuset"];

/// Probes the hard-coded subset of controllers spec.md §9 names. A stricter
/// implementation would probe exactly the controllers it intends to use;
/// this mirrors the original's coarser check.
pub fn preflight() -> Result<(), Error> {
    for dir in [""].iter().chain(CONTROLLERS.iter()) {
        let path = Path::new(CGROUP_ROOT).join(dir);
        let meta = fs::metadata(&path)
            .map_err(|e| Error::Cgroup(format!("{}: {e}", path.display())))?;
        if !meta.is_dir() {
            return Err(Error::Cgroup(format!("{} is not a directory", path.display())));
        }
    }
    Ok(())
}

/// Adds the calling process to an existing cgroup by name. Called from
/// inside the freshly cloned child, which only knows the cgroup's name, not
/// the parent's `BoxCgroup` handle.
pub fn add_self(name: &str) -> Result<(), Error> {
    for controller in CONTROLLERS {
        let path = Path::new(CGROUP_ROOT).join(controller).join(name);
        write_attr(&path, "tasks", &std::process::id().to_string())?;
    }
    Ok(())
}

pub struct BoxCgroup {
    name: String,
    paths: Vec<PathBuf>,
}

impl BoxCgroup {
    pub fn create(name: &str) -> Result<Self, Error> {
        let mut paths = Vec::with_capacity(CONTROLLERS.len());
        for controller in CONTROLLERS {
            let path = Path::new(CGROUP_ROOT).join(controller).join(name);
            fs::create_dir(&path)
                .map_err(|e| Error::Cgroup(format!("creating {}: {e}", path.display())))?;
            if controller == "cpuset" {
                inherit(&path, "cpuset.cpus")?;
                inherit(&path, "cpuset.mems")?;
            }
            paths.push(path);
        }
        Ok(BoxCgroup {
            name: name.to_string(),
            paths,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn controller_path(&self, controller: &str) -> PathBuf {
        Path::new(CGROUP_ROOT).join(controller).join(&self.name)
    }

    pub fn set_memory_limit_kb(&self, kb: u64) -> Result<(), Error> {
        let bytes = kb * 1024;
        let dir = self.controller_path("memory");
        write_attr(&dir, "memory.limit_in_bytes", &bytes.to_string())?;
        // Best-effort: swap accounting isn't always compiled in.
        let _ = write_attr(&dir, "memory.memsw.limit_in_bytes", &bytes.to_string());
        Ok(())
    }

    pub fn add_process(&self, pid: i32) -> Result<(), Error> {
        for path in &self.paths {
            write_attr(path, "tasks", &pid.to_string())?;
        }
        Ok(())
    }

    /// `(cpu_time, memory_kb)`, preferring `memory.memsw` over plain memory
    /// when it reports a larger figure, matching the original's behavior.
    pub fn stats(&self) -> Option<(Duration, u64)> {
        let cpu_ns: u64 = read_attr(&self.controller_path("cpuacct"), "cpuacct.usage")?
            .trim()
            .parse()
            .ok()?;
        let mem_dir = self.controller_path("memory");
        let mem_bytes: u64 = read_attr(&mem_dir, "memory.max_usage_in_bytes")?
            .trim()
            .parse()
            .unwrap_or(0);
        let swap_bytes: u64 = read_attr(&mem_dir, "memory.memsw.max_usage_in_bytes")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        let memory_kb = (mem_bytes.max(swap_bytes)) >> 10;
        Some((Duration::from_nanos(cpu_ns), memory_kb))
    }
}

impl Drop for BoxCgroup {
    fn drop(&mut self) {
        for path in &self.paths {
            let _ = fs::remove_dir(path);
        }
    }
}

fn inherit(child: &Path, attr: &str) -> Result<(), Error> {
    let parent = child
        .parent()
        .ok_or_else(|| Error::Cgroup("cgroup path has no parent".into()))?;
    let value = read_attr(parent, attr).unwrap_or_default();
    write_attr(child, attr, value.trim())
}

fn write_attr(dir: &Path, attr: &str, value: &str) -> Result<(), Error> {
    fs::write(dir.join(attr), value)
        .map_err(|e| Error::Cgroup(format!("writing {}/{attr}: {e}", dir.display())))
}

fn read_attr(dir: &Path, attr: &str) -> Option<String> {
    fs::read_to_string(dir.join(attr)).ok()
}
