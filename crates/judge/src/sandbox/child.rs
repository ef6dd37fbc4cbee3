//! Everything that runs after the clone, inside the new namespaces, before
//! `exec` (spec §4.4.3 steps 1-6). Every fallible step here maps to one of
//! the reserved stage codes in [`super::STAGE_EXEC`] and friends.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::Path;

use nix::mount::{mount, MsFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::{self, Gid, Pid, Uid};

pub type StageResult = Result<(), String>;

struct BindRule {
    source: &'static str,
    target: &'static str,
    rw: bool,
    noexec: bool,
    dev: bool,
    optional: bool,
}

const BIND_RULES: &[BindRule] = &[
    BindRule { source: "box", target: "box", rw: true, noexec: false, dev: false, optional: false },
    BindRule { source: "bin", target: "bin", rw: false, noexec: false, dev: false, optional: false },
    BindRule { source: "dev", target: "dev", rw: false, noexec: false, dev: true, optional: false },
    BindRule { source: "lib", target: "lib", rw: false, noexec: false, dev: false, optional: false },
    BindRule { source: "lib64", target: "lib64", rw: false, noexec: false, dev: false, optional: true },
    BindRule { source: "proc", target: "proc", rw: false, noexec: false, dev: false, optional: false },
    BindRule { source: "usr", target: "usr", rw: false, noexec: false, dev: false, optional: false },
    BindRule { source: "etc", target: "etc", rw: false, noexec: false, dev: false, optional: false },
];

/// `chdir(box_path)`, rebuild `root/`, remount private, tmpfs + bind mounts,
/// then `chroot` into it and land in `/box`.
pub fn setup_root(box_path: &Path) -> StageResult {
    unistd::chdir(box_path).map_err(|e| e.to_string())?;

    let _ = std::fs::remove_dir_all("root");
    std::fs::create_dir("root").map_err(|e| e.to_string())?;

    mount::<str, str, str, str>(None, "/", None, MsFlags::MS_REC | MsFlags::MS_PRIVATE, None)
        .map_err(|e| e.to_string())?;

    mount(Some("none"), "root", Some("tmpfs"), MsFlags::empty(), Some("mode=755"))
        .map_err(|e| e.to_string())?;

    std::fs::create_dir("root/tmp").map_err(|e| e.to_string())?;

    for rule in BIND_RULES {
        let host_path = Path::new("/").join(rule.target);
        if !host_path.is_dir() {
            if rule.optional {
                continue;
            }
            return Err(format!("there is no {} directory", host_path.display()));
        }

        let mount_point = Path::new("root").join(rule.source);
        std::fs::create_dir_all(&mount_point).map_err(|e| e.to_string())?;

        let mut flags = MsFlags::empty();
        if !rule.rw {
            flags |= MsFlags::MS_RDONLY;
        }
        if rule.noexec {
            flags |= MsFlags::MS_NOEXEC;
        }
        if !rule.dev {
            flags |= MsFlags::MS_NODEV;
        }

        if rule.source == "proc" {
            mount(Some("none"), &mount_point, Some("proc"), flags, Some("hidepid=2"))
                .map_err(|e| e.to_string())?;
        } else {
            flags |= MsFlags::MS_BIND | MsFlags::MS_NOSUID;
            mount(Some(host_path.as_path()), &mount_point, None::<&str>, flags, None)
                .map_err(|e| e.to_string())?;
        }
    }

    unistd::chroot("root").map_err(|e| e.to_string())?;
    // cwd is still the pre-chroot `box_path`; this relative chdir lands in
    // the new root's /box without an intermediate chdir("/").
    unistd::chdir("root/box").map_err(|e| e.to_string())?;

    Ok(())
}

pub fn setup_rlimits(memory_limit_kb: Option<u64>, max_processes: Option<u32>) -> StageResult {
    if let Some(kb) = memory_limit_kb {
        let bytes = kb * 1024;
        setrlimit(Resource::RLIMIT_AS, bytes, bytes).map_err(|e| e.to_string())?;
    }

    setrlimit(Resource::RLIMIT_STACK, libc::RLIM_INFINITY, libc::RLIM_INFINITY)
        .map_err(|e| e.to_string())?;
    setrlimit(Resource::RLIMIT_NOFILE, 64, 64).map_err(|e| e.to_string())?;
    setrlimit(Resource::RLIMIT_MEMLOCK, 0, 0).map_err(|e| e.to_string())?;

    if let Some(n) = max_processes {
        setrlimit(Resource::RLIMIT_NPROC, n as u64, n as u64).map_err(|e| e.to_string())?;
    }

    Ok(())
}

pub fn setup_credentials(uid: u32, gid: u32) -> StageResult {
    unistd::setresgid(Gid::from_raw(gid), Gid::from_raw(gid), Gid::from_raw(gid))
        .map_err(|e| e.to_string())?;
    unistd::setgroups(&[]).map_err(|e| e.to_string())?;
    unistd::setresuid(Uid::from_raw(uid), Uid::from_raw(uid), Uid::from_raw(uid))
        .map_err(|e| e.to_string())?;
    unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(|e| e.to_string())?;
    Ok(())
}

/// Dups `files` (stdin, stdout, stderr, in order) into fds 0/1/2, skipping
/// over the error-pipe fd if it collides with a target slot, then closes
/// every other fd still open past that point.
pub fn setup_fds(files: [RawFd; 3], error_fd: RawFd) -> StageResult {
    let mut next = 0;
    for f in files {
        if next == error_fd {
            next += 1;
        }
        unistd::dup2(f, next).map_err(|e| e.to_string())?;
        next += 1;
    }

    for entry in std::fs::read_dir("/proc/self/fd").map_err(|e| e.to_string())? {
        let entry = entry.map_err(|e| e.to_string())?;
        if let Ok(fd) = entry.file_name().to_string_lossy().parse::<RawFd>() {
            if fd >= next && fd != error_fd {
                let _ = unistd::close(fd);
            }
        }
    }

    Ok(())
}

/// `exec(path, argv, env)`. Only returns on failure (`exec` never returns on
/// success); the reserved stage code is left to the caller.
pub fn exec(path: &str, argv: &[String], env: &[String]) -> StageResult {
    let to_cstring = |s: &str| CString::new(s).map_err(|e| e.to_string());
    let path = to_cstring(path)?;
    let argv: Vec<CString> = argv.iter().map(|s| to_cstring(s)).collect::<Result<_, _>>()?;
    let env: Vec<CString> = env.iter().map(|s| to_cstring(s)).collect::<Result<_, _>>()?;

    unistd::execve(&path, &argv, &env).map_err(|e| e.to_string())?;
    unreachable!("execve returns only on error, which is mapped above")
}
