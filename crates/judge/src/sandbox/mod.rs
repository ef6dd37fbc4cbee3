//! The sandbox (C4, spec §4.4) — the hard core. One-shot isolated process
//! execution with resource accounting, grounded in the prior
//! implementation's `isolate.go` (a Go port of `ioi/isolate`) and expressed
//! with `nix`/`libc` instead of raw syscalls.

mod cgroup;
mod child;
mod parent;
mod result;

pub use config::{Io, RunConfig, SandboxCfg};
pub use result::{BoxResult, BoxStatus};

pub mod config;

use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::process::Command;

use nix::sched::{clone, CloneFlags};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chown, Gid, Uid};
use thiserror::Error;

use cgroup::BoxCgroup;

#[derive(Debug, Error)]
pub enum Error {
    #[error("box id {0} is out of range")]
    InvalidBoxId(u32),
    #[error("sandbox must run as root (uid/gid 0)")]
    NotRoot,
    #[error("cgroup error: {0}")]
    Cgroup(String),
    #[error("sandbox setup failed: {0}")]
    Setup(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

/// Reserved stage codes the child writes to the error pipe on failure
/// (spec §4.4.4).
mod stage {
    pub const CGROUP: u8 = 1;
    pub const ROOT: u8 = 2;
    pub const RLIMITS: u8 = 3;
    pub const CREDENTIALS: u8 = 4;
    pub const FDS: u8 = 5;
    pub const EXEC: u8 = 6;
}

const CHILD_STACK_SIZE: usize = 1 << 20;

pub struct Sandbox {
    pub id: u32,
    box_path: PathBuf,
    box_img: PathBuf,
    uid: u32,
    gid: u32,
}

impl Sandbox {
    /// Materializes a fresh ext4 loopback image mounted at `box_root/<id>/box`.
    pub fn open(id: u32, cfg: &SandboxCfg) -> Result<Self, Error> {
        if id >= cfg.n_boxes {
            return Err(Error::InvalidBoxId(id));
        }
        require_root()?;
        let _ = umask(Mode::from_bits_truncate(0o077));

        let box_path = cfg.box_root.join(id.to_string());
        let box_img = cfg.box_root.join(format!("{id}.img"));

        let sandbox = Sandbox {
            id,
            box_path: box_path.clone(),
            box_img: box_img.clone(),
            uid: cfg.first_uid + id,
            gid: cfg.first_gid + id,
        };

        let _ = std::fs::remove_dir_all(&box_path);
        let _ = std::fs::remove_file(&box_img);
        std::fs::create_dir_all(&cfg.box_root)?;

        let image = std::fs::File::create(&box_img)?;
        image.set_len(cfg.image_size_bytes)?;
        drop(image);

        let status = Command::new("mkfs.ext4")
            .args(["-O", "^has_journal", "-q"])
            .arg(&box_img)
            .status();
        if !matches!(status, Ok(s) if s.success()) {
            sandbox.clear();
            return Err(Error::Setup("mkfs.ext4 failed".into()));
        }

        if std::fs::create_dir(&box_path).is_err() {
            sandbox.clear();
            return Err(Error::Setup(format!("creating {}", box_path.display())));
        }
        let inner = box_path.join("box");
        if std::fs::create_dir(&inner).is_err() {
            sandbox.clear();
            return Err(Error::Setup(format!("creating {}", inner.display())));
        }

        let status = Command::new("mount")
            .args(["-o", "loop,rw,usrquota,grpquota"])
            .arg(&box_img)
            .arg(&inner)
            .status();
        if !matches!(status, Ok(s) if s.success()) {
            sandbox.clear();
            return Err(Error::Setup("mount failed".into()));
        }

        chown(&inner, Some(Uid::current()), Some(Gid::current()))?;

        Ok(sandbox)
    }

    /// Unmounts and removes the box directory and image. Tolerates "not
    /// mounted"/"does not exist" so it is safe on every exit path.
    pub fn clear(&self) {
        let _ = Command::new("umount").arg(self.box_path.join("box")).status();
        let _ = std::fs::remove_dir_all(&self.box_path);
        let _ = std::fs::remove_file(&self.box_img);
    }

    pub fn box_dir(&self) -> PathBuf {
        self.box_path.join("box")
    }

    /// Runs one program to completion inside this box. Reuses the box's
    /// filesystem image; does not tear it down (that's `clear`).
    pub fn run(&self, config: RunConfig) -> BoxResult {
        if let Err(e) = require_root() {
            return BoxResult::error(e.to_string());
        }
        let _ = umask(Mode::from_bits_truncate(0o077));

        if config.enable_cgroups {
            if let Err(e) = cgroup::preflight() {
                return BoxResult::error(e.to_string());
            }
        }

        if let Err(e) = chown_recursive(&self.box_dir(), Uid::from_raw(self.uid), Gid::from_raw(self.gid)) {
            return BoxResult::error(e.to_string());
        }

        let stdin = match prepare_stream(config.stdin) {
            Ok(s) => s,
            Err(e) => return BoxResult::error(e.to_string()),
        };
        let stdout = match prepare_stream(config.stdout) {
            Ok(s) => s,
            Err(e) => return BoxResult::error(e.to_string()),
        };
        let stderr = match prepare_stream(config.stderr) {
            Ok(s) => s,
            Err(e) => return BoxResult::error(e.to_string()),
        };

        let (err_r, err_w) = match nix::unistd::pipe() {
            Ok(fds) => fds,
            Err(e) => return BoxResult::error(e.to_string()),
        };

        let cgroup = if config.enable_cgroups {
            let name = format!("box-{}-{}", self.id, rand::random::<u32>());
            match BoxCgroup::create(&name) {
                Ok(c) => {
                    if let Some(kb) = config.memory_limit_kb {
                        if let Err(e) = c.set_memory_limit_kb(kb) {
                            return BoxResult::error(e.to_string());
                        }
                    }
                    Some(c)
                }
                Err(e) => return BoxResult::error(e.to_string()),
            }
        } else {
            None
        };
        let box_path = self.box_dir();
        let uid = self.uid;
        let gid = self.gid;
        let memory_limit_kb = config.memory_limit_kb;
        let max_processes = config.max_processes;
        let mut env = config.env.clone();
        env.push("LIBC_FATAL_STDERR_=1".to_string());
        let path = config.path.clone();
        let argv = {
            let mut a = vec![config.path.clone()];
            a.extend(config.argv.clone());
            a
        };
        let enable_cgroups = config.enable_cgroups;
        let cgroup_join_name = cgroup.as_ref().map(|c| c.name().to_string());
        let files = [stdin.child_fd, stdout.child_fd, stderr.child_fd];

        let mut child_stack = vec![0u8; CHILD_STACK_SIZE];
        let child_fn = Box::new(move || -> isize {
            let fail = |code: u8| -> isize {
                let _ = nix::unistd::write(err_w, &[code]);
                std::process::exit(42);
            };

            if enable_cgroups {
                if let Some(name) = &cgroup_join_name {
                    if cgroup::add_self(name).is_err() {
                        return fail(stage::CGROUP);
                    }
                }
            }
            if child::setup_root(&box_path).is_err() {
                return fail(stage::ROOT);
            }
            if child::setup_rlimits(memory_limit_kb, max_processes).is_err() {
                return fail(stage::RLIMITS);
            }
            if child::setup_credentials(uid, gid).is_err() {
                return fail(stage::CREDENTIALS);
            }
            if child::setup_fds(files, err_w).is_err() {
                return fail(stage::FDS);
            }
            let _ = child::exec(&path, &argv, &env);
            fail(stage::EXEC)
        });

        let clone_result = unsafe {
            clone(
                child_fn,
                &mut child_stack,
                CloneFlags::CLONE_NEWIPC
                    | CloneFlags::CLONE_NEWNET
                    | CloneFlags::CLONE_NEWNS
                    | CloneFlags::CLONE_NEWPID,
                Some(libc::SIGCHLD),
            )
        };

        let _ = nix::unistd::close(err_w);
        for fd in [stdin.parent_close_fd, stdout.parent_close_fd, stderr.parent_close_fd]
            .into_iter()
            .flatten()
        {
            let _ = nix::unistd::close(fd);
        }

        let pid = match clone_result {
            Ok(pid) => pid,
            Err(e) => return BoxResult::error(format!("clone failed: {e}")),
        };

        let mut result = parent::run_parent(
            pid.as_raw(),
            cgroup.as_ref(),
            config.cpu_time_limit,
            config.wall_time_limit,
            || {
                let mut buf = [0u8; 1];
                match nix::unistd::read(err_r, &mut buf) {
                    Ok(1) => Some(buf[0]),
                    _ => None,
                }
            },
        );

        let mut copy_error: Option<String> = None;
        for thread in [stdin.copy_thread, stdout.copy_thread, stderr.copy_thread]
            .into_iter()
            .flatten()
        {
            if let Ok(Err(e)) = thread.join() {
                if e.kind() != std::io::ErrorKind::BrokenPipe && copy_error.is_none() {
                    copy_error = Some(e.to_string());
                }
            }
        }
        let _ = nix::unistd::close(err_r);

        if result.status() != BoxStatus::Error {
            if let Some(e) = copy_error {
                result = BoxResult::error(e);
            }
        }

        let _ = pid; // silence unused warning on platforms without PID reuse oddities
        result
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.clear();
    }
}

fn require_root() -> Result<(), Error> {
    if !Uid::effective().is_root() || Gid::effective().as_raw() != 0 {
        return Err(Error::NotRoot);
    }
    Ok(())
}

fn chown_recursive(dir: &std::path::Path, uid: Uid, gid: Gid) -> Result<(), Error> {
    chown(dir, Some(uid), Some(gid))?;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            chown_recursive(&path, uid, gid)?;
        } else {
            chown(&path, Some(uid), Some(gid))?;
        }
    }
    Ok(())
}

struct PreparedStream {
    child_fd: RawFd,
    parent_close_fd: Option<RawFd>,
    copy_thread: Option<std::thread::JoinHandle<std::io::Result<()>>>,
}

fn prepare_stream(io: Io) -> Result<PreparedStream, Error> {
    match io {
        Io::Null => {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/null")?;
            let fd = std::os::unix::io::IntoRawFd::into_raw_fd(file);
            Ok(PreparedStream {
                child_fd: fd,
                parent_close_fd: Some(fd),
                copy_thread: None,
            })
        }
        Io::File(file) => {
            let fd = std::os::unix::io::IntoRawFd::into_raw_fd(file);
            Ok(PreparedStream {
                child_fd: fd,
                parent_close_fd: Some(fd),
                copy_thread: None,
            })
        }
        Io::Bytes(data) => {
            let (read_fd, write_fd) = nix::unistd::pipe()?;
            let thread = std::thread::spawn(move || -> std::io::Result<()> {
                use std::io::Write;
                let mut writer = unsafe {
                    <std::fs::File as std::os::unix::io::FromRawFd>::from_raw_fd(write_fd)
                };
                let res = writer.write_all(&data);
                drop(writer);
                res
            });
            Ok(PreparedStream {
                child_fd: read_fd,
                parent_close_fd: Some(read_fd),
                copy_thread: Some(thread),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn invalid_box_id_is_rejected() {
        let cfg = SandboxCfg {
            n_boxes: 2,
            ..Default::default()
        };
        assert!(matches!(Sandbox::open(5, &cfg), Err(Error::InvalidBoxId(5))));
    }
}
