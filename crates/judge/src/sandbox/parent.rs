//! The tick-driven watcher loop that runs in the box's owning worker after
//! the clone (spec §4.4.3 "Parent monitoring loop", §9 "single-threaded
//! event loop per worker is sufficient").

use std::sync::mpsc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use super::cgroup::BoxCgroup;
use super::result::{BoxResult, BoxStatus};

struct WaitOutcome {
    status: i32,
    rusage: libc::rusage,
}

fn tick_duration() -> Duration {
    let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    let ticks_per_sec = if ticks_per_sec > 0 { ticks_per_sec as u32 } else { 100 };
    Duration::from_secs(1) / ticks_per_sec
}

/// Blocking `wait4` for `pid`, run on a dedicated thread so the tick loop
/// can keep polling limits in the meantime.
fn spawn_waiter(pid: i32) -> mpsc::Receiver<std::io::Result<WaitOutcome>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut status: libc::c_int = 0;
        let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::wait4(pid, &mut status, 0, &mut rusage) };
        let outcome = if ret == pid {
            Ok(WaitOutcome { status, rusage })
        } else {
            Err(std::io::Error::last_os_error())
        };
        let _ = tx.send(outcome);
    });
    rx
}

fn rusage_accounting(rusage: &libc::rusage) -> (Duration, u64) {
    let utime = Duration::new(rusage.ru_utime.tv_sec as u64, rusage.ru_utime.tv_usec as u32 * 1000);
    let stime = Duration::new(rusage.ru_stime.tv_sec as u64, rusage.ru_stime.tv_usec as u32 * 1000);
    // ru_maxrss is already in KiB on Linux.
    (utime + stime, rusage.ru_maxrss as u64)
}

/// `/proc/<pid>/stat` fallback used mid-run, before a final rusage exists:
/// fields `utime`[14], `stime`[13], `rss`[24] (1-indexed in the proc(5)
/// doc; 0-indexed slice positions 13/12/23 as read here after splitting on
/// the first space-delimited run past the `(comm)` field).
fn proc_stat_accounting(pid: i32) -> Option<(Duration, u64)> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let after_comm = contents.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // fields[0] here is proc(5) field 3 (state); utime/stime are fields
    // 14/13, i.e. indices 11/10 in this 0-based, comm-stripped slice.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(10)?.parse().ok()?;
    let rss_pages: u64 = fields.get(21)?.parse().ok()?;

    let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK).max(1) } as u64;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE).max(1) } as u64;

    let cpu_time = Duration::from_secs_f64((utime + stime) as f64 / ticks_per_sec as f64);
    let memory_kb = (rss_pages * page_size) >> 10;
    Some((cpu_time, memory_kb))
}

fn accounting(pid: i32, cgroup: Option<&BoxCgroup>, rusage: Option<&libc::rusage>) -> (Duration, u64) {
    if let Some(cgroup) = cgroup {
        if let Some(stats) = cgroup.stats() {
            return stats;
        }
    }
    if let Some(rusage) = rusage {
        return rusage_accounting(rusage);
    }
    proc_stat_accounting(pid).unwrap_or_default()
}

/// SIGKILLs the child and its process group.
fn end(pid: i32) {
    let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
}

pub fn run_parent(
    pid: i32,
    cgroup: Option<&BoxCgroup>,
    cpu_time_limit: Duration,
    wall_time_limit: Duration,
    mut read_error_byte: impl FnMut() -> Option<u8>,
) -> BoxResult {
    let start = Instant::now();
    let waiter = spawn_waiter(pid);
    let tick = tick_duration();

    loop {
        match waiter.recv_timeout(tick) {
            Ok(Ok(outcome)) => {
                let wall_time = start.elapsed();
                let (cpu_time, memory_kb) = accounting(pid, cgroup, Some(&outcome.rusage));

                let status = WaitStatus::from_raw(Pid::from_raw(pid), outcome.status)
                    .unwrap_or(WaitStatus::StillAlive);

                return match status {
                    WaitStatus::Exited(_, 42) => {
                        let stage = read_error_byte().unwrap_or(0);
                        BoxResult {
                            status: Some(BoxStatus::Error),
                            cpu_time,
                            wall_time,
                            memory_kb,
                            error_message: Some(format!("runChild returned error code: {stage}")),
                            ..Default::default()
                        }
                    }
                    WaitStatus::Exited(_, code) => BoxResult {
                        status: Some(if code == 0 { BoxStatus::Ok } else { BoxStatus::Exited }),
                        cpu_time,
                        wall_time,
                        memory_kb,
                        exit_code: Some(code),
                        ..Default::default()
                    },
                    WaitStatus::Signaled(_, signal, _) | WaitStatus::Stopped(_, signal) => BoxResult {
                        status: Some(BoxStatus::Signaled),
                        cpu_time,
                        wall_time,
                        memory_kb,
                        signal: Some(signal as i32),
                        ..Default::default()
                    },
                    other => BoxResult::error(format!("wait4: unexpected status {other:?}")),
                };
            }
            Ok(Err(e)) => return BoxResult::error(format!("wait4: {e}")),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let (cpu_time, memory_kb) = accounting(pid, cgroup, None);
                let wall_time = start.elapsed();

                if wall_time_limit > Duration::ZERO && wall_time > wall_time_limit {
                    end(pid);
                    return BoxResult {
                        status: Some(BoxStatus::WallTimeout),
                        cpu_time,
                        wall_time,
                        memory_kb,
                        ..Default::default()
                    };
                }
                if cpu_time_limit > Duration::ZERO && cpu_time > cpu_time_limit {
                    end(pid);
                    return BoxResult {
                        status: Some(BoxStatus::CpuTimeout),
                        cpu_time,
                        wall_time,
                        memory_kb,
                        ..Default::default()
                    };
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return BoxResult::error("waiter thread vanished without a result");
            }
        }
    }
}
