//! Worker pool (C6, spec §4.6): a fixed set of workers, each pinned to one
//! sandbox id, pulling jobs off bounded FIFO queues.
//!
//! Every sandboxed run is a blocking syscall-heavy operation (clone, mount,
//! wait4), so each worker owns a plain OS thread rather than an async task;
//! the bounded `std::sync::mpsc` channels give backpressure without pulling
//! the sandbox itself onto the async runtime.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;

use crate::model::{CustomTest, Submission};
use crate::sandbox::SandboxCfg;
use crate::store::TestStore;
use crate::verdict::TaskVerdict;
use crate::worker::Worker;

/// Depth of every queue in the pool (spec §4.6).
const QUEUE_CAPACITY: usize = 100;

/// How long a worker waits on the custom-test queue before re-checking the
/// submission queue and the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct Pool {
    next_id: AtomicU32,
    /// `None` once `stop()` has run, so post-shutdown `submit*()` calls fail
    /// instead of silently queuing work no worker will ever dequeue.
    submission_tx: Mutex<Option<SyncSender<Submission>>>,
    custom_test_tx: Mutex<Option<SyncSender<CustomTest>>>,
    verdict_rx: Mutex<Receiver<TaskVerdict>>,
    custom_verdict_rx: Mutex<Receiver<TaskVerdict>>,
    shutdown: Arc<AtomicBool>,
}

impl Pool {
    /// Spawns `n_workers` OS threads, one per sandbox id `0..n_workers`.
    pub fn start(n_workers: u32, sandbox_cfg: SandboxCfg, store: Arc<TestStore>) -> Arc<Pool> {
        let (submission_tx, submission_rx) = sync_channel(QUEUE_CAPACITY);
        let (custom_test_tx, custom_test_rx) = sync_channel(QUEUE_CAPACITY);
        let (verdict_tx, verdict_rx) = sync_channel(QUEUE_CAPACITY);
        let (custom_verdict_tx, custom_verdict_rx) = sync_channel(QUEUE_CAPACITY);

        let submission_rx = Arc::new(Mutex::new(submission_rx));
        let custom_test_rx = Arc::new(Mutex::new(custom_test_rx));
        let shutdown = Arc::new(AtomicBool::new(false));

        for box_id in 0..n_workers {
            let submission_rx = submission_rx.clone();
            let custom_test_rx = custom_test_rx.clone();
            let verdict_tx = verdict_tx.clone();
            let custom_verdict_tx = custom_verdict_tx.clone();
            let store = store.clone();
            let sandbox_cfg = sandbox_cfg.clone();
            let shutdown = shutdown.clone();

            std::thread::spawn(move || {
                worker_loop(
                    box_id,
                    Worker::new(box_id, sandbox_cfg),
                    store,
                    submission_rx,
                    custom_test_rx,
                    verdict_tx,
                    custom_verdict_tx,
                    shutdown,
                )
            });
        }

        Arc::new(Pool {
            next_id: AtomicU32::new(1),
            submission_tx: Mutex::new(Some(submission_tx)),
            custom_test_tx: Mutex::new(Some(custom_test_tx)),
            verdict_rx: Mutex::new(verdict_rx),
            custom_verdict_rx: Mutex::new(custom_verdict_rx),
            shutdown,
        })
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Assigns an id and enqueues a submission; applies backpressure to the
    /// async caller without blocking the runtime's own threads. Fails with
    /// the submission handed back if the pool has been `stop()`ped.
    pub async fn submit(self: &Arc<Self>, mut submission: Submission) -> Result<u32, Submission> {
        let id = self.next_id();
        submission.id = id;
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let tx = this.submission_tx.lock().expect("submission sender poisoned");
            match tx.as_ref() {
                Some(tx) => tx.send(submission).map_err(|e| e.0),
                None => Err(submission),
            }
        })
        .await
        .expect("submission worker thread panicked")
        .map(|_| id)
    }

    pub async fn submit_custom_test(self: &Arc<Self>, mut test: CustomTest) -> Result<u32, CustomTest> {
        let id = self.next_id();
        test.id = id;
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let tx = this.custom_test_tx.lock().expect("custom test sender poisoned");
            match tx.as_ref() {
                Some(tx) => tx.send(test).map_err(|e| e.0),
                None => Err(test),
            }
        })
        .await
        .expect("custom test worker thread panicked")
        .map(|_| id)
    }

    /// Pulls the next available verdict for a regular submission. Verdicts
    /// from different workers may arrive out of submission-id order;
    /// callers that need total order re-sort by id (done in `session.rs`).
    pub async fn next_verdict(self: &Arc<Self>) -> Option<TaskVerdict> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.verdict_rx.lock().expect("verdict queue poisoned").recv().ok())
            .await
            .expect("verdict reader thread panicked")
    }

    pub async fn next_custom_test_verdict(self: &Arc<Self>) -> Option<TaskVerdict> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            this.custom_verdict_rx
                .lock()
                .expect("custom verdict queue poisoned")
                .recv()
                .ok()
        })
        .await
        .expect("custom verdict reader thread panicked")
    }

    /// Asks every worker to stop pulling new jobs once its current one (if
    /// any) finishes, and closes the inbound queues so any `submit*()` still
    /// in flight fails instead of enqueueing work nobody will ever dequeue.
    /// Does not interrupt a job already in flight.
    pub fn stop(&self) {
        info!("pool: shutting down");
        self.shutdown.store(true, Ordering::SeqCst);
        self.submission_tx.lock().expect("submission sender poisoned").take();
        self.custom_test_tx.lock().expect("custom test sender poisoned").take();
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    box_id: u32,
    worker: Worker,
    store: Arc<TestStore>,
    submission_rx: Arc<Mutex<Receiver<Submission>>>,
    custom_test_rx: Arc<Mutex<Receiver<CustomTest>>>,
    verdict_tx: SyncSender<TaskVerdict>,
    custom_verdict_tx: SyncSender<TaskVerdict>,
    shutdown: Arc<AtomicBool>,
) {
    info!("worker {box_id}: starting");

    while !shutdown.load(Ordering::SeqCst) {
        // Submissions always take priority over custom tests.
        let next_submission = submission_rx.lock().expect("submission queue poisoned").try_recv();
        if let Ok(submission) = next_submission {
            let verdict = worker.judge_submission(&submission, &store);
            if verdict_tx.send(verdict).is_err() {
                break;
            }
            continue;
        }

        let next_custom_test = custom_test_rx
            .lock()
            .expect("custom test queue poisoned")
            .recv_timeout(POLL_INTERVAL);
        match next_custom_test {
            Ok(test) => {
                let verdict = worker.judge_custom_test(&test);
                if custom_verdict_tx.send(verdict).is_err() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("worker {box_id}: stopped");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lang::Language;
    use std::time::SystemTime;

    fn empty_store() -> Arc<TestStore> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.zip");
        let file = std::fs::File::create(&path).unwrap();
        zip::ZipWriter::new(file).finish().unwrap();
        Arc::new(TestStore::open(&path).unwrap())
    }

    fn submission() -> Submission {
        Submission {
            id: 0,
            session_id: "s".into(),
            when: SystemTime::now(),
            task_ref: "echo".into(),
            code: Vec::new(),
            language: Language::C,
            key: Vec::new(),
        }
    }

    #[tokio::test]
    async fn submit_after_stop_fails_instead_of_enqueueing() {
        let pool = Pool::start(0, SandboxCfg::default(), empty_store());
        pool.stop();
        assert!(pool.submit(submission()).await.is_err());
    }

    #[tokio::test]
    async fn submit_before_stop_succeeds() {
        let pool = Pool::start(0, SandboxCfg::default(), empty_store());
        assert!(pool.submit(submission()).await.is_ok());
    }
}
