//! Session registry (C7, spec §4.7): routes verdicts coming off the pool's
//! queues to the session that submitted the job they belong to.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::pool::Pool;
use crate::verdict::TaskVerdict;

/// A client's accumulated verdicts, kept sorted by id after every append so
/// readers never see a stale ordering (spec §4.7: "resorted by id after
/// each append, since id is monotonic across workers but delivery order is
/// not").
#[derive(Default)]
pub struct Session {
    submissions: Vec<TaskVerdict>,
    custom_tests: Vec<TaskVerdict>,
}

impl Session {
    fn push_submission(&mut self, verdict: TaskVerdict) {
        self.submissions.push(verdict);
        self.submissions.sort_by_key(|v| v.id);
    }

    fn push_custom_test(&mut self, verdict: TaskVerdict) {
        self.custom_tests.push(verdict);
        self.custom_tests.sort_by_key(|v| v.id);
    }

    pub fn submissions(&self) -> &[TaskVerdict] {
        &self.submissions
    }

    pub fn custom_tests(&self) -> &[TaskVerdict] {
        &self.custom_tests
    }

    pub fn submission_by_id(&self, id: u32) -> Option<&TaskVerdict> {
        self.submissions.iter().find(|v| v.id == id)
    }

    pub fn submissions_for_task(&self, task_name: &str) -> Vec<&TaskVerdict> {
        self.submissions.iter().filter(|v| v.task_name == task_name).collect()
    }
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(SessionRegistry {
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the session for `id`, creating an empty one on first access
    /// (spec §4.7: "created on first authenticated access").
    pub fn session(&self, session_id: &str) -> Arc<Mutex<Session>> {
        self.sessions
            .lock()
            .expect("session map poisoned")
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::default())))
            .clone()
    }

    /// Looks a session up without creating it; used by the verdict router,
    /// which must silently drop verdicts for sessions nobody is tracking.
    fn lookup(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.lock().expect("session map poisoned").get(session_id).cloned()
    }

    /// Releases a session's resources. Unknown ids are a no-op.
    pub fn logout(&self, session_id: &str) {
        self.sessions.lock().expect("session map poisoned").remove(session_id);
    }

    fn route_submission_verdict(&self, verdict: TaskVerdict) {
        match self.lookup(&verdict.session_id) {
            Some(session) => session.lock().expect("session poisoned").push_submission(verdict),
            None => debug!("dropping submission verdict for unknown session {}", verdict.session_id),
        }
    }

    fn route_custom_test_verdict(&self, verdict: TaskVerdict) {
        match self.lookup(&verdict.session_id) {
            Some(session) => session.lock().expect("session poisoned").push_custom_test(verdict),
            None => debug!("dropping custom test verdict for unknown session {}", verdict.session_id),
        }
    }
}

/// Spawns the background task that drains both of the pool's verdict queues
/// and files each verdict under its session (spec §4.7). Runs until both
/// queues close, i.e. until every worker has stopped.
pub fn spawn_verdict_router(registry: Arc<SessionRegistry>, pool: Arc<Pool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut submissions_open = true;
        let mut custom_tests_open = true;

        while submissions_open || custom_tests_open {
            tokio::select! {
                verdict = pool.next_verdict(), if submissions_open => {
                    match verdict {
                        Some(v) => registry.route_submission_verdict(v),
                        None => submissions_open = false,
                    }
                }
                verdict = pool.next_custom_test_verdict(), if custom_tests_open => {
                    match verdict {
                        Some(v) => registry.route_custom_test_verdict(v),
                        None => custom_tests_open = false,
                    }
                }
            }
        }
        warn!("verdict router: both queues closed, exiting");
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::SystemTime;

    fn verdict(id: u32, session_id: &str) -> TaskVerdict {
        TaskVerdict {
            id,
            session_id: session_id.to_string(),
            when: SystemTime::UNIX_EPOCH,
            task_name: "echo".into(),
            code_text: String::new(),
            language_info: String::new(),
            compilation: crate::verdict::CompilationKind::Success,
            batches: Vec::new(),
            error: false,
            extra: String::new(),
        }
    }

    #[test]
    fn unknown_session_drops_silently() {
        let registry = SessionRegistry::new();
        registry.route_submission_verdict(verdict(1, "ghost"));
        assert!(registry.lookup("ghost").is_none());
    }

    #[test]
    fn appends_stay_sorted_by_id() {
        let registry = SessionRegistry::new();
        let session = registry.session("alice");
        registry.route_submission_verdict(verdict(5, "alice"));
        registry.route_submission_verdict(verdict(2, "alice"));
        registry.route_submission_verdict(verdict(9, "alice"));

        let ids: Vec<u32> = session.lock().unwrap().submissions().iter().map(|v| v.id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
    }

    #[test]
    fn logout_drops_the_session() {
        let registry = SessionRegistry::new();
        registry.session("bob");
        registry.logout("bob");
        assert!(registry.lookup("bob").is_none());
    }
}
