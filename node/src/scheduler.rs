use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

const CLAIM_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One submitted job and everything that happened to it. Transitions
/// are monotonic: pending -> running -> completed | failed.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub spec: Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// What an executor hands back. Failure is data, never a panic or an
/// error type - the job record carries it to the caller.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionOutcome {
    pub fn success(stdout: String) -> Self {
        Self {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: String) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr,
        }
    }
}

pub type ExecutorFn = Arc<dyn Fn(&Value) -> ExecutionOutcome + Send + Sync>;

#[derive(Default)]
struct SchedulerInner {
    jobs: HashMap<String, JobRecord>,
    queue: VecDeque<String>,
}

/// Unbounded in-memory FIFO of jobs with a single claim-and-run worker.
///
/// The claim is exclusive: a job leaves the queue and flips to
/// `running` inside one critical section, so no two readers ever see it
/// as claimable at once. Executors run outside every lock.
pub struct Scheduler {
    inner: Mutex<SchedulerInner>,
    executors: RwLock<HashMap<String, ExecutorFn>>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SchedulerInner::default()),
            executors: RwLock::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Plug in an executor for a job type. Later registrations replace
    /// earlier ones.
    pub fn register_executor(&self, job_type: &str, executor: ExecutorFn) {
        self.executors
            .write()
            .insert(job_type.to_string(), executor);
    }

    pub fn executor_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Queue a job. The returned id is caller-supplied when given,
    /// otherwise a fresh v4 uuid.
    pub fn submit(&self, job_type: &str, spec: Value, id: Option<String>) -> String {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let record = JobRecord {
            id: id.clone(),
            job_type: job_type.to_string(),
            spec,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            exit_code: None,
            stdout: None,
            stderr: None,
            completed_at: None,
        };

        let mut inner = self.inner.lock();
        inner.jobs.insert(id.clone(), record);
        inner.queue.push_back(id.clone());
        debug!(job = %id, %job_type, "job queued");
        id
    }

    pub fn get(&self, id: &str) -> Option<JobRecord> {
        self.inner.lock().jobs.get(id).cloned()
    }

    /// Every job record, oldest first.
    pub fn list(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.inner.lock().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    pub fn counts(&self) -> HashMap<&'static str, usize> {
        let inner = self.inner.lock();
        let mut counts = HashMap::from([
            ("pending", 0),
            ("running", 0),
            ("completed", 0),
            ("failed", 0),
        ]);
        for job in inner.jobs.values() {
            let key = match job.status {
                JobStatus::Pending => "pending",
                JobStatus::Running => "running",
                JobStatus::Completed => "completed",
                JobStatus::Failed => "failed",
            };
            *counts.get_mut(key).expect("all statuses counted") += 1;
        }
        counts
    }

    /// Start the worker thread.
    pub fn start(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        let handle = thread::Builder::new()
            .name("scheduler-worker".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    if !scheduler.run_next() {
                        thread::sleep(CLAIM_POLL);
                    }
                }
            })
            .expect("spawning the scheduler worker cannot fail");
        *self.worker.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    /// Claim and run the oldest pending job. Returns false when the
    /// queue was empty.
    fn run_next(&self) -> bool {
        let claimed = {
            let mut inner = self.inner.lock();
            loop {
                let Some(id) = inner.queue.pop_front() else {
                    break None;
                };
                match inner.jobs.get_mut(&id) {
                    Some(job) if job.status == JobStatus::Pending => {
                        job.status = JobStatus::Running;
                        break Some((id, job.job_type.clone(), job.spec.clone()));
                    }
                    // Dropped or already handled; keep draining.
                    _ => continue,
                }
            }
        };

        let Some((id, job_type, spec)) = claimed else {
            return false;
        };

        let executor = self.executors.read().get(&job_type).cloned();
        let outcome = match executor {
            Some(executor) => executor(&spec),
            None => {
                warn!(job = %id, %job_type, "no executor for job type");
                ExecutionOutcome::failure(1, format!("unknown job type: {job_type}"))
            }
        };

        let mut inner = self.inner.lock();
        if let Some(job) = inner.jobs.get_mut(&id) {
            job.exit_code = Some(outcome.exit_code);
            job.stdout = Some(outcome.stdout);
            job.stderr = Some(outcome.stderr);
            job.completed_at = Some(Utc::now());
            job.status = if outcome.exit_code == 0 {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            };
            info!(job = %id, %job_type, exit_code = outcome.exit_code, "job finished");
        }
        true
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn wait_terminal(scheduler: &Scheduler, id: &str) -> JobRecord {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(job) = scheduler.get(id) {
                if matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
                    return job;
                }
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("job {id} never reached a terminal state");
    }

    #[test]
    fn submit_runs_through_registered_executor() {
        let scheduler = Arc::new(Scheduler::new());
        scheduler.register_executor(
            "echo",
            Arc::new(|spec| ExecutionOutcome::success(spec["message"].to_string())),
        );
        scheduler.start();

        let id = scheduler.submit("echo", serde_json::json!({"message": "hi"}), None);
        let job = wait_terminal(&scheduler, &id);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.exit_code, Some(0));
        assert!(job.stdout.unwrap().contains("hi"));
        assert!(job.completed_at.is_some());
        scheduler.stop();
    }

    #[test]
    fn unknown_job_type_fails_with_exit_one() {
        let scheduler = Arc::new(Scheduler::new());
        scheduler.start();

        let id = scheduler.submit("teleport", Value::Null, None);
        let job = wait_terminal(&scheduler, &id);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.exit_code, Some(1));
        assert!(job.stderr.unwrap().contains("unknown job type"));
        scheduler.stop();
    }

    #[test]
    fn jobs_run_in_submission_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let scheduler = Arc::new(Scheduler::new());
        let seen = Arc::clone(&order);
        scheduler.register_executor(
            "trace",
            Arc::new(move |spec| {
                seen.lock().push(spec["n"].as_i64().unwrap());
                ExecutionOutcome::success(String::new())
            }),
        );

        let ids: Vec<String> = (0..5)
            .map(|n| scheduler.submit("trace", serde_json::json!({ "n": n }), None))
            .collect();
        scheduler.start();
        for id in &ids {
            wait_terminal(&scheduler, id);
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        scheduler.stop();
    }

    #[test]
    fn caller_supplied_id_is_kept() {
        let scheduler = Scheduler::new();
        let id = scheduler.submit("x", Value::Null, Some("job-42".to_string()));
        assert_eq!(id, "job-42");
        assert_eq!(scheduler.get("job-42").unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn counts_track_statuses() {
        let scheduler = Arc::new(Scheduler::new());
        scheduler.register_executor(
            "ok",
            Arc::new(|_| ExecutionOutcome::success(String::new())),
        );
        scheduler.register_executor(
            "bad",
            Arc::new(|_| ExecutionOutcome::failure(3, "boom".to_string())),
        );
        scheduler.start();

        let ok = scheduler.submit("ok", Value::Null, None);
        let bad = scheduler.submit("bad", Value::Null, None);
        wait_terminal(&scheduler, &ok);
        wait_terminal(&scheduler, &bad);

        let counts = scheduler.counts();
        assert_eq!(counts["completed"], 1);
        assert_eq!(counts["failed"], 1);
        assert_eq!(counts["pending"], 0);
        scheduler.stop();
    }
}
