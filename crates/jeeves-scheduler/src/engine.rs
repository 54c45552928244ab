use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::schedule::next_run_at;
use crate::store::JobStore;
use crate::types::{CronJob, JobStatus};

/// Sleep ceiling while no job is armed; mutations wake the loop earlier.
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

/// Runs one agent turn for a synthetic user message. Implemented by the
/// daemon over the agent loop + agent lock; the scheduler and heartbeat
/// only see this seam.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, session_key: &str, message: &str) -> anyhow::Result<String>;
}

/// Receives every due job, one at a time. The owner's handler acquires the
/// agent lock, runs the loop with `session_key = cron_<jobId>` and the job's
/// message, and forwards the reply to the outbound channel if configured.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn on_job_due(&self, job: &CronJob) -> anyhow::Result<()>;
}

/// Drives the job store: one pending timer armed for the soonest enabled
/// `next_run_at_ms`; on fire, every due job runs sequentially, state is
/// persisted per mutation, and the timer is re-armed.
pub struct CronScheduler {
    store: Arc<JobStore>,
    handler: Arc<dyn JobHandler>,
    stop_tx: watch::Sender<bool>,
}

impl CronScheduler {
    pub fn new(store: Arc<JobStore>, handler: Arc<dyn JobHandler>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            store,
            handler,
            stop_tx,
        }
    }

    /// Spawn the tick loop. The handle resolves after [`CronScheduler::stop`].
    pub fn start(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let handler = self.handler.clone();
        let stop_rx = self.stop_tx.subscribe();
        tokio::spawn(run_loop(store, handler, stop_rx))
    }

    /// Stop the loop. An in-flight job callback completes; no further timers
    /// are armed.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

async fn run_loop(store: Arc<JobStore>, handler: Arc<dyn JobHandler>, mut stop_rx: watch::Receiver<bool>) {
    info!("cron scheduler started");
    loop {
        if *stop_rx.borrow() {
            break;
        }

        let deadline_ms = soonest_deadline(&store);
        let sleep_for = match deadline_ms {
            Some(ms) => {
                let delta = ms - Utc::now().timestamp_millis();
                Duration::from_millis(delta.max(0) as u64)
            }
            None => IDLE_SLEEP,
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {
                if deadline_ms.is_some() {
                    fire_due(&store, handler.as_ref(), Utc::now()).await;
                }
            }
            _ = store.changed().notified() => {
                debug!("job store changed; re-arming timer");
            }
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
        }
    }
    info!("cron scheduler stopped");
}

/// Soonest `next_run_at_ms` among enabled jobs, if any.
fn soonest_deadline(store: &JobStore) -> Option<i64> {
    store
        .list_jobs()
        .iter()
        .filter(|j| j.enabled)
        .filter_map(|j| j.next_run_at_ms)
        .min()
}

/// Fire every enabled job due at `now`, in ascending `next_run_at_ms` order,
/// sequentially. Each fire updates `last_run_at_ms` / `last_status`, then
/// either removes the job (`delete_after_run`) or recomputes its next run;
/// every mutation is persisted.
pub async fn fire_due(store: &JobStore, handler: &dyn JobHandler, now: DateTime<Utc>) {
    let now_ms = now.timestamp_millis();
    let mut due: Vec<CronJob> = store
        .list_jobs()
        .into_iter()
        .filter(|j| j.enabled && j.next_run_at_ms.is_some_and(|t| t <= now_ms))
        .collect();
    due.sort_by_key(|j| j.next_run_at_ms);

    for job in due {
        info!(job_id = %job.id, name = %job.name, "executing job");

        let status = match handler.on_job_due(&job).await {
            Ok(()) => JobStatus::Ok,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "job handler failed");
                JobStatus::Error
            }
        };

        let result = store.update_jobs(|jobs| {
            if job.delete_after_run {
                jobs.retain(|j| j.id != job.id);
            } else if let Some(j) = jobs.iter_mut().find(|j| j.id == job.id) {
                j.last_run_at_ms = Some(now_ms);
                j.last_status = Some(status);
                j.next_run_at_ms = next_run_at(&j.schedule, Some(now_ms), now);
            }
        });
        if let Err(e) = result {
            warn!(job_id = %job.id, error = %e, "failed to persist job state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Schedule;
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records the order jobs were handed over in.
    struct RecordingHandler {
        fired: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self {
                fired: Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl JobHandler for RecordingHandler {
        async fn on_job_due(&self, job: &CronJob) -> anyhow::Result<()> {
            self.fired.lock().unwrap().push(job.name.clone());
            if self.fail {
                anyhow::bail!("handler failure");
            }
            Ok(())
        }
    }

    fn utc(ts: &str) -> DateTime<Utc> {
        ts.parse().unwrap()
    }

    #[tokio::test]
    async fn due_jobs_fire_once_each_in_deadline_order() {
        // P8: N jobs with distinct next runs fire exactly once, ascending.
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JobStore::load(dir.path().join("cron.json")));
        let base = Utc::now() + ChronoDuration::hours(1);

        // Insert out of order on purpose.
        for (name, offset_min) in [("third", 30), ("first", 10), ("second", 20)] {
            store
                .add_job(
                    name,
                    Schedule::At {
                        at: base + ChronoDuration::minutes(offset_min),
                    },
                    "go",
                    None,
                )
                .unwrap();
        }

        let handler = RecordingHandler::new();
        let later = base + ChronoDuration::hours(1);
        fire_due(&store, &handler, later).await;

        assert_eq!(
            *handler.fired.lock().unwrap(),
            vec!["first", "second", "third"]
        );
        // All were one-shots with delete_after_run → store is empty.
        assert!(store.list_jobs().is_empty());

        // A second tick fires nothing.
        fire_due(&store, &handler, later + ChronoDuration::hours(1)).await;
        assert_eq!(handler.fired.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn recurring_job_updates_state_and_rearms() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JobStore::load(dir.path().join("cron.json")));
        let job = store
            .add_job("tick", Schedule::Every { every_ms: 60_000 }, "go", None)
            .unwrap();

        let handler = RecordingHandler::new();
        let fire_time = utc("2025-01-01T00:10:00Z");
        // Force the job due regardless of wall clock.
        store
            .update_jobs(|jobs| {
                jobs[0].next_run_at_ms = Some(fire_time.timestamp_millis() - 1);
            })
            .unwrap();

        fire_due(&store, &handler, fire_time).await;

        let updated = store.get_job(&job.id).unwrap();
        assert_eq!(updated.last_run_at_ms, Some(fire_time.timestamp_millis()));
        assert_eq!(updated.last_status, Some(JobStatus::Ok));
        assert_eq!(
            updated.next_run_at_ms,
            Some(fire_time.timestamp_millis() + 60_000)
        );
    }

    #[tokio::test]
    async fn handler_error_is_recorded_not_fatal() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JobStore::load(dir.path().join("cron.json")));
        let job = store
            .add_job("flaky", Schedule::Every { every_ms: 60_000 }, "go", None)
            .unwrap();
        store
            .update_jobs(|jobs| jobs[0].next_run_at_ms = Some(0))
            .unwrap();

        let handler = RecordingHandler {
            fired: Mutex::new(Vec::new()),
            fail: true,
        };
        fire_due(&store, &handler, Utc::now()).await;

        let updated = store.get_job(&job.id).unwrap();
        assert_eq!(updated.last_status, Some(JobStatus::Error));
        assert!(updated.next_run_at_ms.is_some());
    }

    #[tokio::test]
    async fn disabled_jobs_never_fire() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JobStore::load(dir.path().join("cron.json")));
        let job = store
            .add_job("off", Schedule::Every { every_ms: 1_000 }, "go", None)
            .unwrap();
        store.set_enabled(&job.id, false).unwrap();
        store
            .update_jobs(|jobs| jobs[0].next_run_at_ms = Some(0))
            .unwrap();

        let handler = RecordingHandler::new();
        fire_due(&store, &handler, Utc::now()).await;
        assert!(handler.fired.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn one_shot_fires_through_the_running_engine() {
        // End-to-end over real time: an `at` job 1 s out fires exactly once
        // and removes itself.
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JobStore::load(dir.path().join("cron.json")));
        let handler = Arc::new(RecordingHandler::new());

        let scheduler = CronScheduler::new(store.clone(), handler.clone());
        let loop_handle = scheduler.start();

        store
            .add_job(
                "fire",
                Schedule::At {
                    at: Utc::now() + ChronoDuration::seconds(1),
                },
                "fire",
                None,
            )
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(*handler.fired.lock().unwrap(), vec!["fire"]);
        assert!(store.list_jobs().is_empty());

        scheduler.stop();
        loop_handle.await.unwrap();
    }
}
