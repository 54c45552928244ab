use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::schedule::next_run_at;
use crate::types::{CronJob, Schedule};

/// Persistent job store: a JSON array on disk, written atomically
/// (write-temp-then-rename) after every mutation.
///
/// Holds the authoritative in-memory copy; the engine and any management
/// surface share one instance. Mutations ping [`JobStore::changed`] so the
/// engine can re-arm its timer.
pub struct JobStore {
    path: PathBuf,
    jobs: Mutex<Vec<CronJob>>,
    changed: Notify,
}

impl JobStore {
    /// Load the store from `path`. A missing or corrupt file yields an
    /// empty job list.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut jobs = read_jobs(&path);

        // Enabled jobs that never got a fire time (fresh store edits, older
        // writers) are scheduled now; stored past times are left alone so
        // missed one-shots still fire.
        let now = Utc::now();
        for job in jobs.iter_mut() {
            if job.enabled && job.next_run_at_ms.is_none() {
                job.next_run_at_ms = next_run_at(&job.schedule, job.last_run_at_ms, now);
            }
        }

        Self {
            path,
            jobs: Mutex::new(jobs),
            changed: Notify::new(),
        }
    }

    /// Snapshot of all jobs.
    pub fn list_jobs(&self) -> Vec<CronJob> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn get_job(&self, id: &str) -> Option<CronJob> {
        self.jobs.lock().unwrap().iter().find(|j| j.id == id).cloned()
    }

    /// Add a job. `delete_after_run` defaults by schedule kind (`at` → true,
    /// everything else → false).
    pub fn add_job(
        &self,
        name: &str,
        schedule: Schedule,
        message: &str,
        delete_after_run: Option<bool>,
    ) -> Result<CronJob> {
        let now = Utc::now();
        let job = CronJob {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            enabled: true,
            delete_after_run: delete_after_run.unwrap_or(schedule.default_delete_after_run()),
            next_run_at_ms: next_run_at(&schedule, None, now),
            schedule,
            message: message.to_string(),
            last_run_at_ms: None,
            last_status: None,
        };

        self.update_jobs(|jobs| jobs.push(job.clone()))?;
        info!(job_id = %job.id, name, "job added");
        Ok(job)
    }

    /// Remove a job by ID.
    pub fn remove_job(&self, id: &str) -> Result<()> {
        let mut found = false;
        self.update_jobs(|jobs| {
            let before = jobs.len();
            jobs.retain(|j| j.id != id);
            found = jobs.len() != before;
        })?;
        if !found {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!(job_id = %id, "job removed");
        Ok(())
    }

    /// Enable or disable a job, recomputing its next fire when re-enabled.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let now = Utc::now();
        let mut found = false;
        self.update_jobs(|jobs| {
            if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
                job.enabled = enabled;
                if enabled {
                    job.next_run_at_ms = next_run_at(&job.schedule, job.last_run_at_ms, now);
                }
                found = true;
            }
        })?;
        if !found {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Mutate the job list under the lock, persist, and wake the engine.
    pub(crate) fn update_jobs<F: FnOnce(&mut Vec<CronJob>)>(&self, f: F) -> Result<()> {
        {
            let mut jobs = self.jobs.lock().unwrap();
            f(&mut jobs);
            persist(&self.path, &jobs)?;
        }
        // notify_one stores a permit, so a mutation landing between the
        // engine's deadline computation and its next await is not lost.
        self.changed.notify_one();
        Ok(())
    }

    /// Notified after every persisted mutation.
    pub(crate) fn changed(&self) -> &Notify {
        &self.changed
    }
}

fn read_jobs(path: &Path) -> Vec<CronJob> {
    let raw = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    match serde_json::from_str::<Vec<CronJob>>(&raw) {
        Ok(jobs) => {
            debug!(count = jobs.len(), path = %path.display(), "loaded cron store");
            jobs
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt cron store; starting empty");
            Vec::new()
        }
    }
}

/// Write the serialised job list to a temp file in the same directory, then
/// rename over the target so readers never see a torn store.
fn persist(path: &Path, jobs: &[CronJob]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let tmp = tempfile::NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(tmp.as_file(), jobs)?;
    tmp.persist(path)
        .map_err(|e| SchedulerError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> JobStore {
        JobStore::load(dir.path().join("cron.json"))
    }

    #[test]
    fn missing_store_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir).list_jobs().is_empty());
    }

    #[test]
    fn corrupt_store_is_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("cron.json"), "{{{nope").unwrap();
        assert!(store(&dir).list_jobs().is_empty());
    }

    #[test]
    fn mutations_survive_reload() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let job = s
            .add_job(
                "ping",
                Schedule::Every { every_ms: 60_000 },
                "check in",
                None,
            )
            .unwrap();
        assert!(!job.delete_after_run);
        assert!(job.next_run_at_ms.is_some());

        let reloaded = store(&dir);
        let jobs = reloaded.list_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, job.id);
        assert_eq!(jobs[0].message, "check in");

        reloaded.remove_job(&job.id).unwrap();
        assert!(store(&dir).list_jobs().is_empty());
    }

    #[test]
    fn at_jobs_default_to_delete_after_run() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let job = s
            .add_job(
                "once",
                Schedule::At { at: Utc::now() },
                "one shot",
                None,
            )
            .unwrap();
        assert!(job.delete_after_run);
    }

    #[test]
    fn remove_unknown_job_errors() {
        let dir = TempDir::new().unwrap();
        let err = store(&dir).remove_job("ghost").unwrap_err();
        assert!(matches!(err, SchedulerError::JobNotFound { .. }));
    }

    #[test]
    fn disabled_then_enabled_recomputes_next_run() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let job = s
            .add_job("tick", Schedule::Every { every_ms: 1_000 }, "go", None)
            .unwrap();
        s.set_enabled(&job.id, false).unwrap();
        assert!(!s.get_job(&job.id).unwrap().enabled);
        s.set_enabled(&job.id, true).unwrap();
        let job = s.get_job(&job.id).unwrap();
        assert!(job.enabled);
        assert!(job.next_run_at_ms.is_some());
    }
}
