//! The authoritative job table.
//!
//! All job mutation funnels through here: transitions are validated
//! against the state machine, written through to sqlite, and announced
//! on the event hub — in that order, under one lock, so no observer ever
//! sees a transition out of order.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_rusqlite::Connection;
use tracing::{info, warn};

use crate::db;
use crate::error::{ControlError, ControlResult};

use super::events::{EventHub, JobEvent};
use super::job::{Job, JobStatus, transition_allowed};

#[derive(Clone)]
pub struct JobStore {
    conn: Connection,
    hub: EventHub,
    jobs: Arc<Mutex<HashMap<String, Job>>>,
}

impl JobStore {
    pub fn new(conn: Connection, hub: EventHub) -> Self {
        Self {
            conn,
            hub,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    /// Restore persisted jobs on startup. Jobs found Running or Queued on
    /// disk lost their worker with the previous process; they come back
    /// Paused so the operator can resume or retry them.
    pub async fn bootstrap(&self) -> Result<usize> {
        let mut restored = db::jobs::load_all(&self.conn).await?;
        let mut jobs = self.jobs.lock().await;
        for job in &mut restored {
            if matches!(job.status, JobStatus::Running | JobStatus::Queued) {
                warn!(job_id = %job.id, from = %job.status, "Normalizing interrupted job to Paused");
                job.status = JobStatus::Paused;
                job.drive_path = None;
                db::jobs::upsert(&self.conn, job).await?;
            }
            jobs.insert(job.id.clone(), job.clone());
        }
        Ok(jobs.len())
    }

    pub async fn create(&self, job: Job) -> Result<Job> {
        let mut jobs = self.jobs.lock().await;
        db::jobs::upsert(&self.conn, &job).await?;
        jobs.insert(job.id.clone(), job.clone());
        info!(job_id = %job.id, disc_type = job.disc_type.as_str(), label = %job.disc_label, "Job created");
        Ok(job)
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.lock().await.get(job_id).cloned()
    }

    pub async fn list(&self) -> Vec<Job> {
        let jobs = self.jobs.lock().await;
        let mut list: Vec<Job> = jobs.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    /// Validated status transition. `op` names the control operation for
    /// the error message.
    pub async fn transition(
        &self,
        job_id: &str,
        to: JobStatus,
        op: &'static str,
    ) -> ControlResult<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| ControlError::JobNotFound(job_id.to_string()))?;

        if !transition_allowed(job.status, to) {
            return Err(ControlError::InvalidTransition {
                op,
                status: job.status,
            });
        }

        job.status = to;
        if to == JobStatus::Finished {
            job.progress_overall = 100;
            job.progress_step = 100;
        }
        db::jobs::upsert(&self.conn, job).await?;
        self.hub.publish(job_id, JobEvent::status(to));
        info!(job_id, status = %to, "Job transition");
        Ok(job.clone())
    }

    /// Position the job at a pipeline step, zeroing the per-step gauges.
    pub async fn begin_step(
        &self,
        job_id: &str,
        index: u32,
        name: &str,
        total: u32,
    ) -> ControlResult<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| ControlError::JobNotFound(job_id.to_string()))?;

        job.step_index = index;
        job.step_name = name.to_string();
        job.step_total = total;
        job.progress_step = 0;
        job.progress_title = 0;
        db::jobs::upsert(&self.conn, job).await?;
        self.hub.publish(
            job_id,
            JobEvent {
                step: Some(name.to_string()),
                step_progress: Some(0),
                title_progress: Some(0),
                ..Default::default()
            },
        );
        Ok(job.clone())
    }

    /// Update the progress gauges. Overall progress never moves backwards
    /// within a run; step/title gauges reset only via `begin_step`.
    pub async fn set_progress(
        &self,
        job_id: &str,
        overall: Option<u8>,
        step: Option<u8>,
        title: Option<u8>,
    ) -> ControlResult<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| ControlError::JobNotFound(job_id.to_string()))?;

        let overall = overall.map(|v| v.min(100).max(job.progress_overall));
        if let Some(v) = overall {
            job.progress_overall = v;
        }
        if let Some(v) = step {
            job.progress_step = v.min(100);
        }
        if let Some(v) = title {
            job.progress_title = v.min(100);
        }
        db::jobs::upsert(&self.conn, job).await?;
        self.hub.publish(
            job_id,
            JobEvent {
                progress: overall,
                step_progress: step,
                title_progress: title,
                ..Default::default()
            },
        );
        Ok(())
    }

    /// Append a line to the durable log and fan it out live.
    pub async fn append_log(&self, job_id: &str, line: &str) -> Result<()> {
        db::jobs::append_log(&self.conn, job_id.to_string(), line.to_string()).await?;
        self.hub.publish(job_id, JobEvent::line(line));
        Ok(())
    }

    pub async fn full_log(&self, job_id: &str) -> ControlResult<Vec<String>> {
        if self.get(job_id).await.is_none() {
            return Err(ControlError::JobNotFound(job_id.to_string()));
        }
        Ok(db::jobs::full_log(&self.conn, job_id.to_string()).await?)
    }

    /// Irreversibly commit the output path.
    pub async fn lock_output(&self, job_id: &str) -> ControlResult<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| ControlError::JobNotFound(job_id.to_string()))?;
        if !job.output_locked {
            job.output_locked = true;
            db::jobs::upsert(&self.conn, job).await?;
            self.hub.publish(job_id, JobEvent::output_locked());
        }
        Ok(job.clone())
    }

    /// Replace the output path. Callers validate shape and move resolver
    /// claims first; this enforces the lock invariant and records whether
    /// the job now holds the claim on its target.
    pub async fn set_output(
        &self,
        job_id: &str,
        path: std::path::PathBuf,
        claimed: bool,
    ) -> ControlResult<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| ControlError::JobNotFound(job_id.to_string()))?;
        if job.output_locked {
            return Err(ControlError::OutputLocked);
        }
        job.output_path = path;
        job.output_claimed = claimed;
        db::jobs::upsert(&self.conn, job).await?;
        Ok(job.clone())
    }

    pub async fn set_metadata(
        &self,
        job_id: &str,
        imdb_id: &str,
        season: Option<u32>,
    ) -> ControlResult<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| ControlError::JobNotFound(job_id.to_string()))?;
        job.imdb_id = Some(imdb_id.to_string());
        job.season = season;
        db::jobs::upsert(&self.conn, job).await?;
        Ok(job.clone())
    }

    /// The extraction step released the drive; stop showing it on the job.
    pub async fn clear_drive(&self, job_id: &str) -> ControlResult<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| ControlError::JobNotFound(job_id.to_string()))?;
        job.drive_path = None;
        db::jobs::upsert(&self.conn, job).await?;
        Ok(())
    }

    /// The disc is fully read; from here on the job is retryable.
    pub async fn mark_extracted(&self, job_id: &str) -> ControlResult<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| ControlError::JobNotFound(job_id.to_string()))?;
        job.extracted = true;
        db::jobs::upsert(&self.conn, job).await?;
        Ok(())
    }

    /// Re-queue a failed or cancelled job for its post-extraction tail.
    ///
    /// Only legal once the disc has been fully extracted; the disc may
    /// already be out of the drive, so anything earlier cannot be re-run.
    /// Resets the gauges and the log; preserves the output path.
    pub async fn retry(&self, job_id: &str) -> ControlResult<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| ControlError::JobNotFound(job_id.to_string()))?;

        if !matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(ControlError::InvalidTransition {
                op: "retry",
                status: job.status,
            });
        }
        if !job.extracted {
            return Err(ControlError::RetryNotAllowed {
                step_index: job.step_index,
            });
        }

        job.status = JobStatus::Queued;
        job.step_index = 1;
        job.step_name = String::new();
        job.progress_overall = 0;
        job.progress_step = 0;
        job.progress_title = 0;
        db::jobs::clear_log(&self.conn, job_id.to_string()).await?;
        db::jobs::upsert(&self.conn, job).await?;
        self.hub.publish(job_id, JobEvent::status(JobStatus::Queued));
        info!(job_id, "Job re-queued for retry");
        Ok(job.clone())
    }

    /// Remove the job record. The executor facade handles cancel-first
    /// and temp cleanup before calling this.
    pub async fn remove(&self, job_id: &str) -> ControlResult<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .remove(job_id)
            .ok_or_else(|| ControlError::JobNotFound(job_id.to_string()))?;
        db::jobs::delete(&self.conn, job_id.to_string()).await?;
        self.hub.remove(job_id);
        info!(job_id, "Job deleted");
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::drive::DiscType;
    use std::path::{Path, PathBuf};

    async fn store() -> JobStore {
        let conn = crate::db::init_in_memory().await.unwrap();
        JobStore::new(conn, EventHub::new())
    }

    fn job(id: &str, disc_type: DiscType) -> Job {
        Job::new(
            id.to_string(),
            "/dev/sr0",
            disc_type,
            "DISC",
            Path::new("/tmp/ripd-test/temp"),
            PathBuf::from("/tmp/ripd-test/out"),
        )
    }

    #[tokio::test]
    async fn claim_run_finish() {
        let s = store().await;
        s.create(job("j1", DiscType::DvdVideo)).await.unwrap();

        s.transition("j1", JobStatus::Running, "claim").await.unwrap();
        let done = s.transition("j1", JobStatus::Finished, "finish").await.unwrap();
        assert_eq!(done.progress_overall, 100);
    }

    #[tokio::test]
    async fn resume_only_from_paused() {
        let s = store().await;
        s.create(job("j1", DiscType::CdAudio)).await.unwrap();
        s.transition("j1", JobStatus::Running, "claim").await.unwrap();

        // Resume on a Running job is rejected with no mutation
        let err = s.transition("j1", JobStatus::Running, "resume").await.unwrap_err();
        assert!(matches!(err, ControlError::InvalidTransition { op: "resume", .. }));
        assert_eq!(s.get("j1").await.unwrap().status, JobStatus::Running);

        s.transition("j1", JobStatus::Paused, "pause").await.unwrap();
        s.transition("j1", JobStatus::Running, "resume").await.unwrap();
    }

    #[tokio::test]
    async fn retry_gating() {
        let s = store().await;
        s.create(job("j1", DiscType::DvdVideo)).await.unwrap();
        s.transition("j1", JobStatus::Running, "claim").await.unwrap();
        s.begin_step("j1", 1, "extract-titles", 3).await.unwrap();
        s.transition("j1", JobStatus::Failed, "step failure").await.unwrap();

        // Failed at step 1: the disc was never fully extracted
        let err = s.retry("j1").await.unwrap_err();
        assert!(matches!(err, ControlError::RetryNotAllowed { step_index: 1 }));

        // Fail again after extraction and retry successfully
        s.retry_preconditions_for_test("j1").await;
        let retried = s.retry("j1").await.unwrap();
        assert_eq!(retried.status, JobStatus::Queued);
        assert_eq!(retried.step_index, 1);
        assert_eq!(retried.progress_overall, 0);
        // Output path survives the retry
        assert_eq!(retried.output_path, PathBuf::from("/tmp/ripd-test/out"));
    }

    #[tokio::test]
    async fn retry_from_cancelled_is_allowed() {
        let s = store().await;
        s.create(job("j1", DiscType::CdRom)).await.unwrap();
        s.transition("j1", JobStatus::Running, "claim").await.unwrap();
        s.mark_extracted("j1").await.unwrap();
        s.begin_step("j1", 2, "finalize", 2).await.unwrap();
        s.transition("j1", JobStatus::Cancelled, "cancel").await.unwrap();

        assert_eq!(s.retry("j1").await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn overall_progress_is_monotonic() {
        let s = store().await;
        s.create(job("j1", DiscType::CdRom)).await.unwrap();

        s.set_progress("j1", Some(40), Some(80), None).await.unwrap();
        // A stale lower reading cannot move the gauge backwards
        s.set_progress("j1", Some(35), Some(70), None).await.unwrap();
        assert_eq!(s.get("j1").await.unwrap().progress_overall, 40);
    }

    #[tokio::test]
    async fn output_lock_freezes_path() {
        let s = store().await;
        s.create(job("j1", DiscType::CdRom)).await.unwrap();

        let j = s.set_output("j1", PathBuf::from("/elsewhere/Disc.iso"), true).await.unwrap();
        assert!(j.output_claimed);
        s.lock_output("j1").await.unwrap();

        let err = s
            .set_output("j1", PathBuf::from("/other/Disc.iso"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::OutputLocked));
        assert_eq!(
            s.get("j1").await.unwrap().output_path,
            PathBuf::from("/elsewhere/Disc.iso")
        );
    }

    #[tokio::test]
    async fn bootstrap_normalizes_interrupted_jobs() {
        let conn = crate::db::init_in_memory().await.unwrap();
        let s = JobStore::new(conn.clone(), EventHub::new());

        let mut running = job("j-running", DiscType::DvdVideo);
        running.status = JobStatus::Running;
        let mut finished = job("j-done", DiscType::CdRom);
        finished.status = JobStatus::Finished;
        crate::db::jobs::upsert(&conn, &running).await.unwrap();
        crate::db::jobs::upsert(&conn, &finished).await.unwrap();

        let restored = JobStore::new(conn, EventHub::new());
        assert_eq!(restored.bootstrap().await.unwrap(), 2);
        assert_eq!(restored.get("j-running").await.unwrap().status, JobStatus::Paused);
        assert_eq!(restored.get("j-done").await.unwrap().status, JobStatus::Finished);
        drop(s);
    }

    impl JobStore {
        /// Test helper: force a job into Failed past extraction.
        async fn retry_preconditions_for_test(&self, job_id: &str) {
            let mut jobs = self.jobs.lock().await;
            let job = jobs.get_mut(job_id).unwrap();
            job.status = JobStatus::Failed;
            job.step_index = 2;
            job.extracted = true;
            db::jobs::upsert(&self.conn, job).await.unwrap();
        }
    }
}
