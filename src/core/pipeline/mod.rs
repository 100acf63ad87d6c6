//! The pipeline executor.
//!
//! Owns the disc-to-job claim protocol and one worker task per active
//! job. A worker walks its step table, spawns the external tool for each
//! step in its own process group, streams tool output into the job log
//! and the progress gauges, and settles the job into a terminal state.
//! Control operations (pause/resume/cancel/retry/delete/eject) are thin
//! facades over the worker's cancellation token and pause flag.

pub mod parsers;
pub mod steps;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{ControlError, ControlResult};
use crate::logging::LogThrottle;

use super::drive::DriveRegistry;
use super::job::{Job, JobStatus};
use super::output::OutputResolver;
use super::store::JobStore;
use parsers::{ProgressParser, parser_for};
use steps::{StepSpec, build_plan, retry_plan};

struct Worker {
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    config: Arc<AppConfig>,
    registry: DriveRegistry,
    store: JobStore,
    resolver: OutputResolver,
    active: Mutex<HashMap<String, Worker>>,
}

#[derive(Clone)]
pub struct PipelineExecutor {
    inner: Arc<Inner>,
}

enum StepEnd {
    Completed,
    Cancelled,
}

struct StepFailure {
    code: Option<i32>,
    detail: String,
}

impl PipelineExecutor {
    pub fn new(
        config: Arc<AppConfig>,
        registry: DriveRegistry,
        store: JobStore,
        resolver: OutputResolver,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                store,
                resolver,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    pub fn registry(&self) -> &DriveRegistry {
        &self.inner.registry
    }

    pub fn resolver(&self) -> &OutputResolver {
        &self.inner.resolver
    }

    /// Claim protocol for a detected disc: reserve the drive, resolve the
    /// output destination, create the job, start a worker.
    pub async fn admit_disc(
        &self,
        drive_path: &str,
        disc_type: super::drive::DiscType,
        label: &str,
    ) -> ControlResult<Job> {
        let inner = &self.inner;
        let job_id = Uuid::now_v7().to_string();

        inner.registry.try_reserve(drive_path, disc_type, &job_id).await?;
        inner.registry.set_disc_label(drive_path, Some(label.to_string())).await;

        let proposal = inner.resolver.propose(disc_type, label);
        let claimed = proposal.locked;
        let mut job = Job::new(
            job_id,
            drive_path,
            disc_type,
            label,
            &inner.config.temp_dir,
            proposal.path,
        );
        job.output_claimed = claimed;
        let claim_path = job.output_path.clone();
        let job = match inner.store.create(job).await {
            Ok(job) => job,
            Err(e) => {
                inner.registry.release(drive_path).await;
                if claimed {
                    inner.resolver.release(&claim_path);
                }
                return Err(e.into());
            }
        };

        if proposal.duplicate == Some(true) {
            warn!(job_id = %job.id, path = %job.output_path.display(), "Proposed output already exists");
            let _ = inner
                .store
                .append_log(
                    &job.id,
                    "[ripd] proposed output path already exists; set a new output path before the image is finalized",
                )
                .await;
        }

        let plan = build_plan(&job, &inner.config.tools);
        self.spawn_worker(&job.id, plan, 0, 0.0).await;
        Ok(job)
    }

    /// Pause takes effect at the next step boundary; the in-flight tool
    /// run completes first.
    pub async fn pause(&self, job_id: &str) -> ControlResult<Job> {
        let job = self.inner.store.transition(job_id, JobStatus::Paused, "pause").await?;
        if let Some(worker) = self.inner.active.lock().await.get(job_id) {
            let _ = worker.pause.send(true);
        }
        Ok(job)
    }

    pub async fn resume(&self, job_id: &str) -> ControlResult<Job> {
        {
            let mut active = self.inner.active.lock().await;
            if let Some(worker) = active.get(job_id) {
                if !worker.handle.is_finished() {
                    let job = self
                        .inner
                        .store
                        .transition(job_id, JobStatus::Running, "resume")
                        .await?;
                    let _ = worker.pause.send(false);
                    return Ok(job);
                }
                active.remove(job_id);
            }
        }

        // The worker was lost with a previous process; restart from the
        // current step.
        let job = self
            .inner
            .store
            .get(job_id)
            .await
            .ok_or_else(|| ControlError::JobNotFound(job_id.to_string()))?;
        // A job interrupted mid-retry carries the renumbered tail's step
        // numbering; rebuild the plan it was actually running.
        let tail = retry_plan(&job, &self.inner.config.tools);
        let plan = if job.extracted && job.step_total as usize == tail.len() {
            tail
        } else {
            build_plan(&job, &self.inner.config.tools)
        };
        let start = job.step_index.saturating_sub(1) as usize;
        if plan.get(start).is_some_and(|s| s.needs_drive) && job.drive_path.is_none() {
            return Err(ControlError::DriveUnavailable(
                "the disc is no longer in a drive; delete the job and re-insert the disc".to_string(),
            ));
        }
        let base: f64 = plan[..start.min(plan.len())].iter().map(|s| s.weight).sum();
        let job = self
            .inner
            .store
            .transition(job_id, JobStatus::Running, "resume")
            .await?;
        self.spawn_worker(job_id, plan, start, base).await;
        Ok(job)
    }

    /// Cooperative cancel. Returns immediately; a running tool gets
    /// SIGTERM, then SIGKILL after the configured grace, and the job
    /// converges to Cancelled. Idempotent on terminal jobs.
    pub async fn cancel(&self, job_id: &str) -> ControlResult<Job> {
        let job = self
            .inner
            .store
            .get(job_id)
            .await
            .ok_or_else(|| ControlError::JobNotFound(job_id.to_string()))?;
        if job.status.is_terminal() {
            return Ok(job);
        }

        {
            let active = self.inner.active.lock().await;
            if let Some(worker) = active.get(job_id)
                && !worker.handle.is_finished()
            {
                worker.cancel.cancel();
                return Ok(job);
            }
        }

        // No live worker (restart-restored Paused/Queued job): settle
        // directly. The output claim stays with the job; Cancelled is
        // retryable and still owns its destination.
        let job = self
            .inner
            .store
            .transition(job_id, JobStatus::Cancelled, "cancel")
            .await?;
        self.release_job_drive(&job, false).await;
        Ok(job)
    }

    /// Re-queue a failed/cancelled job and run its post-extraction tail.
    pub async fn retry(&self, job_id: &str) -> ControlResult<Job> {
        let job = self.inner.store.retry(job_id).await?;
        let plan = retry_plan(&job, &self.inner.config.tools);
        self.spawn_worker(job_id, plan, 0, 0.0).await;
        Ok(job)
    }

    /// Cancel-first delete. Removes the record, the live channel, and the
    /// temp workspace; finalized output files are never touched.
    pub async fn delete(&self, job_id: &str) -> ControlResult<()> {
        let worker = self.inner.active.lock().await.remove(job_id);
        if let Some(worker) = worker {
            worker.cancel.cancel();
            let deadline = Duration::from_secs(self.inner.config.cancel_grace_secs + 2);
            if tokio::time::timeout(deadline, worker.handle).await.is_err() {
                warn!(job_id, "Worker did not settle within the cancel grace; abandoning it");
            }
        }

        let job = self
            .inner
            .store
            .get(job_id)
            .await
            .ok_or_else(|| ControlError::JobNotFound(job_id.to_string()))?;
        if !job.status.is_terminal() {
            let _ = self
                .inner
                .store
                .transition(job_id, JobStatus::Cancelled, "delete")
                .await;
            self.release_job_drive(&job, false).await;
        }

        let job = self.inner.store.remove(job_id).await?;
        self.inner.resolver.release(&job.output_path);
        if let Err(e) = tokio::fs::remove_dir_all(&job.temp_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(job_id, error = %e, "Failed to remove temp workspace");
        }
        Ok(())
    }

    /// Eject a drive's tray, cancelling whatever job holds it first.
    pub async fn eject_drive(&self, drive_path: &str) -> ControlResult<()> {
        let drive = self
            .inner
            .registry
            .get(drive_path)
            .await
            .ok_or_else(|| ControlError::DriveNotFound(drive_path.to_string()))?;

        if let Some(job_id) = drive.assigned_job {
            self.cancel(&job_id).await?;
            // Wait for the worker to let go of the device before ejecting
            let deadline =
                Instant::now() + Duration::from_secs(self.inner.config.cancel_grace_secs + 2);
            while Instant::now() < deadline {
                let held = self
                    .inner
                    .registry
                    .get(drive_path)
                    .await
                    .is_some_and(|d| d.assigned_job.is_some());
                if !held {
                    break;
                }
                sleep(Duration::from_millis(100)).await;
            }
        }

        self.inner.registry.set_disc_label(drive_path, None).await;
        spawn_tool(&self.inner.config.tools.eject, drive_path);
        info!(drive = drive_path, "Ejecting drive");
        Ok(())
    }

    /// A drive was unplugged. Any job holding it loses the device;
    /// cancel it so the worker settles instead of failing mid-read.
    pub async fn handle_drive_detached(&self, drive_path: &str) {
        if let Some(drive) = self.inner.registry.get(drive_path).await
            && let Some(job_id) = drive.assigned_job
        {
            warn!(drive = drive_path, job_id = %job_id, "Drive detached mid-job");
            let _ = self.cancel(&job_id).await;
        }
        self.inner.registry.unregister(drive_path).await;
    }

    async fn spawn_worker(&self, job_id: &str, plan: Vec<StepSpec>, start: usize, base: f64) {
        let token = CancellationToken::new();
        let (pause_tx, pause_rx) = watch::channel(false);
        let handle = tokio::spawn(run_worker(
            self.inner.clone(),
            job_id.to_string(),
            plan,
            start,
            base,
            pause_rx,
            token.clone(),
        ));
        self.inner.active.lock().await.insert(
            job_id.to_string(),
            Worker {
                cancel: token,
                pause: pause_tx,
                handle,
            },
        );
    }

    async fn release_job_drive(&self, job: &Job, eject: bool) {
        release_drive(&self.inner, job, eject).await;
    }
}

async fn release_drive(inner: &Inner, job: &Job, eject: bool) {
    let Some(drive) = &job.drive_path else { return };
    inner.registry.release(drive).await;
    inner.registry.set_disc_label(drive, None).await;
    let _ = inner.store.clear_drive(&job.id).await;
    if eject {
        spawn_tool(&inner.config.tools.eject, drive);
    }
}

/// Fire-and-forget helper tool invocation (eject). Failures are logged,
/// never fatal.
fn spawn_tool(tool: &str, arg: &str) {
    let result = Command::new(tool)
        .arg(arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    if let Err(e) = result {
        warn!(tool, arg, error = %e, "Failed to spawn helper tool");
    }
}

async fn run_worker(
    inner: Arc<Inner>,
    job_id: String,
    plan: Vec<StepSpec>,
    start: usize,
    base: f64,
    mut pause_rx: watch::Receiver<bool>,
    token: CancellationToken,
) {
    let Some(job) = inner.store.get(&job_id).await else {
        return;
    };
    if job.status == JobStatus::Queued
        && let Err(e) = inner.store.transition(&job_id, JobStatus::Running, "start").await
    {
        warn!(job_id, error = %e, "Failed to start job");
        return;
    }
    if let Err(e) = tokio::fs::create_dir_all(&job.temp_path).await {
        fail_job(&inner, &job_id, "setup", &format!("cannot create temp workspace: {e}")).await;
        finish_worker(&inner, &job_id).await;
        return;
    }

    let total = plan.len() as u32;
    let mut done = base;
    let mut outcome: Option<JobStatus> = None;

    for (i, step) in plan.iter().enumerate().skip(start) {
        // Park at the step boundary while paused
        let parked = tokio::select! {
            res = pause_rx.wait_for(|paused| !*paused) => res.is_ok(),
            _ = token.cancelled() => false,
        };
        if !parked || token.is_cancelled() {
            outcome = Some(JobStatus::Cancelled);
            break;
        }

        let Some(job) = inner.store.get(&job_id).await else {
            return;
        };

        let index = (i + 1) as u32;
        if let Err(e) = inner.store.begin_step(&job_id, index, step.name, total).await {
            warn!(job_id, error = %e, "Failed to record step start");
        }
        let _ = inner
            .store
            .append_log(&job_id, &format!("[ripd] step {index}/{total}: {}", step.name))
            .await;
        info!(job_id, step = step.name, index, total, "Step started");

        if step.locks_output && !job.output_locked {
            // A ROM image is about to materialize. A job that does not
            // hold the claim on its target must not write it, whether or
            // not the claim holder has produced a file yet.
            if job.disc_type.is_rom() && (!job.output_claimed || job.output_path.exists()) {
                let _ = inner
                    .store
                    .append_log(
                        &job_id,
                        "[ripd] output path already exists or is claimed by another job; set a new output path and retry",
                    )
                    .await;
                fail_job(&inner, &job_id, step.name, "output path already exists or is claimed").await;
                outcome = Some(JobStatus::Failed);
                break;
            }
            let _ = inner.store.lock_output(&job_id).await;
        }

        match run_step(&inner, &job_id, step, done, &token).await {
            Ok(StepEnd::Completed) => {
                done += step.weight;
                let overall = (done * 100.0).round().clamp(0.0, 100.0) as u8;
                let _ = inner
                    .store
                    .set_progress(&job_id, Some(overall), Some(100), None)
                    .await;
                if step.release_drive_after {
                    let _ = inner.store.mark_extracted(&job_id).await;
                    release_drive(&inner, &job, true).await;
                }
            }
            Ok(StepEnd::Cancelled) => {
                outcome = Some(JobStatus::Cancelled);
                break;
            }
            Err(failure) => {
                handle_step_failure(&inner, &job, step, failure).await;
                outcome = Some(JobStatus::Failed);
                break;
            }
        }
    }

    match outcome {
        None => {
            // A pause that lands after the last step has no boundary left
            // to park at; the job simply completes.
            if let Some(job) = inner.store.get(&job_id).await
                && job.status == JobStatus::Paused
            {
                let _ = inner.store.transition(&job_id, JobStatus::Running, "resume").await;
            }
            let _ = inner.store.append_log(&job_id, "[ripd] job finished").await;
            if let Err(e) = inner.store.transition(&job_id, JobStatus::Finished, "finish").await {
                warn!(job_id, error = %e, "Failed to finish job");
            }
            if let Some(job) = inner.store.get(&job_id).await {
                inner.resolver.release(&job.output_path);
            }
        }
        Some(JobStatus::Cancelled) => {
            let _ = inner.store.append_log(&job_id, "[ripd] job cancelled").await;
            if let Some(job) = inner.store.get(&job_id).await {
                release_drive(&inner, &job, false).await;
            }
            if let Err(e) = inner.store.transition(&job_id, JobStatus::Cancelled, "cancel").await {
                debug!(job_id, error = %e, "Cancel transition skipped");
            }
        }
        // Failed and Cancelled keep the output claim: both are retryable
        // and still own their destination. Delete releases it.
        Some(_) => {}
    }

    finish_worker(&inner, &job_id).await;
}

async fn finish_worker(inner: &Inner, job_id: &str) {
    inner.active.lock().await.remove(job_id);
}

async fn fail_job(inner: &Inner, job_id: &str, step: &str, detail: &str) {
    let err = ControlError::StepExecution {
        step: step.to_string(),
        detail: detail.to_string(),
    };
    warn!(job_id, %err, "Step failed");
    let _ = inner.store.append_log(job_id, &format!("[ripd] {err}")).await;
    if let Err(e) = inner.store.transition(job_id, JobStatus::Failed, "step failure").await {
        warn!(job_id, error = %e, "Failed to record job failure");
    }
}

async fn handle_step_failure(inner: &Inner, job: &Job, step: &StepSpec, failure: StepFailure) {
    // A vanished device node during a drive-bound step is a hardware
    // fault: take the drive out of rotation so the next disc does not
    // land in it.
    if step.needs_drive
        && let Some(drive) = &job.drive_path
        && !Path::new(drive).exists()
    {
        let fault = ControlError::HardwareFault {
            drive: drive.clone(),
            detail: "device node vanished mid-step".to_string(),
        };
        warn!(job_id = %job.id, %fault, "Blacklisting drive");
        let _ = inner
            .store
            .append_log(&job.id, &format!("[ripd] {fault}; drive blacklisted"))
            .await;
        let _ = inner.registry.set_blacklisted(drive, true).await;
    }

    let detail = match failure.code {
        Some(code) => format!("{} (exit code {code})", failure.detail),
        None => failure.detail.clone(),
    };
    release_drive(inner, job, false).await;
    fail_job(inner, &job.id, step.name, &detail).await;
}

/// Run one step's tool to completion, streaming output into the job log
/// and progress gauges. `done` is the weight already banked by earlier
/// steps; this step contributes up to `step.weight` on top.
async fn run_step(
    inner: &Arc<Inner>,
    job_id: &str,
    step: &StepSpec,
    done: f64,
    token: &CancellationToken,
) -> Result<StepEnd, StepFailure> {
    let mut cmd = Command::new(&step.argv[0]);
    cmd.args(&step.argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &step.cwd {
        let _ = tokio::fs::create_dir_all(cwd).await;
        cmd.current_dir(cwd);
    }
    // Own process group, so cancellation reaches the whole tool tree
    // (sh wrappers included).
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| StepFailure {
        code: None,
        detail: format!("failed to spawn {}: {e}", step.argv[0]),
    })?;
    let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));

    let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(stream_lines(stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(stream_lines(stderr, line_tx.clone()));
    }
    drop(line_tx);

    let grace = Duration::from_secs(inner.config.cancel_grace_secs);
    let mut parser = parser_for(&step.parser);
    let throttle = LogThrottle::new(Duration::from_secs(2));

    // Drain output until the tool finishes or a cancel arrives.
    let cancelled = loop {
        tokio::select! {
            maybe = line_rx.recv() => match maybe {
                Some(line) => {
                    handle_line(inner, job_id, step, done, parser.as_mut(), &throttle, &line).await;
                }
                // Both pipes closed: the tool is done (or killed)
                None => break false,
            },
            _ = token.cancelled() => break true,
        }
    };

    if cancelled {
        if let Some(pgid) = pgid {
            let _ = signal::killpg(pgid, Signal::SIGTERM);
        }
        // Keep draining during the grace window so the tool can flush a
        // clean shutdown; escalate to SIGKILL if it overstays.
        let deadline = Instant::now() + grace;
        loop {
            tokio::select! {
                maybe = line_rx.recv() => match maybe {
                    Some(line) => {
                        handle_line(inner, job_id, step, done, parser.as_mut(), &throttle, &line).await;
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(job_id, step = step.name, "Cancel grace expired; force-killing");
                    if let Some(pgid) = pgid {
                        let _ = signal::killpg(pgid, Signal::SIGKILL);
                    }
                    let _ = child.start_kill();
                    while line_rx.recv().await.is_some() {}
                    break;
                }
            }
        }
    }

    let status = child.wait().await.map_err(|e| StepFailure {
        code: None,
        detail: format!("failed to reap {}: {e}", step.argv[0]),
    })?;

    if cancelled {
        return Ok(StepEnd::Cancelled);
    }
    if status.success() {
        Ok(StepEnd::Completed)
    } else {
        Err(StepFailure {
            code: status.code(),
            detail: format!("{} exited unsuccessfully", step.argv[0]),
        })
    }
}

async fn handle_line(
    inner: &Arc<Inner>,
    job_id: &str,
    step: &StepSpec,
    done: f64,
    parser: &mut dyn ProgressParser,
    throttle: &LogThrottle,
    line: &str,
) {
    if let Err(e) = inner.store.append_log(job_id, line).await {
        warn!(job_id, error = %e, "Failed to append job log");
    }

    if let Some(update) = parser.parse_line(line) {
        let overall = update
            .step
            .map(|pct| ((done + step.weight * pct / 100.0) * 100.0).round().clamp(0.0, 100.0) as u8);
        let step_pct = update.step.map(|v| v.round().clamp(0.0, 100.0) as u8);
        let title_pct = update.title.map(|v| v.round().clamp(0.0, 100.0) as u8);
        if let Err(e) = inner.store.set_progress(job_id, overall, step_pct, title_pct).await {
            warn!(job_id, error = %e, "Failed to update progress");
        }
        if throttle.should_log() {
            debug!(job_id, step = step.name, overall, step_progress = step_pct, "Step progress");
        }
    }
}

/// Byte-wise line splitter. Tools rewrite their progress line with bare
/// carriage returns; treating CR as a line break turns each rewrite into
/// its own line.
async fn stream_lines<R: tokio::io::AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<String>) {
    let mut line_buffer = Vec::new();
    let mut byte_buffer = [0u8; 1];

    while let Ok(n) = reader.read(&mut byte_buffer).await {
        if n == 0 {
            break;
        }
        let b = byte_buffer[0];
        if b == b'\r' || b == b'\n' {
            if line_buffer.is_empty() {
                continue;
            }
            let line = String::from_utf8_lossy(&line_buffer).into_owned();
            if tx.send(line).await.is_err() {
                return;
            }
            line_buffer.clear();
        } else {
            line_buffer.push(b);
        }
    }

    if !line_buffer.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&line_buffer).into_owned()).await;
    }
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PipelineExecutor")
    }
}
