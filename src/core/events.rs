//! Per-job event fan-out.
//!
//! Each job has a broadcast channel carrying sparse typed events (only
//! the fields that changed are set). Subscribers get the live tail only;
//! history comes from the persisted job log, read before subscribing.
//! A slow subscriber lags and drops events for itself; it never blocks
//! the publisher or other subscribers.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use super::job::JobStatus;

/// Events a lagging subscriber can buffer before it starts dropping.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Default)]
pub struct JobEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_locked: Option<bool>,
}

impl JobEvent {
    pub fn line(line: impl Into<String>) -> Self {
        Self {
            line: Some(line.into()),
            ..Default::default()
        }
    }

    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn step(index_name: impl Into<String>) -> Self {
        Self {
            step: Some(index_name.into()),
            ..Default::default()
        }
    }

    pub fn output_locked() -> Self {
        Self {
            output_locked: Some(true),
            ..Default::default()
        }
    }
}

/// Publish/subscribe broadcaster, one channel per job.
#[derive(Clone, Default)]
pub struct EventHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<JobEvent>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, job_id: &str) -> broadcast::Sender<JobEvent> {
        let mut channels = self.channels.lock().expect("event hub lock poisoned");
        channels
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Fan an event out to all current subscribers for the job. Never
    /// blocks; with no subscribers the event is simply dropped (the
    /// durable log write happens at the call site).
    pub fn publish(&self, job_id: &str, event: JobEvent) {
        let _ = self.sender(job_id).send(event);
    }

    /// Live feed of subsequent events for the job. Does not replay
    /// history; callers fetch the persisted log first, then subscribe.
    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<JobEvent> {
        self.sender(job_id).subscribe()
    }

    /// Drop the job's channel (after Delete).
    pub fn remove(&self, job_id: &str) {
        self.channels
            .lock()
            .expect("event hub lock poisoned")
            .remove(job_id);
    }
}
