//! The job entity and its state machine.
//!
//! A job is one disc worked through a disc-type pipeline. All mutation
//! goes through the `JobStore`; this module defines the data and the
//! legal status transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use super::drive::DiscType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Finished,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Finished => "Finished",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Queued" => Some(Self::Queued),
            "Running" => Some(Self::Running),
            "Paused" => Some(Self::Paused),
            "Finished" => Some(Self::Finished),
            "Failed" => Some(Self::Failed),
            "Cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Is `from -> to` a legal status edge?
///
/// Retry (Failed/Cancelled -> Queued) is validated separately because it
/// also depends on the step position.
pub fn transition_allowed(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Queued, Running)
            | (Running, Finished)
            | (Running, Failed)
            | (Running, Paused)
            | (Paused, Running)
            | (Queued | Running | Paused, Cancelled)
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    /// Immutable unique id.
    pub id: String,
    /// Drive the disc sits in; cleared once the extraction step releases
    /// the drive.
    pub drive_path: Option<String>,
    pub disc_type: DiscType,
    pub disc_label: String,
    pub status: JobStatus,

    /// 1-based position within the pipeline.
    pub step_index: u32,
    pub step_name: String,
    pub step_total: u32,

    /// Weighted total, 0..=100.
    pub progress_overall: u8,
    /// Current step, 0..=100.
    pub progress_step: u8,
    /// Current title during multi-title extraction, otherwise 0.
    pub progress_title: u8,

    pub output_path: PathBuf,
    /// Once true, `output_path` never changes again.
    pub output_locked: bool,
    /// This job holds the resolver claim on `output_path` (ROM targets
    /// only). A duplicate-flagged job runs unclaimed until the operator
    /// assigns it a fresh path.
    pub output_claimed: bool,
    /// The disc was fully read into the temp workspace; everything left
    /// runs without the drive. Gates Retry.
    pub extracted: bool,

    /// Per-job temp workspace (`<temp_root>/<job_id>`); extraction
    /// artifacts live here until Delete.
    pub temp_path: PathBuf,

    pub imdb_id: Option<String>,
    pub season: Option<u32>,

    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        id: String,
        drive_path: &str,
        disc_type: DiscType,
        disc_label: &str,
        temp_root: &std::path::Path,
        output_path: PathBuf,
    ) -> Self {
        let temp_path = temp_root.join(&id);
        Self {
            id,
            drive_path: Some(drive_path.to_string()),
            disc_type,
            disc_label: disc_label.to_string(),
            status: JobStatus::Queued,
            step_index: 1,
            step_name: String::new(),
            step_total: 1,
            progress_overall: 0,
            progress_step: 0,
            progress_title: 0,
            output_path,
            output_locked: false,
            output_claimed: false,
            extracted: false,
            temp_path,
            imdb_id: None,
            season: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::JobStatus::*;
    use super::*;

    #[test]
    fn legal_edges() {
        assert!(transition_allowed(Queued, Running));
        assert!(transition_allowed(Running, Finished));
        assert!(transition_allowed(Running, Failed));
        assert!(transition_allowed(Running, Paused));
        assert!(transition_allowed(Paused, Running));
        // Cancel from any non-terminal state
        assert!(transition_allowed(Queued, Cancelled));
        assert!(transition_allowed(Running, Cancelled));
        assert!(transition_allowed(Paused, Cancelled));
    }

    #[test]
    fn illegal_edges() {
        assert!(!transition_allowed(Queued, Finished));
        assert!(!transition_allowed(Queued, Paused));
        assert!(!transition_allowed(Paused, Finished));
        assert!(!transition_allowed(Finished, Running));
        assert!(!transition_allowed(Cancelled, Running));
        assert!(!transition_allowed(Failed, Running));
        // Terminal states cannot be re-cancelled
        assert!(!transition_allowed(Finished, Cancelled));
        assert!(!transition_allowed(Cancelled, Cancelled));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in [Queued, Running, Paused, Finished, Failed, Cancelled] {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(JobStatus::parse("Unknown"), None);
    }
}
