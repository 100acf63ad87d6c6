//! Physical drive registry.
//!
//! Authoritative state for every optical drive the daemon knows about:
//! capability, occupancy, and blacklist. Drives are created/removed by
//! hotplug events from the drive event source; `assigned_job` is set only
//! by the pipeline executor at claim time and cleared at release.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{ControlError, ControlResult};

/// Disc class a drive can read. Hierarchical: a Blu-ray drive also reads
/// DVDs and CDs, a DVD drive also reads CDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveClass {
    Cd,
    Dvd,
    Bluray,
}

impl DriveClass {
    pub fn covers(&self, required: DriveClass) -> bool {
        *self >= required
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cd => "cd",
            Self::Dvd => "dvd",
            Self::Bluray => "bluray",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cd" => Some(Self::Cd),
            "dvd" => Some(Self::Dvd),
            "bluray" | "bd" => Some(Self::Bluray),
            _ => None,
        }
    }
}

/// Detected content type of an inserted disc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscType {
    CdAudio,
    CdRom,
    DvdVideo,
    DvdRom,
    BlurayVideo,
    BlurayRom,
    OtherDisc,
}

impl DiscType {
    /// The drive class required to read this disc.
    pub fn required_class(&self) -> DriveClass {
        match self {
            Self::CdAudio | Self::CdRom | Self::OtherDisc => DriveClass::Cd,
            Self::DvdVideo | Self::DvdRom => DriveClass::Dvd,
            Self::BlurayVideo | Self::BlurayRom => DriveClass::Bluray,
        }
    }

    /// Content is opaque image data rather than audio/video titles.
    pub fn is_rom(&self) -> bool {
        matches!(self, Self::CdRom | Self::DvdRom | Self::BlurayRom | Self::OtherDisc)
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Self::DvdVideo | Self::BlurayVideo)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CdAudio => "cd_audio",
            Self::CdRom => "cd_rom",
            Self::DvdVideo => "dvd_video",
            Self::DvdRom => "dvd_rom",
            Self::BlurayVideo => "bluray_video",
            Self::BlurayRom => "bluray_rom",
            Self::OtherDisc => "other_disc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cd_audio" => Some(Self::CdAudio),
            "cd_rom" => Some(Self::CdRom),
            "dvd_video" => Some(Self::DvdVideo),
            "dvd_rom" => Some(Self::DvdRom),
            "bluray_video" => Some(Self::BlurayVideo),
            "bluray_rom" => Some(Self::BlurayRom),
            "other_disc" => Some(Self::OtherDisc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Drive {
    /// Unique hardware identifier (device node path).
    pub path: String,
    pub model: String,
    pub capability: DriveClass,
    /// At most one active job per drive.
    pub assigned_job: Option<String>,
    /// Excluded from auto-assignment; does not abort an in-flight job.
    pub blacklisted: bool,
    /// Label of the currently inserted disc, if any.
    pub disc_label: Option<String>,
    /// Registration order, used as the selection tie-break.
    #[serde(skip)]
    seq: u64,
}

#[derive(Default)]
struct RegistryState {
    drives: HashMap<String, Drive>,
    next_seq: u64,
}

/// Shared, mutex-guarded drive table. All reservation and release
/// operations are atomic with respect to each other.
#[derive(Clone, Default)]
pub struct DriveRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

impl DriveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a drive on hotplug attach. Re-attaching refreshes model and
    /// capability but keeps assignment and blacklist state.
    pub async fn register(&self, path: &str, model: &str, capability: DriveClass) -> Drive {
        let mut state = self.inner.lock().await;
        if let Some(drive) = state.drives.get_mut(path) {
            drive.model = model.to_string();
            drive.capability = capability;
            return drive.clone();
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let drive = Drive {
            path: path.to_string(),
            model: model.to_string(),
            capability,
            assigned_job: None,
            blacklisted: false,
            disc_label: None,
            seq,
        };
        state.drives.insert(path.to_string(), drive.clone());
        drive
    }

    /// Remove a drive on hotplug detach.
    pub async fn unregister(&self, path: &str) -> Option<Drive> {
        self.inner.lock().await.drives.remove(path)
    }

    pub async fn set_disc_label(&self, path: &str, label: Option<String>) {
        if let Some(drive) = self.inner.lock().await.drives.get_mut(path) {
            drive.disc_label = label;
        }
    }

    /// Snapshot of all drives in registration order.
    pub async fn list(&self) -> Vec<Drive> {
        let state = self.inner.lock().await;
        let mut drives: Vec<Drive> = state.drives.values().cloned().collect();
        drives.sort_by_key(|d| d.seq);
        drives
    }

    pub async fn get(&self, path: &str) -> Option<Drive> {
        self.inner.lock().await.drives.get(path).cloned()
    }

    /// Atomically reserve a drive for a job.
    ///
    /// Succeeds iff the drive exists, is not blacklisted, has no assigned
    /// job, and its capability covers the disc type.
    pub async fn try_reserve(
        &self,
        path: &str,
        disc_type: DiscType,
        job_id: &str,
    ) -> ControlResult<()> {
        let mut state = self.inner.lock().await;
        let drive = state
            .drives
            .get_mut(path)
            .ok_or_else(|| ControlError::DriveUnavailable(format!("{path}: not present")))?;

        if drive.blacklisted {
            return Err(ControlError::DriveUnavailable(format!("{path}: blacklisted")));
        }
        if let Some(existing) = &drive.assigned_job {
            return Err(ControlError::DriveUnavailable(format!(
                "{path}: in use by job {existing}"
            )));
        }
        if !drive.capability.covers(disc_type.required_class()) {
            return Err(ControlError::DriveUnavailable(format!(
                "{path}: {} drive cannot read {}",
                drive.capability.as_str(),
                disc_type.as_str()
            )));
        }

        drive.assigned_job = Some(job_id.to_string());
        Ok(())
    }

    /// Clear the assignment. Idempotent; unknown paths are a no-op.
    pub async fn release(&self, path: &str) {
        if let Some(drive) = self.inner.lock().await.drives.get_mut(path) {
            drive.assigned_job = None;
        }
    }

    /// Blacklist state is independent of reservation state.
    pub async fn set_blacklisted(&self, path: &str, blacklisted: bool) -> ControlResult<()> {
        let mut state = self.inner.lock().await;
        let drive = state
            .drives
            .get_mut(path)
            .ok_or_else(|| ControlError::DriveNotFound(path.to_string()))?;
        drive.blacklisted = blacklisted;
        Ok(())
    }

    /// Pick a drive for a disc class without a specific path: narrowest
    /// capability first, so wide drives stay free for discs that need
    /// them; ties break on registration order.
    pub async fn select_for(&self, disc_type: DiscType) -> Option<String> {
        let state = self.inner.lock().await;
        state
            .drives
            .values()
            .filter(|d| {
                !d.blacklisted
                    && d.assigned_job.is_none()
                    && d.capability.covers(disc_type.required_class())
            })
            .min_by_key(|d| (d.capability, d.seq))
            .map(|d| d.path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capability_hierarchy() {
        let reg = DriveRegistry::new();
        reg.register("/dev/sr0", "BD-RE WH16NS40", DriveClass::Bluray).await;
        reg.register("/dev/sr1", "CDRW-52X", DriveClass::Cd).await;

        // Blu-ray drive satisfies CD, DVD, and Blu-ray requests
        for disc in [DiscType::CdAudio, DiscType::DvdVideo, DiscType::BlurayRom] {
            assert!(reg.try_reserve("/dev/sr0", disc, "j").await.is_ok());
            reg.release("/dev/sr0").await;
        }

        // CD-only drive is rejected for DVD and Blu-ray
        assert!(reg.try_reserve("/dev/sr1", DiscType::CdRom, "j").await.is_ok());
        reg.release("/dev/sr1").await;
        assert!(reg.try_reserve("/dev/sr1", DiscType::DvdVideo, "j").await.is_err());
        assert!(reg.try_reserve("/dev/sr1", DiscType::BlurayRom, "j").await.is_err());
    }

    #[tokio::test]
    async fn reservation_is_exclusive_until_release() {
        let reg = DriveRegistry::new();
        reg.register("/dev/sr0", "X", DriveClass::Dvd).await;

        assert!(reg.try_reserve("/dev/sr0", DiscType::DvdRom, "a").await.is_ok());
        assert!(reg.try_reserve("/dev/sr0", DiscType::DvdRom, "b").await.is_err());

        reg.release("/dev/sr0").await;
        assert!(reg.try_reserve("/dev/sr0", DiscType::DvdRom, "b").await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_reservations_admit_one() {
        let reg = DriveRegistry::new();
        reg.register("/dev/sr0", "X", DriveClass::Bluray).await;

        let mut handles = Vec::new();
        for i in 0..16 {
            let reg = reg.clone();
            handles.push(tokio::spawn(async move {
                reg.try_reserve("/dev/sr0", DiscType::BlurayVideo, &format!("job-{i}"))
                    .await
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn selection_prefers_narrowest_capability() {
        let reg = DriveRegistry::new();
        reg.register("/dev/sr0", "BD", DriveClass::Bluray).await;
        reg.register("/dev/sr1", "CD", DriveClass::Cd).await;
        reg.register("/dev/sr2", "DVD", DriveClass::Dvd).await;

        // CD job goes to the CD-only drive, not the Blu-ray one
        assert_eq!(reg.select_for(DiscType::CdAudio).await.as_deref(), Some("/dev/sr1"));
        // DVD job skips the CD drive
        assert_eq!(reg.select_for(DiscType::DvdVideo).await.as_deref(), Some("/dev/sr2"));
        // Blu-ray job has one choice
        assert_eq!(reg.select_for(DiscType::BlurayVideo).await.as_deref(), Some("/dev/sr0"));
    }

    #[tokio::test]
    async fn selection_tie_breaks_on_registration_order() {
        let reg = DriveRegistry::new();
        reg.register("/dev/sr3", "DVD-A", DriveClass::Dvd).await;
        reg.register("/dev/sr1", "DVD-B", DriveClass::Dvd).await;

        assert_eq!(reg.select_for(DiscType::DvdRom).await.as_deref(), Some("/dev/sr3"));
    }

    #[tokio::test]
    async fn blacklist_blocks_reservation_but_not_release() {
        let reg = DriveRegistry::new();
        reg.register("/dev/sr0", "X", DriveClass::Dvd).await;

        reg.try_reserve("/dev/sr0", DiscType::DvdRom, "a").await.unwrap();
        // Blacklisting does not abort the in-flight assignment
        reg.set_blacklisted("/dev/sr0", true).await.unwrap();
        assert_eq!(
            reg.get("/dev/sr0").await.unwrap().assigned_job.as_deref(),
            Some("a")
        );

        reg.release("/dev/sr0").await;
        assert!(reg.try_reserve("/dev/sr0", DiscType::DvdRom, "b").await.is_err());

        reg.set_blacklisted("/dev/sr0", false).await.unwrap();
        assert!(reg.try_reserve("/dev/sr0", DiscType::DvdRom, "b").await.is_ok());
    }
}
