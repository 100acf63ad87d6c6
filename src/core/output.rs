//! Output path resolution and locking.
//!
//! Computes candidate destinations per disc type, validates caller
//! overrides, and guards ROM file targets against the race where two
//! jobs resolve the same path. Video and audio destinations are
//! directories; ROM/data destinations are full file paths ending in a
//! recognized image/archive extension.

use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};

use crate::config::AppConfig;
use crate::error::{ControlError, ControlResult};

use super::drive::DiscType;

/// File endings accepted for ROM/data/"other" destinations.
const ROM_EXTENSIONS: &[&str] = &[".iso", ".img", ".iso.zst", ".iso.bz2", ".img.zst", ".img.bz2"];

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1F]+"#).expect("static regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

/// Make a disc label safe to use as a path component.
pub fn sanitize_label(name: &str) -> String {
    let cleaned = UNSAFE_CHARS.replace_all(name, "");
    let collapsed = WHITESPACE.replace_all(cleaned.trim(), " ");
    if collapsed.is_empty() {
        "DISC".to_string()
    } else {
        collapsed.into_owned()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputProposal {
    pub path: PathBuf,
    /// Only meaningful for ROM discs: a file already exists (or is
    /// claimed by another job) at the proposed path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<bool>,
    /// The proposal claimed the path.
    pub locked: bool,
}

/// Resolver state: configured roots plus the in-process set of claimed
/// ROM file targets.
#[derive(Clone)]
pub struct OutputResolver {
    video_root: PathBuf,
    audio_root: PathBuf,
    rom_root: PathBuf,
    use_compression: bool,
    compressor: String,
    claimed: Arc<Mutex<HashSet<PathBuf>>>,
}

impl OutputResolver {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            video_root: config.video_output_dir.clone(),
            audio_root: config.audio_output_dir.clone(),
            rom_root: config.rom_output_dir.clone(),
            use_compression: config.tools.use_compression,
            compressor: config.tools.compressor.clone(),
            claimed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Compute (and for ROM discs, try to claim) the destination for a
    /// detected disc.
    pub fn propose(&self, disc_type: DiscType, label: &str) -> OutputProposal {
        let name = sanitize_label(label);
        match disc_type {
            DiscType::DvdVideo | DiscType::BlurayVideo => OutputProposal {
                path: self.video_root.join(&name),
                duplicate: None,
                locked: false,
            },
            DiscType::CdAudio => OutputProposal {
                path: self.audio_root.join(&name),
                duplicate: None,
                locked: false,
            },
            _ => {
                let path = self.rom_file_path(&name);
                // Existence check and claim happen under one lock so
                // exactly one of two concurrent proposals wins.
                let mut claimed = self.claimed.lock().expect("output lock poisoned");
                let duplicate = path.exists() || claimed.contains(&path);
                if !duplicate {
                    claimed.insert(path.clone());
                }
                OutputProposal {
                    path,
                    duplicate: Some(duplicate),
                    locked: !duplicate,
                }
            }
        }
    }

    fn rom_file_path(&self, name: &str) -> PathBuf {
        let file = if self.use_compression && self.compressor.contains("zstd") {
            format!("{name}.iso.zst")
        } else if self.use_compression && self.compressor.contains("bzip2") {
            format!("{name}.iso.bz2")
        } else {
            format!("{name}.iso")
        };
        self.rom_root.join(name).join(file)
    }

    /// Validate a caller-supplied path against the disc-type shape rule.
    pub fn validate_shape(&self, disc_type: DiscType, path: &Path) -> ControlResult<()> {
        if disc_type.is_rom() {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_lowercase)
                .unwrap_or_default();
            if ROM_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
                Ok(())
            } else {
                Err(ControlError::InvalidOutputPath(format!(
                    "ROM output must be a file path ending in one of {ROM_EXTENSIONS:?}"
                )))
            }
        } else {
            // Video and audio destinations are directories, never filenames
            if path.extension().is_some() {
                Err(ControlError::InvalidOutputPath(
                    "video/audio output must be a directory (no filename)".to_string(),
                ))
            } else {
                Ok(())
            }
        }
    }

    /// Claim `new` for a job overriding its destination, moving the
    /// job's own claim off `owned` if it holds one. A job that never
    /// held a claim (duplicate proposal) passes `None` and cannot evict
    /// the holder's. Fails if `new` already exists or is claimed.
    pub fn reclaim(&self, owned: Option<&Path>, new: &Path) -> ControlResult<()> {
        let mut claimed = self.claimed.lock().expect("output lock poisoned");
        if new.exists() || claimed.contains(new) {
            return Err(ControlError::InvalidOutputPath(format!(
                "{} already exists",
                new.display()
            )));
        }
        if let Some(owned) = owned {
            claimed.remove(owned);
        }
        claimed.insert(new.to_path_buf());
        Ok(())
    }

    /// Release a claim once its job reaches a terminal state or is
    /// deleted.
    pub fn release(&self, path: &Path) {
        self.claimed.lock().expect("output lock poisoned").remove(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use tempfile::tempdir;

    fn resolver(root: &Path) -> OutputResolver {
        let cfg = AppConfig {
            video_output_dir: root.join("video"),
            audio_output_dir: root.join("audio"),
            rom_output_dir: root.join("iso"),
            ..AppConfig::default()
        };
        OutputResolver::new(&cfg)
    }

    #[test]
    fn sanitize_strips_path_hazards() {
        assert_eq!(sanitize_label("My/Disc: <Vol*1>"), "MyDisc Vol1");
        assert_eq!(sanitize_label("   spaced    out  "), "spaced out");
        assert_eq!(sanitize_label("///"), "DISC");
    }

    #[test]
    fn video_proposal_is_a_directory() {
        let tmp = tempdir().unwrap();
        let r = resolver(tmp.path());
        let p = r.propose(DiscType::DvdVideo, "SOME MOVIE");
        assert!(p.path.ends_with("video/SOME MOVIE"));
        assert_eq!(p.duplicate, None);
        assert!(!p.locked);
    }

    #[test]
    fn rom_proposal_claims_exactly_once() {
        let tmp = tempdir().unwrap();
        let r = resolver(tmp.path());

        let first = r.propose(DiscType::CdRom, "MyDisc");
        assert_eq!(first.duplicate, Some(false));
        assert!(first.locked);

        // Identical label proposes the identical path, now a duplicate
        let second = r.propose(DiscType::CdRom, "MyDisc");
        assert_eq!(second.path, first.path);
        assert_eq!(second.duplicate, Some(true));
        assert!(!second.locked);
    }

    #[tokio::test]
    async fn concurrent_rom_proposals_admit_one() {
        let tmp = tempdir().unwrap();
        let r = resolver(tmp.path());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let r = r.clone();
            handles.push(tokio::spawn(async move {
                r.propose(DiscType::DvdRom, "SAME DISC").locked
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

    #[test]
    fn pre_existing_file_reports_duplicate() {
        let tmp = tempdir().unwrap();
        let r = resolver(tmp.path());

        let expected = tmp.path().join("iso/Old/Old.iso.zst");
        std::fs::create_dir_all(expected.parent().unwrap()).unwrap();
        std::fs::write(&expected, b"x").unwrap();

        let p = r.propose(DiscType::BlurayRom, "Old");
        assert_eq!(p.duplicate, Some(true));
    }

    #[test]
    fn shape_validation() {
        let tmp = tempdir().unwrap();
        let r = resolver(tmp.path());

        assert!(r.validate_shape(DiscType::DvdVideo, Path::new("/out/Movie")).is_ok());
        assert!(r.validate_shape(DiscType::DvdVideo, Path::new("/out/Movie.mkv")).is_err());
        assert!(r.validate_shape(DiscType::CdAudio, Path::new("/out/Album")).is_ok());

        assert!(r.validate_shape(DiscType::CdRom, Path::new("/out/Disc.iso")).is_ok());
        assert!(r.validate_shape(DiscType::OtherDisc, Path::new("/out/Disc.iso.zst")).is_ok());
        assert!(r.validate_shape(DiscType::CdRom, Path::new("/out/Disc")).is_err());
        assert!(r.validate_shape(DiscType::CdRom, Path::new("/out/Disc.txt")).is_err());
    }

    #[test]
    fn reclaim_moves_the_claim() {
        let tmp = tempdir().unwrap();
        let r = resolver(tmp.path());

        let first = r.propose(DiscType::CdRom, "MyDisc");
        assert!(first.locked);

        let alt = tmp.path().join("iso/MyDisc/MyDisc_2.iso");
        r.reclaim(Some(&first.path), &alt).unwrap();

        // The original path is free again, the new one is taken
        assert_eq!(r.propose(DiscType::CdRom, "MyDisc").duplicate, Some(false));
        assert!(r.reclaim(Some(&first.path), &alt).is_err());
    }

    #[test]
    fn unowned_override_cannot_evict_the_claim_holder() {
        let tmp = tempdir().unwrap();
        let r = resolver(tmp.path());

        let holder = r.propose(DiscType::CdRom, "MyDisc");
        assert!(holder.locked);

        // A duplicate job never held a claim; moving to a fresh path
        // must leave the holder's claim in place
        let alt = tmp.path().join("iso/MyDisc/MyDisc_2.iso");
        r.reclaim(None, &alt).unwrap();
        assert_eq!(r.propose(DiscType::CdRom, "MyDisc").duplicate, Some(true));
    }
}
