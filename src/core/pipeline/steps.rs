//! Pipeline step tables.
//!
//! Each disc type maps to an ordered list of steps; a step is one
//! external tool invocation plus the policy around it (progress parser,
//! overall-progress weight, whether the physical drive can be released
//! afterwards). The executor walks the table, it never builds argv
//! itself.

use std::path::{Path, PathBuf};

use super::parsers::ParserKind;
use crate::config::ToolsConfig;
use crate::core::drive::DiscType;
use crate::core::job::Job;

/// Temp filename for the raw image produced by ROM extraction.
pub const IMAGE_FILE: &str = "disc.iso";
/// Subdirectory of the job workspace holding transcoded titles.
pub const ENCODE_DIR: &str = "enc";

#[derive(Debug, Clone)]
pub struct StepSpec {
    pub name: &'static str,
    /// argv[0] is the program; sh-wrapped steps use `/bin/sh -c`.
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Share of the overall progress gauge, all steps of a plan sum to 1.
    pub weight: f64,
    /// Step reads the physical disc and cannot run without the drive.
    pub needs_drive: bool,
    /// The disc is no longer needed once this step succeeds.
    pub release_drive_after: bool,
    /// The output path freezes when this step begins.
    pub locks_output: bool,
    pub parser: ParserKind,
}

/// Number of leading steps that read the physical disc. Everything after
/// works from the temp workspace alone.
fn drive_bound_steps(_disc_type: DiscType) -> u32 {
    1
}

/// Step index (1-based) at which the output path becomes immutable.
///
/// Video and audio destinations are directories named before ripping
/// starts; they freeze as soon as extraction begins. ROM images only
/// materialize at the final compress/copy step, leaving room to rename a
/// duplicate-flagged target until then.
pub fn output_lock_step(disc_type: DiscType) -> u32 {
    if disc_type.is_rom() {
        plan_len(disc_type)
    } else {
        1
    }
}

pub fn plan_len(disc_type: DiscType) -> u32 {
    weights(disc_type).len() as u32
}

/// Overall-progress weights per step. Extraction dominates for slow
/// media; transcode dominates encoding time on video discs.
fn weights(disc_type: DiscType) -> &'static [f64] {
    use DiscType::*;
    match disc_type {
        CdAudio => &[0.80, 0.20],
        CdRom => &[0.50, 0.50],
        DvdRom | OtherDisc => &[0.60, 0.40],
        BlurayRom => &[0.70, 0.30],
        DvdVideo => &[0.60, 0.30, 0.10],
        BlurayVideo => &[0.70, 0.25, 0.05],
    }
}

// Single-quote for /bin/sh -c. Paths come from config and sanitized
// labels but may still contain spaces.
fn sh_quote(path: &Path) -> String {
    let s = path.to_string_lossy();
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn sh_step(
    name: &'static str,
    script: String,
    weight: f64,
    needs_drive: bool,
    release_drive_after: bool,
    parser: ParserKind,
) -> StepSpec {
    StepSpec {
        name,
        argv: vec!["/bin/sh".to_string(), "-c".to_string(), script],
        cwd: None,
        weight,
        needs_drive,
        release_drive_after,
        locks_output: false,
        parser,
    }
}

/// Build the full pipeline for a job. The drive path is only consulted by
/// drive-bound steps; retried jobs run the tail and never look at it.
pub fn build_plan(job: &Job, tools: &ToolsConfig) -> Vec<StepSpec> {
    let drive = job.drive_path.clone().unwrap_or_default();
    let w = weights(job.disc_type);

    let mut plan = if job.disc_type == DiscType::CdAudio {
        audio_plan(job, tools, &drive, w)
    } else if job.disc_type.is_video() {
        video_plan(job, tools, &drive, w)
    } else {
        rom_plan(job, tools, &drive, w)
    };
    plan[output_lock_step(job.disc_type) as usize - 1].locks_output = true;
    plan
}

/// The post-extraction tail with weights renormalized to sum to 1, so a
/// retried run still ends at overall=100.
pub fn retry_plan(job: &Job, tools: &ToolsConfig) -> Vec<StepSpec> {
    let skip = drive_bound_steps(job.disc_type) as usize;
    let mut tail: Vec<StepSpec> = build_plan(job, tools).split_off(skip);
    let total: f64 = tail.iter().map(|s| s.weight).sum();
    if total > 0.0 {
        for step in &mut tail {
            step.weight /= total;
        }
    }
    tail
}

fn video_plan(job: &Job, tools: &ToolsConfig, drive: &str, w: &[f64]) -> Vec<StepSpec> {
    let temp = sh_quote(&job.temp_path);
    let enc = sh_quote(&job.temp_path.join(ENCODE_DIR));
    let out = sh_quote(&job.output_path);
    let hb = sh_quote(Path::new(&tools.handbrake));
    let preset = tools.handbrake_preset.replace('\'', r"'\''");

    let transcode = format!(
        "mkdir -p {enc} && for f in {temp}/*.mkv; do \
         [ -e \"$f\" ] || continue; \
         {hb} -i \"$f\" -o {enc}/\"$(basename \"$f\")\" --preset '{preset}'; \
         done"
    );
    let finalize = format!("mkdir -p {out} && mv {enc}/* {out}/");

    vec![
        StepSpec {
            name: "extract-titles",
            argv: vec![
                tools.makemkv.clone(),
                "-r".to_string(),
                "--progress=-same".to_string(),
                "mkv".to_string(),
                format!("dev:{drive}"),
                "all".to_string(),
                job.temp_path.to_string_lossy().into_owned(),
            ],
            cwd: None,
            weight: w[0],
            needs_drive: true,
            release_drive_after: true,
            locks_output: false,
            parser: ParserKind::Makemkv,
        },
        sh_step("transcode", transcode, w[1], false, false, ParserKind::Handbrake),
        sh_step("finalize", finalize, w[2], false, false, ParserKind::Percent),
    ]
}

fn rom_plan(job: &Job, tools: &ToolsConfig, drive: &str, w: &[f64]) -> Vec<StepSpec> {
    let image = job.temp_path.join(IMAGE_FILE);
    let image_q = sh_quote(&image);
    let out_q = sh_quote(&job.output_path);
    let out_dir_q = sh_quote(job.output_path.parent().unwrap_or(Path::new(".")));

    // .iso/.img are raw copies; anything else (.zst, .bz2) goes through
    // the configured compressor.
    let compressed = !job
        .output_path
        .extension()
        .is_some_and(|e| e == "iso" || e == "img");
    let finalize = if compressed {
        let zstd = sh_quote(Path::new(&tools.compressor));
        format!("mkdir -p {out_dir_q} && {zstd} -q -f {image_q} -o {out_q}")
    } else {
        format!("mkdir -p {out_dir_q} && cp {image_q} {out_q}")
    };

    vec![
        StepSpec {
            name: "extract-image",
            argv: vec![
                tools.image_dump.clone(),
                format!("if={drive}"),
                format!("of={}", image.to_string_lossy()),
                "bs=2048".to_string(),
                "conv=noerror,sync".to_string(),
                "status=progress".to_string(),
            ],
            cwd: None,
            weight: w[0],
            needs_drive: true,
            release_drive_after: true,
            locks_output: false,
            parser: ParserKind::ByteCount(None),
        },
        sh_step("finalize", finalize, w[1], false, false, ParserKind::Percent),
    ]
}

fn audio_plan(job: &Job, tools: &ToolsConfig, drive: &str, w: &[f64]) -> Vec<StepSpec> {
    let temp = sh_quote(&job.temp_path);
    let out = sh_quote(&job.output_path);
    let finalize = format!("mkdir -p {out} && cp -R {temp}/. {out}/");

    vec![
        StepSpec {
            name: "extract-audio",
            argv: vec![
                tools.audio_ripper.clone(),
                "-d".to_string(),
                drive.to_string(),
                "-o".to_string(),
                "flac".to_string(),
                "-N".to_string(),
            ],
            cwd: Some(job.temp_path.clone()),
            weight: w[0],
            needs_drive: true,
            release_drive_after: true,
            locks_output: false,
            parser: ParserKind::Percent,
        },
        sh_step("finalize", finalize, w[1], false, false, ParserKind::Percent),
    ]
}
