//! Daemon configuration.
//!
//! Layered via figment: built-in defaults, then `ripd.toml`, then
//! `RIPD_*` environment variables, then CLI overrides (serialized by the
//! caller as the top layer).

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const CONFIG_FILE: &str = "ripd.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root for per-job temp workspaces (`<temp_dir>/<job_id>/`).
    pub temp_dir: PathBuf,
    /// Output root for video discs (refined into Movies/Shows by metadata).
    pub video_output_dir: PathBuf,
    /// Output root for audio CDs.
    pub audio_output_dir: PathBuf,
    /// Output root for ROM/data/other discs (ISO images).
    pub rom_output_dir: PathBuf,
    /// SQLite database path.
    pub db_path: PathBuf,
    /// HTTP/WebSocket control surface bind address.
    pub http_bind: String,
    /// Seconds to wait after SIGTERM before force-killing a cancelled step.
    pub cancel_grace_secs: u64,
    /// Run with the simulated drive event source instead of udev.
    pub simulation: bool,
    pub verbose: bool,
    /// OMDb API key for video metadata lookup (optional feature).
    pub omdb_api_key: Option<String>,
    pub tools: ToolsConfig,
}

/// External tool commands. Each is the argv[0] the executor spawns; tests
/// point these at shell stand-ins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    pub makemkv: String,
    pub handbrake: String,
    pub handbrake_preset: String,
    pub image_dump: String,
    pub compressor: String,
    pub use_compression: bool,
    pub audio_ripper: String,
    pub eject: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            makemkv: "makemkvcon".to_string(),
            handbrake: "HandBrakeCLI".to_string(),
            handbrake_preset: "Fast 1080p30".to_string(),
            image_dump: "dd".to_string(),
            compressor: "zstd".to_string(),
            use_compression: true,
            audio_ripper: "abcde".to_string(),
            eject: "eject".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_root = std::env::temp_dir().join("ripd");
        Self {
            temp_dir: data_root.join("temp"),
            video_output_dir: data_root.join("output/video"),
            audio_output_dir: data_root.join("output/audio"),
            rom_output_dir: data_root.join("output/iso"),
            db_path: data_root.join("ripd.db"),
            http_bind: "127.0.0.1:8480".to_string(),
            cancel_grace_secs: 10,
            simulation: false,
            verbose: false,
            omdb_api_key: None,
            tools: ToolsConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn new<T: Serialize>(cli_overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed("RIPD_").split("__"));

        if let Some(cli) = cli_overrides {
            figment = figment.merge(Serialized::defaults(cli));
        }

        figment.extract().context("Invalid configuration")
    }
}
