//! The daemon event loop.
//!
//! Bridges the drive event source to the registry and the pipeline
//! executor: attach/detach maintain the drive table, disc insertion
//! kicks off the claim protocol, and detected drives are written through
//! to the database so blacklist flags survive restarts.

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::adapters::{self, DriveEvent};
use crate::context::AppContext;
use crate::db;

pub struct Orchestrator {
    ctx: AppContext,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub async fn start(&self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(32);
        let source = adapters::get_source(self.ctx.config.simulation);
        source.start(tx);
        info!("Orchestrator started");

        while let Some(event) = rx.recv().await {
            self.handle_drive_event(event).await;
        }

        Ok(())
    }

    pub async fn handle_drive_event(&self, event: DriveEvent) {
        match event {
            DriveEvent::DriveAttached {
                path,
                model,
                capability,
            } => {
                info!(drive = %path, %model, capability = capability.as_str(), "Drive attached");
                self.ctx.registry.register(&path, &model, capability).await;

                // Blacklist flags are durable; re-apply the persisted one.
                let blacklisted = match db::drives::load_all(&self.ctx.db).await {
                    Ok(records) => records
                        .iter()
                        .find(|r| r.path == path)
                        .map(|r| r.blacklisted)
                        .unwrap_or(false),
                    Err(e) => {
                        warn!(error = %e, "Failed to read persisted drives");
                        false
                    }
                };
                if blacklisted {
                    let _ = self.ctx.registry.set_blacklisted(&path, true).await;
                }

                if let Err(e) = db::drives::upsert(
                    &self.ctx.db,
                    db::drives::DriveRecord {
                        path,
                        model,
                        capability,
                        blacklisted,
                    },
                )
                .await
                {
                    warn!(error = %e, "Failed to persist drive");
                }
            }
            DriveEvent::DriveDetached { path } => {
                info!(drive = %path, "Drive detached");
                self.ctx.executor.handle_drive_detached(&path).await;
            }
            DriveEvent::DiscInserted {
                path,
                disc_type,
                label,
            } => {
                info!(drive = %path, disc_type = disc_type.as_str(), %label, "Disc inserted");
                match self.ctx.executor.admit_disc(&path, disc_type, &label).await {
                    Ok(job) => info!(job_id = %job.id, "Job admitted"),
                    Err(e) => warn!(drive = %path, error = %e, "Disc not admitted"),
                }
            }
            DriveEvent::DiscRemoved { path } => {
                // A drive-bound step that loses its media fails on its
                // own; here we only refresh the dashboard state.
                self.ctx.registry.set_disc_label(&path, None).await;
            }
        }
    }
}
