//! Simulated drive event source.
//!
//! Drives no hardware; events are injected through the `Simulator`
//! handle. Integration tests construct it directly; `--simulation` mode
//! additionally wires a stdin command loop for manual poking.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::info;

use super::{DriveEvent, DriveEventSource};
use crate::core::drive::{DiscType, DriveClass};

#[derive(Clone)]
pub struct Simulator {
    tx: mpsc::UnboundedSender<DriveEvent>,
}

impl Simulator {
    pub fn attach_drive(&self, path: &str, model: &str, capability: DriveClass) {
        let _ = self.tx.send(DriveEvent::DriveAttached {
            path: path.to_string(),
            model: model.to_string(),
            capability,
        });
    }

    pub fn detach_drive(&self, path: &str) {
        let _ = self.tx.send(DriveEvent::DriveDetached {
            path: path.to_string(),
        });
    }

    pub fn insert_disc(&self, path: &str, disc_type: DiscType, label: &str) {
        let _ = self.tx.send(DriveEvent::DiscInserted {
            path: path.to_string(),
            disc_type,
            label: label.to_string(),
        });
    }

    pub fn remove_disc(&self, path: &str) {
        let _ = self.tx.send(DriveEvent::DiscRemoved {
            path: path.to_string(),
        });
    }
}

pub struct SimulatedSource {
    // Wrapped so `start(&self)` can move the receiver out; start is only
    // called once.
    rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<DriveEvent>>>>,
}

impl SimulatedSource {
    pub fn new() -> (Self, Simulator) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx: Arc::new(Mutex::new(Some(rx))),
            },
            Simulator { tx },
        )
    }
}

impl DriveEventSource for SimulatedSource {
    fn start(&self, event_sender: mpsc::Sender<DriveEvent>) {
        let mut rx = self
            .rx
            .lock()
            .expect("simulated source lock poisoned")
            .take()
            .expect("SimulatedSource::start() called twice");

        info!("Simulated drive source started");

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event_sender.send(event).await.is_err() {
                    break;
                }
            }
        });
    }
}

/// Interactive control loop for `--simulation` mode:
///   attach <path> <cd|dvd|bluray>
///   detach <path>
///   insert <path> <disc_type> [label..]
///   remove <path>
pub fn spawn_stdin_controller(sim: Simulator) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lines() {
            let Ok(cmd) = line else { break };
            let parts: Vec<&str> = cmd.split_whitespace().collect();
            match parts.as_slice() {
                ["attach", path, class] => match DriveClass::parse(class) {
                    Some(capability) => sim.attach_drive(path, "SIMULATED DRIVE", capability),
                    None => eprintln!("(simulator) unknown drive class: {class}"),
                },
                ["detach", path] => sim.detach_drive(path),
                ["insert", path, disc_type, label @ ..] => match DiscType::parse(disc_type) {
                    Some(disc_type) => {
                        let label = if label.is_empty() {
                            "SIM DISC".to_string()
                        } else {
                            label.join(" ")
                        };
                        sim.insert_disc(path, disc_type, &label);
                    }
                    None => eprintln!("(simulator) unknown disc type: {disc_type}"),
                },
                ["remove", path] => sim.remove_disc(path),
                [] => {}
                _ => eprintln!(
                    "(simulator) commands: attach <path> <class> | detach <path> | insert <path> <disc_type> [label] | remove <path>"
                ),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn injected_events_reach_the_daemon_channel() {
        let (source, sim) = SimulatedSource::new();
        let (tx, mut rx) = mpsc::channel(8);
        source.start(tx);

        sim.attach_drive("/dev/sr0", "SIM BD", DriveClass::Bluray);
        sim.insert_disc("/dev/sr0", DiscType::DvdVideo, "SOME MOVIE");

        match rx.recv().await.unwrap() {
            DriveEvent::DriveAttached { path, capability, .. } => {
                assert_eq!(path, "/dev/sr0");
                assert_eq!(capability, DriveClass::Bluray);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            DriveEvent::DiscInserted { disc_type, label, .. } => {
                assert_eq!(disc_type, DiscType::DvdVideo);
                assert_eq!(label, "SOME MOVIE");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
