//! Drive event sources.
//!
//! The daemon core is hardware-agnostic: it consumes a stream of
//! `DriveEvent`s from whichever source is configured. Production uses the
//! udev-backed Linux source; tests and development use the simulated
//! source, which injects events on demand.

use tokio::sync::mpsc;

use crate::core::drive::{DiscType, DriveClass};

#[cfg(target_os = "linux")]
mod linux;
pub mod simulated;

#[derive(Debug, Clone)]
pub enum DriveEvent {
    DriveAttached {
        path: String,
        model: String,
        capability: DriveClass,
    },
    DriveDetached {
        path: String,
    },
    DiscInserted {
        path: String,
        disc_type: DiscType,
        label: String,
    },
    DiscRemoved {
        path: String,
    },
}

pub trait DriveEventSource: Send + Sync {
    /// Start listening for drive events. Spawns internal tasks/threads
    /// that send events to the provided channel.
    fn start(&self, event_sender: mpsc::Sender<DriveEvent>);
}

pub fn get_source(simulation: bool) -> Box<dyn DriveEventSource> {
    if simulation {
        let (source, controller) = simulated::SimulatedSource::new();
        simulated::spawn_stdin_controller(controller);
        return Box::new(source);
    }

    #[cfg(target_os = "linux")]
    {
        Box::new(linux::UdevSource)
    }
    #[cfg(not(target_os = "linux"))]
    {
        panic!("only the simulated drive source is available on this platform (set simulation = true)")
    }
}
