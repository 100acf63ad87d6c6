//! udev-backed drive event source.
//!
//! Watches the `block` subsystem for optical drives (ID_CDROM=1).
//! Hotplug add/remove maps to drive attach/detach; `change` events carry
//! the media state, which is classified into a `DiscType` from the
//! ID_CDROM_MEDIA_* and ID_FS_* properties.

use std::os::fd::AsRawFd;

use tokio::sync::mpsc;
use tracing::{info, warn};
use udev::{Device, EventType};

use super::{DriveEvent, DriveEventSource};
use crate::core::drive::{DiscType, DriveClass};

pub struct UdevSource;

impl DriveEventSource for UdevSource {
    fn start(&self, event_sender: mpsc::Sender<DriveEvent>) {
        std::thread::spawn(move || {
            if let Err(e) = monitor_loop(event_sender) {
                warn!(error = %e, "udev monitor stopped");
            }
        });
    }
}

fn monitor_loop(tx: mpsc::Sender<DriveEvent>) -> anyhow::Result<()> {
    let socket = udev::MonitorBuilder::new()?
        .match_subsystem("block")?
        .listen()?;

    // Drives present before the daemon started still need to be announced.
    emit_existing(&tx)?;
    info!("udev drive monitor started");

    let fd = socket.as_raw_fd();
    loop {
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pollfd, 1, 1000) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        if ready == 0 {
            continue;
        }

        for event in socket.iter() {
            let device = event.device();
            if !is_optical(&device) {
                continue;
            }
            let Some(path) = devnode(&device) else { continue };

            let drive_event = match event.event_type() {
                EventType::Add => Some(DriveEvent::DriveAttached {
                    path,
                    model: model(&device),
                    capability: capability(&device),
                }),
                EventType::Remove => Some(DriveEvent::DriveDetached { path }),
                EventType::Change => {
                    if has_media(&device) {
                        Some(DriveEvent::DiscInserted {
                            path,
                            disc_type: classify_disc(&device),
                            label: label(&device),
                        })
                    } else {
                        Some(DriveEvent::DiscRemoved { path })
                    }
                }
                _ => None,
            };

            if let Some(ev) = drive_event
                && tx.blocking_send(ev).is_err()
            {
                return Ok(());
            }
        }
    }
}

fn emit_existing(tx: &mpsc::Sender<DriveEvent>) -> anyhow::Result<()> {
    let mut enumerator = udev::Enumerator::new()?;
    enumerator.match_subsystem("block")?;
    enumerator.match_property("ID_CDROM", "1")?;

    for device in enumerator.scan_devices()? {
        let Some(path) = devnode(&device) else { continue };
        if tx
            .blocking_send(DriveEvent::DriveAttached {
                path: path.clone(),
                model: model(&device),
                capability: capability(&device),
            })
            .is_err()
        {
            return Ok(());
        }
        if has_media(&device)
            && tx
                .blocking_send(DriveEvent::DiscInserted {
                    path,
                    disc_type: classify_disc(&device),
                    label: label(&device),
                })
                .is_err()
        {
            return Ok(());
        }
    }
    Ok(())
}

fn prop<'a>(device: &'a Device, name: &str) -> Option<&'a str> {
    device.property_value(name).and_then(|v| v.to_str())
}

fn flag(device: &Device, name: &str) -> bool {
    prop(device, name) == Some("1")
}

fn is_optical(device: &Device) -> bool {
    flag(device, "ID_CDROM")
}

fn has_media(device: &Device) -> bool {
    flag(device, "ID_CDROM_MEDIA")
}

fn devnode(device: &Device) -> Option<String> {
    device.devnode().map(|p| p.to_string_lossy().into_owned())
}

fn model(device: &Device) -> String {
    prop(device, "ID_MODEL")
        .map(|m| m.replace('_', " "))
        .unwrap_or_else(|| "UNKNOWN DRIVE".to_string())
}

fn label(device: &Device) -> String {
    prop(device, "ID_FS_LABEL")
        .map(|l| l.replace('_', " "))
        .unwrap_or_else(|| "DISC".to_string())
}

fn capability(device: &Device) -> DriveClass {
    if flag(device, "ID_CDROM_BD") {
        DriveClass::Bluray
    } else if flag(device, "ID_CDROM_DVD") {
        DriveClass::Dvd
    } else {
        DriveClass::Cd
    }
}

/// Classify inserted media. Audio track count wins outright; otherwise
/// the media class plus the filesystem decides between titles (udf) and
/// raw data.
fn classify_disc(device: &Device) -> DiscType {
    let audio_tracks = prop(device, "ID_CDROM_MEDIA_TRACK_COUNT_AUDIO")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    if audio_tracks > 0 {
        return DiscType::CdAudio;
    }

    let fs = prop(device, "ID_FS_TYPE").unwrap_or("");
    if flag(device, "ID_CDROM_MEDIA_BD") {
        return if fs == "udf" {
            DiscType::BlurayVideo
        } else {
            DiscType::BlurayRom
        };
    }
    if flag(device, "ID_CDROM_MEDIA_DVD") {
        return if fs == "udf" {
            DiscType::DvdVideo
        } else {
            DiscType::DvdRom
        };
    }
    if flag(device, "ID_CDROM_MEDIA_CD") {
        return if fs.is_empty() {
            DiscType::OtherDisc
        } else {
            DiscType::CdRom
        };
    }
    DiscType::OtherDisc
}
