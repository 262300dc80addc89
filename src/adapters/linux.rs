use crate::core::hardware::{DeviceAction, DeviceEvent, HardwareMonitor, PROP_DEVNAME};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::collections::BTreeMap;
use std::os::fd::AsFd;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

const SUBSYSTEM: &str = "block";
/// How often the listener wakes up to notice `stop()`.
const POLL_TIMEOUT_MS: u16 = 500;

/// Listens for block device uevents through a udev netlink monitor.
pub struct LinuxMonitor {
    cancel: CancellationToken,
    failure: Arc<Mutex<Option<anyhow::Error>>>,
}

impl Default for LinuxMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxMonitor {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            failure: Arc::new(Mutex::new(None)),
        }
    }
}

impl HardwareMonitor for LinuxMonitor {
    fn start(&self, tx: mpsc::Sender<DeviceEvent>) {
        let cancel = self.cancel.clone();
        let failure = Arc::clone(&self.failure);

        let spawned = std::thread::Builder::new()
            .name("udev-monitor".into())
            .spawn(move || {
                // The failure is recorded before `tx` drops and ends the consumer loop
                if let Err(e) = listen(&tx, &cancel) {
                    error!(error = %e, "udev subscription failed");
                    record_failure(&failure, e);
                }
                drop(tx);
            });

        match spawned {
            Ok(_) => info!(subsystem = SUBSYSTEM, "udev listener started"),
            Err(e) => {
                error!(error = %e, "Failed to spawn udev listener thread");
                record_failure(&self.failure, e.into());
            }
        }
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn take_failure(&self) -> Option<anyhow::Error> {
        match self.failure.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

fn record_failure(slot: &Mutex<Option<anyhow::Error>>, error: anyhow::Error) {
    match slot.lock() {
        Ok(mut guard) => *guard = Some(error),
        Err(poisoned) => *poisoned.into_inner() = Some(error),
    }
}

fn listen(tx: &mpsc::Sender<DeviceEvent>, cancel: &CancellationToken) -> anyhow::Result<()> {
    let socket = udev::MonitorBuilder::new()?
        .match_subsystem(SUBSYSTEM)?
        .listen()?;

    while !cancel.is_cancelled() {
        let mut fds = [PollFd::new(socket.as_fd(), PollFlags::POLLIN)];

        match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }

        for event in socket.iter() {
            let event = to_device_event(event.event_type(), &event.device());

            if !event.qualifies_for_backup() {
                trace!(action = ?event.action, "Dropping uninteresting uevent");
                continue;
            }

            debug!(devnode = ?event.devnode(), "Forwarding add event");
            if tx.blocking_send(event).is_err() {
                debug!("Event receiver gone, stopping udev listener");
                return Ok(());
            }
        }
    }

    debug!("udev listener cancelled");
    Ok(())
}

fn to_action(event_type: udev::EventType) -> DeviceAction {
    match event_type {
        udev::EventType::Add => DeviceAction::Add,
        udev::EventType::Remove => DeviceAction::Remove,
        other => DeviceAction::Other(format!("{:?}", other).to_lowercase()),
    }
}

fn to_device_event(event_type: udev::EventType, device: &udev::Device) -> DeviceEvent {
    let mut properties: BTreeMap<String, String> = device
        .properties()
        .map(|entry| {
            (
                entry.name().to_string_lossy().into_owned(),
                entry.value().to_string_lossy().into_owned(),
            )
        })
        .collect();

    if let Some(node) = device.devnode() {
        properties
            .entry(PROP_DEVNAME.to_string())
            .or_insert_with(|| node.to_string_lossy().into_owned());
    }

    DeviceEvent {
        action: to_action(event_type),
        properties,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_failure_is_taken_once() {
        let monitor = LinuxMonitor::new();
        assert!(monitor.take_failure().is_none());

        record_failure(&monitor.failure, anyhow::anyhow!("netlink unavailable"));

        let failure = monitor.take_failure().map(|e| e.to_string());
        assert_eq!(failure.as_deref(), Some("netlink unavailable"));
        assert!(monitor.take_failure().is_none());
    }

    #[test]
    fn maps_udev_event_types() {
        assert_eq!(to_action(udev::EventType::Add), DeviceAction::Add);
        assert_eq!(to_action(udev::EventType::Remove), DeviceAction::Remove);
        assert_eq!(
            to_action(udev::EventType::Change),
            DeviceAction::Other("change".to_string())
        );
    }
}
