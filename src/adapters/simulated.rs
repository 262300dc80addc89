use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::core::hardware::{
    DeviceAction, DeviceEvent, HardwareMonitor, PROP_ACTION, PROP_DEVNAME, PROP_FS_TYPE,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Filesystem reported for simulated devices unless told otherwise.
pub const SIMULATED_FS_TYPE: &str = "vfat";

/// Handle used to inject fake hotplug events into a [`SimulatedMonitor`].
///
/// Simulated devices are plain directories: the "device node" is the
/// directory path, resolved as its own mount point by `DirectoryMounts`.
#[derive(Clone)]
pub struct Simulator {
    tx: mpsc::UnboundedSender<DeviceEvent>,
}

impl Simulator {
    pub fn add_device(&self, path: &Path, fs_type: &str) {
        let event = simulated_event(DeviceAction::Add, path).with_property(PROP_FS_TYPE, fs_type);
        let _ = self.tx.send(event);
    }

    /// An add event without filesystem metadata, like a bare disk.
    pub fn add_raw_device(&self, path: &Path) {
        let _ = self.tx.send(simulated_event(DeviceAction::Add, path));
    }

    pub fn remove_device(&self, path: &Path) {
        let _ = self.tx.send(simulated_event(DeviceAction::Remove, path));
    }

    /// Apply one line of the stdin simulator protocol.
    pub fn apply_command(&self, line: &str) -> bool {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["add", path] => self.add_device(Path::new(path), SIMULATED_FS_TYPE),
            ["add", path, fs_type] => self.add_device(Path::new(path), fs_type),
            ["raw", path] => self.add_raw_device(Path::new(path)),
            ["rm", path] => self.remove_device(Path::new(path)),
            _ => return false,
        }
        true
    }
}

fn simulated_event(action: DeviceAction, path: &Path) -> DeviceEvent {
    let name = match &action {
        DeviceAction::Add => "add",
        DeviceAction::Remove => "remove",
        DeviceAction::Other(other) => other.as_str(),
    }
    .to_string();

    DeviceEvent::new(action)
        .with_property(PROP_ACTION, name)
        .with_property(PROP_DEVNAME, path.to_string_lossy())
}

pub struct SimulatedMonitor {
    // Wrapped so it can be moved out inside `start()`, which takes &self
    cmd_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<DeviceEvent>>>>,
    cancel: CancellationToken,
}

impl SimulatedMonitor {
    pub fn new() -> (Self, Simulator) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Self {
                cmd_rx: Arc::new(Mutex::new(Some(rx))),
                cancel: CancellationToken::new(),
            },
            Simulator { tx },
        )
    }
}

impl HardwareMonitor for SimulatedMonitor {
    fn start(&self, daemon_tx: mpsc::Sender<DeviceEvent>) {
        let taken = match self.cmd_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut rx) = taken else {
            warn!("SimulatedMonitor already started");
            return;
        };

        info!("Simulated monitor listening for injected events");
        let cancel = self.cancel.clone();

        // Bridge task
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                if daemon_tx.send(event).await.is_err() {
                    break;
                }
            }
        });
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}
