use std::collections::BTreeMap;
use std::path::Path;

use tokio::sync::mpsc;

/// udev property carrying the detected filesystem type.
pub const PROP_FS_TYPE: &str = "ID_FS_TYPE";
/// udev property carrying the device node, e.g. `/dev/sdb1`.
pub const PROP_DEVNAME: &str = "DEVNAME";
/// udev property carrying the raw action name.
pub const PROP_ACTION: &str = "ACTION";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAction {
    Add,
    Remove,
    Other(String),
}

impl DeviceAction {
    pub fn from_str(s: &str) -> Self {
        match s {
            "add" => Self::Add,
            "remove" => Self::Remove,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A single hotplug notification for a block device.
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub action: DeviceAction,
    pub properties: BTreeMap<String, String>,
}

impl DeviceEvent {
    pub fn new(action: DeviceAction) -> Self {
        Self {
            action,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn filesystem_type(&self) -> Option<&str> {
        self.properties.get(PROP_FS_TYPE).map(String::as_str)
    }

    pub fn devnode(&self) -> Option<&Path> {
        self.properties.get(PROP_DEVNAME).map(Path::new)
    }

    /// An add event for a device that exposes a filesystem.
    ///
    /// Only presence of the filesystem type is checked, an empty value still counts.
    pub fn qualifies_for_backup(&self) -> bool {
        self.action == DeviceAction::Add && self.properties.contains_key(PROP_FS_TYPE)
    }
}

pub trait HardwareMonitor: Send + Sync {
    /// Start listening for hardware events.
    /// Spawns internal tasks that send events to the provided channel.
    /// Dropping the sender (e.g. on a subscription failure) ends the consumer loop.
    fn start(&self, event_sender: mpsc::Sender<DeviceEvent>);

    /// Stop the hardware monitor gracefully.
    fn stop(&self);

    /// The error that ended the event stream, if it did not close normally.
    /// Taking it clears it.
    fn take_failure(&self) -> Option<anyhow::Error> {
        None
    }
}
