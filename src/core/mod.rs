pub mod hardware;
pub mod mounts;
pub mod orchestrator;
pub mod tree_copier;

pub use hardware::{DeviceAction, DeviceEvent, HardwareMonitor};
pub use mounts::{DirectoryMounts, MountResolver, ProcMounts};
pub use orchestrator::{EventOutcome, Orchestrator, backup_destination};
pub use tree_copier::{CopyError, CopyOptions, CopyStats, copy_tree};
