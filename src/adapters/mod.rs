use std::sync::Arc;

use crate::core::hardware::HardwareMonitor;
use crate::core::mounts::{DirectoryMounts, MountResolver, ProcMounts};

mod linux;
mod simulated;

pub use linux::LinuxMonitor;
pub use simulated::{SIMULATED_FS_TYPE, SimulatedMonitor, Simulator};

pub fn get_monitor(simulation: bool) -> Box<dyn HardwareMonitor> {
    if !simulation {
        return Box::new(LinuxMonitor::new());
    }

    let (monitor, controller) = SimulatedMonitor::new();

    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lines().map_while(Result::ok) {
            if !controller.apply_command(line.trim()) {
                println!("(Simulator) Use: 'add <dir> [fstype]', 'raw <dir>' or 'rm <dir>'");
            }
        }
    });

    Box::new(monitor)
}

pub fn get_mount_resolver(simulation: bool) -> Arc<dyn MountResolver> {
    if simulation {
        Arc::new(DirectoryMounts)
    } else {
        Arc::new(ProcMounts::default())
    }
}
