use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, error, info, trace};

use crate::context::AppContext;
use crate::core::hardware::{DeviceEvent, HardwareMonitor};
use crate::core::mounts::MountResolver;
use crate::core::tree_copier::{CopyOptions, CopyStats, copy_tree};

const EVENT_QUEUE_CAPACITY: usize = 32;
const MOUNT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// `<root>/usb_backup_YYYYmmdd_HHMMSS`
pub fn backup_destination(root: &Path, now: &DateTime<Local>) -> PathBuf {
    root.join(format!("usb_backup_{}", now.format("%Y%m%d_%H%M%S")))
}

/// What happened to a single device event.
#[derive(Debug)]
pub enum EventOutcome {
    /// Not an add event, or no filesystem on the device.
    Ignored,
    NotMounted,
    Copied {
        destination: PathBuf,
        stats: CopyStats,
    },
    Failed(anyhow::Error),
}

pub struct Orchestrator {
    ctx: AppContext,
    mounts: Arc<dyn MountResolver>,
    clock: fn() -> DateTime<Local>,
}

impl Orchestrator {
    pub fn new(ctx: AppContext, mounts: Arc<dyn MountResolver>) -> Self {
        Self {
            ctx,
            mounts,
            clock: Local::now,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Local>) -> Self {
        self.clock = clock;
        self
    }

    /// Consume device events until the monitor's stream closes.
    ///
    /// Events are handled strictly one at a time; a copy runs to completion
    /// before the next event is received. A normal close (stop, end of
    /// injected input) returns `Ok`; a failed subscription returns its error.
    pub async fn start(&self, monitor: &dyn HardwareMonitor) -> Result<()> {
        info!(
            backup_directory = %self.ctx.config.backup_directory.display(),
            "usbbk daemon starting"
        );

        let (tx, mut rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        monitor.start(tx);

        while let Some(event) = rx.recv().await {
            self.handle_device_event(event).await;
        }

        monitor.stop();
        if let Some(e) = monitor.take_failure() {
            return Err(e.context("Device subscription failed"));
        }

        info!("Device event stream closed");
        Ok(())
    }

    pub async fn handle_device_event(&self, event: DeviceEvent) -> EventOutcome {
        if !event.qualifies_for_backup() {
            trace!(action = ?event.action, "Ignoring device event");
            return EventOutcome::Ignored;
        }

        let Some(devnode) = event.devnode() else {
            debug!("Add event without a device node, ignoring");
            return EventOutcome::Ignored;
        };

        info!(
            devnode = %devnode.display(),
            filesystem = event.filesystem_type().unwrap_or_default(),
            "Storage device attached"
        );

        let mount_point = match self.wait_for_mount(devnode).await {
            Ok(Some(path)) => path,
            Ok(None) => {
                debug!(devnode = %devnode.display(), "Device is not mounted, skipping");
                return EventOutcome::NotMounted;
            }
            Err(e) => {
                error!(devnode = %devnode.display(), error = %e, "Mount lookup failed");
                return EventOutcome::Failed(e);
            }
        };

        let now = (self.clock)();
        let destination = backup_destination(&self.ctx.config.backup_directory, &now);
        self.backup(mount_point, destination).await
    }

    /// Copy `source` into `destination` on the blocking pool and wait for it.
    pub async fn backup(&self, source: PathBuf, destination: PathBuf) -> EventOutcome {
        let options = CopyOptions {
            sync_files: self.ctx.config.sync_files,
        };

        let task_destination = destination.clone();
        let result =
            tokio::task::spawn_blocking(move || copy_tree(&source, &task_destination, &options))
                .await;

        match result {
            Ok(Ok(stats)) => {
                info!(
                    destination = %destination.display(),
                    files = stats.files,
                    bytes = stats.bytes,
                    "Backup complete"
                );
                EventOutcome::Copied { destination, stats }
            }
            Ok(Err(e)) => {
                error!(
                    destination = %destination.display(),
                    error = %e,
                    "Backup failed, partial copy left in place"
                );
                EventOutcome::Failed(e.into())
            }
            Err(e) => {
                error!(error = %e, "Backup task panicked");
                EventOutcome::Failed(anyhow!("Backup task failed: {}", e))
            }
        }
    }

    async fn wait_for_mount(&self, devnode: &Path) -> Result<Option<PathBuf>> {
        let deadline = Instant::now() + self.ctx.config.mount_wait();

        loop {
            if let Some(path) = self.mounts.mount_point(devnode)? {
                return Ok(Some(path));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            debug!(devnode = %devnode.display(), "Device not mounted yet, waiting");
            sleep(MOUNT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}
