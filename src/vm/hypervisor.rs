//! The hypervisor boundary.
//!
//! The coordinator never talks to a virtualization API directly. It hands a
//! [`BootConfig`] to a [`Hypervisor`] and gets back a [`Launched`] run: a
//! handle for stop/console requests plus a channel of [`RunNotice`]s that
//! the backend pushes as the guest changes state or exits.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::vm::console::ConsoleHandle;
use crate::vm::slots::{Slot, SlotPaths};

/// Default kernel command line; hvc0 is the virtio console.
pub const DEFAULT_CMDLINE: &str = "console=hvc0";

/// CPU, memory and command line for a boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineResources {
    pub cpus: u32,
    pub memory_mb: u32,
    pub cmdline: String,
}

impl Default for MachineResources {
    fn default() -> Self {
        Self {
            cpus: 2,
            memory_mb: 2048,
            cmdline: DEFAULT_CMDLINE.to_string(),
        }
    }
}

/// Everything a backend needs to boot one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    pub kernel: PathBuf,
    pub initrd: Option<PathBuf>,
    pub image: Option<PathBuf>,
    pub extra_image: Option<PathBuf>,
    pub resources: MachineResources,
}

impl BootConfig {
    /// Build a boot configuration from the current slots.
    ///
    /// Returns `None` when no kernel is assigned.
    pub fn from_slots(slots: &SlotPaths, resources: &MachineResources) -> Option<Self> {
        let owned = |slot: Slot| slots.get(slot).map(PathBuf::from);
        Some(Self {
            kernel: owned(Slot::Kernel)?,
            initrd: owned(Slot::Initrd),
            image: owned(Slot::Image),
            extra_image: owned(Slot::Extra),
            resources: resources.clone(),
        })
    }

    /// Disk images in attachment order: boot image first, then extra image.
    pub fn disks(&self) -> impl Iterator<Item = &PathBuf> {
        self.image.iter().chain(self.extra_image.iter())
    }

    /// Kernel command line with `root=/dev/vda` appended when a boot image
    /// is attached and the configured line names no root device.
    pub fn effective_cmdline(&self) -> String {
        let base = self.resources.cmdline.trim();
        if self.image.is_some() && !base.split_whitespace().any(|arg| arg.starts_with("root=")) {
            if base.is_empty() {
                "root=/dev/vda".to_string()
            } else {
                format!("{base} root=/dev/vda")
            }
        } else {
            base.to_string()
        }
    }
}

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "lowercase")]
pub enum ExitReason {
    /// The guest powered off, or the backend completed a requested stop.
    Shutdown,
    /// The backend or guest failed.
    Fault(String),
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Shutdown => f.write_str("shut down"),
            ExitReason::Fault(msg) => write!(f, "fault: {msg}"),
        }
    }
}

/// Asynchronous report from a running VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunNotice {
    /// New human-readable state description.
    State(String),
    /// The run is over. Sent at most once, and nothing follows it.
    Exited(ExitReason),
}

/// A live VM owned by a backend.
#[async_trait]
pub trait VmRun: fmt::Debug + Send + Sync {
    /// Backend-specific identifier (e.g. a process id).
    fn id(&self) -> String;

    /// Ask the backend to end the run and wait until it has.
    async fn terminate(&self) -> Result<()>;

    /// Attach a viewer to the serial console.
    fn console(&self) -> Result<ConsoleHandle>;
}

/// A successful boot.
pub struct Launched {
    pub run: Arc<dyn VmRun>,
    /// Initial state description.
    pub description: String,
    pub notices: mpsc::UnboundedReceiver<RunNotice>,
}

/// Backend that turns a [`BootConfig`] into a running VM.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &str;

    /// Boot a VM. Path validation happens here, not before.
    async fn boot(&self, config: BootConfig) -> Result<Launched>;
}
