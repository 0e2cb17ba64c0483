//! VM layer for simplevm.
//!
//! Boot slots and the readiness rule over them, the hypervisor boundary and
//! its vfkit backend, the serial console fan-out, and the drop folder that
//! feeds file paths into the slots.

pub mod console;
pub mod drop_folder;
pub mod hypervisor;
pub mod readiness;
pub mod slots;
pub mod vfkit;

pub use console::{ConsoleHandle, ConsoleHub};
pub use hypervisor::{
    BootConfig, ExitReason, Hypervisor, Launched, MachineResources, RunNotice, VmRun,
};
pub use readiness::ReadinessPolicy;
pub use slots::{Slot, SlotPaths};
pub use vfkit::VfkitHypervisor;
