//! simplevm: boot a Linux VM from four file slots.
//!
//! The [`coordinator`] owns slot assignment and the VM lifecycle; the
//! [`server`] and the drop folder in [`vm::drop_folder`] are front ends to it.

pub mod coordinator;
pub mod logging;
pub mod paths;
pub mod server;
pub mod settings;
pub mod state_machine;
pub mod vm;

pub use coordinator::{CoordinatorHandle, StartOutcome, StopOutcome, VmStatus};
pub use state_machine::VmPhase;
