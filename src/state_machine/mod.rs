//! Lifecycle state machines.

pub mod launch_sm;

pub use launch_sm::{LaunchEvent, LaunchMachine, VmPhase};
