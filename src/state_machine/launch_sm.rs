//! VM launch state machine.
//!
//! Hierarchy:
//! ```text
//! Session (superstate: slot assignment, ignores everything else)
//!     ├── Idle                     [entry: drop the finished run]
//!     ├── Starting                 [entry: spawn boot task]
//!     ├── Running { description }
//!     └── Stopping                 [entry: spawn terminate task]
//! ```
//!
//! Hypervisor results come back as events tagged with the generation of the
//! run they belong to; events from an older generation fall through to the
//! superstate and are ignored.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statig::prelude::*;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::vm::hypervisor::{
    BootConfig, ExitReason, Hypervisor, Launched, MachineResources, RunNotice, VmRun,
};
use crate::vm::readiness::ReadinessPolicy;
use crate::vm::slots::{Slot, SlotPaths};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events dispatched to the launch state machine.
#[derive(Debug, Clone)]
pub enum LaunchEvent {
    /// A file source assigned a path to a slot.
    AssignSlot { slot: Slot, path: PathBuf },
    /// A slot was emptied.
    ClearSlot { slot: Slot },
    /// User asked to start the VM.
    Start,
    /// User asked to stop the VM.
    Stop,
    /// The hypervisor accepted the boot.
    Booted {
        generation: u64,
        run: Arc<dyn VmRun>,
        description: String,
    },
    /// The hypervisor rejected the boot.
    BootFailed { generation: u64, message: String },
    /// The hypervisor reported a new state description.
    StateChanged { generation: u64, description: String },
    /// The run ended, requested or not.
    Exited { generation: u64, reason: ExitReason },
    /// A terminate request completed.
    StopFinished {
        generation: u64,
        error: Option<String>,
    },
}

/// Coarse lifecycle phase reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmPhase {
    Idle,
    Starting,
    Running,
    Stopping,
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

/// Shared storage for the launch state machine.
///
/// - `slots` / `policy`: configuration and the readiness rule over it
/// - `run`: the live VM; `Some` from Booted until the machine is back in Idle
/// - `generation`: bumped on every boot; tags hypervisor events
/// - `events`: channel bridging spawned hypervisor tasks back to the owner
pub struct LaunchMachine {
    pub slots: SlotPaths,
    pub policy: ReadinessPolicy,
    pub resources: MachineResources,
    pub generation: u64,
    pub run: Option<Arc<dyn VmRun>>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_exit: Option<ExitReason>,
    hypervisor: Arc<dyn Hypervisor>,
    events: mpsc::UnboundedSender<LaunchEvent>,
    rt_handle: tokio::runtime::Handle,
}

impl LaunchMachine {
    pub fn new(
        policy: ReadinessPolicy,
        resources: MachineResources,
        hypervisor: Arc<dyn Hypervisor>,
        events: mpsc::UnboundedSender<LaunchEvent>,
        rt_handle: tokio::runtime::Handle,
    ) -> Self {
        Self {
            slots: SlotPaths::new(),
            policy,
            resources,
            generation: 0,
            run: None,
            started_at: None,
            last_error: None,
            last_exit: None,
            hypervisor,
            events,
            rt_handle,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.policy.is_ready(&self.slots)
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }
}

impl State {
    pub fn phase(&self) -> VmPhase {
        match self {
            State::Idle {} => VmPhase::Idle,
            State::Starting {} => VmPhase::Starting,
            State::Running { .. } => VmPhase::Running,
            State::Stopping {} => VmPhase::Stopping,
        }
    }

    /// State description; present only while running.
    pub fn description(&self) -> Option<&str> {
        match self {
            State::Running { description } => Some(description.as_str()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::idle()",
    state(derive(Debug, Clone, PartialEq))
)]
impl LaunchMachine {
    /// Slot edits are accepted in every state. Anything a leaf did not
    /// consume is ignored here.
    #[superstate]
    fn session(&mut self, event: &LaunchEvent) -> Outcome<State> {
        match event {
            LaunchEvent::AssignSlot { slot, path } => {
                let replaced = self.slots.set(*slot, path.clone());
                info!(
                    target: "coordinator",
                    slot = %slot,
                    path = %path.display(),
                    replaced = replaced.is_some(),
                    "slot assigned"
                );
                Handled
            }
            LaunchEvent::ClearSlot { slot } => {
                if self.slots.clear(*slot).is_some() {
                    info!(target: "coordinator", slot = %slot, "slot cleared");
                }
                Handled
            }
            other => {
                debug!(target: "coordinator", event = ?other, "event ignored");
                Handled
            }
        }
    }

    /// No VM. Start proceeds only when the readiness policy is satisfied.
    #[state(superstate = "session", entry_action = "enter_idle")]
    fn idle(&mut self, event: &LaunchEvent) -> Outcome<State> {
        match event {
            LaunchEvent::Start if self.is_ready() => Transition(State::starting()),
            LaunchEvent::Start => {
                let missing = self.policy.missing(&self.slots);
                info!(target: "coordinator", missing = ?missing, "start ignored: not ready");
                Handled
            }
            _ => Super,
        }
    }

    /// Waiting for the boot task. Start and Stop are ignored meanwhile.
    #[state(superstate = "session", entry_action = "enter_starting")]
    fn starting(&mut self, event: &LaunchEvent) -> Outcome<State> {
        match event {
            LaunchEvent::Booted {
                generation,
                run,
                description,
            } if self.is_current(*generation) => {
                info!(target: "coordinator", run = %run.id(), state = %description, "VM running");
                self.run = Some(Arc::clone(run));
                self.started_at = Some(Utc::now());
                Transition(State::running(description.clone()))
            }
            LaunchEvent::BootFailed {
                generation,
                message,
            } if self.is_current(*generation) => {
                warn!(target: "coordinator", error = %message, "VM failed to start");
                self.last_error = Some(message.clone());
                Transition(State::idle())
            }
            _ => Super,
        }
    }

    /// The VM is up; `description` carries the latest reported state.
    #[state(superstate = "session")]
    fn running(&mut self, event: &LaunchEvent, description: &String) -> Outcome<State> {
        match event {
            LaunchEvent::Stop => Transition(State::stopping()),
            LaunchEvent::StateChanged {
                generation,
                description: next,
            } if self.is_current(*generation) && next != description => {
                Transition(State::running(next.clone()))
            }
            LaunchEvent::Exited { generation, reason } if self.is_current(*generation) => {
                match reason {
                    ExitReason::Fault(msg) => {
                        warn!(target: "coordinator", error = %msg, "VM terminated unexpectedly");
                        self.last_error = Some(msg.clone());
                    }
                    ExitReason::Shutdown => {
                        info!(target: "coordinator", "VM shut down");
                    }
                }
                self.last_exit = Some(reason.clone());
                Transition(State::idle())
            }
            _ => Super,
        }
    }

    /// Terminate requested; waiting for the run to end.
    #[state(superstate = "session", entry_action = "enter_stopping")]
    fn stopping(&mut self, event: &LaunchEvent) -> Outcome<State> {
        match event {
            LaunchEvent::Exited { generation, reason } if self.is_current(*generation) => {
                info!(target: "coordinator", reason = %reason, "VM stopped");
                self.last_exit = Some(reason.clone());
                Transition(State::idle())
            }
            LaunchEvent::StopFinished { generation, error } if self.is_current(*generation) => {
                match error {
                    Some(msg) => {
                        warn!(target: "coordinator", error = %msg, "VM stop failed");
                        self.last_error = Some(msg.clone());
                    }
                    None => {
                        info!(target: "coordinator", "VM stopped");
                        self.last_exit = Some(ExitReason::Shutdown);
                    }
                }
                Transition(State::idle())
            }
            _ => Super,
        }
    }

    // ------------------------------------------------------------------
    // Entry actions
    // ------------------------------------------------------------------

    #[action]
    fn enter_idle(&mut self) {
        self.run = None;
        self.started_at = None;
    }

    /// Spawn the boot task. Called on entry to `Starting`.
    #[action]
    fn enter_starting(&mut self) {
        self.generation += 1;
        self.last_error = None;
        self.last_exit = None;
        let generation = self.generation;

        let Some(config) = BootConfig::from_slots(&self.slots, &self.resources) else {
            let _ = self.events.send(LaunchEvent::BootFailed {
                generation,
                message: "no kernel assigned".to_string(),
            });
            return;
        };

        info!(
            target: "coordinator",
            generation,
            hypervisor = self.hypervisor.name(),
            slots = %self.slots.summary(),
            "starting VM"
        );

        let hypervisor = Arc::clone(&self.hypervisor);
        let events = self.events.clone();
        self.rt_handle
            .spawn(boot_and_watch(hypervisor, config, generation, events));
    }

    /// Spawn the terminate task. Called on entry to `Stopping`.
    #[action]
    fn enter_stopping(&mut self) {
        let generation = self.generation;
        let events = self.events.clone();
        let Some(run) = self.run.clone() else {
            let _ = events.send(LaunchEvent::StopFinished {
                generation,
                error: None,
            });
            return;
        };

        info!(target: "coordinator", run = %run.id(), "stopping VM");
        self.rt_handle.spawn(async move {
            let error = run.terminate().await.err().map(|e| format!("{e:#}"));
            let _ = events.send(LaunchEvent::StopFinished { generation, error });
        });
    }
}

/// Boot through the hypervisor, then relay the run's notices as events
/// until it exits.
async fn boot_and_watch(
    hypervisor: Arc<dyn Hypervisor>,
    config: BootConfig,
    generation: u64,
    events: mpsc::UnboundedSender<LaunchEvent>,
) {
    let Launched {
        run,
        description,
        mut notices,
    } = match hypervisor.boot(config).await {
        Ok(launched) => launched,
        Err(e) => {
            let _ = events.send(LaunchEvent::BootFailed {
                generation,
                message: format!("{e:#}"),
            });
            return;
        }
    };

    let booted = LaunchEvent::Booted {
        generation,
        run: Arc::clone(&run),
        description,
    };
    if events.send(booted).is_err() {
        warn!(
            target: "coordinator",
            run = %run.id(),
            "coordinator gone before boot finished, terminating VM"
        );
        if let Err(e) = run.terminate().await {
            warn!(target: "coordinator", error = %e, "terminate failed");
        }
        return;
    }

    loop {
        let event = match notices.recv().await {
            Some(RunNotice::State(description)) => LaunchEvent::StateChanged {
                generation,
                description,
            },
            Some(RunNotice::Exited(reason)) => LaunchEvent::Exited { generation, reason },
            None => LaunchEvent::Exited {
                generation,
                reason: ExitReason::Fault("hypervisor stopped reporting".to_string()),
            },
        };
        let last = matches!(event, LaunchEvent::Exited { .. });
        if events.send(event).is_err() || last {
            return;
        }
    }
}
