//! VM launch coordinator.
//!
//! One tokio task owns the [`LaunchMachine`] and is the only writer of slot
//! configuration and run state. Callers hold a cloneable
//! [`CoordinatorHandle`]; every request is a message on the task's queue,
//! answered over a oneshot channel, so concurrent file drops and
//! start/stop clicks are applied one at a time in arrival order.
//!
//! ```text
//! CoordinatorHandle ──Command──► coordinator task ──handle()──► LaunchMachine
//!        ▲                            ▲     │                        │
//!        └──── watch<VmStatus> ◄──────┘     │            spawn boot / terminate
//!                                           └──◄── LaunchEvent ◄─────┘
//! ```
//!
//! `start()` resolves when the boot finishes but never blocks the task, so
//! slot edits and status queries are served while the hypervisor works.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use statig::prelude::*;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::state_machine::launch_sm::State;
use crate::state_machine::{LaunchEvent, LaunchMachine, VmPhase};
use crate::vm::console::ConsoleHandle;
use crate::vm::hypervisor::{ExitReason, Hypervisor, MachineResources};
use crate::vm::readiness::ReadinessPolicy;
use crate::vm::slots::{Slot, SlotPaths};

const CLOSED: &str = "VM coordinator has shut down";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Snapshot of the coordinator, published after every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmStatus {
    pub phase: VmPhase,
    /// State description; `Some` only while running.
    pub description: Option<String>,
    pub ready: bool,
    /// Required slots that are still empty.
    pub missing: Vec<Slot>,
    pub slots: SlotPaths,
    pub run_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    /// Most recent boot failure, runtime fault or stop failure.
    pub last_error: Option<String>,
    pub last_exit: Option<ExitReason>,
}

impl VmStatus {
    pub fn is_running(&self) -> bool {
        self.phase == VmPhase::Running
    }
}

/// Result of a `start()` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    /// The hypervisor accepted the boot.
    Started { description: String },
    /// Ignored: required slots are empty.
    NotReady { missing: Vec<Slot> },
    /// Ignored: a run is already starting, running or stopping.
    AlreadyActive { phase: VmPhase },
    /// The hypervisor rejected the boot; the coordinator is idle again.
    Failed { message: String },
}

/// Result of a `stop()` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    /// The run ended and the coordinator is idle.
    Stopped,
    /// Ignored: nothing was running.
    NotRunning,
}

enum Command {
    SetPath {
        slot: Slot,
        path: PathBuf,
        reply: oneshot::Sender<()>,
    },
    ClearPath {
        slot: Slot,
        reply: oneshot::Sender<()>,
    },
    Start {
        reply: oneshot::Sender<StartOutcome>,
    },
    Stop {
        reply: oneshot::Sender<StopOutcome>,
    },
    ShowConsole {
        reply: oneshot::Sender<Result<Option<ConsoleHandle>>>,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable handle to a coordinator task.
///
/// The task shuts down, terminating any active run, once every handle has
/// been dropped.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<VmStatus>,
}

impl CoordinatorHandle {
    /// Spawn a coordinator on the current tokio runtime.
    pub fn spawn(
        policy: ReadinessPolicy,
        resources: MachineResources,
        hypervisor: Arc<dyn Hypervisor>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        info!(
            target: "coordinator",
            hypervisor = hypervisor.name(),
            required = ?policy.required().collect::<Vec<_>>(),
            "coordinator starting"
        );

        let machine = LaunchMachine::new(
            policy,
            resources,
            hypervisor,
            event_tx,
            tokio::runtime::Handle::current(),
        )
        .state_machine();

        let initial = snapshot(&machine);
        let (status_tx, status_rx) = watch::channel(initial);

        let task = CoordinatorTask {
            machine,
            commands: command_rx,
            events: event_rx,
            status: status_tx,
            start_waiters: Vec::new(),
            stop_waiters: Vec::new(),
        };
        tokio::spawn(task.run());

        Self {
            commands: command_tx,
            status: status_rx,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| anyhow!(CLOSED))?;
        rx.await.map_err(|_| anyhow!(CLOSED))
    }

    /// Assign `path` to `slot`, overwriting only that slot.
    pub async fn set_path(&self, slot: Slot, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        self.request(|reply| Command::SetPath { slot, path, reply })
            .await
    }

    pub async fn clear_path(&self, slot: Slot) -> Result<()> {
        self.request(|reply| Command::ClearPath { slot, reply }).await
    }

    /// Whether the readiness policy is currently satisfied.
    pub fn is_ready(&self) -> bool {
        self.status.borrow().ready
    }

    /// Start the VM. Resolves once the hypervisor has accepted or rejected
    /// the boot; ignored requests resolve immediately.
    pub async fn start(&self) -> Result<StartOutcome> {
        self.request(|reply| Command::Start { reply }).await
    }

    /// Stop the VM. Resolves once the coordinator is idle again.
    pub async fn stop(&self) -> Result<StopOutcome> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Attach to the serial console of the current run, if any.
    pub async fn show_console(&self) -> Result<Option<ConsoleHandle>> {
        self.request(|reply| Command::ShowConsole { reply }).await?
    }

    pub fn status(&self) -> VmStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every published status.
    pub fn subscribe(&self) -> watch::Receiver<VmStatus> {
        self.status.clone()
    }

    /// Wait until the published status reaches `phase`.
    pub async fn wait_for_phase(&self, phase: VmPhase) -> Result<VmStatus> {
        let mut status = self.status.clone();
        match status.wait_for(|s| s.phase == phase).await {
            Ok(seen) => Ok(seen.clone()),
            Err(_) => Err(anyhow!(CLOSED)),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

struct CoordinatorTask {
    machine: StateMachine<LaunchMachine>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<LaunchEvent>,
    status: watch::Sender<VmStatus>,
    start_waiters: Vec<oneshot::Sender<StartOutcome>>,
    stop_waiters: Vec<oneshot::Sender<StopOutcome>>,
}

impl CoordinatorTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(event) = self.events.recv() => {
                    self.machine.handle(&event);
                    self.settle();
                }
            }
        }
        self.shutdown().await;
    }

    fn phase(&self) -> VmPhase {
        self.machine.state().phase()
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::SetPath { slot, path, reply } => {
                self.machine.handle(&LaunchEvent::AssignSlot { slot, path });
                self.settle();
                let _ = reply.send(());
            }
            Command::ClearPath { slot, reply } => {
                self.machine.handle(&LaunchEvent::ClearSlot { slot });
                self.settle();
                let _ = reply.send(());
            }
            Command::Start { reply } => {
                let before = self.phase();
                self.machine.handle(&LaunchEvent::Start);
                let after = self.phase();
                if before == VmPhase::Idle && after == VmPhase::Starting {
                    self.start_waiters.push(reply);
                } else if before != VmPhase::Idle {
                    let _ = reply.send(StartOutcome::AlreadyActive { phase: before });
                } else {
                    let inner = self.machine.inner();
                    let missing = inner.policy.missing(&inner.slots);
                    let _ = reply.send(StartOutcome::NotReady { missing });
                }
                self.settle();
            }
            Command::Stop { reply } => {
                self.machine.handle(&LaunchEvent::Stop);
                if self.phase() == VmPhase::Stopping {
                    self.stop_waiters.push(reply);
                } else {
                    let _ = reply.send(StopOutcome::NotRunning);
                }
                self.settle();
            }
            Command::ShowConsole { reply } => {
                let console = self
                    .machine
                    .inner()
                    .run
                    .as_ref()
                    .map(|run| run.console())
                    .transpose();
                let _ = reply.send(console);
            }
        }
    }

    /// Resolve waiters whose condition is met and publish the new status.
    fn settle(&mut self) {
        let phase = self.phase();

        if phase != VmPhase::Starting && !self.start_waiters.is_empty() {
            let outcome = match self.machine.state() {
                State::Running { description } => StartOutcome::Started {
                    description: description.clone(),
                },
                _ => StartOutcome::Failed {
                    message: self
                        .machine
                        .inner()
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "VM stopped during boot".to_string()),
                },
            };
            for waiter in self.start_waiters.drain(..) {
                let _ = waiter.send(outcome.clone());
            }
        }

        if phase == VmPhase::Idle {
            for waiter in self.stop_waiters.drain(..) {
                let _ = waiter.send(StopOutcome::Stopped);
            }
        }

        let next = snapshot(&self.machine);
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Every handle is gone; end the active run with the session.
    async fn shutdown(&mut self) {
        if let Some(run) = self.machine.inner().run.clone() {
            info!(target: "coordinator", run = %run.id(), "coordinator closing, terminating VM");
            if let Err(e) = run.terminate().await {
                warn!(target: "coordinator", error = %e, "terminate on shutdown failed");
            }
        }
        info!(target: "coordinator", "coordinator stopped");
    }
}

fn snapshot(machine: &StateMachine<LaunchMachine>) -> VmStatus {
    let state = machine.state();
    let inner = machine.inner();
    VmStatus {
        phase: state.phase(),
        description: state.description().map(str::to_string),
        ready: inner.is_ready(),
        missing: inner.policy.missing(&inner.slots),
        slots: inner.slots.clone(),
        run_id: inner.run.as_ref().map(|run| run.id()),
        started_at: inner.started_at,
        last_error: inner.last_error.clone(),
        last_exit: inner.last_exit.clone(),
    }
}
