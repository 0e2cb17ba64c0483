//! Shared test helpers: an in-process hypervisor that boots nothing.
//!
//! `FakeHypervisor` records every boot, can be told to fail, and can hold
//! boots at a gate until the test releases them. Each successful boot hands
//! the test a [`FakeControl`] for pushing notices and console output.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use simplevm::coordinator::CoordinatorHandle;
use simplevm::vm::console::{ConsoleHandle, ConsoleHub};
use simplevm::vm::hypervisor::{
    BootConfig, ExitReason, Hypervisor, Launched, MachineResources, RunNotice, VmRun,
};
use simplevm::vm::readiness::ReadinessPolicy;

pub const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct FakeState {
    fail_boot: Option<String>,
    fail_terminate: Option<String>,
    quiet_terminate: bool,
    boots: Vec<BootConfig>,
    runs: Vec<FakeControl>,
}

pub struct FakeHypervisor {
    state: Mutex<FakeState>,
    gate: Option<Arc<Notify>>,
}

impl FakeHypervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            gate: None,
        })
    }

    /// Boots wait for [`FakeHypervisor::release`] before answering.
    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            gate: Some(Arc::new(Notify::new())),
        })
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    pub fn fail_boot(&self, message: &str) {
        self.state.lock().unwrap().fail_boot = Some(message.to_string());
    }

    pub fn fail_terminate(&self, message: &str) {
        self.state.lock().unwrap().fail_terminate = Some(message.to_string());
    }

    /// Terminate succeeds without the run reporting its exit.
    pub fn quiet_terminate(&self) {
        self.state.lock().unwrap().quiet_terminate = true;
    }

    pub fn boots(&self) -> Vec<BootConfig> {
        self.state.lock().unwrap().boots.clone()
    }

    pub fn boot_count(&self) -> usize {
        self.state.lock().unwrap().boots.len()
    }

    pub fn last_run(&self) -> FakeControl {
        self.state
            .lock()
            .unwrap()
            .runs
            .last()
            .cloned()
            .expect("no VM was booted")
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    fn name(&self) -> &str {
        "fake"
    }

    async fn boot(&self, config: BootConfig) -> Result<Launched> {
        self.state.lock().unwrap().boots.push(config);

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.fail_boot.take() {
            bail!("{message}");
        }

        let (notices_tx, notices) = mpsc::unbounded_channel();
        let (hub, input) = ConsoleHub::new(4096);
        let control = FakeControl {
            id: format!("fake-{}", state.runs.len() + 1),
            notices: notices_tx,
            hub,
            input: Arc::new(tokio::sync::Mutex::new(input)),
            terminations: Arc::new(Mutex::new(0)),
            fail_terminate: state.fail_terminate.take(),
            quiet_terminate: state.quiet_terminate,
        };
        state.runs.push(control.clone());

        Ok(Launched {
            run: Arc::new(FakeRun(control)),
            description: "Running".to_string(),
            notices,
        })
    }
}

/// Test-side handle on one fake run.
#[derive(Clone)]
pub struct FakeControl {
    pub id: String,
    notices: mpsc::UnboundedSender<RunNotice>,
    pub hub: Arc<ConsoleHub>,
    input: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    terminations: Arc<Mutex<usize>>,
    fail_terminate: Option<String>,
    quiet_terminate: bool,
}

impl FakeControl {
    pub fn report_state(&self, description: &str) {
        let _ = self.notices.send(RunNotice::State(description.to_string()));
    }

    /// The guest ends on its own.
    pub fn exit(&self, reason: ExitReason) {
        self.hub.close();
        let _ = self.notices.send(RunNotice::Exited(reason));
    }

    pub fn terminations(&self) -> usize {
        *self.terminations.lock().unwrap()
    }

    /// Next chunk of input the guest received.
    pub async fn next_input(&self) -> Option<Vec<u8>> {
        self.input.lock().await.recv().await
    }
}

#[derive(Clone)]
struct FakeRun(FakeControl);

impl std::fmt::Debug for FakeRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FakeRun").field(&self.0.id).finish()
    }
}

#[async_trait]
impl VmRun for FakeRun {
    fn id(&self) -> String {
        self.0.id.clone()
    }

    async fn terminate(&self) -> Result<()> {
        *self.0.terminations.lock().unwrap() += 1;
        if let Some(message) = &self.0.fail_terminate {
            bail!("{message}");
        }
        if !self.0.quiet_terminate {
            self.0.exit(ExitReason::Shutdown);
        }
        Ok(())
    }

    fn console(&self) -> Result<ConsoleHandle> {
        Ok(self.0.hub.attach())
    }
}

pub fn spawn_coordinator(
    policy: ReadinessPolicy,
    hypervisor: Arc<FakeHypervisor>,
) -> CoordinatorHandle {
    CoordinatorHandle::spawn(policy, MachineResources::default(), hypervisor)
}

pub fn kernel_path() -> PathBuf {
    PathBuf::from("/images/vmlinuz")
}

/// Run `fut` with the shared test timeout.
pub async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(TIMEOUT, fut)
        .await
        .expect("timed out")
}
