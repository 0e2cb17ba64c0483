//! Drop folder feeding a coordinator through a real filesystem watcher.

mod common;

use std::path::Path;

use common::{FakeHypervisor, spawn_coordinator, within};
use simplevm::vm::drop_folder::{DropFolderWatcher, forward_drops, slot_dir};
use simplevm::vm::readiness::ReadinessPolicy;
use simplevm::vm::slots::Slot;
use tokio::sync::mpsc;

#[tokio::test]
async fn kernel_dropped_into_folder_makes_coordinator_ready() {
    let dir = tempfile::tempdir().unwrap();
    let vm = spawn_coordinator(ReadinessPolicy::kernel_only(), FakeHypervisor::new());
    assert!(!vm.is_ready());

    let (tx, rx) = mpsc::unbounded_channel();
    let watcher = DropFolderWatcher::start(dir.path().to_path_buf(), tx).unwrap();
    tokio::spawn(forward_drops(vm.clone(), rx));

    let kernel = slot_dir(watcher.root(), Slot::Kernel).join("vmlinuz");
    std::fs::write(&kernel, b"kernel").unwrap();

    let mut status = vm.subscribe();
    within(status.wait_for(|s| s.ready)).await.unwrap();

    let slots = vm.status().slots;
    assert_eq!(slots.get(Slot::Kernel), Some(kernel.as_path()));
    assert_eq!(slots.get(Slot::Initrd), None::<&Path>);
}

#[tokio::test]
async fn forwarding_ends_when_drop_events_stop() {
    let vm = spawn_coordinator(ReadinessPolicy::kernel_only(), FakeHypervisor::new());
    let (tx, rx) = mpsc::unbounded_channel();
    let forward = tokio::spawn(forward_drops(vm, rx));

    drop(tx);
    within(forward).await.unwrap();
}
