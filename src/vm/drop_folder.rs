//! Drop folder: file ingestion for the boot slots.
//!
//! The drop folder has one subdirectory per slot:
//!
//! ```text
//! <drop_dir>/kernel/   <drop_dir>/initrd/   <drop_dir>/image/   <drop_dir>/extra/
//! ```
//!
//! Dragging a file into a subdirectory (Finder, `cp`, `mv`) emits a
//! [`DropEvent`] assigning it to that slot. Drag sources that hand over a
//! `file://` URL instead of a path go through [`resolve_dropped`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use notify::event::{CreateKind, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::coordinator::CoordinatorHandle;
use crate::vm::slots::Slot;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A file that has been dropped onto a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropEvent {
    pub slot: Slot,
    /// Absolute path of the dropped file.
    pub path: PathBuf,
    /// UTC timestamp of detection.
    pub timestamp: DateTime<Utc>,
}

impl DropEvent {
    pub fn new(slot: Slot, path: PathBuf) -> Self {
        Self {
            slot,
            path,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Turn what a drag source handed over (a path or a `file://` URL) into a
/// filesystem path. Existence is not checked here.
pub fn resolve_dropped(input: &str) -> Result<PathBuf> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        bail!("empty path");
    }

    let is_file_url = trimmed
        .get(..5)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("file:"));
    if is_file_url {
        let url = Url::parse(trimmed).with_context(|| format!("invalid file URL: {trimmed}"))?;
        return url
            .to_file_path()
            .map_err(|_| anyhow::anyhow!("file URL has no local path: {trimmed}"));
    }

    if let Some(scheme_end) = trimmed.find("://") {
        bail!("unsupported URL scheme: {}", &trimmed[..scheme_end]);
    }

    Ok(PathBuf::from(trimmed))
}

/// Subdirectory of `root` that feeds `slot`.
pub fn slot_dir(root: &Path, slot: Slot) -> PathBuf {
    root.join(slot.as_str())
}

/// Create the drop folder and its per-slot subdirectories.
pub fn ensure_drop_dirs(root: &Path) -> std::io::Result<()> {
    for slot in Slot::ALL {
        std::fs::create_dir_all(slot_dir(root, slot))?;
    }
    Ok(())
}

/// The slot a file inside the drop folder belongs to.
///
/// Only direct children of a slot subdirectory count; hidden files (editor
/// and Finder droppings) are ignored.
pub fn slot_for_path(root: &Path, path: &Path) -> Option<Slot> {
    let name = path.file_name()?.to_str()?;
    if name.starts_with('.') {
        return None;
    }
    let parent = path.parent()?;
    if parent.parent()? != root {
        return None;
    }
    parent.file_name()?.to_str()?.parse().ok()
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// Owns the filesystem watcher on the drop folder.
pub struct DropFolderWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl DropFolderWatcher {
    /// Start watching `root`. Every file created or moved into a slot
    /// subdirectory is sent on `events`.
    pub fn start(root: PathBuf, events: mpsc::UnboundedSender<DropEvent>) -> Result<Self> {
        ensure_drop_dirs(&root)
            .with_context(|| format!("failed to create drop folder {}", root.display()))?;
        // FSEvents reports canonical paths (/private/var/... on macOS).
        let root = root.canonicalize().unwrap_or(root);

        let watch_root = root.clone();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if !is_arrival(&event.kind) {
                        return;
                    }
                    for path in &event.paths {
                        if !path.is_file() {
                            continue;
                        }
                        if let Some(slot) = slot_for_path(&watch_root, path) {
                            debug!(
                                target: "drop_folder",
                                slot = %slot,
                                path = %path.display(),
                                "file dropped"
                            );
                            let _ = events.send(DropEvent::new(slot, path.clone()));
                        }
                    }
                }
                Err(e) => {
                    warn!(target: "drop_folder", "watch error: {e}");
                }
            }
        })
        .context("failed to create drop folder watcher")?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", root.display()))?;
        info!(target: "drop_folder", root = %root.display(), "watching drop folder");

        Ok(Self {
            _watcher: watcher,
            root,
        })
    }

    /// Get the path being watched.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Assign every dropped file to its slot until `events` closes or the
/// coordinator shuts down.
pub async fn forward_drops(
    handle: CoordinatorHandle,
    mut events: mpsc::UnboundedReceiver<DropEvent>,
) {
    while let Some(event) = events.recv().await {
        info!(
            target: "drop_folder",
            slot = %event.slot,
            path = %event.path.display(),
            "assigning dropped file"
        );
        if let Err(e) = handle.set_path(event.slot, event.path).await {
            warn!(target: "drop_folder", "failed to assign dropped file: {e:#}");
            break;
        }
    }
}

/// Creates and moves-in count as arrivals; content writes do not.
fn is_arrival(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(CreateKind::File | CreateKind::Any)
            | EventKind::Modify(ModifyKind::Name(_))
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
