//! Boot file slots.
//!
//! A VM is assembled from up to four host files. Each one lives in a named
//! [`Slot`]; [`SlotPaths`] is the keyed slot → path mapping that the
//! coordinator mutates one assignment at a time.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// One of the four boot inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    /// Linux kernel image (`vmlinuz`).
    Kernel,
    /// Initial ramdisk.
    Initrd,
    /// Bootable disk image, attached as the first block device.
    Image,
    /// Additional disk image, attached after the boot image.
    Extra,
}

impl Slot {
    /// Every slot, in attachment order.
    pub const ALL: [Slot; 4] = [Slot::Kernel, Slot::Initrd, Slot::Image, Slot::Extra];

    /// Canonical lowercase name, also used for drop folder subdirectories.
    pub fn as_str(self) -> &'static str {
        match self {
            Slot::Kernel => "kernel",
            Slot::Initrd => "initrd",
            Slot::Image => "image",
            Slot::Extra => "extra",
        }
    }

    /// Human label shown next to the slot value.
    pub fn label(self) -> &'static str {
        match self {
            Slot::Kernel => "vmlinuz",
            Slot::Initrd => "initrd",
            Slot::Image => "image",
            Slot::Extra => "extra image",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Slot {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kernel" | "vmlinuz" => Ok(Slot::Kernel),
            "initrd" | "ramdisk" => Ok(Slot::Initrd),
            "image" | "boot-image" => Ok(Slot::Image),
            "extra" | "extra-image" => Ok(Slot::Extra),
            other => bail!("unknown slot '{other}' (expected kernel, initrd, image or extra)"),
        }
    }
}

/// The current assignment of host paths to slots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotPaths {
    paths: BTreeMap<Slot, PathBuf>,
}

impl SlotPaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign `path` to `slot`, returning the value it replaced.
    pub fn set(&mut self, slot: Slot, path: PathBuf) -> Option<PathBuf> {
        self.paths.insert(slot, path)
    }

    /// Empty `slot`, returning the value it held.
    pub fn clear(&mut self, slot: Slot) -> Option<PathBuf> {
        self.paths.remove(&slot)
    }

    pub fn get(&self, slot: Slot) -> Option<&Path> {
        self.paths.get(&slot).map(PathBuf::as_path)
    }

    pub fn contains(&self, slot: Slot) -> bool {
        self.paths.contains_key(&slot)
    }

    /// Populated slots in attachment order.
    pub fn iter(&self) -> impl Iterator<Item = (Slot, &Path)> {
        self.paths.iter().map(|(slot, path)| (*slot, path.as_path()))
    }

    /// One-line summary in the form `vmlinuz: bzImage, initrd: (empty), ...`.
    pub fn summary(&self) -> String {
        Slot::ALL
            .iter()
            .map(|slot| {
                let value = self
                    .get(*slot)
                    .and_then(|p| p.file_name())
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "(empty)".to_string());
                format!("{}: {}", slot.label(), value)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}
