//! User configuration: `~/.config/simplevm/config.toml`.
//!
//! Every field has a compiled default, so a missing file or a missing line
//! means "use the default". On first run a commented default file is written
//! so the user has something to edit.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::vm::hypervisor::MachineResources;
use crate::vm::readiness::ReadinessPolicy;

pub const DEFAULT_REST_PORT: u16 = 7711;
pub const DEFAULT_BIND: &str = "127.0.0.1:7710";

/// Root configuration container.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub readiness: ReadinessSettings,
    pub machine: MachineResources,
    pub vfkit: VfkitSettings,
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    /// Slots that must be filled before Start is allowed. The kernel is
    /// always required.
    pub required: ReadinessPolicy,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct VfkitSettings {
    /// Explicit vfkit binary; `None` searches `$PATH` and Homebrew.
    pub binary: Option<PathBuf>,
    /// Port for the vfkit REST management API.
    pub rest_port: u16,
}

impl Default for VfkitSettings {
    fn default() -> Self {
        Self {
            binary: None,
            rest_port: DEFAULT_REST_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Listen address of the HTTP control API.
    pub bind: String,
    /// Drop folder; `None` uses `<data>/drop`.
    pub drop_dir: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            drop_dir: None,
        }
    }
}

impl Settings {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("invalid config.toml")
    }

    /// Load `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                debug!(path = %path.display(), "loading settings");
                Self::from_toml(&content)
                    .with_context(|| format!("while reading {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }
}

/// Write the default TOML content to `path` if the file does not already exist.
/// Creates parent directories as needed.
pub fn ensure_default_toml(path: &Path, default_content: &str) {
    if path.exists() {
        return;
    }
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("failed to create config dir {}: {e}", parent.display());
            return;
        }
    }
    if let Err(e) = std::fs::write(path, default_content) {
        warn!("failed to write default config.toml at {}: {e}", path.display());
    }
}

/// A well-commented default config file.
///
/// Values match the compiled defaults so the file is a no-op on first load
/// but gives the user a complete reference.
pub fn default_toml_content() -> String {
    r#"# simplevm configuration. Any missing value uses the compiled default.

[readiness]
# Slots that must be filled before Start is allowed.
# One or more of: "kernel", "initrd", "image", "extra". The kernel is always required.
required = ["kernel"]

[machine]
cpus = 2
memory_mb = 2048
cmdline = "console=hvc0"   # root=/dev/vda is appended when a boot image is set

[vfkit]
# binary = "/opt/homebrew/bin/vfkit"
rest_port = 7711

[server]
bind = "127.0.0.1:7710"
# drop_dir = "/Users/me/simplevm-drop"
"#
    .to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::vm::slots::Slot;

    #[test]
    fn default_toml_matches_compiled_defaults() {
        let parsed = Settings::from_toml(&default_toml_content()).unwrap();
        assert_eq!(parsed, Settings::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let parsed = Settings::from_toml(
            r#"
[readiness]
required = ["initrd", "image"]

[machine]
memory_mb = 4096
"#,
        )
        .unwrap();

        let required: Vec<Slot> = parsed.readiness.required.required().collect();
        assert_eq!(required, vec![Slot::Kernel, Slot::Initrd, Slot::Image]);
        assert_eq!(parsed.machine.memory_mb, 4096);
        assert_eq!(parsed.machine.cpus, 2);
        assert_eq!(parsed.vfkit.rest_port, DEFAULT_REST_PORT);
        assert_eq!(parsed.server.bind, DEFAULT_BIND);
    }

    #[test]
    fn unknown_slot_is_rejected() {
        assert!(Settings::from_toml("[readiness]\nrequired = [\"floppy\"]\n").is_err());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn ensure_default_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        ensure_default_toml(&path, "# test content\n");

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("test content"));
    }

    #[test]
    fn ensure_default_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "# user customized").unwrap();
        drop(f);

        ensure_default_toml(&path, "# default content\n");

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(
            content.contains("user customized"),
            "ensure_default_toml should not overwrite existing file"
        );
    }
}
