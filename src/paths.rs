//! Application directory structure for simplevm.
//!
//! Provides a single `SimplePaths` struct that resolves all standard directories
//! and ensures they exist on first launch. Follows macOS conventions:
//!
//! - Config:    `~/.config/simplevm/`  (human-editable, XDG-style)
//! - Data:      `~/Library/Application Support/com.simplevm.simplevm/`
//! - Drop:      `<data>/drop/`  (one subdirectory per boot slot)
//! - Logs:      `~/Library/Logs/simplevm/`
//!
//! On non-macOS, falls back to XDG paths.

use std::path::{Path, PathBuf};
use tracing::info;

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
const BUNDLE_ID: &str = "com.simplevm.simplevm";
pub const APP_NAME: &str = "simplevm";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct SimplePaths {
    /// Human-editable config: `~/.config/simplevm/`
    pub config: PathBuf,
    /// Machine-managed application data root
    pub data: PathBuf,
    /// Drop folder watched for boot files
    pub drop: PathBuf,
    /// Application logs
    pub logs: PathBuf,
}

impl SimplePaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; `ensure()` does.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        Some(Self::under_home(&home))
    }

    /// Resolve all paths relative to `home`.
    pub fn under_home(home: &Path) -> Self {
        let data = resolve_data_dir(home);
        Self {
            config: resolve_config_dir(home),
            drop: data.join("drop"),
            data,
            logs: resolve_log_dir(home),
        }
    }

    /// `config.toml` inside the config directory.
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.data, &self.drop, &self.logs] {
            std::fs::create_dir_all(dir)?;
            info!("ensured directory: {}", dir.display());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_data_dir(home: &Path) -> PathBuf {
    home.join("Library")
        .join("Application Support")
        .join(BUNDLE_ID)
}

#[cfg(not(target_os = "macos"))]
fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME).join("logs")
    } else {
        home.join(".local").join("share").join(APP_NAME).join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_produces_valid_paths() {
        let paths = SimplePaths::resolve().expect("HOME should be set in tests");
        assert!(paths.config.to_string_lossy().contains("simplevm"));
        assert!(paths.data.to_string_lossy().contains("simplevm"));
        assert!(paths.drop.ends_with("drop"));
        assert!(paths.drop.starts_with(&paths.data));
        assert!(paths.config_file().ends_with("simplevm/config.toml"));
    }

    #[test]
    fn ensure_creates_directories() {
        let tmp = tempfile::tempdir().unwrap();

        let paths = SimplePaths {
            config: tmp.path().join("config"),
            data: tmp.path().join("data"),
            drop: tmp.path().join("data/drop"),
            logs: tmp.path().join("logs"),
        };

        paths.ensure().expect("ensure should succeed");

        assert!(paths.config.is_dir());
        assert!(paths.data.is_dir());
        assert!(paths.drop.is_dir());
        assert!(paths.logs.is_dir());
    }
}
