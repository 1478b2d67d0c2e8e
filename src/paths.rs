//! Application directory structure for vm-supervisor.
//!
//! Provides a single `AppPaths` struct that resolves all standard directories
//! and ensures they exist on first launch. Follows macOS conventions:
//!
//! - Config:  `~/.config/vm-supervisor/`  (human-editable, XDG-style)
//! - Data:    `~/Library/Application Support/org.vm-supervisor/`
//! - Logs:    `~/Library/Logs/vm-supervisor/`
//!
//! On non-macOS, falls back to XDG paths.

use std::path::{Path, PathBuf};
use tracing::info;

#[cfg(target_os = "macos")]
const BUNDLE_ID: &str = "org.vm-supervisor";
const APP_NAME: &str = "vm-supervisor";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Human-editable config: `~/.config/vm-supervisor/`
    pub config: PathBuf,
    /// Machine-managed application data root
    pub data: PathBuf,
    /// Persistent VM disk images, one per disk name
    pub disks: PathBuf,
    /// Folder the VM always has access to; per-mount symlinks live here
    pub shared: PathBuf,
    /// Application logs
    pub logs: PathBuf,
}

impl AppPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;

        let config = resolve_config_dir(&home);
        let data = resolve_data_dir(&home);
        let logs = resolve_log_dir(&home);

        Some(Self::under(config, data, logs))
    }

    /// Lay out the derived directories below explicit roots.
    pub fn under(config: PathBuf, data: PathBuf, logs: PathBuf) -> Self {
        Self {
            config,
            disks: data.join("disks"),
            shared: data.join("shared"),
            data,
            logs,
        }
    }

    /// Path of the global settings file.
    pub fn settings_file(&self) -> PathBuf {
        self.config.join("settings.toml")
    }

    /// Path of the per-disk metadata store.
    pub fn metadata_file(&self) -> PathBuf {
        self.data.join("disk_metadata.json")
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        let dirs = [&self.config, &self.data, &self.disks, &self.shared, &self.logs];

        for dir in &dirs {
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
