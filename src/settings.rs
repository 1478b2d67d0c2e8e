//! Global settings persisted as `settings.toml`.
//!
//! Every key has a compiled default, so a partial (or missing) file is
//! always valid. The file is written back with defaults on first launch so
//! the user has something to edit.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::metadata::write_atomic;

/// Default management endpoint port on the loopback interface.
pub const DEFAULT_MONITOR_PORT: u16 = 10044;

/// Default host port forwarded to the guest's shell daemon.
pub const DEFAULT_SHELL_PORT: u16 = 10022;

/// Default port for the control-plane server.
pub const DEFAULT_CONTROL_PORT: u16 = 10050;

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// One of `persistent_boot`, `snapshot_boot`, `recovery_boot`, `clean_boot`.
    pub resume_behavior: String,
    /// Snapshot name used by `snapshot_boot`.
    pub boot_snapshot: String,
    /// Name of the disk image to boot.
    pub disk_name: String,
    pub font_size: u32,
    pub theme: String,
    /// Prefer the multi-threaded JIT accelerator when available.
    pub jit: bool,
    /// Set before every launch and cleared once the guest connects. Still
    /// being set at startup means the previous launch never finished booting.
    pub attempting_boot: bool,
    /// External command printing a chosen directory on stdout.
    pub picker_command: Vec<String>,
    pub vm: VmSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            resume_behavior: "persistent_boot".to_string(),
            boot_snapshot: String::new(),
            disk_name: "disk".to_string(),
            font_size: 14,
            theme: "solarized-dark".to_string(),
            jit: true,
            attempting_boot: false,
            picker_command: vec![
                "zenity".to_string(),
                "--file-selection".to_string(),
                "--directory".to_string(),
            ],
            vm: VmSettings::default(),
        }
    }
}

/// `[vm]` table: how to launch the hypervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSettings {
    pub qemu_binary: PathBuf,
    /// Directory holding `bzImage`, `initrd.img`, `empty.qcow2` and firmware.
    pub resource_dir: PathBuf,
    pub memory: String,
    pub monitor_port: u16,
    pub shell_port: u16,
    pub control_port: u16,
    /// Wait after `savevm` before the new slot is recorded as latest.
    pub settle_delay_ms: u64,
    /// Host folders exposed to the guest on every start, never persisted.
    pub host_mounts: Vec<HostMountSetting>,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            qemu_binary: PathBuf::from("qemu-system-x86_64"),
            resource_dir: PathBuf::from("/usr/share/vm-supervisor"),
            memory: "4G".to_string(),
            monitor_port: DEFAULT_MONITOR_PORT,
            shell_port: DEFAULT_SHELL_PORT,
            control_port: DEFAULT_CONTROL_PORT,
            settle_delay_ms: 2000,
            host_mounts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMountSetting {
    pub path: PathBuf,
    #[serde(default)]
    pub tag: Option<String>,
}

impl Settings {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

/// Shared, lock-guarded settings with write-through persistence.
///
/// `path = None` keeps everything in memory (tests, `ctl` invocations).
#[derive(Debug)]
pub struct SettingsStore {
    path: Option<PathBuf>,
    inner: RwLock<Settings>,
}

impl SettingsStore {
    /// Load `path`, writing the defaults there first if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("read settings {}", path.display()))?;
            Settings::from_toml(&content)
                .with_context(|| format!("parse settings {}", path.display()))?
        } else {
            let defaults = Settings::default();
            write_atomic(path, defaults.to_toml().as_bytes())?;
            info!(path = %path.display(), "wrote default settings");
            defaults
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            inner: RwLock::new(settings),
        })
    }

    pub fn in_memory(settings: Settings) -> Self {
        Self {
            path: None,
            inner: RwLock::new(settings),
        }
    }

    /// Copy of the current settings.
    pub fn snapshot(&self) -> Settings {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn font_size(&self) -> u32 {
        self.snapshot().font_size
    }

    pub fn set_font_size(&self, size: u32) -> Result<()> {
        self.update(|s| s.font_size = size)
    }

    pub fn set_attempting_boot(&self, attempting: bool) -> Result<()> {
        self.update(|s| s.attempting_boot = attempting)
    }

    /// Apply `f` to a copy, persist it, then publish it. A failed write
    /// leaves the current settings untouched.
    pub fn update(&self, f: impl FnOnce(&mut Settings)) -> Result<()> {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = guard.clone();
        f(&mut next);

        if let Some(path) = &self.path {
            if let Err(e) = write_atomic(path, next.to_toml().as_bytes()) {
                warn!(path = %path.display(), error = %e, "failed to persist settings");
                return Err(e);
            }
        }
        *guard = next;
        Ok(())
    }
}
