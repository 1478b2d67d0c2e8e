//! Per-launch context, fixed before the supervisor is built.

use std::fmt;
use std::path::Path;

use anyhow::Result;
use tracing::warn;

use crate::metadata::MetadataStore;
use crate::settings::SettingsStore;
use crate::vm::resume::ResumeState;

/// Why this launch boots the way it does, for the UI to narrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootReason {
    Normal,
    /// No saved state yet (new disk, or no save ever completed).
    FirstBoot,
    /// The previous launch never finished booting.
    ForcedRecovery,
    /// Recovery was asked for on the command line.
    UserRecovery,
}

impl BootReason {
    /// User-facing notice, `None` when startup should be quick.
    pub fn notice(self) -> Option<&'static str> {
        match self {
            BootReason::Normal => None,
            BootReason::FirstBoot => {
                Some("Setting up the VM for the first time, slow startup expected.")
            }
            BootReason::ForcedRecovery => Some(
                "The last launch did not finish booting. Starting in recovery mode, slow startup expected.",
            ),
            BootReason::UserRecovery => Some("Recovery boot requested, slow startup expected."),
        }
    }
}

impl fmt::Display for BootReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BootReason::Normal => "normal",
            BootReason::FirstBoot => "first_boot",
            BootReason::ForcedRecovery => "forced_recovery",
            BootReason::UserRecovery => "user_recovery",
        })
    }
}

/// Immutable launch flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaunchContext {
    pub jit_enabled: bool,
    pub first_boot: bool,
    pub recovery_forced: bool,
    pub user_recovery: bool,
}

impl LaunchContext {
    /// Build the context for this launch and mark a boot as in progress.
    ///
    /// A still-set `attempting_boot` flag means the previous launch died
    /// before the guest connected, so this one is forced into recovery.
    /// The flag is set again here and cleared by
    /// [`crate::vm::Supervisor::note_guest_connected`].
    pub fn begin(
        settings: &SettingsStore,
        metadata: &MetadataStore,
        disks_dir: &Path,
        user_recovery: bool,
    ) -> Result<Self> {
        let snapshot = settings.snapshot();
        let recovery_forced = snapshot.attempting_boot;
        if recovery_forced {
            warn!("previous launch never completed its boot; forcing recovery");
        }

        let disk_exists = disks_dir.join(format!("{}.qcow2", snapshot.disk_name)).exists();
        let first_boot =
            !disk_exists || !ResumeState::new(metadata, &snapshot.disk_name).has_completed_save();

        settings.set_attempting_boot(true)?;

        Ok(Self {
            jit_enabled: snapshot.jit,
            first_boot,
            recovery_forced,
            user_recovery,
        })
    }

    /// Whether the boot image resolver must be overridden to recovery.
    pub fn force_recovery(&self) -> bool {
        self.recovery_forced || self.user_recovery
    }

    pub fn boot_reason(&self) -> BootReason {
        if self.user_recovery {
            BootReason::UserRecovery
        } else if self.recovery_forced {
            BootReason::ForcedRecovery
        } else if self.first_boot {
            BootReason::FirstBoot
        } else {
            BootReason::Normal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use crate::vm::resume::Slot;

    #[test]
    fn clean_previous_boot_is_normal_or_first() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = SettingsStore::in_memory(Settings::default());
        let metadata = MetadataStore::in_memory();

        let ctx = LaunchContext::begin(&settings, &metadata, tmp.path(), false).unwrap();
        assert!(!ctx.force_recovery());
        assert_eq!(ctx.boot_reason(), BootReason::FirstBoot);
        assert!(settings.snapshot().attempting_boot);

        // Disk exists and a save completed.
        std::fs::write(tmp.path().join("disk.qcow2"), b"x").unwrap();
        ResumeState::new(&metadata, "disk").record_completed(Slot::A).unwrap();
        settings.set_attempting_boot(false).unwrap();

        let ctx = LaunchContext::begin(&settings, &metadata, tmp.path(), false).unwrap();
        assert_eq!(ctx.boot_reason(), BootReason::Normal);
        assert_eq!(ctx.boot_reason().notice(), None);
    }

    #[test]
    fn unfinished_boot_forces_recovery() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = SettingsStore::in_memory(Settings {
            attempting_boot: true,
            ..Settings::default()
        });

        let ctx =
            LaunchContext::begin(&settings, &MetadataStore::in_memory(), tmp.path(), false).unwrap();
        assert!(ctx.force_recovery());
        assert_eq!(ctx.boot_reason(), BootReason::ForcedRecovery);
        assert!(ctx.boot_reason().notice().unwrap().contains("slow startup"));
    }

    #[test]
    fn user_recovery_wins() {
        let ctx = LaunchContext {
            recovery_forced: true,
            user_recovery: true,
            ..LaunchContext::default()
        };
        assert_eq!(ctx.boot_reason(), BootReason::UserRecovery);
    }
}
