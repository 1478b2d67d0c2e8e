//! Boot image resolution.
//!
//! Decides which saved VM state a launch starts from. Pure: the decision is
//! recomputed on every launch from the configured mode, the disk's resume
//! tag and the forced-recovery flag, and is never persisted itself.

use std::fmt;
use std::str::FromStr;

/// Fixed baseline snapshot, outside the A/B rotation.
pub const CLEAN_BOOT_TAG: &str = "instantboot";

/// Configured resume behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    PersistentBoot,
    SnapshotBoot,
    RecoveryBoot,
    CleanBoot,
}

/// An unrecognised `resume_behavior` value. Fatal: the process must not
/// launch a VM with an undefined boot target.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown boot mode {0:?} (expected persistent_boot, snapshot_boot, recovery_boot or clean_boot)")]
pub struct BootModeError(pub String);

impl FromStr for ResumeMode {
    type Err = BootModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "persistent_boot" => Ok(ResumeMode::PersistentBoot),
            "snapshot_boot" => Ok(ResumeMode::SnapshotBoot),
            "recovery_boot" => Ok(ResumeMode::RecoveryBoot),
            "clean_boot" => Ok(ResumeMode::CleanBoot),
            other => Err(BootModeError(other.to_string())),
        }
    }
}

impl fmt::Display for ResumeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResumeMode::PersistentBoot => "persistent_boot",
            ResumeMode::SnapshotBoot => "snapshot_boot",
            ResumeMode::RecoveryBoot => "recovery_boot",
            ResumeMode::CleanBoot => "clean_boot",
        })
    }
}

/// What the VM is launched from.
///
/// Recovery launches resolve to `NoSavedState`; why a cold boot happened is
/// carried by [`crate::launch::BootReason`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootImage {
    /// No saved state exists yet: cold boot.
    NoSavedState,
    ResumeFromTag(String),
    ResumeFromSnapshot(String),
}

impl BootImage {
    /// The `-loadvm` tag to pass to the hypervisor, if any.
    pub fn load_tag(&self) -> Option<&str> {
        match self {
            BootImage::ResumeFromTag(tag) | BootImage::ResumeFromSnapshot(tag) => Some(tag),
            BootImage::NoSavedState => None,
        }
    }
}

/// Resolve the boot image.
///
/// `resume_tag` is the disk's current resume tag; empty means no save has
/// completed yet. `snapshot` is the configured snapshot name for
/// `snapshot_boot` and is passed through unvalidated.
pub fn resolve(
    mode: ResumeMode,
    resume_tag: &str,
    snapshot: &str,
    force_recovery: bool,
) -> BootImage {
    let mode = if force_recovery {
        ResumeMode::RecoveryBoot
    } else {
        mode
    };

    match mode {
        ResumeMode::PersistentBoot if resume_tag.is_empty() => BootImage::NoSavedState,
        ResumeMode::PersistentBoot => BootImage::ResumeFromTag(resume_tag.to_string()),
        ResumeMode::SnapshotBoot => BootImage::ResumeFromSnapshot(snapshot.to_string()),
        ResumeMode::RecoveryBoot => BootImage::NoSavedState,
        ResumeMode::CleanBoot => BootImage::ResumeFromTag(CLEAN_BOOT_TAG.to_string()),
    }
}

/// Parse the configured mode string and resolve in one step.
pub fn resolve_configured(
    mode: &str,
    resume_tag: &str,
    snapshot: &str,
    force_recovery: bool,
) -> Result<BootImage, BootModeError> {
    let mode: ResumeMode = mode.parse()?;
    Ok(resolve(mode, resume_tag, snapshot, force_recovery))
}
