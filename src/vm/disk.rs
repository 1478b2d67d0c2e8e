//! Persistent disk images, one per disk name.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::info;

/// Name of the blank template image shipped with the VM resources.
pub const TEMPLATE_IMAGE: &str = "empty.qcow2";

/// A disk image on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage {
    pub name: String,
    pub path: PathBuf,
    /// The image was copied from the template during this launch.
    pub freshly_created: bool,
}

/// Locate `<disks_dir>/<name>.qcow2`, copying `template` there if absent.
pub fn prepare_disk(disks_dir: &Path, name: &str, template: &Path) -> Result<DiskImage> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        bail!("invalid disk name {name:?}");
    }

    std::fs::create_dir_all(disks_dir)
        .with_context(|| format!("create disk directory {}", disks_dir.display()))?;

    let path = disks_dir.join(format!("{name}.qcow2"));
    if path.exists() {
        return Ok(DiskImage {
            name: name.to_string(),
            path,
            freshly_created: false,
        });
    }

    if !template.exists() {
        bail!("template disk image does not exist: {}", template.display());
    }

    // Copy next to the destination first so a crash never leaves a
    // half-copied image under the real name.
    let partial = path.with_extension("qcow2.partial");
    std::fs::copy(template, &partial).with_context(|| {
        format!("copy template {} -> {}", template.display(), partial.display())
    })?;
    std::fs::rename(&partial, &path)
        .with_context(|| format!("rename {} -> {}", partial.display(), path.display()))?;

    info!(disk = %name, path = %path.display(), "created disk image from template");

    Ok(DiskImage {
        name: name.to_string(),
        path,
        freshly_created: true,
    })
}
