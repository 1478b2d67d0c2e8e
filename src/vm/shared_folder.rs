//! The shared folder exported to the VM over 9p.
//!
//! ## Design
//!
//! The VM always has one folder shared with the host. Every host folder the
//! guest is allowed to mount appears inside it as a symlink named after its
//! VM-mount tag:
//!
//! ```text
//! Host:  <data>/shared/<vm_tag>  ->  /path/the/user/picked
//!                    |
//!             9p (mount tag: "hostshare")
//!                    |
//! VM:    /mnt/host/<vm_tag>/
//! ```
//!
//! The guest also drops its last working directory into `.last_cwd` here,
//! which the host reads back to reopen shells where the user left off.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::Rng;
use rand::distributions::Alphanumeric;

/// 9p mount tag under which the shared folder is exported.
pub const SHARED_FOLDER_TAG: &str = "hostshare";

/// Length of generated VM-mount tags.
pub const GENERATED_TAG_LEN: usize = 8;

const LAST_CWD_MARKER: &str = ".last_cwd";

/// Arguments exporting `shared_dir` to the guest via virtio-9p.
pub fn build_virtfs_args(shared_dir: &Path) -> Vec<String> {
    vec![
        "-virtfs".to_string(),
        format!(
            "local,path={},mount_tag={},security_model=none,id={}",
            shared_dir.display(),
            SHARED_FOLDER_TAG,
            SHARED_FOLDER_TAG,
        ),
    ]
}

/// Random fixed-length alphanumeric tag.
pub fn generate_tag() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_TAG_LEN)
        .map(char::from)
        .collect()
}

/// Handle on the shared folder directory.
#[derive(Debug, Clone)]
pub struct SharedFolder {
    root: PathBuf,
}

impl SharedFolder {
    /// Ensure `root` exists and wrap it.
    pub fn create(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("create shared folder {}", root.display()))?;
        Ok(Self { root: root.to_path_buf() })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Point `<root>/<tag>` at `target`, replacing any previous link.
    pub fn link(&self, tag: &str, target: &Path) -> Result<PathBuf> {
        let link = self.root.join(tag);

        if link.symlink_metadata().is_ok() {
            std::fs::remove_file(&link)
                .with_context(|| format!("remove old link {}", link.display()))?;
        }

        symlink(target, &link)
            .with_context(|| format!("link {} -> {}", link.display(), target.display()))?;
        Ok(link)
    }

    /// Remove a stale working-directory marker left by a previous session.
    pub fn clear_last_cwd(&self) -> Result<()> {
        let marker = self.root.join(LAST_CWD_MARKER);
        match std::fs::remove_file(&marker) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", marker.display())),
        }
    }

    /// The guest's last reported working directory, if any.
    pub fn last_cwd(&self) -> Option<String> {
        let raw = std::fs::read_to_string(self.root.join(LAST_CWD_MARKER)).ok()?;
        let cwd = raw.trim();
        (!cwd.is_empty()).then(|| cwd.to_string())
    }
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}
