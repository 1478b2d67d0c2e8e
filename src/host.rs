//! Host-side collaborators the supervisor talks to but does not own:
//! the interactive shell transport and the folder picker.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::vm::access::{AccessError, issue_token};
use crate::vm::shared_folder::SharedFolder;

/// The transport carrying the interactive shell between host and guest.
pub trait ShellTransport: Send + Sync {
    /// `true` once the guest side answers.
    fn is_connected(&self) -> bool;

    /// Drop and re-establish the transport, e.g. after the guest forward
    /// was re-added.
    fn force_reconnect(&self);

    /// The guest's last known working directory.
    fn current_working_directory(&self) -> Option<String>;
}

/// A folder chosen by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickedFolder {
    pub path: PathBuf,
    /// Persistable access token for `path`.
    pub token: String,
}

impl PickedFolder {
    pub fn for_path(path: &Path) -> Result<Self, AccessError> {
        Ok(Self {
            path: path.to_path_buf(),
            token: issue_token(path)?,
        })
    }
}

/// Interactive folder chooser. Blocks until the user answers.
pub trait FolderPicker: Send + Sync {
    /// `Ok(None)` when the user cancelled.
    fn pick_folder(&self) -> Result<Option<PickedFolder>>;
}

// ---------------------------------------------------------------------------
// PortProbeShell
// ---------------------------------------------------------------------------

const PROBE_INTERVAL: Duration = Duration::from_secs(1);
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const SSH_BANNER_PREFIX: &[u8] = b"SSH-";

/// Treats the shell as connected while the guest's SSH server answers on
/// the forwarded shell port. The host end of the forward accepts as soon
/// as the hypervisor runs, so only the identification banner counts. The
/// working directory comes from the shared folder's `.last_cwd` marker.
pub struct PortProbeShell {
    connected: Arc<AtomicBool>,
    reprobe: Arc<Notify>,
    shared: SharedFolder,
}

impl PortProbeShell {
    /// Start probing `127.0.0.1:<shell_port>` in the background.
    pub fn spawn(shell_port: u16, shared: SharedFolder) -> Self {
        let connected = Arc::new(AtomicBool::new(false));
        let reprobe = Arc::new(Notify::new());

        let addr = format!("127.0.0.1:{shell_port}");
        let flag = Arc::clone(&connected);
        let wake = Arc::clone(&reprobe);
        tokio::spawn(async move {
            loop {
                let up = matches!(
                    tokio::time::timeout(PROBE_TIMEOUT, guest_answers(&addr)).await,
                    Ok(true)
                );
                if flag.swap(up, Ordering::SeqCst) != up {
                    info!(addr = %addr, connected = up, "shell transport state changed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(PROBE_INTERVAL) => {}
                    _ = wake.notified() => debug!(addr = %addr, "shell re-probe requested"),
                }
            }
        });

        Self {
            connected,
            reprobe,
            shared,
        }
    }
}

/// Connect and read the first bytes the guest sends.
async fn guest_answers(addr: &str) -> bool {
    let Ok(mut stream) = TcpStream::connect(addr).await else {
        return false;
    };
    let mut banner = [0u8; SSH_BANNER_PREFIX.len()];
    match stream.read_exact(&mut banner).await {
        Ok(_) => banner[..] == *SSH_BANNER_PREFIX,
        Err(_) => false,
    }
}

impl ShellTransport for PortProbeShell {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn force_reconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.reprobe.notify_one();
    }

    fn current_working_directory(&self) -> Option<String> {
        self.shared.last_cwd()
    }
}

// ---------------------------------------------------------------------------
// CommandPicker
// ---------------------------------------------------------------------------

/// Runs an external chooser that prints the selected directory on stdout.
/// A non-zero exit or empty output is a cancel.
#[derive(Debug, Clone)]
pub struct CommandPicker {
    argv: Vec<String>,
}

impl CommandPicker {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl FolderPicker for CommandPicker {
    fn pick_folder(&self) -> Result<Option<PickedFolder>> {
        let Some((program, args)) = self.argv.split_first() else {
            anyhow::bail!("no folder picker command configured");
        };

        let output = std::process::Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("run folder picker {program}"))?;

        if !output.status.success() {
            debug!(status = ?output.status, "folder picker cancelled");
            return Ok(None);
        }

        let chosen = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if chosen.is_empty() {
            return Ok(None);
        }

        Ok(Some(PickedFolder::for_path(Path::new(&chosen))?))
    }
}
