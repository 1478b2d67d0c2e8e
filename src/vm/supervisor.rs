//! VM supervisor: owns the VM process and the durable save/resume protocol.
//!
//! ```text
//! start() ─► clear .last_cwd ─► prepare disk ─► resolve boot image ─► launch
//!                                                                      │
//!                      replay mount registry ◄─────────────────────────┘
//!                      config host mounts
//!
//! perform_background_save():
//!   guest connected? ─► saving flag ─► savevm <other slot> ─► settle ─► record slot
//! ```
//!
//! A process kill anywhere before the final step leaves the previous slot
//! recorded, so the next boot resumes from the last complete snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::host::ShellTransport;
use crate::launch::{BootReason, LaunchContext};
use crate::metadata::MetadataStore;
use crate::paths::AppPaths;
use crate::settings::SettingsStore;
use crate::vm::access::{AccessError, DirectPath, MountSource};
use crate::vm::boot::{self, BootImage};
use crate::vm::disk::{self, TEMPLATE_IMAGE};
use crate::vm::launcher::{self, Acceleration, LaunchSpec, VmProcess};
use crate::vm::lifecycle::{Lifecycle, LifecycleEvent, VmPhase};
use crate::vm::monitor::{MonitorChannel, MonitorCommand, MonitorError, shell_forward_rule};
use crate::vm::mounts::{MountRecord, MountRegistry};
use crate::vm::resume::ResumeState;
use crate::vm::shared_folder::{SHARED_FOLDER_TAG, SharedFolder, generate_tag};

/// User-mode network device carrying the shell forward.
const NETDEV_ID: &str = "net0";

const KERNEL_IMAGE: &str = "bzImage";
const INITRD_IMAGE: &str = "initrd.img";

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("mount tag {0:?} is already in use")]
    TagInUse(String),
    #[error("could not expose folder to the VM: {0:#}")]
    SharedFolder(anyhow::Error),
    #[error("could not persist mount: {0:#}")]
    Registry(anyhow::Error),
}

/// Clears the saving flag however the save ends.
struct SavingGuard<'a>(&'a AtomicBool);

impl Drop for SavingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Supervisor {
    settings: Arc<SettingsStore>,
    metadata: Arc<MetadataStore>,
    paths: AppPaths,
    context: LaunchContext,
    shell: Arc<dyn ShellTransport>,
    monitor: MonitorChannel,
    shared: SharedFolder,
    disk_name: String,
    shell_port: u16,
    settle_delay: Duration,
    lifecycle: Mutex<Lifecycle>,
    process: tokio::sync::Mutex<Option<VmProcess>>,
    /// Latched once the guest has been seen connected.
    guest_connected: AtomicBool,
    saving: AtomicBool,
    /// The shell forward is currently removed.
    protected_lost: AtomicBool,
    /// VM-mount tag -> host folder, for every mount active this session.
    active_mounts: Mutex<HashMap<String, PathBuf>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("disk", &self.disk_name)
            .field("phase", &self.phase())
            .field("context", &self.context)
            .finish()
    }
}

impl Supervisor {
    /// Build a supervisor for the configured disk. Must be called inside a
    /// tokio runtime (the management channel actor is spawned here).
    pub fn new(
        settings: Arc<SettingsStore>,
        metadata: Arc<MetadataStore>,
        paths: AppPaths,
        context: LaunchContext,
        shell: Arc<dyn ShellTransport>,
    ) -> Result<Self> {
        let snapshot = settings.snapshot();
        let shared = SharedFolder::create(&paths.shared)?;
        let monitor = MonitorChannel::spawn(format!("127.0.0.1:{}", snapshot.vm.monitor_port));

        Ok(Self {
            settings,
            metadata,
            paths,
            context,
            shell,
            monitor,
            shared,
            disk_name: snapshot.disk_name,
            shell_port: snapshot.vm.shell_port,
            settle_delay: Duration::from_millis(snapshot.vm.settle_delay_ms),
            lifecycle: Mutex::new(Lifecycle::default()),
            process: tokio::sync::Mutex::new(None),
            guest_connected: AtomicBool::new(false),
            saving: AtomicBool::new(false),
            protected_lost: AtomicBool::new(false),
            active_mounts: Mutex::new(HashMap::new()),
        })
    }

    pub fn disk_name(&self) -> &str {
        &self.disk_name
    }

    pub fn launch_context(&self) -> LaunchContext {
        self.context
    }

    pub fn boot_reason(&self) -> BootReason {
        self.context.boot_reason()
    }

    pub fn phase(&self) -> VmPhase {
        self.lifecycle().phase()
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, event: LifecycleEvent) -> VmPhase {
        self.lifecycle().handle(event)
    }

    fn mounts(&self) -> MutexGuard<'_, HashMap<String, PathBuf>> {
        self.active_mounts.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Launch
    // -----------------------------------------------------------------------

    /// Resolve the boot image, launch the VM and replay mounts.
    ///
    /// An unknown resume mode is returned as an error and must be treated
    /// as fatal by the caller. Fails without launching anything unless the
    /// VM is not started or stopped.
    pub async fn start(&self) -> Result<BootImage> {
        {
            let mut lifecycle = self.lifecycle();
            let phase = lifecycle.phase();
            if !matches!(phase, VmPhase::NotStarted | VmPhase::Stopped) {
                anyhow::bail!("VM is already active ({phase:?})");
            }
            lifecycle.handle(LifecycleEvent::LaunchRequested);
        }
        match self.launch().await {
            Ok(image) => Ok(image),
            Err(e) => {
                self.transition(LifecycleEvent::LaunchFailed);
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<BootImage> {
        let settings = self.settings.snapshot();
        let resources = &settings.vm.resource_dir;

        self.shared.clear_last_cwd()?;

        let disk = disk::prepare_disk(
            &self.paths.disks,
            &self.disk_name,
            &resources.join(TEMPLATE_IMAGE),
        )?;
        let resume = ResumeState::new(&self.metadata, &self.disk_name);
        if disk.freshly_created {
            resume.reset()?;
        }

        let boot_image = boot::resolve_configured(
            &settings.resume_behavior,
            &resume.current_tag(),
            &settings.boot_snapshot,
            self.context.force_recovery(),
        )?;

        info!(
            disk = %self.disk_name,
            boot = ?boot_image,
            reason = %self.context.boot_reason(),
            "launching VM"
        );

        let spec = LaunchSpec {
            qemu_binary: settings.vm.qemu_binary.clone(),
            bios_dir: resources.clone(),
            kernel_path: resources.join(KERNEL_IMAGE),
            initrd_path: resources.join(INITRD_IMAGE),
            disk_path: disk.path,
            shared_dir: self.shared.root().to_path_buf(),
            boot_image: boot_image.clone(),
            monitor_port: settings.vm.monitor_port,
            shell_port: settings.vm.shell_port,
            memory: settings.vm.memory.clone(),
            acceleration: Acceleration::from_jit(self.context.jit_enabled),
        };
        let process = launcher::launch(&spec).await?;
        *self.process.lock().await = Some(process);
        self.transition(LifecycleEvent::Launched);

        self.replay_mounts();

        for host_mount in &settings.vm.host_mounts {
            let source = DirectPath(host_mount.path.clone());
            if let Err(e) = self.mount(&source, None, host_mount.tag.as_deref(), false) {
                warn!(path = %host_mount.path.display(), error = %e, "configured host mount failed");
            }
        }

        // The monitor may not be listening yet; commands reconnect on demand.
        if let Err(e) = self.monitor.connect().await {
            debug!(error = %e, "management channel not ready yet");
        }

        Ok(boot_image)
    }

    fn replay_mounts(&self) {
        let summary = MountRegistry::new(&self.metadata).replay_all(&self.disk_name);
        let mut active = self.mounts();
        for (record, handle) in summary.restored {
            active.insert(record.vm_tag, handle.path().to_path_buf());
        }
    }

    /// Kill the VM process and drop the management connection.
    pub async fn stop(&self) -> Result<()> {
        self.monitor.disconnect().await;
        if let Some(process) = self.process.lock().await.take() {
            process.stop().await?;
        }
        self.transition(LifecycleEvent::Stopped);
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        match self.process.lock().await.as_ref() {
            Some(process) => process.is_running().await,
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Management commands
    // -----------------------------------------------------------------------

    async fn issue(&self, command: MonitorCommand) -> Result<String, MonitorError> {
        if !self.monitor.is_connected() {
            self.monitor.connect().await?;
        }
        self.monitor.issue(&command).await
    }

    pub async fn pause(&self) -> Result<(), MonitorError> {
        self.issue(MonitorCommand::Halt).await.map(drop)
    }

    pub async fn resume(&self) -> Result<(), MonitorError> {
        self.issue(MonitorCommand::Cont).await.map(drop)
    }

    /// Issue `savevm <tag>`. Callers serialize saves on the same tag.
    pub async fn save_state(&self, tag: &str) -> Result<(), MonitorError> {
        info!(tag = %tag, "saving VM state");
        self.issue(MonitorCommand::SaveVm(tag.to_string())).await.map(drop)
    }

    /// Issue `loadvm <tag>` then continue.
    pub async fn load_state(&self, tag: &str) -> Result<(), MonitorError> {
        info!(tag = %tag, "loading VM state");
        self.issue(MonitorCommand::LoadVm(tag.to_string())).await?;
        self.issue(MonitorCommand::Continue).await.map(drop)
    }

    /// Save into the slot not most recently completed, wait for it to
    /// settle, then record it as latest.
    ///
    /// Returns the tag written, or `None` when skipped: the guest never
    /// connected, the VM is not running, or a save is already in flight.
    pub async fn perform_background_save(&self) -> Result<Option<String>> {
        if self.shell.is_connected() {
            self.note_guest_connected();
        }
        if !self.guest_connected.load(Ordering::SeqCst) {
            debug!("background save skipped: guest never connected");
            return Ok(None);
        }
        if !self.phase().is_running() {
            debug!(phase = ?self.phase(), "background save skipped: VM not running");
            return Ok(None);
        }
        if self
            .saving
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("background save skipped: already saving");
            return Ok(None);
        }
        let _saving = SavingGuard(&self.saving);

        self.transition(LifecycleEvent::BackgroundSaveStarted);
        let result = self.background_save_inner().await;

        self.transition(LifecycleEvent::BackgroundSaveFinished);
        // Backgrounding always returns to Serving; re-enter the sub-state
        // if the forward is still down.
        if self.protected_lost.load(Ordering::SeqCst) {
            self.transition(LifecycleEvent::ProtectedDataLost);
        }
        result.map(Some)
    }

    async fn background_save_inner(&self) -> Result<String> {
        let resume = ResumeState::new(&self.metadata, &self.disk_name);
        let slot = resume.next_slot();
        let tag = slot.tag();

        self.save_state(&tag)
            .await
            .with_context(|| format!("savevm {tag}"))?;

        // The save command returns before the snapshot is durable.
        tokio::time::sleep(self.settle_delay).await;

        resume.record_completed(slot)?;
        info!(disk = %self.disk_name, tag = %tag, "background save recorded");
        Ok(tag)
    }

    /// Remove the guest-reachable shell forward.
    pub async fn stop_host_channels(&self) -> Result<(), MonitorError> {
        let rule = format!("{NETDEV_ID} tcp::{}", self.shell_port);
        self.issue(MonitorCommand::HostFwdRemove(rule)).await.map(drop)
    }

    /// Re-add the shell forward.
    pub async fn start_host_channels(&self) -> Result<(), MonitorError> {
        let rule = format!("{NETDEV_ID} {}", shell_forward_rule(self.shell_port));
        self.issue(MonitorCommand::HostFwdAdd(rule)).await.map(drop)
    }

    /// Host protected storage became unavailable: cut the guest off
    /// without pausing it.
    pub async fn protected_data_will_become_unavailable(&self) -> Result<(), MonitorError> {
        self.stop_host_channels().await?;
        self.protected_lost.store(true, Ordering::SeqCst);
        self.transition(LifecycleEvent::ProtectedDataLost);
        Ok(())
    }

    /// Protected storage is back: restore the forward and have the shell
    /// transport reconnect.
    pub async fn protected_data_did_become_available(&self) -> Result<(), MonitorError> {
        self.start_host_channels().await?;
        self.protected_lost.store(false, Ordering::SeqCst);
        self.transition(LifecycleEvent::ProtectedDataRestored);
        self.shell.force_reconnect();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Guest state
    // -----------------------------------------------------------------------

    /// Record the guest's first confirmed connection. Clears the
    /// boot-in-progress flag so the next launch is not forced into recovery.
    pub fn note_guest_connected(&self) {
        if self.guest_connected.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(disk = %self.disk_name, "guest connected");
        if let Err(e) = self.settings.set_attempting_boot(false) {
            warn!(error = %e, "could not clear boot-in-progress flag");
        }
    }

    pub fn guest_has_connected(&self) -> bool {
        self.guest_connected.load(Ordering::SeqCst)
    }

    pub fn shell_connected(&self) -> bool {
        self.shell.is_connected()
    }

    /// Where the guest shell last was, for reopening shells in place.
    pub fn last_working_directory(&self) -> Option<String> {
        self.shell
            .current_working_directory()
            .or_else(|| self.shared.last_cwd())
    }

    // -----------------------------------------------------------------------
    // Mounts
    // -----------------------------------------------------------------------

    /// Expose a host folder to the guest and return its VM-mount tag.
    ///
    /// Missing tags are generated. With `persistent`, sources that carry a
    /// token are appended to the mount registry for replay on later boots.
    pub fn mount(
        &self,
        source: &dyn MountSource,
        transport_tag: Option<&str>,
        vm_tag: Option<&str>,
        persistent: bool,
    ) -> Result<String, MountError> {
        let handle = source.resolve()?;
        let host_path = handle.path().to_path_buf();

        let tag = self.reserve_tag(vm_tag, &host_path)?;

        if let Err(e) = self.shared.link(&tag, &host_path) {
            self.mounts().remove(&tag);
            return Err(MountError::SharedFolder(e));
        }

        if persistent {
            match source.persistable_token() {
                Some(token) => {
                    let record = MountRecord {
                        token,
                        transport_tag: transport_tag.unwrap_or(SHARED_FOLDER_TAG).to_string(),
                        vm_tag: tag.clone(),
                    };
                    MountRegistry::new(&self.metadata)
                        .append(&self.disk_name, &record)
                        .map_err(MountError::Registry)?;
                }
                None => debug!(tag = %tag, "path mount is session-only"),
            }
        }

        info!(
            disk = %self.disk_name,
            tag = %tag,
            path = %host_path.display(),
            persistent,
            "host folder mounted"
        );
        Ok(tag)
    }

    /// Claim a VM-mount tag. A requested tag already bound to the same
    /// folder is reused; bound elsewhere it is an error. Generated tags are
    /// drawn until one is free.
    fn reserve_tag(&self, requested: Option<&str>, host_path: &Path) -> Result<String, MountError> {
        let mut active = self.mounts();

        if let Some(tag) = requested.filter(|t| !t.is_empty()) {
            return match active.get(tag) {
                Some(existing) if existing.as_path() == host_path => Ok(tag.to_string()),
                Some(_) => Err(MountError::TagInUse(tag.to_string())),
                None => {
                    active.insert(tag.to_string(), host_path.to_path_buf());
                    Ok(tag.to_string())
                }
            };
        }

        loop {
            let tag = generate_tag();
            if !active.contains_key(&tag) {
                active.insert(tag.clone(), host_path.to_path_buf());
                return Ok(tag);
            }
        }
    }

    /// VM-mount tags active this session.
    pub fn active_mount_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.mounts().keys().cloned().collect();
        tags.sort();
        tags
    }
}
