//! Shared harness for the integration tests.
//!
//! No real hypervisor is needed: the VM binary is a shell script that
//! sleeps, and the management endpoint is a fake line server that records
//! every command it receives.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use vm_supervisor::host::{FolderPicker, PickedFolder, ShellTransport};
use vm_supervisor::launch::LaunchContext;
use vm_supervisor::metadata::MetadataStore;
use vm_supervisor::paths::AppPaths;
use vm_supervisor::settings::{Settings, SettingsStore, VmSettings};
use vm_supervisor::vm::Supervisor;

// ---------------------------------------------------------------------------
// Fake management endpoint
// ---------------------------------------------------------------------------

/// Accepts any number of connections; every line is recorded and answered
/// with a fresh prompt.
pub struct FakeMonitor {
    pub port: u16,
    commands: Arc<Mutex<Vec<String>>>,
}

impl FakeMonitor {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let commands = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&commands);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    if write.write_all(b"QEMU monitor\r\n(qemu) ").await.is_err() {
                        return;
                    }
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        seen.lock().unwrap().push(line.trim_end().to_string());
                        if write.write_all(b"\r\n(qemu) ").await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        Self { port, commands }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// Collaborator stubs
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct StubShell {
    pub connected: AtomicBool,
    pub reconnects: AtomicUsize,
}

impl ShellTransport for StubShell {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn force_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn current_working_directory(&self) -> Option<String> {
        None
    }
}

/// Picks a fixed folder, or cancels when `None`.
pub struct StubPicker(pub Option<PathBuf>);

impl FolderPicker for StubPicker {
    fn pick_folder(&self) -> anyhow::Result<Option<PickedFolder>> {
        match &self.0 {
            Some(path) => Ok(Some(PickedFolder::for_path(path)?)),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// On-disk state for one test: resources, a stub VM binary, app paths.
pub struct TestEnv {
    pub dir: TempDir,
    pub paths: AppPaths,
    pub metadata: Arc<MetadataStore>,
    pub monitor: FakeMonitor,
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let resources = root.join("resources");
        std::fs::create_dir_all(&resources).unwrap();
        for file in ["bzImage", "initrd.img", "empty.qcow2"] {
            std::fs::write(resources.join(file), b"stub").unwrap();
        }
        write_stub_vm(&root.join("fake-qemu"));

        let paths = AppPaths::under(root.join("config"), root.join("data"), root.join("logs"));
        paths.ensure().unwrap();

        Self {
            metadata: Arc::new(MetadataStore::open(&paths.metadata_file()).unwrap()),
            paths,
            monitor: FakeMonitor::start().await,
            dir,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn settings(&self) -> Settings {
        Settings {
            vm: VmSettings {
                qemu_binary: self.root().join("fake-qemu"),
                resource_dir: self.root().join("resources"),
                monitor_port: self.monitor.port,
                shell_port: 10022,
                control_port: 0,
                settle_delay_ms: 20,
                ..VmSettings::default()
            },
            ..Settings::default()
        }
    }

    pub fn supervisor(
        &self,
        settings: Settings,
        context: LaunchContext,
        shell: Arc<StubShell>,
    ) -> Arc<Supervisor> {
        Arc::new(
            Supervisor::new(
                Arc::new(SettingsStore::in_memory(settings)),
                Arc::clone(&self.metadata),
                self.paths.clone(),
                context,
                shell,
            )
            .unwrap(),
        )
    }

    /// A host folder under the test directory.
    pub fn host_folder(&self, name: &str) -> PathBuf {
        let path = self.root().join("host").join(name);
        std::fs::create_dir_all(&path).unwrap();
        path
    }
}

fn write_stub_vm(path: &Path) {
    std::fs::write(path, "#!/bin/sh\nexec sleep 30\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}
