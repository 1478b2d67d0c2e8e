//! Hypervisor process launch.
//!
//! ## Architecture
//!
//! ```text
//! LaunchSpec ──build_args()──► tokio::process::Command ──► qemu child
//!                                                            └─► VmProcess { child }
//!                                                                  ├─► is_running()  (try_wait)
//!                                                                  └─► stop()        (kill + reap)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::vm::boot::BootImage;
use crate::vm::monitor::shell_forward_rule;
use crate::vm::shared_folder::build_virtfs_args;

/// How the guest CPU is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceleration {
    /// Multi-threaded translation with a large code cache.
    Jit,
    /// Single-threaded translation, for hosts that refuse executable mappings.
    Interpreted,
}

impl Acceleration {
    pub fn from_jit(jit_enabled: bool) -> Self {
        if jit_enabled {
            Acceleration::Jit
        } else {
            Acceleration::Interpreted
        }
    }

    fn accel_arg(self) -> &'static str {
        match self {
            Acceleration::Jit => "tcg,thread=multi,tb-size=1024",
            Acceleration::Interpreted => "tcg,thread=single",
        }
    }
}

/// Everything needed to start the VM. All paths must exist before launch.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub qemu_binary: PathBuf,
    /// Firmware directory passed with `-L`.
    pub bios_dir: PathBuf,
    pub kernel_path: PathBuf,
    pub initrd_path: PathBuf,
    pub disk_path: PathBuf,
    pub shared_dir: PathBuf,
    pub boot_image: BootImage,
    pub monitor_port: u16,
    pub shell_port: u16,
    pub memory: String,
    pub acceleration: Acceleration,
}

impl LaunchSpec {
    /// Loopback address of the management endpoint.
    pub fn monitor_addr(&self) -> String {
        format!("127.0.0.1:{}", self.monitor_port)
    }

    /// Hypervisor command-line arguments (without the binary).
    pub fn build_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-L".into(),
            self.bios_dir.display().to_string(),
            "-display".into(),
            "none".into(),
            "-accel".into(),
            self.acceleration.accel_arg().into(),
            "-kernel".into(),
            self.kernel_path.display().to_string(),
            "-initrd".into(),
            self.initrd_path.display().to_string(),
            "-m".into(),
            self.memory.clone(),
            "-drive".into(),
            format!(
                "file={},if=virtio,format=qcow2,discard=unmap,detect-zeroes=unmap",
                self.disk_path.display()
            ),
            "-device".into(),
            "virtio-net-pci,id=net1,netdev=net0".into(),
            "-netdev".into(),
            format!(
                "user,id=net0,net=192.168.100.0/24,dhcpstart=192.168.100.100,hostfwd={}",
                shell_forward_rule(self.shell_port)
            ),
            "-device".into(),
            "virtio-rng-pci".into(),
            "-monitor".into(),
            format!("tcp:{},server,nowait", self.monitor_addr()),
        ];

        args.extend(build_virtfs_args(&self.shared_dir));

        if let Some(tag) = self.boot_image.load_tag() {
            args.push("-loadvm".into());
            args.push(tag.to_string());
        }

        args
    }
}

/// A running hypervisor process.
///
/// Dropping this value does NOT stop the child. Call [`VmProcess::stop`].
#[derive(Debug, Clone)]
pub struct VmProcess {
    child: Arc<Mutex<Option<Child>>>,
    pid: Option<u32>,
}

impl VmProcess {
    /// `true` while the child has not exited.
    pub async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    info!(exit_status = ?status, "VM process exited");
                    *guard = None;
                    false
                }
                Err(e) => {
                    error!(error = %e, "try_wait on VM process failed");
                    false
                }
            },
            None => false,
        }
    }

    /// Kill the child and reap it.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Ok(Some(status)) = child.try_wait() {
                info!(exit_status = ?status, "VM process already exited");
                return Ok(());
            }
            child.kill().await.context("kill VM process")?;
            info!(pid = ?self.pid, "VM process stopped");
        }
        Ok(())
    }
}

/// Validate `spec` and spawn the hypervisor.
pub async fn launch(spec: &LaunchSpec) -> anyhow::Result<VmProcess> {
    for (label, path) in [
        ("kernel", &spec.kernel_path),
        ("initrd", &spec.initrd_path),
        ("disk", &spec.disk_path),
        ("shared folder", &spec.shared_dir),
    ] {
        if !path.exists() {
            bail!("{label} does not exist: {}", path.display());
        }
    }

    let mut cmd = Command::new(&spec.qemu_binary);
    cmd.args(spec.build_args());

    // Redirect child stdio so it does not pollute our terminal.
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::null());
    cmd.stderr(std::process::Stdio::null());

    let child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {}", spec.qemu_binary.display()))?;
    let pid = child.id();

    info!(
        pid = ?pid,
        kernel = %spec.kernel_path.display(),
        disk = %spec.disk_path.display(),
        boot = ?spec.boot_image,
        acceleration = ?spec.acceleration,
        "VM spawned"
    );

    Ok(VmProcess {
        child: Arc::new(Mutex::new(Some(child))),
        pid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(boot_image: BootImage) -> LaunchSpec {
        LaunchSpec {
            qemu_binary: PathBuf::from("qemu-system-x86_64"),
            bios_dir: PathBuf::from("/res"),
            kernel_path: PathBuf::from("/res/bzImage"),
            initrd_path: PathBuf::from("/res/initrd.img"),
            disk_path: PathBuf::from("/data/disks/disk.qcow2"),
            shared_dir: PathBuf::from("/data/shared"),
            boot_image,
            monitor_port: 10044,
            shell_port: 10022,
            memory: "4G".into(),
            acceleration: Acceleration::Jit,
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn resume_adds_loadvm() {
        let args = spec(BootImage::ResumeFromTag("instantbootb".into())).build_args();
        assert_eq!(value_after(&args, "-loadvm"), vec!["instantbootb"]);
    }

    #[test]
    fn cold_boot_has_no_loadvm() {
        let args = spec(BootImage::NoSavedState).build_args();
        assert!(!args.iter().any(|a| a == "-loadvm"));
    }

    #[test]
    fn monitor_listens_on_loopback() {
        let args = spec(BootImage::NoSavedState).build_args();
        assert_eq!(
            value_after(&args, "-monitor"),
            vec!["tcp:127.0.0.1:10044,server,nowait"]
        );
    }

    #[test]
    fn netdev_forwards_shell_port() {
        let args = spec(BootImage::NoSavedState).build_args();
        let netdev = value_after(&args, "-netdev");
        assert!(netdev[0].contains("hostfwd=tcp::10022-:22"), "{netdev:?}");
    }

    #[test]
    fn acceleration_follows_jit_hint() {
        let mut s = spec(BootImage::NoSavedState);
        assert_eq!(value_after(&s.build_args(), "-accel"), vec!["tcg,thread=multi,tb-size=1024"]);
        s.acceleration = Acceleration::from_jit(false);
        assert_eq!(value_after(&s.build_args(), "-accel"), vec!["tcg,thread=single"]);
    }

    #[tokio::test]
    async fn launch_rejects_missing_kernel() {
        let err = launch(&spec(BootImage::NoSavedState)).await.unwrap_err();
        assert!(err.to_string().contains("kernel"), "{err}");
    }
}
