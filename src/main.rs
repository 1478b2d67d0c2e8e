//! vm-supervisor: launches the VM, keeps its resume snapshots rotating and
//! serves the control plane. `ctl` talks to a running instance.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use vm_supervisor::control::{ControlClient, ControlContext, ControlServer};
use vm_supervisor::host::{CommandPicker, PortProbeShell};
use vm_supervisor::launch::LaunchContext;
use vm_supervisor::metadata::MetadataStore;
use vm_supervisor::paths::AppPaths;
use vm_supervisor::settings::{DEFAULT_CONTROL_PORT, SettingsStore};
use vm_supervisor::vm::Supervisor;
use vm_supervisor::vm::shared_folder::SharedFolder;
use vm_supervisor::{logging, vm};

#[derive(Parser, Debug)]
#[command(name = "vm-supervisor", version, about = "VM lifecycle supervisor")]
struct Args {
    /// Settings file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch the VM and serve the control plane until interrupted
    Run {
        /// Cold boot regardless of any saved state
        #[arg(long)]
        recovery: bool,
    },
    /// Send a command to a running control server
    Ctl {
        /// Control server address
        #[arg(long, default_value_t = format!("127.0.0.1:{DEFAULT_CONTROL_PORT}"))]
        addr: String,

        #[command(subcommand)]
        action: CtlAction,
    },
}

#[derive(Subcommand, Debug)]
enum CtlAction {
    /// Issue a raw protocol command and print the reply
    Raw {
        command: String,
        key: Option<String>,
        value: Option<String>,
    },
    /// Set a terminal font property
    Font { property: String, value: String },
    /// Expose a host folder to the guest and print its mount tag
    PrepareMount {
        /// TARGET is an access token from `open-folder`, not a path
        #[arg(long)]
        bookmark: bool,
        target: String,
    },
    /// Pick a host folder and print its path
    ChooseFolder,
    /// Pick a host folder and print a persistable access token for it
    OpenFolder,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    match args.command {
        Command::Run { recovery } => runtime.block_on(run(args.config, recovery)),
        Command::Ctl { addr, action } => {
            let _log = logging::init(None);
            runtime.block_on(ctl(ControlClient::new(addr), action))
        }
    }
}

async fn run(config: Option<PathBuf>, user_recovery: bool) -> Result<()> {
    let paths = AppPaths::resolve().context("could not determine the home directory")?;
    paths.ensure().context("create application directories")?;
    let _log = logging::init(Some(&paths.logs));

    let settings_path = config.unwrap_or_else(|| paths.settings_file());
    let settings = Arc::new(SettingsStore::load(&settings_path)?);
    let metadata = Arc::new(MetadataStore::open(&paths.metadata_file())?);
    let snapshot = settings.snapshot();

    let context = LaunchContext::begin(&settings, &metadata, &paths.disks, user_recovery)?;
    if let Some(notice) = context.boot_reason().notice() {
        println!("{notice}");
    }

    let shared = SharedFolder::create(&paths.shared)?;
    let shell = Arc::new(PortProbeShell::spawn(snapshot.vm.shell_port, shared));

    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&settings),
        metadata,
        paths,
        context,
        shell,
    )?);

    let boot_image = supervisor.start().await.inspect_err(|e| {
        if e.downcast_ref::<vm::BootModeError>().is_some() {
            error!(error = %e, "refusing to start with an undefined boot mode");
        }
    })?;
    info!(disk = %supervisor.disk_name(), boot = ?boot_image, "VM started");

    let picker = Arc::new(CommandPicker::new(snapshot.picker_command.clone()));
    let server = ControlServer::start(
        &format!("127.0.0.1:{}", snapshot.vm.control_port),
        Arc::new(ControlContext::new(Arc::clone(&supervisor), picker)),
    )
    .await?;

    let result = wait_for_exit(&supervisor).await;

    server.shutdown();
    supervisor.stop().await?;
    result
}

/// Serve until Ctrl-C or the VM exits. SIGUSR1 takes a background save,
/// SIGUSR2 toggles protected-data availability.
#[cfg(unix)]
async fn wait_for_exit(supervisor: &Supervisor) -> Result<()> {
    use std::time::Duration;
    use tokio::signal::unix::{SignalKind, signal};

    let mut save_signal = signal(SignalKind::user_defined1())?;
    let mut protect_signal = signal(SignalKind::user_defined2())?;
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut protected_lost = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; saving before shutdown");
                if let Err(e) = supervisor.perform_background_save().await {
                    warn!(error = %e, "final background save failed");
                }
                return Ok(());
            }
            _ = save_signal.recv() => {
                match supervisor.perform_background_save().await {
                    Ok(Some(tag)) => info!(tag = %tag, "background save complete"),
                    Ok(None) => info!("background save skipped"),
                    Err(e) => warn!(error = %e, "background save failed"),
                }
            }
            _ = protect_signal.recv() => {
                let result = if protected_lost {
                    supervisor.protected_data_did_become_available().await
                } else {
                    supervisor.protected_data_will_become_unavailable().await
                };
                match result {
                    Ok(()) => protected_lost = !protected_lost,
                    Err(e) => warn!(error = %e, "could not change host channels"),
                }
            }
            _ = tick.tick() => {
                if supervisor.shell_connected() {
                    supervisor.note_guest_connected();
                }
                if !supervisor.is_running().await {
                    warn!("VM process exited");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_exit(supervisor: &Supervisor) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    if let Err(e) = supervisor.perform_background_save().await {
        warn!(error = %e, "final background save failed");
    }
    Ok(())
}

async fn ctl(client: ControlClient, action: CtlAction) -> Result<()> {
    match action {
        CtlAction::Raw {
            command,
            key,
            value,
        } => {
            let reply = client.raw(&command, key, value).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        CtlAction::Font { property, value } => match value.parse::<u32>() {
            Ok(size) if property == "size" => client.set_font_size(size).await?,
            _ => {
                let reply = client.raw("font", Some(property), Some(value)).await?;
                if reply.is_error() {
                    anyhow::bail!(reply.value.unwrap_or_default());
                }
            }
        },
        CtlAction::PrepareMount { bookmark, target } => {
            let tag = if bookmark {
                client.prepare_mount_bookmark(&target).await?
            } else {
                client.prepare_mount(&target).await?
            };
            println!("{tag}");
        }
        CtlAction::ChooseFolder => println!("{}", client.choose_folder().await?),
        CtlAction::OpenFolder => println!("{}", client.open_folder().await?),
    }
    Ok(())
}
