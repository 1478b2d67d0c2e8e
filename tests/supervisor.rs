//! Supervisor integration tests: boot resolution against persisted state,
//! A/B background saves, host channels and mount replay.
//!
//! Each test runs a stub VM binary and a fake management endpoint (see
//! `common`), so nothing here needs a hypervisor.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::{StubShell, TestEnv};
use vm_supervisor::launch::{BootReason, LaunchContext};
use vm_supervisor::settings::Settings;
use vm_supervisor::vm::resume::{RESUME_IMAGE_KEY, ResumeState, Slot};
use vm_supervisor::vm::{
    BookmarkToken, BootImage, BootModeError, DirectPath, MountError, MountRegistry, VmPhase,
};
use vm_supervisor::vm::access::issue_token;

fn first_boot() -> LaunchContext {
    LaunchContext {
        jit_enabled: true,
        first_boot: true,
        ..LaunchContext::default()
    }
}

fn connected_shell() -> Arc<StubShell> {
    let shell = Arc::new(StubShell::default());
    shell.connected.store(true, Ordering::SeqCst);
    shell
}

#[tokio::test]
async fn first_start_creates_disk_and_cold_boots() {
    let env = TestEnv::new().await;
    let sup = env.supervisor(env.settings(), first_boot(), Arc::default());

    let image = sup.start().await.unwrap();

    assert_eq!(image, BootImage::NoSavedState);
    assert!(env.paths.disks.join("disk.qcow2").exists());
    assert_eq!(sup.phase(), VmPhase::Running);
    assert!(sup.is_running().await);
    assert_eq!(sup.boot_reason(), BootReason::FirstBoot);

    sup.stop().await.unwrap();
    assert_eq!(sup.phase(), VmPhase::Stopped);
    assert!(!sup.is_running().await);
}

#[tokio::test]
async fn second_start_is_refused_while_running() {
    let env = TestEnv::new().await;
    let sup = env.supervisor(env.settings(), first_boot(), Arc::default());
    sup.start().await.unwrap();

    assert!(sup.start().await.is_err());
    assert_eq!(sup.phase(), VmPhase::Running);
    assert!(sup.is_running().await);

    sup.stop().await.unwrap();
    assert!(!sup.is_running().await);

    // A stopped supervisor may be started again.
    sup.start().await.unwrap();
    assert_eq!(sup.phase(), VmPhase::Running);
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_starts_launch_one_vm() {
    let env = TestEnv::new().await;
    let sup = env.supervisor(env.settings(), first_boot(), Arc::default());

    let (a, b) = tokio::join!(sup.start(), sup.start());
    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn background_save_is_a_no_op_before_guest_connects() {
    let env = TestEnv::new().await;
    let sup = env.supervisor(env.settings(), first_boot(), Arc::default());
    sup.start().await.unwrap();

    assert_eq!(sup.perform_background_save().await.unwrap(), None);

    assert!(env.monitor.commands().is_empty());
    assert_eq!(env.metadata.get("disk", RESUME_IMAGE_KEY).as_deref(), Some(""));
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn background_saves_rotate_a_b_a() {
    let env = TestEnv::new().await;
    let sup = env.supervisor(env.settings(), first_boot(), connected_shell());
    sup.start().await.unwrap();

    let mut tags = Vec::new();
    for _ in 0..3 {
        tags.push(sup.perform_background_save().await.unwrap().unwrap());
    }

    assert_eq!(tags, vec!["instantboota", "instantbootb", "instantboota"]);
    assert_eq!(
        env.monitor.commands(),
        vec!["savevm instantboota", "savevm instantbootb", "savevm instantboota"]
    );
    assert_eq!(ResumeState::new(&env.metadata, "disk").current_tag(), "instantboota");
    assert_eq!(sup.phase(), VmPhase::Running);
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn overlapping_background_saves_run_once() {
    let env = TestEnv::new().await;
    let sup = env.supervisor(env.settings(), first_boot(), connected_shell());
    sup.start().await.unwrap();

    let (a, b) = tokio::join!(sup.perform_background_save(), sup.perform_background_save());
    let saved: Vec<_> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();

    assert_eq!(saved, vec!["instantboota"]);
    assert_eq!(env.monitor.commands(), vec!["savevm instantboota"]);
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn restart_resumes_from_latest_save() {
    let env = TestEnv::new().await;

    let sup = env.supervisor(env.settings(), first_boot(), connected_shell());
    sup.start().await.unwrap();
    sup.perform_background_save().await.unwrap();
    sup.stop().await.unwrap();

    let sup = env.supervisor(env.settings(), LaunchContext::default(), Arc::default());
    let image = sup.start().await.unwrap();
    assert_eq!(image, BootImage::ResumeFromTag("instantboota".into()));
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn forced_recovery_ignores_saved_state() {
    let env = TestEnv::new().await;
    std::fs::write(env.paths.disks.join("disk.qcow2"), b"existing").unwrap();
    ResumeState::new(&env.metadata, "disk").record_completed(Slot::B).unwrap();

    let forced = LaunchContext {
        recovery_forced: true,
        ..LaunchContext::default()
    };
    let sup = env.supervisor(env.settings(), forced, Arc::default());
    assert_eq!(sup.start().await.unwrap(), BootImage::NoSavedState);
    assert_eq!(sup.boot_reason(), BootReason::ForcedRecovery);
    sup.stop().await.unwrap();

    // The saved tag is still there for the next normal boot.
    let sup = env.supervisor(env.settings(), LaunchContext::default(), Arc::default());
    assert_eq!(
        sup.start().await.unwrap(),
        BootImage::ResumeFromTag("instantbootb".into())
    );
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_resume_mode_is_fatal() {
    let env = TestEnv::new().await;
    let settings = Settings {
        resume_behavior: "warp_boot".into(),
        ..env.settings()
    };
    let sup = env.supervisor(settings, first_boot(), Arc::default());

    let err = sup.start().await.unwrap_err();
    assert!(err.downcast_ref::<BootModeError>().is_some(), "{err:#}");
    assert_eq!(sup.phase(), VmPhase::Stopped);
}

#[tokio::test]
async fn management_commands_reach_the_vm() {
    let env = TestEnv::new().await;
    let sup = env.supervisor(env.settings(), first_boot(), Arc::default());
    sup.start().await.unwrap();

    sup.pause().await.unwrap();
    sup.resume().await.unwrap();
    sup.load_state("instantbootb").await.unwrap();

    assert_eq!(
        env.monitor.commands(),
        vec!["halt", "cont", "loadvm instantbootb", "c"]
    );
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn protected_data_toggles_the_shell_forward() {
    let env = TestEnv::new().await;
    let shell = Arc::new(StubShell::default());
    let sup = env.supervisor(env.settings(), first_boot(), Arc::clone(&shell));
    sup.start().await.unwrap();

    sup.protected_data_will_become_unavailable().await.unwrap();
    assert_eq!(sup.phase(), VmPhase::ProtectedDataUnavailable);

    sup.protected_data_did_become_available().await.unwrap();
    assert_eq!(sup.phase(), VmPhase::Running);
    assert_eq!(shell.reconnects.load(Ordering::SeqCst), 1);

    assert_eq!(
        env.monitor.commands(),
        vec!["hostfwd_remove net0 tcp::10022", "hostfwd_add net0 tcp::10022-:22"]
    );
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn background_save_keeps_protected_state() {
    let env = TestEnv::new().await;
    let sup = env.supervisor(env.settings(), first_boot(), connected_shell());
    sup.start().await.unwrap();

    sup.protected_data_will_become_unavailable().await.unwrap();
    sup.perform_background_save().await.unwrap().unwrap();

    assert_eq!(sup.phase(), VmPhase::ProtectedDataUnavailable);
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn guest_connection_clears_boot_in_progress_flag() {
    let env = TestEnv::new().await;
    let settings = Settings {
        attempting_boot: true,
        ..env.settings()
    };
    let sup = env.supervisor(settings, first_boot(), Arc::default());

    assert!(!sup.guest_has_connected());
    sup.note_guest_connected();
    assert!(sup.guest_has_connected());
    assert!(!sup.settings().snapshot().attempting_boot);
}

#[tokio::test]
async fn start_clears_stale_working_directory() {
    let env = TestEnv::new().await;
    std::fs::create_dir_all(&env.paths.shared).unwrap();
    std::fs::write(env.paths.shared.join(".last_cwd"), "/root/old").unwrap();

    let sup = env.supervisor(env.settings(), first_boot(), Arc::default());
    assert_eq!(sup.last_working_directory().as_deref(), Some("/root/old"));

    sup.start().await.unwrap();
    assert_eq!(sup.last_working_directory(), None);
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn bookmark_mounts_are_replayed_after_restart() {
    let env = TestEnv::new().await;
    let folder = env.host_folder("projects");
    let token = issue_token(&folder).unwrap();

    let sup = env.supervisor(env.settings(), first_boot(), Arc::default());
    sup.start().await.unwrap();
    let tag = sup
        .mount(&BookmarkToken(token.clone()), None, Some("projects"), true)
        .unwrap();
    assert_eq!(tag, "projects");
    assert_eq!(
        std::fs::read_link(env.paths.shared.join("projects")).unwrap(),
        folder.canonicalize().unwrap()
    );
    sup.stop().await.unwrap();

    let records = MountRegistry::new(&env.metadata).list("disk");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].token, token);
    assert_eq!(records[0].transport_tag, "hostshare");

    let sup = env.supervisor(env.settings(), LaunchContext::default(), Arc::default());
    sup.start().await.unwrap();
    assert_eq!(sup.active_mount_tags(), vec!["projects"]);

    // Same tag for a different folder is refused.
    let other = env.host_folder("other");
    let err = sup
        .mount(&DirectPath(other), None, Some("projects"), false)
        .unwrap_err();
    assert!(matches!(err, MountError::TagInUse(_)), "{err}");
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn path_mounts_are_session_only() {
    let env = TestEnv::new().await;
    let sup = env.supervisor(env.settings(), first_boot(), Arc::default());

    let tag = sup
        .mount(&DirectPath(env.host_folder("scratch")), None, None, true)
        .unwrap();

    assert_eq!(tag.len(), 8);
    assert!(env.paths.shared.join(&tag).symlink_metadata().is_ok());
    assert!(MountRegistry::new(&env.metadata).list("disk").is_empty());
}

#[tokio::test]
async fn configured_host_mounts_are_mounted_on_start() {
    let env = TestEnv::new().await;
    let folder = env.host_folder("configured");
    let mut settings = env.settings();
    settings.vm.host_mounts = vec![vm_supervisor::settings::HostMountSetting {
        path: folder,
        tag: Some("cfg".into()),
    }];

    let sup = env.supervisor(settings, first_boot(), Arc::default());
    sup.start().await.unwrap();

    assert_eq!(sup.active_mount_tags(), vec!["cfg"]);
    assert!(MountRegistry::new(&env.metadata).list("disk").is_empty());
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn stale_bookmark_is_an_access_error() {
    let env = TestEnv::new().await;
    let folder = env.host_folder("gone");
    let token = issue_token(&folder).unwrap();
    std::fs::remove_dir(&folder).unwrap();

    let sup = env.supervisor(env.settings(), first_boot(), Arc::default());
    let err = sup
        .mount(&BookmarkToken(token), None, None, true)
        .unwrap_err();
    assert!(matches!(err, MountError::Access(_)), "{err}");
}
