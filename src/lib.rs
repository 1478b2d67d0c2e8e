//! vm-supervisor: keeps a local VM instantly resumable.
//!
//! The supervisor decides which saved state to boot from, drives the VM's
//! management channel (pause, resume, snapshots, port forwards), tracks
//! host-folder mounts across restarts, and serves a small JSON control
//! protocol to the guest.

pub mod control;
pub mod host;
pub mod launch;
pub mod logging;
pub mod metadata;
pub mod paths;
pub mod settings;
pub mod vm;
