//! VM management: boot image resolution, disk and shared-folder setup,
//! process launch, the management channel, the mount registry and the
//! supervisor that drives them.

pub mod access;
pub mod boot;
pub mod disk;
pub mod launcher;
pub mod lifecycle;
pub mod monitor;
pub mod mounts;
pub mod resume;
pub mod shared_folder;
pub mod supervisor;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use access::{AccessError, BookmarkToken, DirectPath, MountSource};
pub use boot::{BootImage, BootModeError, ResumeMode};
pub use lifecycle::VmPhase;
pub use monitor::{ChannelState, MonitorChannel, MonitorCommand, MonitorError};
pub use mounts::{MountRecord, MountRegistry};
pub use supervisor::{MountError, Supervisor};
