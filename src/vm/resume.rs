//! A/B instant-resume slot rotation.
//!
//! Each disk records, under `resume_image`, the tag of the newest snapshot
//! known to be complete. Saves always target the other slot, so an
//! interrupted save can only damage a slot that is not the current one.

use anyhow::Result;

use crate::metadata::MetadataStore;

/// Metadata key holding the current resume tag. Empty: no completed save.
pub const RESUME_IMAGE_KEY: &str = "resume_image";

const TAG_PREFIX: &str = "instantboot";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn tag(self) -> String {
        match self {
            Slot::A => format!("{TAG_PREFIX}a"),
            Slot::B => format!("{TAG_PREFIX}b"),
        }
    }

    pub fn from_tag(tag: &str) -> Option<Slot> {
        match tag.strip_prefix(TAG_PREFIX)? {
            "a" => Some(Slot::A),
            "b" => Some(Slot::B),
            _ => None,
        }
    }

    pub fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }
}

/// Slot the next save must write: never the one most recently completed.
pub fn next_slot(current_tag: &str) -> Slot {
    Slot::from_tag(current_tag).map(Slot::other).unwrap_or(Slot::A)
}

/// Per-disk view of the rotation over the metadata store.
#[derive(Debug, Clone, Copy)]
pub struct ResumeState<'a> {
    store: &'a MetadataStore,
    disk: &'a str,
}

impl<'a> ResumeState<'a> {
    pub fn new(store: &'a MetadataStore, disk: &'a str) -> Self {
        Self { store, disk }
    }

    /// Current resume tag, empty before the first completed save.
    pub fn current_tag(&self) -> String {
        self.store
            .get(self.disk, RESUME_IMAGE_KEY)
            .unwrap_or_default()
    }

    pub fn has_completed_save(&self) -> bool {
        !self.current_tag().is_empty()
    }

    pub fn next_slot(&self) -> Slot {
        next_slot(&self.current_tag())
    }

    /// Mark `slot` as the newest complete snapshot. Only call once the save
    /// has settled on disk.
    pub fn record_completed(&self, slot: Slot) -> Result<()> {
        self.store.set(self.disk, RESUME_IMAGE_KEY, &slot.tag())
    }

    /// Forget any saved state (fresh disk).
    pub fn reset(&self) -> Result<()> {
        self.store.set(self.disk, RESUME_IMAGE_KEY, "")
    }
}
