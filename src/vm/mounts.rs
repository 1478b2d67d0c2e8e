//! Persistent mount registry.
//!
//! Mount records are appended per disk under `disk_mount_<n>` keys, `n`
//! counting up from zero. Listing scans slots in order and stops at the
//! first missing one, so a middle slot must never be removed: everything
//! after the hole would disappear with it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::metadata::{DiskProperties, MetadataStore};
use crate::vm::access::{BookmarkToken, HostHandle, MountSource};

const SLOT_PREFIX: &str = "disk_mount_";

/// One persisted host-folder grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    /// Base64 access token, re-hydratable in a later session.
    pub token: String,
    /// Backing transport the VM sees (the shared-folder export tag).
    pub transport_tag: String,
    /// Name the guest mounts.
    pub vm_tag: String,
}

pub fn slot_key(index: usize) -> String {
    format!("{SLOT_PREFIX}{index}")
}

/// Outcome of replaying a disk's records at boot.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub restored: Vec<(MountRecord, HostHandle)>,
    pub stale: Vec<MountRecord>,
}

#[derive(Debug, Clone, Copy)]
pub struct MountRegistry<'a> {
    store: &'a MetadataStore,
}

impl<'a> MountRegistry<'a> {
    pub fn new(store: &'a MetadataStore) -> Self {
        Self { store }
    }

    /// Append `record` to the next free slot; returns the slot index.
    ///
    /// Counting and writing happen under the store lock, so concurrent
    /// appends never claim the same slot.
    pub fn append(&self, disk: &str, record: &MountRecord) -> Result<usize> {
        let encoded = serde_json::to_string(record).context("serialise mount record")?;
        let index = self.store.update(disk, |props| {
            let index = contiguous_len(props);
            props.insert(slot_key(index), encoded);
            index
        })?;
        info!(disk = %disk, slot = index, tag = %record.vm_tag, "mount record appended");
        Ok(index)
    }

    /// Records in append order, up to the first absent slot.
    pub fn list(&self, disk: &str) -> Vec<MountRecord> {
        let props = self.store.properties(disk);
        let mut records = Vec::new();

        for index in 0.. {
            let Some(raw) = props.get(&slot_key(index)) else {
                break;
            };
            match serde_json::from_str::<MountRecord>(raw) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(disk = %disk, slot = index, error = %e, "unreadable mount record skipped");
                }
            }
        }
        records
    }

    /// Re-hydrate every record's token to restore its access grant for
    /// this session. Symlinks are not recreated here; stale grants are
    /// reported and left in place.
    pub fn replay_all(&self, disk: &str) -> ReplaySummary {
        let mut summary = ReplaySummary::default();

        for record in self.list(disk) {
            match BookmarkToken(record.token.clone()).resolve() {
                Ok(handle) => summary.restored.push((record, handle)),
                Err(e) => {
                    warn!(disk = %disk, tag = %record.vm_tag, error = %e, "stale mount grant");
                    summary.stale.push(record);
                }
            }
        }

        info!(
            disk = %disk,
            restored = summary.restored.len(),
            stale = summary.stale.len(),
            "mount registry replayed"
        );
        summary
    }
}

fn contiguous_len(props: &DiskProperties) -> usize {
    (0..).take_while(|i| props.contains_key(&slot_key(*i))).count()
}
