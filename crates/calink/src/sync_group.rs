//! Synchronous-group table entries.
//!
//! The context only maintains the identity table here; the blocking
//! group-completion API is an outer veneer built on top of it.

use std::time::Instant;

/// A sync-group table entry.
#[derive(Debug)]
pub(crate) struct SyncGroup {
    id: u32,
    created: Instant,
    /// Bumped on uninstall so that stale lookups can be rejected.
    seq: u32,
}

impl SyncGroup {
    pub fn new(id: u32, seq: u32) -> Self {
        Self {
            id,
            created: Instant::now(),
            seq,
        }
    }

    pub fn verify(&self, id: u32) -> bool {
        self.id == id
    }

    pub fn info(&self) -> SyncGroupInfo {
        SyncGroupInfo {
            id: self.id,
            age: self.created.elapsed(),
            seq: self.seq,
        }
    }
}

/// Snapshot of a sync-group entry returned by lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncGroupInfo {
    /// Group identifier.
    pub id: u32,
    /// Time since the group was installed.
    pub age: std::time::Duration,
    /// Install sequence number, distinguishing id reuse.
    pub seq: u32,
}
