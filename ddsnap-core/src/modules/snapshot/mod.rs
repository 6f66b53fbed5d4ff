//! Snapshot registry
//!
//! Snapshots are named by client-visible tags and own one bit of the sharing
//! mask while live. A snapshot whose exceptions were released while clients
//! still used it is "squashed": its entry stays in the list so clients get a
//! definite error, but its bit is free again.

use log::{debug, info, warn};
use thiserror::Error;

use crate::block_bitmap::Space;
use crate::error::{Error, Result};
use crate::layout::{SnapshotEntry, MAX_SNAPSHOTS, SNAPSHOT_SQUASHED};
use crate::snapmask::SnapshotMask;
use crate::store::SnapStore;

/// Tag clients use to address the origin
pub const ORIGIN_TAG: u32 = u32::MAX;

/// Priority that exempts a snapshot from automatic release
pub const MAX_PRIORITY: i8 = i8::MAX;

/// Snapshot error types
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Snapshot {0} does not exist")]
    NotFound(u32),
    #[error("Snapshot {0} already exists")]
    Exists(u32),
    #[error("The number of snapshots is beyond the {MAX_SNAPSHOTS} limit")]
    TooManySnapshots,
    #[error("Snapshot {0} is in use")]
    InUse(u32),
    #[error("Snapshot {0} has been squashed")]
    Squashed(u32),
    #[error("Usecount of snapshot {0} would overflow")]
    UsecountOverflow(u32),
    #[error("Usecount of snapshot {0} would underflow")]
    UsecountUnderflow(u32),
    #[error("No snapshot can be released")]
    NoVictim,
    #[error("Snapshot bit {0} was released to make room")]
    Released(u8),
}

/// What a tag currently names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SnapshotState {
    Live = 0,
    Missing = 1,
    Squashed = 2,
}

impl SnapStore {
    /// Index of the snapshot with `tag` in the superblock list
    pub fn find_snap(&self, tag: u32) -> Option<usize> {
        self.image.snapshots.iter().position(|snap| snap.tag == tag)
    }

    pub fn snapshot(&self, tag: u32) -> Option<&SnapshotEntry> {
        self.image.snapshots.iter().find(|snap| snap.tag == tag)
    }

    pub fn snapshots(&self) -> &[SnapshotEntry] {
        &self.image.snapshots
    }

    /// Persistent use count plus the clients currently attached
    pub fn usecount(&self, snap: &SnapshotEntry) -> u16 {
        let transient = if snap.is_squashed() {
            0
        } else {
            self.usecounts[snap.bit as usize]
        };
        transient.wrapping_add(snap.usecount)
    }

    pub fn snapshot_state(&self, tag: u32) -> SnapshotState {
        match self.snapshot(tag) {
            None => SnapshotState::Missing,
            Some(snap) if snap.is_squashed() => SnapshotState::Squashed,
            Some(_) => SnapshotState::Live,
        }
    }

    /// Mask of every snapshot bit still in use
    pub(crate) fn calc_snapmask(&self) -> SnapshotMask {
        self.image
            .snapshots
            .iter()
            .filter(|snap| !snap.is_squashed())
            .fold(SnapshotMask::EMPTY, |mask, snap| mask | SnapshotMask::bit(snap.bit))
    }

    /// Pick the snapshot to release when space or snapshot slots run out.
    ///
    /// Unused snapshots go before used ones, then lower priority first, then
    /// older first. Squashed entries are only considered when freeing a slot
    /// in the list, and then they go first.
    pub(crate) fn find_victim(&self, include_squashed: bool) -> Option<usize> {
        self.image
            .snapshots
            .iter()
            .enumerate()
            .filter(|(_, snap)| include_squashed || !snap.is_squashed())
            .min_by_key(|(_, snap)| (self.usecount(snap) != 0, !snap.is_squashed(), snap.prio))
            .map(|(index, _)| index)
    }

    /// Remove the snapshot at `index` from the list and release its exceptions
    pub(crate) async fn delete_snap(&mut self, index: usize) -> Result<()> {
        let snap = self.image.snapshots.remove(index);
        warn!("SNAPSHOT: delete snapshot {} (bit {})", snap.tag, snap.bit);
        self.sb_dirty = true;
        if snap.is_squashed() {
            debug!("SNAPSHOT: snapshot {} squashed, skipping tree delete", snap.tag);
            return Ok(());
        }
        self.usecounts[snap.bit as usize] = 0;
        self.commit_deferred_allocs().await?;
        self.delete_tree_range(SnapshotMask::bit(snap.bit), 0).await
    }

    /// Release one snapshot to make room. A snapshot that is still in use
    /// keeps its list entry but loses its exceptions and its bit.
    pub(crate) async fn auto_delete_snapshot(&mut self) -> Result<()> {
        let victim = match self.find_victim(false) {
            Some(index) if self.image.snapshots[index].prio != MAX_PRIORITY => index,
            _ => {
                self.check_freespace().await?;
                return Err(SnapshotError::NoVictim.into());
            }
        };

        let snap = self.image.snapshots[victim];
        warn!("SNAPSHOT: releasing snapshot {}", snap.tag);
        if self.usecount(&snap) != 0 {
            self.commit_deferred_allocs().await?;
            self.delete_tree_range(SnapshotMask::bit(snap.bit), 0).await?;
            self.usecounts[snap.bit as usize] = 0;
            self.image.snapshots[victim].bit = SNAPSHOT_SQUASHED;
            self.sb_dirty = true;
            Ok(())
        } else {
            self.delete_snap(victim).await
        }
    }

    /// Release snapshots until `space` has at least `chunks` free chunks
    pub(crate) async fn ensure_free_chunks(&mut self, space: Space, chunks: u64) -> Result<()> {
        loop {
            if self.space(space).freechunks >= chunks {
                return Ok(());
            }
            if self.image.snapshots.is_empty() {
                break;
            }
            match self.auto_delete_snapshot().await {
                Ok(()) => {}
                Err(Error::Snapshot(SnapshotError::NoVictim)) => break,
                Err(err) => return Err(err),
            }
        }
        warn!("SNAPSHOT: unable to free {} {:?} chunks", chunks, space);
        Err(Error::NoSpace)
    }

    /// Register a new snapshot of the origin and return its bit
    pub async fn create_snapshot(&mut self, tag: u32) -> Result<u8> {
        if tag == ORIGIN_TAG {
            return Err(Error::InvalidArgument(format!("tag {:#x} is reserved", tag)));
        }
        if self.image.snapshots.len() >= MAX_SNAPSHOTS {
            if let Some(victim) = self.find_victim(true) {
                if self.usecount(&self.image.snapshots[victim]) == 0 {
                    self.delete_snap(victim).await?;
                }
            }
            if self.image.snapshots.len() >= MAX_SNAPSHOTS {
                warn!("SNAPSHOT: the number of snapshots is beyond the {} limit", MAX_SNAPSHOTS);
                return Err(SnapshotError::TooManySnapshots.into());
            }
        }

        if self.find_snap(tag).is_some() {
            return Err(SnapshotError::Exists(tag).into());
        }
        let bit = self
            .snapmask
            .first_free()
            .ok_or(SnapshotError::TooManySnapshots)?;

        info!("SNAPSHOT: create snapshot {} with bit {}", tag, bit);
        self.image.snapshots.push(SnapshotEntry {
            ctime: chrono::Utc::now().timestamp() as u32,
            tag,
            usecount: 0,
            bit,
            prio: 0,
            sectors: self.image.orgsectors,
        });
        self.snapmask.insert(bit);
        self.sb_dirty = true;
        Ok(bit)
    }

    /// Delete a snapshot nobody uses
    pub async fn delete_snapshot(&mut self, tag: u32) -> Result<()> {
        let index = self.find_snap(tag).ok_or(SnapshotError::NotFound(tag))?;
        if self.usecount(&self.image.snapshots[index]) != 0 {
            return Err(SnapshotError::InUse(tag).into());
        }
        self.delete_snap(index).await
    }

    /// Set the eviction priority of a snapshot; higher survives longer
    pub fn set_priority(&mut self, tag: u32, prio: i8) -> Result<i8> {
        let index = self.find_snap(tag).ok_or(SnapshotError::NotFound(tag))?;
        self.image.snapshots[index].prio = prio;
        self.sb_dirty = true;
        Ok(prio)
    }

    /// Adjust the persistent use count and return the combined count
    pub fn adjust_usecount(&mut self, tag: u32, delta: i32) -> Result<u16> {
        let index = self.find_snap(tag).ok_or(SnapshotError::NotFound(tag))?;
        let snap = self.image.snapshots[index];
        let total = self.usecount(&snap) as i64 + delta as i64;
        if total > u16::MAX as i64 {
            return Err(SnapshotError::UsecountOverflow(tag).into());
        }
        let persistent = snap.usecount as i64 + delta as i64;
        if persistent < 0 {
            return Err(SnapshotError::UsecountUnderflow(tag).into());
        }
        self.image.snapshots[index].usecount = persistent as u16;
        self.sb_dirty = true;
        Ok(self.usecount(&self.image.snapshots[index]))
    }

    /// Count one more attached client of a live snapshot
    pub(crate) fn attach_snapshot(&mut self, tag: u32) -> Result<u8> {
        let snap = *self.snapshot(tag).ok_or(SnapshotError::NotFound(tag))?;
        if snap.is_squashed() {
            return Err(SnapshotError::Squashed(tag).into());
        }
        if self.usecount(&snap) == u16::MAX {
            return Err(SnapshotError::UsecountOverflow(tag).into());
        }
        self.usecounts[snap.bit as usize] += 1;
        Ok(snap.bit)
    }

    pub(crate) fn detach_snapshot(&mut self, tag: u32) {
        if let Some(snap) = self.snapshot(tag).copied() {
            if !snap.is_squashed() {
                let count = &mut self.usecounts[snap.bit as usize];
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Per-bit histogram of exception sharing: `table[bit][k]` counts the
    /// exceptions owned by `bit` that exactly `k` other snapshots share
    pub async fn sharing_table(&mut self) -> Result<Vec<[u64; MAX_SNAPSHOTS]>> {
        let mut table = vec![[0u64; MAX_SNAPSHOTS]; MAX_SNAPSHOTS];
        self.traverse_tree_range(0, u64::MAX, |leaf| {
            for (_, exception) in leaf.entries() {
                let others = exception.share.count().saturating_sub(1) as usize;
                for bit in exception.share.iter() {
                    table[bit as usize][others] += 1;
                }
            }
        })
        .await?;
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    #[tokio::test]
    async fn test_create_assigns_lowest_free_bit() {
        let mut store = test_store().await;
        assert_eq!(store.create_snapshot(10).await.unwrap(), 0);
        assert_eq!(store.create_snapshot(11).await.unwrap(), 1);
        store.delete_snapshot(10).await.unwrap();
        assert_eq!(store.create_snapshot(12).await.unwrap(), 0);
        assert!(matches!(
            store.create_snapshot(11).await,
            Err(Error::Snapshot(SnapshotError::Exists(11)))
        ));
        assert_eq!(store.snapshot_state(10), SnapshotState::Missing);
        assert_eq!(store.snapshot_state(12), SnapshotState::Live);
    }

    #[tokio::test]
    async fn test_full_list_evicts_unused_snapshot() {
        let mut store = test_store().await;
        for tag in 0..MAX_SNAPSHOTS as u32 {
            store.create_snapshot(tag).await.unwrap();
        }
        store.set_priority(0, 5).unwrap();
        store.adjust_usecount(1, 1).unwrap();

        // tag 2 is the oldest unused snapshot at the lowest priority
        store.create_snapshot(100).await.unwrap();
        assert!(store.find_snap(2).is_none());
        assert!(store.find_snap(0).is_some());
        assert!(store.find_snap(1).is_some());
        assert_eq!(store.snapshots().len(), MAX_SNAPSHOTS);
    }

    #[tokio::test]
    async fn test_full_list_of_used_snapshots_refuses() {
        let mut store = test_store().await;
        for tag in 0..MAX_SNAPSHOTS as u32 {
            store.create_snapshot(tag).await.unwrap();
            store.adjust_usecount(tag, 1).unwrap();
        }
        assert!(matches!(
            store.create_snapshot(100).await,
            Err(Error::Snapshot(SnapshotError::TooManySnapshots))
        ));
    }

    #[tokio::test]
    async fn test_victim_order() {
        let mut store = test_store().await;
        for tag in 1..=3 {
            store.create_snapshot(tag).await.unwrap();
        }
        store.set_priority(1, 3).unwrap();
        store.set_priority(2, -1).unwrap();
        store.set_priority(3, -1).unwrap();
        assert_eq!(store.find_victim(false), Some(1));

        store.attach_snapshot(2).unwrap();
        assert_eq!(store.find_victim(false), Some(2));
        store.detach_snapshot(2);
        assert_eq!(store.usecount(store.snapshot(2).unwrap()), 0);
    }

    #[tokio::test]
    async fn test_usecount_bounds() {
        let mut store = test_store().await;
        store.create_snapshot(7).await.unwrap();
        assert_eq!(store.adjust_usecount(7, 2).unwrap(), 2);
        store.attach_snapshot(7).unwrap();
        assert_eq!(store.adjust_usecount(7, -2).unwrap(), 1);
        assert!(matches!(
            store.adjust_usecount(7, -1),
            Err(Error::Snapshot(SnapshotError::UsecountUnderflow(7)))
        ));
        assert!(matches!(
            store.adjust_usecount(7, u16::MAX as i32),
            Err(Error::Snapshot(SnapshotError::UsecountOverflow(7)))
        ));
        assert!(matches!(
            store.delete_snapshot(7).await,
            Err(Error::Snapshot(SnapshotError::InUse(7)))
        ));
    }

    #[tokio::test]
    async fn test_release_in_use_snapshot_squashes() {
        let mut store = test_store().await;
        store.create_snapshot(1).await.unwrap();
        store.attach_snapshot(1).unwrap();
        store.auto_delete_snapshot().await.unwrap();

        assert_eq!(store.snapshot_state(1), SnapshotState::Squashed);
        assert!(store.snapmask.is_empty());
        assert_eq!(store.calc_snapmask(), SnapshotMask::EMPTY);
        assert!(matches!(
            store.auto_delete_snapshot().await,
            Err(Error::Snapshot(SnapshotError::NoVictim))
        ));
    }
}
