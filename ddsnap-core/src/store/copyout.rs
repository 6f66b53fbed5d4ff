//! Copy-on-write: preserving shared chunks before they are overwritten

use log::{trace, warn};

use crate::block_bitmap::Space;
use crate::btree::{Leaf, Target};
use crate::error::{Error, Result};
use crate::modules::snapshot::SnapshotError;
use crate::store::SnapStore;

/// Metadata chunks one exception insert may consume in the worst case
const MAX_NEW_METACHUNKS: u64 = 10;

/// Where the old contents of a chunk are read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CopySource {
    Origin,
    /// An exception shared with other snapshots
    Snapstore,
}

/// A pending copy of contiguous chunks into the snapshot store
#[derive(Debug)]
pub(crate) struct Copyout {
    source: CopySource,
    source_chunk: u64,
    dest: u64,
    count: u32,
    limit: u32,
    chunk_bits: u32,
    buffer: Vec<u8>,
}

impl Copyout {
    pub(crate) fn new(limit: u32, chunk_bits: u32) -> Self {
        Self {
            source: CopySource::Origin,
            source_chunk: 0,
            dest: 0,
            count: 0,
            limit: limit.max(1),
            chunk_bits,
            buffer: Vec::new(),
        }
    }

    /// Extend the pending run if `chunk -> dest` continues it
    fn extends(&self, source: CopySource, chunk: u64, dest: u64) -> bool {
        self.count > 0
            && self.source == source
            && self.source_chunk + self.count as u64 == chunk
            && self.dest + self.count as u64 == dest
            && self.count < self.limit
    }
}

impl SnapStore {
    /// Queue a copy of `chunk` to snapshot store chunk `dest`. Runs that are
    /// contiguous on both ends are gathered into one transfer.
    pub(crate) async fn copyout(&mut self, source: CopySource, chunk: u64, dest: u64) -> Result<()> {
        if self.copy.extends(source, chunk, dest) {
            self.copy.count += 1;
            return Ok(());
        }
        self.finish_copyout().await?;
        self.copy.source = source;
        self.copy.source_chunk = chunk;
        self.copy.dest = dest;
        self.copy.count = 1;
        Ok(())
    }

    /// Perform the pending copy, if any
    pub async fn finish_copyout(&mut self) -> Result<()> {
        if self.copy.count == 0 {
            return Ok(());
        }
        let bits = self.copy.chunk_bits;
        let size = (self.copy.count as usize) << bits;
        trace!(
            "COPYOUT: copy {} {:?} chunks from {:#x} to {:#x}",
            self.copy.count,
            self.copy.source,
            self.copy.source_chunk,
            self.copy.dest
        );
        self.copy.count = 0;
        self.copy.buffer.resize(size, 0);

        let from = match self.copy.source {
            CopySource::Origin => &self.devices.origin,
            CopySource::Snapstore => self.devices.snapdev(),
        };
        from.read_at(self.copy.source_chunk << bits, &mut self.copy.buffer)
            .await?;
        self.devices
            .snapdev()
            .write_at(self.copy.dest << bits, &self.copy.buffer)
            .await?;
        Ok(())
    }

    /// Give `target` its own copy of `chunk`.
    ///
    /// Returns the exception now holding the target's data, or `None` for an
    /// origin chunk no snapshot shares any more. Snapshots are released first
    /// if the store could run out of space during the insert; a snapshot
    /// target released that way fails with [`SnapshotError::Released`].
    pub async fn make_unique(&mut self, chunk: u64, target: Target) -> Result<Option<u64>> {
        trace!("COPYOUT: make chunk {:#x} unique for {:?}", chunk, target);
        if self.layout.combined {
            self.ensure_free_chunks(Space::Metadata, MAX_NEW_METACHUNKS + 1)
                .await?;
        } else {
            self.ensure_free_chunks(Space::Metadata, MAX_NEW_METACHUNKS)
                .await?;
            self.ensure_free_chunks(Space::Snapdata, 1).await?;
        }
        if let Target::Snapshot(bit) = target {
            if !self.snapmask.contains(bit) {
                warn!("COPYOUT: snapshot bit {} released while making room", bit);
                return Err(Error::Snapshot(SnapshotError::Released(bit)));
            }
        }

        let (path, leaf_sector) = self.probe(chunk).await?;
        let block = self.meta.read(leaf_sector).await?;
        let leaf = Leaf::new(&block[..]);
        let shared = match target {
            Target::Origin => {
                if leaf.origin_chunk_unique(chunk, self.snapmask) {
                    return Ok(None);
                }
                None
            }
            Target::Snapshot(bit) => match leaf.snapshot_exception(chunk, bit) {
                Some((exception, true)) => return Ok(Some(exception)),
                Some((exception, false)) => Some(exception),
                None => None,
            },
        };

        let Some(exception) = self.alloc_chunk(Space::Snapdata).await? else {
            warn!("COPYOUT: no snapshot store chunk left for {:#x}", chunk);
            return Err(Error::NoSpace);
        };
        if let Err(err) = self
            .add_exception_to_tree(leaf_sector, chunk, exception, target, &path)
            .await
        {
            warn!("COPYOUT: unable to add exception to tree: {}", err);
            self.free_exception(exception).await?;
            return Err(err);
        }

        match shared {
            Some(source) => self.copyout(CopySource::Snapstore, source, exception).await?,
            None => self.copyout(CopySource::Origin, chunk, exception).await?,
        }
        Ok(Some(exception))
    }

    /// Whether `chunk` is already unique for `target`, and the exception
    /// holding a snapshot's data if it has one
    pub async fn test_unique(&mut self, chunk: u64, target: Target) -> Result<(bool, Option<u64>)> {
        let (_, leaf_sector) = self.probe(chunk).await?;
        let block = self.meta.read(leaf_sector).await?;
        let leaf = Leaf::new(&block[..]);
        Ok(match target {
            Target::Origin => (leaf.origin_chunk_unique(chunk, self.snapmask), None),
            Target::Snapshot(bit) => match leaf.snapshot_exception(chunk, bit) {
                Some((exception, unique)) => (unique, Some(exception)),
                None => (false, None),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{test_store, test_store_with, EngineConfig};

    #[tokio::test]
    async fn test_origin_write_copies_old_data() {
        let mut store = test_store().await;
        store.devices.origin.write_at(100 << 12, &[0xab; 4096]).await.unwrap();
        store.create_snapshot(5).await.unwrap();

        let exception = store.make_unique(100, Target::Origin).await.unwrap().unwrap();
        store.finish_copyout().await.unwrap();
        assert_eq!(store.make_unique(100, Target::Origin).await.unwrap(), None);

        let mut copy = vec![0u8; 4096];
        store.devices.snapdev().read_at(exception << 12, &mut copy).await.unwrap();
        assert!(copy.iter().all(|&b| b == 0xab));
        assert_eq!(store.test_unique(100, Target::Snapshot(0)).await.unwrap(), (true, Some(exception)));
    }

    #[tokio::test]
    async fn test_origin_without_snapshots_is_unique() {
        let mut store = test_store().await;
        assert_eq!(store.make_unique(7, Target::Origin).await.unwrap(), None);
        assert_eq!(store.test_unique(7, Target::Origin).await.unwrap(), (true, None));
    }

    #[tokio::test]
    async fn test_snapshot_write_splits_shared_exception() {
        let mut store = test_store().await;
        let one = store.create_snapshot(1).await.unwrap();
        let two = store.create_snapshot(2).await.unwrap();

        let shared = store.make_unique(50, Target::Origin).await.unwrap().unwrap();
        let own = store.make_unique(50, Target::Snapshot(one)).await.unwrap().unwrap();
        assert_ne!(shared, own);
        assert_eq!(store.test_unique(50, Target::Snapshot(one)).await.unwrap(), (true, Some(own)));
        assert_eq!(store.test_unique(50, Target::Snapshot(two)).await.unwrap(), (true, Some(shared)));

        // already unique: no new allocation
        assert_eq!(store.make_unique(50, Target::Snapshot(one)).await.unwrap(), Some(own));
    }

    #[tokio::test]
    async fn test_contiguous_copies_are_batched() {
        let mut store = test_store().await;
        store.copyout(CopySource::Origin, 10, 500).await.unwrap();
        store.copyout(CopySource::Origin, 11, 501).await.unwrap();
        store.copyout(CopySource::Origin, 12, 502).await.unwrap();
        assert_eq!(store.copy.count, 3);
        store.copyout(CopySource::Snapstore, 13, 503).await.unwrap();
        assert_eq!(store.copy.count, 1);
        store.finish_copyout().await.unwrap();
        assert_eq!(store.copy.count, 0);
    }

    #[tokio::test]
    async fn test_target_released_while_making_room() {
        let mut store = test_store_with(EngineConfig::default(), 2 << 20).await;
        let bit = store.create_snapshot(1).await.unwrap();
        store.attach_snapshot(1).unwrap();

        let mut chunk = 0;
        let err = loop {
            assert!(chunk < 1000, "store never filled up");
            match store.make_unique(chunk, Target::Snapshot(bit)).await {
                Ok(exception) => assert!(exception.is_some()),
                Err(err) => break err,
            }
            store.finish_copyout().await.unwrap();
            store.commit_transaction(false).await.unwrap();
            chunk += 1;
        };
        assert!(matches!(err, Error::Snapshot(SnapshotError::Released(b)) if b == bit));
        assert!(store.snapshot(1).unwrap().is_squashed());
        assert_eq!(store.test_unique(chunk, Target::Snapshot(bit)).await.unwrap(), (false, None));
        assert_eq!(store.test_unique(0, Target::Snapshot(bit)).await.unwrap(), (false, None));
    }
}
