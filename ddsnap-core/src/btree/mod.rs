//! Exception B-tree
//!
//! Index nodes map logical chunk boundaries to child sectors; leaves record,
//! per logical chunk, the snapshot-store copies and which snapshots share
//! each copy. All blocks live on the metadata device and go through the
//! buffer cache, so every edit here becomes part of the next journal commit.

pub mod leaf;
pub mod node;

use log::{debug, info, trace, warn};
use thiserror::Error;

pub use leaf::{Exception, Leaf, LEAF_MAGIC};
pub use node::Node;

use crate::block_bitmap::Space;
use crate::error::{Error, Result};
use crate::snapmask::SnapshotMask;
use crate::store::SnapStore;

/// Who an exception is being created for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// A write to the origin: the old data is preserved for every snapshot
    /// still sharing it
    Origin,
    /// A write to the snapshot with this bit
    Snapshot(u8),
}

/// Error type for B-tree operations
#[derive(Error, Debug)]
pub enum TreeError {
    #[error("leaf is full")]
    LeafFull,
    #[error("chunk {chunk} lies below leaf base {base}")]
    OutOfLeafRange { chunk: u64, base: u64 },
    #[error("block at sector {0:#x} is not a leaf")]
    BadLeaf(u64),
    #[error("freshly split leaf has no space")]
    NewLeafFull,
}

/// One index node on the way from the root to a leaf. `next` is the entry
/// just after the child that was followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PathEntry {
    pub sector: u64,
    pub next: usize,
}

impl SnapStore {
    /// Find the leaf covering `chunk`, recording the index path to it
    pub(crate) async fn probe(&mut self, chunk: u64) -> Result<(Vec<PathEntry>, u64)> {
        let levels = self.image.etree_levels as usize;
        let mut path = Vec::with_capacity(levels);
        let mut sector = self.image.etree_root;

        for _ in 0..levels {
            let block = self.meta.read(sector).await?;
            let node = Node::new(&block[..]);
            let next = node.probe_next(chunk);
            path.push(PathEntry { sector, next });
            sector = node.sector(next - 1);
        }

        let block = self.meta.read(sector).await?;
        if !Leaf::new(&block[..]).is_valid() {
            return Err(TreeError::BadLeaf(sector).into());
        }
        Ok((path, sector))
    }

    /// Allocate a metadata chunk and return its sector
    async fn new_block(&mut self) -> Result<u64> {
        match self.alloc_chunk(Space::Metadata).await? {
            Some(chunk) => Ok(self.layout.meta_sector(chunk)),
            None => Err(Error::NoSpace),
        }
    }

    pub(crate) async fn new_leaf(&mut self) -> Result<u64> {
        trace!("BTREE: new leaf");
        let sector = self.new_block().await?;
        let mut block = self.meta.zeroed();
        Leaf::new(&mut block[..]).init(0);
        self.meta.mark_dirty(sector, block);
        Ok(sector)
    }

    pub(crate) async fn new_node(&mut self) -> Result<u64> {
        trace!("BTREE: new node");
        let sector = self.new_block().await?;
        let block = self.meta.zeroed();
        self.meta.mark_dirty(sector, block);
        Ok(sector)
    }

    /// Drop a metadata block from the cache and return its chunk
    pub(crate) async fn free_block(&mut self, sector: u64) -> Result<()> {
        self.meta.forget(sector);
        let chunk = self.layout.meta_chunk(sector);
        self.free_chunk(Space::Metadata, chunk).await?;
        Ok(())
    }

    pub(crate) async fn free_exception(&mut self, chunk: u64) -> Result<()> {
        self.free_chunk(Space::Snapdata, chunk).await?;
        Ok(())
    }

    /// Record `exception` as a copy of `chunk` in the leaf at `leaf_sector`,
    /// splitting the leaf and as many ancestors along `path` as needed
    pub(crate) async fn add_exception_to_tree(
        &mut self,
        leaf_sector: u64,
        chunk: u64,
        exception: u64,
        target: Target,
        path: &[PathEntry],
    ) -> Result<()> {
        let active = self.snapmask;
        let mut leaf = self.meta.read(leaf_sector).await?;
        match Leaf::new(&mut leaf[..]).add_exception(chunk, exception, target, active) {
            Ok(()) => {
                self.meta.mark_dirty(leaf_sector, leaf);
                return Ok(());
            }
            Err(TreeError::LeafFull) => {}
            Err(err) => return Err(err.into()),
        }

        debug!("BTREE: splitting leaf {:#x}", leaf_sector);
        let mut child_sector = self.new_block().await?;
        let mut child = self.meta.zeroed();
        let mut childkey = Leaf::new(&mut leaf[..]).split(&mut child);
        let half = if chunk < childkey { &mut leaf } else { &mut child };
        Leaf::new(&mut half[..])
            .add_exception(chunk, exception, target, active)
            .map_err(|_| TreeError::NewLeafFull)?;
        self.meta.mark_dirty(leaf_sector, leaf);
        self.meta.mark_dirty(child_sector, child);

        let per_node = self.layout.alloc_per_node;
        for entry in path.iter().rev() {
            let mut parent = self.meta.read(entry.sector).await?;
            let count = Node::new(&parent[..]).count();
            if count < per_node {
                Node::new(&mut parent[..]).insert_child(entry.next, child_sector, childkey);
                self.meta.mark_dirty(entry.sector, parent);
                return Ok(());
            }

            let half = count / 2;
            let newkey = Node::new(&parent[..]).key(half);
            let new_sector = self.new_block().await?;
            let mut sibling = self.meta.zeroed();
            Node::new(&mut parent[..]).split_into(&mut sibling, half);
            if entry.next > half {
                Node::new(&mut sibling[..]).insert_child(entry.next - half, child_sector, childkey);
            } else {
                Node::new(&mut parent[..]).insert_child(entry.next, child_sector, childkey);
            }
            self.meta.mark_dirty(entry.sector, parent);
            self.meta.mark_dirty(new_sector, sibling);
            childkey = newkey;
            child_sector = new_sector;
        }

        let root_sector = self.new_block().await?;
        let mut root = self.meta.zeroed();
        {
            let mut node = Node::new(&mut root[..]);
            node.set_entry(0, 0, self.image.etree_root);
            node.set_entry(1, childkey, child_sector);
            node.set_count(2);
        }
        self.meta.mark_dirty(root_sector, root);
        self.image.etree_root = root_sector;
        self.image.etree_levels += 1;
        self.sb_dirty = true;
        info!("BTREE: tree grows to {} levels", self.image.etree_levels);
        Ok(())
    }

    async fn finished_level(&mut self, path: &[PathEntry], level: usize) -> Result<bool> {
        let block = self.meta.read(path[level].sector).await?;
        Ok(path[level].next == Node::new(&block[..]).count())
    }

    /// Remove the index entry just before `path[level].next`. When the
    /// removed entry was the first of its node, its key becomes the pivot
    /// in the nearest ancestor that separates this node from its left sibling.
    async fn remove_index(&mut self, path: &mut [PathEntry], level: usize) -> Result<()> {
        let sector = path[level].sector;
        let mut block = self.meta.read(sector).await?;
        let mut node = Node::new(&mut block[..]);
        let next = path[level].next;
        let pivot = if next < node.count() { node.key(next) } else { 0 };
        node.remove(next - 1);
        let count = node.count();
        self.meta.mark_dirty(sector, block);
        path[level].next -= 1;

        if path[level].next == count {
            return Ok(());
        }
        if path[level].next == 0 && level > 0 {
            let mut i = level - 1;
            while path[i].next == 1 {
                if i == 0 {
                    return Ok(());
                }
                i -= 1;
            }
            let mut parent = self.meta.read(path[i].sector).await?;
            Node::new(&mut parent[..]).set_key(path[i].next - 1, pivot);
            self.meta.mark_dirty(path[i].sector, parent);
        }
        Ok(())
    }

    /// Strip `mask` from every exception from `resume` onward, freeing the
    /// copies nobody shares any more and merging leaves and nodes that fit
    /// into their left neighbour. Finally drops root levels with one child
    /// and removes `mask` from the live snapshot mask.
    pub(crate) async fn delete_tree_range(&mut self, mask: SnapshotMask, resume: u64) -> Result<()> {
        let mut levels = self.image.etree_levels as usize;
        let mut level = levels - 1;
        let mut hold: Vec<Option<u64>> = vec![None; levels];
        let mut prev_leaf: Option<u64> = None;
        let per_node = self.layout.alloc_per_node;

        let (mut path, mut leaf_sector) = self.probe(resume).await?;
        self.commit_transaction(false).await?;

        loop {
            let mut leaf = self.meta.read(leaf_sector).await?;
            let (any, freed) = Leaf::new(&mut leaf[..]).delete_snapshots(mask);
            if any {
                self.meta.mark_dirty(leaf_sector, leaf);
            }
            for chunk in freed {
                self.free_exception(chunk).await?;
                self.dirty_buffer_count_check().await?;
            }

            let mut merged = false;
            if let Some(prev) = prev_leaf {
                let this = self.meta.read(leaf_sector).await?;
                let mut prev_block = self.meta.read(prev).await?;
                if Leaf::new(&this[..]).payload() <= Leaf::new(&prev_block[..]).freespace() {
                    trace!("BTREE: merge leaf {:#x} into {:#x}", leaf_sector, prev);
                    Leaf::new(&mut prev_block[..]).merge(&this);
                    self.remove_index(&mut path, level).await?;
                    self.meta.mark_dirty(prev, prev_block);
                    self.free_block(leaf_sector).await?;
                    self.dirty_buffer_count_check().await?;
                    merged = true;
                }
            }
            if !merged {
                prev_leaf = Some(leaf_sector);
            }

            if self.finished_level(&path, level).await? {
                loop {
                    let mut keep_prev = false;
                    if let Some(held) = hold[level] {
                        let this = self.meta.read(path[level].sector).await?;
                        let mut prev = self.meta.read(held).await?;
                        let this_count = Node::new(&this[..]).count();
                        let prev_count = Node::new(&prev[..]).count();
                        if level > 0 && this_count <= per_node - prev_count {
                            trace!("BTREE: merge node {:#x} into {:#x}", path[level].sector, held);
                            Node::new(&mut prev[..]).merge(&this);
                            self.remove_index(&mut path, level - 1).await?;
                            self.meta.mark_dirty(held, prev);
                            self.free_block(path[level].sector).await?;
                            self.dirty_buffer_count_check().await?;
                            keep_prev = true;
                        }
                    }
                    if !keep_prev {
                        hold[level] = Some(path[level].sector);
                    }

                    if level == 0 {
                        while levels > 1 {
                            let (Some(root), Some(child)) = (hold[0], hold[1]) else {
                                break;
                            };
                            let block = self.meta.read(root).await?;
                            if Node::new(&block[..]).count() != 1 {
                                break;
                            }
                            debug!("BTREE: drop tree level");
                            self.image.etree_root = child;
                            self.free_block(root).await?;
                            self.dirty_buffer_count_check().await?;
                            levels -= 1;
                            self.image.etree_levels = levels as u32;
                            hold.remove(0);
                            self.sb_dirty = true;
                        }
                        if self.meta.dirty_count() > 0 {
                            self.commit_transaction(false).await?;
                        }
                        self.snapmask &= !mask;
                        self.sb_dirty = true;
                        self.save_sb().await;
                        return Ok(());
                    }

                    level -= 1;
                    if !self.finished_level(&path, level).await? {
                        break;
                    }
                }

                while level < levels - 1 {
                    let block = self.meta.read(path[level].sector).await?;
                    let child = Node::new(&block[..]).sector(path[level].next);
                    path[level].next += 1;
                    level += 1;
                    path[level] = PathEntry {
                        sector: child,
                        next: 0,
                    };
                }
            }

            self.dirty_buffer_count_check().await?;
            let block = self.meta.read(path[level].sector).await?;
            leaf_sector = Node::new(&block[..]).sector(path[level].next);
            path[level].next += 1;
        }
    }

    /// Visit, in chunk order, every leaf whose range may hold chunks in
    /// `start..=finish`
    pub(crate) async fn traverse_tree_range<F>(&mut self, start: u64, finish: u64, mut visit: F) -> Result<()>
    where
        F: FnMut(&Leaf<&[u8]>) + Send,
    {
        let levels = self.image.etree_levels as usize;
        let root = self.image.etree_root;
        let mut seeking = start > 0;

        let first = if seeking {
            let block = self.meta.read(root).await?;
            Node::new(&block[..]).probe_next(start) - 1
        } else {
            0
        };
        let mut stack: Vec<(u64, usize)> = vec![(root, first)];

        while let Some(&(sector, index)) = stack.last() {
            let block = self.meta.read(sector).await?;
            let node = Node::new(&block[..]);
            if index >= node.count() || (index > 0 && node.key(index) > finish) {
                stack.pop();
                continue;
            }
            let child = node.sector(index);
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }

            if stack.len() == levels {
                let leaf = self.meta.read(child).await?;
                let view = Leaf::new(&leaf[..]);
                if !view.is_valid() {
                    warn!("BTREE: unable to read leaf at sector {:#x} during traversal", child);
                    return Err(TreeError::BadLeaf(child).into());
                }
                visit(&view);
                seeking = false;
            } else {
                let first = if seeking {
                    let block = self.meta.read(child).await?;
                    Node::new(&block[..]).probe_next(start) - 1
                } else {
                    0
                };
                stack.push((child, first));
            }
        }
        Ok(())
    }

    /// Log the exceptions recorded for chunks in `start..=finish`
    pub async fn dump_tree_range(&mut self, start: u64, finish: u64) -> Result<()> {
        info!(
            "BTREE: {} levels, root at sector {:#x}",
            self.image.etree_levels, self.image.etree_root
        );
        let mut lines = Vec::new();
        self.traverse_tree_range(start, finish, |leaf| {
            for i in 0..leaf.count() {
                let chunk = leaf.chunk(i);
                if chunk < start || chunk > finish {
                    continue;
                }
                let exceptions: Vec<String> = leaf
                    .exceptions(i)
                    .map(|e| format!("{:x}/{:016x}", e.chunk, e.share.bits()))
                    .collect();
                lines.push(format!("chunk {}: {}", chunk, exceptions.join(", ")));
            }
        })
        .await?;
        for line in lines {
            info!("BTREE: {}", line);
        }
        Ok(())
    }
}
