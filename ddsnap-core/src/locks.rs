//! Origin chunk read locks
//!
//! A snapshot client reading a chunk that still lives on the origin holds a
//! read lock on it until the read finishes. An origin write touching a locked
//! chunk must not be acknowledged before every such read is done, so its reply
//! is parked in a pending record counted against each lock it waits on.

use std::collections::HashMap;

use log::{debug, trace, warn};
use thiserror::Error;

/// Connection identifier assigned by the server
pub type ClientId = u64;

/// Handle of a parked reply
pub type PendingId = u64;

/// Error type for lock table operations
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LockError {
    #[error("chunk {0:#x} is not locked")]
    NotLocked(u64),
    #[error("chunk {chunk:#x} is not held by client {client}")]
    NotHeld { chunk: u64, client: ClientId },
}

#[derive(Debug)]
struct ChunkLock {
    chunk: u64,
    holders: Vec<ClientId>,
    waiters: Vec<PendingId>,
}

#[derive(Debug)]
struct Pending<R> {
    holdcount: u32,
    reply: R,
}

/// Hash table of chunk locks and the replies waiting on them
#[derive(Debug)]
pub struct LockTable<R> {
    bits: u32,
    buckets: Vec<Vec<ChunkLock>>,
    pending: HashMap<PendingId, Pending<R>>,
    next_pending: PendingId,
}

impl<R> LockTable<R> {
    pub fn new(bits: u32) -> Self {
        let bits = bits.clamp(1, 16);
        let mut buckets = Vec::with_capacity(1 << bits);
        buckets.resize_with(1 << bits, Vec::new);
        Self {
            bits,
            buckets,
            pending: HashMap::new(),
            next_pending: 0,
        }
    }

    fn bucket(&self, chunk: u64) -> usize {
        ((chunk.wrapping_mul(3_498_734_713) as u32) >> (32 - self.bits)) as usize
    }

    fn find(&self, chunk: u64) -> Option<&ChunkLock> {
        self.buckets[self.bucket(chunk)]
            .iter()
            .find(|lock| lock.chunk == chunk)
    }

    pub fn is_locked(&self, chunk: u64) -> bool {
        self.find(chunk).is_some()
    }

    /// Replies still waiting for locks to clear
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Take a read lock on `chunk` for `client`. A client may hold the same
    /// chunk more than once.
    pub fn readlock_chunk(&mut self, chunk: u64, client: ClientId) {
        trace!("LOCKS: client {} locks chunk {:#x}", client, chunk);
        let bucket = self.bucket(chunk);
        let locks = &mut self.buckets[bucket];
        match locks.iter_mut().find(|lock| lock.chunk == chunk) {
            Some(lock) => lock.holders.push(client),
            None => locks.push(ChunkLock {
                chunk,
                holders: vec![client],
                waiters: Vec::new(),
            }),
        }
    }

    /// Park `reply` until every lock it is made to wait on clears. The
    /// record starts with one extra hold that [`LockTable::finish_wait`] drops.
    pub fn begin_wait(&mut self, reply: R) -> PendingId {
        let id = self.next_pending;
        self.next_pending = self.next_pending.wrapping_add(1);
        self.pending.insert(id, Pending { holdcount: 1, reply });
        id
    }

    /// Make `pending` wait on `chunk` if anyone holds it. Returns whether it
    /// had to wait.
    pub fn waitfor_chunk(&mut self, chunk: u64, pending: PendingId) -> bool {
        let bucket = self.bucket(chunk);
        let Some(lock) = self.buckets[bucket].iter_mut().find(|lock| lock.chunk == chunk) else {
            return false;
        };
        let Some(record) = self.pending.get_mut(&pending) else {
            warn!("LOCKS: wait on chunk {:#x} for unknown pending {}", chunk, pending);
            return false;
        };
        debug!("LOCKS: pending {} waits for chunk {:#x}", pending, chunk);
        lock.waiters.push(pending);
        record.holdcount += 1;
        true
    }

    /// The parked reply, while it is still waiting
    pub fn reply_mut(&mut self, pending: PendingId) -> Option<&mut R> {
        self.pending.get_mut(&pending).map(|record| &mut record.reply)
    }

    /// Drop the initial hold of `pending`; returns the reply if nothing else
    /// holds it
    pub fn finish_wait(&mut self, pending: PendingId) -> Option<R> {
        self.drop_hold(pending)
    }

    fn drop_hold(&mut self, pending: PendingId) -> Option<R> {
        let record = self.pending.get_mut(&pending)?;
        record.holdcount = record.holdcount.saturating_sub(1);
        if record.holdcount == 0 {
            self.pending.remove(&pending).map(|record| record.reply)
        } else {
            None
        }
    }

    /// Release one hold of `client` on `chunk`, returning the replies that
    /// became ready, in the order their writes arrived
    pub fn release_chunk(&mut self, chunk: u64, client: ClientId) -> Result<Vec<R>, LockError> {
        trace!("LOCKS: client {} releases chunk {:#x}", client, chunk);
        let bucket = self.bucket(chunk);
        let locks = &mut self.buckets[bucket];
        let index = locks
            .iter()
            .position(|lock| lock.chunk == chunk)
            .ok_or(LockError::NotLocked(chunk))?;
        let lock = &mut locks[index];
        let hold = lock
            .holders
            .iter()
            .position(|&holder| holder == client)
            .ok_or(LockError::NotHeld { chunk, client })?;
        lock.holders.remove(hold);
        if !lock.holders.is_empty() {
            return Ok(Vec::new());
        }

        let lock = locks.swap_remove(index);
        Ok(lock
            .waiters
            .into_iter()
            .filter_map(|pending| self.drop_hold(pending))
            .collect())
    }

    /// Release everything a disconnected client held
    pub fn release_client(&mut self, client: ClientId) -> Vec<R> {
        let held: Vec<u64> = self
            .buckets
            .iter()
            .flatten()
            .flat_map(|lock| {
                lock.holders
                    .iter()
                    .filter(move |&&holder| holder == client)
                    .map(move |_| lock.chunk)
            })
            .collect();
        if !held.is_empty() {
            debug!("LOCKS: dropping {} holds of client {}", held.len(), client);
        }

        let mut ready = Vec::new();
        for chunk in held {
            if let Ok(replies) = self.release_chunk(chunk, client) {
                ready.extend(replies);
            }
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::thread_rng;

    #[test]
    fn test_write_waits_for_every_reader() {
        let mut locks = LockTable::new(8);
        locks.readlock_chunk(100, 1);
        locks.readlock_chunk(100, 2);
        locks.readlock_chunk(101, 2);

        let pending = locks.begin_wait("write");
        assert!(locks.waitfor_chunk(100, pending));
        assert!(locks.waitfor_chunk(101, pending));
        assert!(!locks.waitfor_chunk(102, pending));
        assert_eq!(locks.finish_wait(pending), None);

        assert!(locks.release_chunk(100, 1).unwrap().is_empty());
        assert!(locks.release_chunk(101, 2).unwrap().is_empty());
        assert_eq!(locks.release_chunk(100, 2).unwrap(), vec!["write"]);
        assert_eq!(locks.pending_count(), 0);
        assert!(!locks.is_locked(100));
    }

    #[test]
    fn test_unlocked_write_replies_at_once() {
        let mut locks: LockTable<u32> = LockTable::new(8);
        let pending = locks.begin_wait(7);
        assert!(!locks.waitfor_chunk(5, pending));
        assert_eq!(locks.finish_wait(pending), Some(7));
    }

    #[test]
    fn test_release_errors() {
        let mut locks: LockTable<()> = LockTable::new(4);
        assert_eq!(locks.release_chunk(9, 1), Err(LockError::NotLocked(9)));
        locks.readlock_chunk(9, 1);
        assert_eq!(
            locks.release_chunk(9, 2),
            Err(LockError::NotHeld { chunk: 9, client: 2 })
        );
    }

    #[test]
    fn test_disconnect_releases_all_holds() {
        let mut locks = LockTable::new(8);
        locks.readlock_chunk(3, 1);
        locks.readlock_chunk(3, 1);
        locks.readlock_chunk(4, 1);
        let pending = locks.begin_wait(42u32);
        locks.waitfor_chunk(3, pending);
        locks.waitfor_chunk(4, pending);
        assert_eq!(locks.finish_wait(pending), None);

        assert_eq!(locks.release_client(1), vec![42]);
        assert!(!locks.is_locked(3));
        assert!(!locks.is_locked(4));
    }

    #[test]
    fn test_any_release_order_replies_once() {
        let mut rng = thread_rng();
        for _ in 0..50 {
            let mut locks = LockTable::new(2);
            let mut holds = Vec::new();
            for client in 0..8u64 {
                for chunk in 0..4u64 {
                    locks.readlock_chunk(chunk, client);
                    holds.push((chunk, client));
                }
            }
            let pending = locks.begin_wait(());
            for chunk in 0..4 {
                assert!(locks.waitfor_chunk(chunk, pending));
            }
            assert!(locks.finish_wait(pending).is_none());

            holds.shuffle(&mut rng);
            let last = holds.len() - 1;
            for (i, (chunk, client)) in holds.into_iter().enumerate() {
                let ready = locks.release_chunk(chunk, client).unwrap();
                assert_eq!(ready.len(), usize::from(i == last));
            }
            assert_eq!(locks.pending_count(), 0);
        }
    }
}
