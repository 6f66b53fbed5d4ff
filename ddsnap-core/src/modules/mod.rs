//! Store subsystems built on the block layer
//!
//! `journaling` makes metadata updates crash safe, `snapshot` keeps the
//! snapshot list and decides which snapshot to give up when space runs out.

pub mod journaling;
pub mod snapshot;

pub use journaling::{CommitBlock, JournalError};
pub use snapshot::{SnapshotError, SnapshotState, MAX_PRIORITY, ORIGIN_TAG};
