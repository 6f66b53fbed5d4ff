//! ddsnap core: a copy-on-write snapshot store for block devices
//!
//! The store keeps, for every chunk of an origin volume that changed since a
//! snapshot was taken, an exception: a copy of the old data on the snapshot
//! store device together with the mask of snapshots sharing that copy.
//! Exceptions live in a B-tree on the metadata device; metadata updates go
//! through a journal so a crashed server can be restarted with the tree
//! intact.
//!
//! Device-mapper style clients talk to the server over a Unix socket with
//! the message protocol in [`protocol`]. The [`engine`] answers those
//! messages, [`server`] carries them, and [`client`] is the control side
//! used by the command line tools.

#![warn(rust_2018_idioms)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod block_bitmap;
pub mod blockdev;
pub mod btree;
pub mod cache;
pub mod changelist;
#[cfg(unix)]
pub mod client;
pub mod engine;
pub mod error;
pub mod format;
pub mod layout;
pub mod locks;
pub mod modules;
pub mod protocol;
#[cfg(unix)]
pub mod server;
pub mod snapmask;
pub mod store;

pub use changelist::ChangeList;
pub use engine::{Engine, Outcome, Session};
pub use error::{Error, Result};
pub use format::{initialize, FormatOptions};
pub use modules::snapshot::{SnapshotState, ORIGIN_TAG};
pub use snapmask::SnapshotMask;
pub use store::{Devices, EngineConfig, SnapStore, SpaceUsage};

/// Re-export common types and traits
pub mod prelude {
    pub use crate::blockdev::{BlockDevice, FileBackedBlockDevice, MemoryBlockDevice};
    pub use crate::error::{Error, Result};
    pub use crate::store::{Devices, EngineConfig, SnapStore};
}
