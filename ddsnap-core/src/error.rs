use std::fmt;
use std::io;

use crate::block_bitmap::BlockBitmapError;
use crate::blockdev::BlockDeviceError;
use crate::btree::TreeError;
use crate::cache::CacheError;
use crate::changelist::ChangelistError;
use crate::locks::LockError;
use crate::modules::journaling::JournalError;
use crate::modules::snapshot::SnapshotError;
use crate::protocol::ProtocolError;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    BlockDevice(BlockDeviceError),
    Cache(CacheError),
    Bitmap(BlockBitmapError),
    Journal(JournalError),
    Tree(TreeError),
    Snapshot(SnapshotError),
    Lock(LockError),
    Protocol(ProtocolError),
    Changelist(ChangelistError),
    InvalidSuperblock(String),
    /// No free chunk left in an allocation space, even after evicting snapshots
    NoSpace,
    InvalidArgument(String),
    /// An error reply received from a server
    Remote { code: u32, err: u32, msg: String },
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::BlockDevice(e) => write!(f, "Block device error: {}", e),
            Error::Cache(e) => write!(f, "Buffer cache error: {}", e),
            Error::Bitmap(e) => write!(f, "Allocation error: {}", e),
            Error::Journal(e) => write!(f, "Journal error: {}", e),
            Error::Tree(e) => write!(f, "B-tree error: {}", e),
            Error::Snapshot(e) => write!(f, "{}", e),
            Error::Lock(e) => write!(f, "Lock error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::Changelist(e) => write!(f, "Changelist error: {}", e),
            Error::InvalidSuperblock(msg) => write!(f, "Invalid superblock: {}", msg),
            Error::NoSpace => write!(f, "No space left in snapshot store"),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::Remote { msg, .. } => write!(f, "{}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<BlockDeviceError> for Error {
    fn from(err: BlockDeviceError) -> Self {
        match err {
            BlockDeviceError::Io(e) => Error::Io(e),
            other => Error::BlockDevice(other),
        }
    }
}

impl From<CacheError> for Error {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::BlockDevice(e) => e.into(),
            other => Error::Cache(other),
        }
    }
}

impl From<BlockBitmapError> for Error {
    fn from(err: BlockBitmapError) -> Self {
        Error::Bitmap(err)
    }
}

impl From<JournalError> for Error {
    fn from(err: JournalError) -> Self {
        Error::Journal(err)
    }
}

impl From<TreeError> for Error {
    fn from(err: TreeError) -> Self {
        Error::Tree(err)
    }
}

impl From<SnapshotError> for Error {
    fn from(err: SnapshotError) -> Self {
        Error::Snapshot(err)
    }
}

impl From<LockError> for Error {
    fn from(err: LockError) -> Self {
        Error::Lock(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => Error::Io(e),
            other => Error::Protocol(other),
        }
    }
}

impl From<ChangelistError> for Error {
    fn from(err: ChangelistError) -> Self {
        Error::Changelist(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
