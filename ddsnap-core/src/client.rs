//! Client side of the control protocol

use std::path::Path;

use log::debug;
use tokio::net::UnixStream;

use crate::changelist::ChangeList;
use crate::error::{Error, Result};
use crate::modules::snapshot::SnapshotState;
use crate::protocol::{
    code, read_message, write_message, ChangelistStream, DumpTreeRange, ErrorReply, Identify,
    IdentifyOk, Message, PriorityInfo, PriorityOk, ProtocolError, ProtocolErrorReply,
    ResizeRequest, SnapInfo, SnapTag, SnapshotList, SnapshotSectors, StateMessage, StatusReply,
    StreamChangelist, UsecountInfo, UsecountOk,
};

/// Replies to STATUS and STREAM_CHANGELIST grow with the store
const MAX_REPLY_BODY: usize = 1 << 30;

pub struct Client {
    stream: UnixStream,
}

impl Client {
    pub async fn connect(socket: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(socket.as_ref()).await?;
        debug!("CLIENT: connected to {}", socket.as_ref().display());
        Ok(Self { stream })
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        write_message(&mut self.stream, message).await?;
        Ok(())
    }

    pub async fn receive(&mut self) -> Result<Message> {
        read_message(&mut self.stream, MAX_REPLY_BODY)
            .await?
            .ok_or_else(|| Error::Other("server closed the connection".into()))
    }

    /// Send `message` and wait for `ok`; any error reply becomes
    /// [`Error::Remote`]
    async fn call(&mut self, message: &Message, ok: u32) -> Result<Message> {
        self.send(message).await?;
        let reply = self.receive().await?;
        if reply.code == ok {
            return Ok(reply);
        }
        Err(match reply.code {
            code::PROTOCOL_ERROR => {
                let err: ProtocolErrorReply = reply.parse()?;
                Error::Remote {
                    code: reply.code,
                    err: err.err,
                    msg: err.msg,
                }
            }
            code::IDENTIFY_ERROR
            | code::CREATE_SNAPSHOT_ERROR
            | code::DELETE_SNAPSHOT_ERROR
            | code::PRIORITY_ERROR
            | code::USECOUNT_ERROR
            | code::STREAM_CHANGELIST_ERROR
            | code::STATUS_ERROR
            | code::GENERIC_ERROR => {
                let err: ErrorReply = reply.parse()?;
                Error::Remote {
                    code: reply.code,
                    err: err.err,
                    msg: err.msg,
                }
            }
            got => ProtocolError::UnexpectedReply {
                request: message.code,
                got,
            }
            .into(),
        })
    }

    /// Identify as a device client; returns the chunk size bits
    pub async fn identify(&mut self, id: u64, snap: u32, off: u64, len: u64) -> Result<u32> {
        let request = Message::new(code::IDENTIFY, &Identify { id, snap, off, len });
        let reply = self.call(&request, code::IDENTIFY_OK).await?;
        Ok(reply.parse::<IdentifyOk>()?.chunksize_bits)
    }

    pub async fn create_snapshot(&mut self, snap: u32) -> Result<()> {
        let request = Message::new(code::CREATE_SNAPSHOT, &SnapTag { snap });
        self.call(&request, code::CREATE_SNAPSHOT_OK).await?;
        Ok(())
    }

    pub async fn delete_snapshot(&mut self, snap: u32) -> Result<()> {
        let request = Message::new(code::DELETE_SNAPSHOT, &SnapTag { snap });
        self.call(&request, code::DELETE_SNAPSHOT_OK).await?;
        Ok(())
    }

    pub async fn list_snapshots(&mut self) -> Result<Vec<SnapInfo>> {
        let reply = self
            .call(&Message::empty(code::LIST_SNAPSHOTS), code::SNAPSHOT_LIST)
            .await?;
        Ok(reply.parse::<SnapshotList>()?.snapshots)
    }

    pub async fn set_priority(&mut self, snap: u32, prio: i8) -> Result<i8> {
        let request = Message::new(code::PRIORITY, &PriorityInfo { snap, prio });
        let reply = self.call(&request, code::PRIORITY_OK).await?;
        Ok(reply.parse::<PriorityOk>()?.prio)
    }

    /// Add `delta` to the persistent use count; returns the new total
    pub async fn adjust_usecount(&mut self, snap: u32, delta: i32) -> Result<u16> {
        let request = Message::new(
            code::USECOUNT,
            &UsecountInfo {
                snap,
                usecnt_dev: delta,
            },
        );
        let reply = self.call(&request, code::USECOUNT_OK).await?;
        Ok(reply.parse::<UsecountOk>()?.usecount)
    }

    pub async fn status(&mut self, snap: u32) -> Result<StatusReply> {
        let request = Message::new(code::STATUS, &SnapTag { snap });
        let reply = self.call(&request, code::STATUS_OK).await?;
        Ok(reply.parse()?)
    }

    pub async fn changelist(&mut self, src: u32, tgt: u32) -> Result<ChangeList> {
        let request = Message::new(
            code::STREAM_CHANGELIST,
            &StreamChangelist {
                snap1: src,
                snap2: tgt,
            },
        );
        let reply = self.call(&request, code::STREAM_CHANGELIST_OK).await?;
        let stream: ChangelistStream = reply.parse()?;
        Ok(ChangeList {
            chunksize_bits: stream.chunksize_bits,
            src_snap: src,
            tgt_snap: tgt,
            chunks: stream.chunks,
        })
    }

    pub async fn snapshot_state(&mut self, snap: u32) -> Result<SnapshotState> {
        let request = Message::new(code::REQUEST_SNAPSHOT_STATE, &SnapTag { snap });
        let reply = self.call(&request, code::SNAPSHOT_STATE).await?;
        let state: StateMessage = reply.parse()?;
        match state.state {
            0 => Ok(SnapshotState::Live),
            1 => Ok(SnapshotState::Missing),
            2 => Ok(SnapshotState::Squashed),
            other => Err(Error::Other(format!("unknown snapshot state {}", other))),
        }
    }

    pub async fn snapshot_sectors(&mut self, snap: u32) -> Result<u64> {
        let request = Message::new(code::REQUEST_SNAPSHOT_SECTORS, &SnapTag { snap });
        let reply = self.call(&request, code::SNAPSHOT_SECTORS).await?;
        Ok(reply.parse::<SnapshotSectors>()?.count)
    }

    /// Ask the server to pick up new device sizes in bytes (zero keeps a
    /// size); returns the sizes in effect afterwards
    pub async fn resize(&mut self, orgsize: u64, snapsize: u64, metasize: u64) -> Result<ResizeRequest> {
        let request = Message::new(
            code::RESIZE,
            &ResizeRequest {
                orgsize,
                snapsize,
                metasize,
            },
        );
        let reply = self.call(&request, code::RESIZE).await?;
        Ok(reply.parse()?)
    }

    /// Have the server log the exception tree between two chunks
    pub async fn dump_tree_range(&mut self, start: u64, finish: u64) -> Result<()> {
        self.send(&Message::new(code::DUMP_TREE_RANGE, &DumpTreeRange { start, finish }))
            .await
    }

    pub async fn shutdown_server(&mut self) -> Result<()> {
        self.send(&Message::empty(code::SHUTDOWN_SERVER)).await
    }
}
