//! Wire protocol between the snapshot server, device clients and admin tools
//!
//! Every message is a `{code: u32, length: u32}` little-endian header followed
//! by `length` bytes of body. Bodies are packed little-endian structures.

use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::layout::MAX_SNAPSHOTS;

/// Largest body the server accepts from a client
pub const MAX_BODY: usize = 500;

/// Message codes
pub mod code {
    pub const PROTOCOL_ERROR: u32 = 0xbead0000;
    pub const IDENTIFY: u32 = PROTOCOL_ERROR + 1;
    pub const IDENTIFY_OK: u32 = PROTOCOL_ERROR + 2;
    pub const IDENTIFY_ERROR: u32 = PROTOCOL_ERROR + 3;
    pub const QUERY_WRITE: u32 = PROTOCOL_ERROR + 4;
    pub const ORIGIN_WRITE_OK: u32 = PROTOCOL_ERROR + 5;
    pub const ORIGIN_WRITE_ERROR: u32 = PROTOCOL_ERROR + 6;
    pub const SNAPSHOT_WRITE_OK: u32 = PROTOCOL_ERROR + 7;
    pub const SNAPSHOT_WRITE_ERROR: u32 = PROTOCOL_ERROR + 8;
    pub const QUERY_SNAPSHOT_READ: u32 = PROTOCOL_ERROR + 9;
    pub const SNAPSHOT_READ_OK: u32 = PROTOCOL_ERROR + 10;
    pub const SNAPSHOT_READ_ERROR: u32 = PROTOCOL_ERROR + 11;
    pub const SNAPSHOT_READ_ORIGIN_OK: u32 = PROTOCOL_ERROR + 12;
    pub const SNAPSHOT_READ_ORIGIN_ERROR: u32 = PROTOCOL_ERROR + 13;
    pub const FINISH_SNAPSHOT_READ: u32 = PROTOCOL_ERROR + 14;
    pub const CREATE_SNAPSHOT: u32 = PROTOCOL_ERROR + 15;
    pub const CREATE_SNAPSHOT_OK: u32 = PROTOCOL_ERROR + 16;
    pub const CREATE_SNAPSHOT_ERROR: u32 = PROTOCOL_ERROR + 17;
    pub const DELETE_SNAPSHOT: u32 = PROTOCOL_ERROR + 18;
    pub const DELETE_SNAPSHOT_OK: u32 = PROTOCOL_ERROR + 19;
    pub const DELETE_SNAPSHOT_ERROR: u32 = PROTOCOL_ERROR + 20;
    pub const DUMP_TREE_RANGE: u32 = PROTOCOL_ERROR + 21;
    pub const START_SERVER: u32 = PROTOCOL_ERROR + 29;
    pub const SHUTDOWN_SERVER: u32 = PROTOCOL_ERROR + 30;
    pub const LIST_SNAPSHOTS: u32 = PROTOCOL_ERROR + 38;
    pub const SNAPSHOT_LIST: u32 = PROTOCOL_ERROR + 39;
    pub const PRIORITY: u32 = PROTOCOL_ERROR + 40;
    pub const PRIORITY_OK: u32 = PROTOCOL_ERROR + 41;
    pub const PRIORITY_ERROR: u32 = PROTOCOL_ERROR + 42;
    pub const USECOUNT: u32 = PROTOCOL_ERROR + 43;
    pub const USECOUNT_ERROR: u32 = PROTOCOL_ERROR + 44;
    pub const USECOUNT_OK: u32 = PROTOCOL_ERROR + 45;
    pub const STREAM_CHANGELIST: u32 = PROTOCOL_ERROR + 46;
    pub const STREAM_CHANGELIST_OK: u32 = PROTOCOL_ERROR + 47;
    pub const STREAM_CHANGELIST_ERROR: u32 = PROTOCOL_ERROR + 48;
    pub const STATUS: u32 = PROTOCOL_ERROR + 53;
    pub const STATUS_OK: u32 = PROTOCOL_ERROR + 54;
    pub const STATUS_ERROR: u32 = PROTOCOL_ERROR + 55;
    pub const REQUEST_SNAPSHOT_STATE: u32 = PROTOCOL_ERROR + 56;
    pub const SNAPSHOT_STATE: u32 = PROTOCOL_ERROR + 57;
    pub const REQUEST_SNAPSHOT_SECTORS: u32 = PROTOCOL_ERROR + 58;
    pub const SNAPSHOT_SECTORS: u32 = PROTOCOL_ERROR + 59;
    pub const STREAM_EXCEPTIONS: u32 = PROTOCOL_ERROR + 60;
    pub const RESIZE: u32 = PROTOCOL_ERROR + 61;
    /// Error reply for requests without a dedicated error code
    pub const GENERIC_ERROR: u32 = PROTOCOL_ERROR + 62;
}

/// Error values carried in error replies, next to plain errno values
pub mod errcode {
    pub const ERROR_REFUSED: u32 = 0xdead0001;
    pub const ERROR_SIZE_MISMATCH: u32 = 0xdead0002;
    pub const ERROR_OFFSET_MISMATCH: u32 = 0xdead0003;
    pub const ERROR_INVALID_SNAPSHOT: u32 = 0xdead0004;
    pub const ERROR_PRIORITY: u32 = 0xdead0005;
    pub const ERROR_USECOUNT: u32 = 0xdead0006;
    pub const ERROR_UNKNOWN_MESSAGE: u32 = 0xdead0007;
    pub const OTHER: u32 = 0xdead0008;
}

/// Human readable name of a message code, for logs
pub fn code_name(code: u32) -> &'static str {
    use code::*;
    match code {
        PROTOCOL_ERROR => "PROTOCOL_ERROR",
        IDENTIFY => "IDENTIFY",
        IDENTIFY_OK => "IDENTIFY_OK",
        IDENTIFY_ERROR => "IDENTIFY_ERROR",
        QUERY_WRITE => "QUERY_WRITE",
        ORIGIN_WRITE_OK => "ORIGIN_WRITE_OK",
        ORIGIN_WRITE_ERROR => "ORIGIN_WRITE_ERROR",
        SNAPSHOT_WRITE_OK => "SNAPSHOT_WRITE_OK",
        SNAPSHOT_WRITE_ERROR => "SNAPSHOT_WRITE_ERROR",
        QUERY_SNAPSHOT_READ => "QUERY_SNAPSHOT_READ",
        SNAPSHOT_READ_OK => "SNAPSHOT_READ_OK",
        SNAPSHOT_READ_ERROR => "SNAPSHOT_READ_ERROR",
        SNAPSHOT_READ_ORIGIN_OK => "SNAPSHOT_READ_ORIGIN_OK",
        SNAPSHOT_READ_ORIGIN_ERROR => "SNAPSHOT_READ_ORIGIN_ERROR",
        FINISH_SNAPSHOT_READ => "FINISH_SNAPSHOT_READ",
        CREATE_SNAPSHOT => "CREATE_SNAPSHOT",
        CREATE_SNAPSHOT_OK => "CREATE_SNAPSHOT_OK",
        CREATE_SNAPSHOT_ERROR => "CREATE_SNAPSHOT_ERROR",
        DELETE_SNAPSHOT => "DELETE_SNAPSHOT",
        DELETE_SNAPSHOT_OK => "DELETE_SNAPSHOT_OK",
        DELETE_SNAPSHOT_ERROR => "DELETE_SNAPSHOT_ERROR",
        DUMP_TREE_RANGE => "DUMP_TREE_RANGE",
        START_SERVER => "START_SERVER",
        SHUTDOWN_SERVER => "SHUTDOWN_SERVER",
        LIST_SNAPSHOTS => "LIST_SNAPSHOTS",
        SNAPSHOT_LIST => "SNAPSHOT_LIST",
        PRIORITY => "PRIORITY",
        PRIORITY_OK => "PRIORITY_OK",
        PRIORITY_ERROR => "PRIORITY_ERROR",
        USECOUNT => "USECOUNT",
        USECOUNT_ERROR => "USECOUNT_ERROR",
        USECOUNT_OK => "USECOUNT_OK",
        STREAM_CHANGELIST => "STREAM_CHANGELIST",
        STREAM_CHANGELIST_OK => "STREAM_CHANGELIST_OK",
        STREAM_CHANGELIST_ERROR => "STREAM_CHANGELIST_ERROR",
        STATUS => "STATUS",
        STATUS_OK => "STATUS_OK",
        STATUS_ERROR => "STATUS_ERROR",
        REQUEST_SNAPSHOT_STATE => "REQUEST_SNAPSHOT_STATE",
        SNAPSHOT_STATE => "SNAPSHOT_STATE",
        REQUEST_SNAPSHOT_SECTORS => "REQUEST_SNAPSHOT_SECTORS",
        SNAPSHOT_SECTORS => "SNAPSHOT_SECTORS",
        STREAM_EXCEPTIONS => "STREAM_EXCEPTIONS",
        RESIZE => "RESIZE",
        GENERIC_ERROR => "GENERIC_ERROR",
        _ => "UNKNOWN",
    }
}

/// Error type for protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("message {code:#x} too long ({length} bytes)")]
    TooLong { code: u32, length: usize },
    #[error("message {code:#x} too short ({length} bytes)")]
    TooShort { code: u32, length: usize },
    #[error("unexpected reply {got:#x} ({}) to {request:#x}", code_name(*.got))]
    UnexpectedReply { request: u32, got: u32 },
}

/// One framed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub code: u32,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(code: u32, body: &impl Wire) -> Self {
        let mut out = Vec::new();
        // writes into a Vec cannot fail
        let _ = body.put(&mut out);
        Self { code, body: out }
    }

    pub fn empty(code: u32) -> Self {
        Self {
            code,
            body: Vec::new(),
        }
    }

    /// Decode the body as `T`
    pub fn parse<T: Wire>(&self) -> Result<T, ProtocolError> {
        let mut reader = Cursor::new(&self.body[..]);
        T::get(&mut reader).map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => ProtocolError::TooShort {
                code: self.code,
                length: self.body.len(),
            },
            _ => ProtocolError::Io(err),
        })
    }

    /// Decode the body as `T`, refusing trailing bytes
    pub fn parse_exact<T: Wire>(&self) -> Result<T, ProtocolError> {
        let value = self.parse::<T>()?;
        let mut out = Vec::new();
        let _ = value.put(&mut out);
        if out.len() != self.body.len() {
            return Err(ProtocolError::TooLong {
                code: self.code,
                length: self.body.len(),
            });
        }
        Ok(value)
    }
}

/// Read one message; `Ok(None)` on a clean end of stream
pub async fn read_message<R>(reader: &mut R, max_body: usize) -> Result<Option<Message>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 8];
    match tokio::io::AsyncReadExt::read_exact(reader, &mut head).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let code = u32::from_le_bytes(*arrayref::array_ref![head, 0, 4]);
    let length = u32::from_le_bytes(*arrayref::array_ref![head, 4, 4]) as usize;
    if length > max_body {
        return Err(ProtocolError::TooLong { code, length });
    }
    let mut body = vec![0u8; length];
    tokio::io::AsyncReadExt::read_exact(reader, &mut body).await?;
    Ok(Some(Message { code, body }))
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(8 + message.body.len());
    frame.extend_from_slice(&message.code.to_le_bytes());
    frame.extend_from_slice(&(message.body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&message.body);
    tokio::io::AsyncWriteExt::write_all(writer, &frame).await?;
    tokio::io::AsyncWriteExt::flush(writer).await?;
    Ok(())
}

/// A message body with a packed little-endian encoding
pub trait Wire: Sized {
    fn put<W: Write>(&self, out: &mut W) -> io::Result<()>;
    fn get<R: Read>(input: &mut R) -> io::Result<Self>;
}

fn put_cstring<W: Write>(out: &mut W, text: &str) -> io::Result<()> {
    out.write_all(text.as_bytes())?;
    out.write_u8(0)
}

fn get_cstring<R: Read>(input: &mut R) -> io::Result<String> {
    let mut bytes = Vec::new();
    input.read_to_end(&mut bytes)?;
    if let Some(end) = bytes.iter().position(|&b| b == 0) {
        bytes.truncate(end);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identify {
    pub id: u64,
    pub snap: u32,
    /// Volume offset in sectors
    pub off: u64,
    /// Volume length in sectors
    pub len: u64,
}

impl Wire for Identify {
    fn put<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.id)?;
        out.write_u32::<LittleEndian>(self.snap)?;
        out.write_u64::<LittleEndian>(self.off)?;
        out.write_u64::<LittleEndian>(self.len)
    }

    fn get<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self {
            id: input.read_u64::<LittleEndian>()?,
            snap: input.read_u32::<LittleEndian>()?,
            off: input.read_u64::<LittleEndian>()?,
            len: input.read_u64::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifyOk {
    pub chunksize_bits: u32,
}

impl Wire for IdentifyOk {
    fn put<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.chunksize_bits)
    }

    fn get<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self {
            chunksize_bits: input.read_u32::<LittleEndian>()?,
        })
    }
}

/// Body of every `*_ERROR` reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub err: u32,
    pub msg: String,
}

impl Wire for ErrorReply {
    fn put<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.err)?;
        put_cstring(out, &self.msg)
    }

    fn get<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self {
            err: input.read_u32::<LittleEndian>()?,
            msg: get_cstring(input)?,
        })
    }
}

/// Reply to a message the receiver does not understand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolErrorReply {
    pub err: u32,
    pub culprit: u32,
    pub msg: String,
}

impl Wire for ProtocolErrorReply {
    fn put<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.err)?;
        out.write_u32::<LittleEndian>(self.culprit)?;
        put_cstring(out, &self.msg)
    }

    fn get<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self {
            err: input.read_u32::<LittleEndian>()?,
            culprit: input.read_u32::<LittleEndian>()?,
            msg: get_cstring(input)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub chunk: u64,
    pub chunks: u32,
}

impl ChunkRange {
    /// One past the last chunk, `None` if that does not fit in a u64
    pub fn end(&self) -> Option<u64> {
        self.chunk.checked_add(self.chunks as u64)
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> {
        self.chunk..self.chunk.saturating_add(self.chunks as u64)
    }
}

/// Read or write query, and the matching release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RwRequest {
    pub id: u32,
    pub ranges: Vec<ChunkRange>,
}

impl RwRequest {
    pub fn chunks(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().flat_map(ChunkRange::iter)
    }

    /// Whether every range ends at or before chunk `limit`
    pub fn within(&self, limit: u64) -> bool {
        self.ranges
            .iter()
            .all(|range| matches!(range.end(), Some(end) if end <= limit))
    }
}

impl Wire for RwRequest {
    fn put<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.id)?;
        out.write_u32::<LittleEndian>(self.ranges.len() as u32)?;
        for range in &self.ranges {
            out.write_u64::<LittleEndian>(range.chunk)?;
            out.write_u32::<LittleEndian>(range.chunks)?;
        }
        Ok(())
    }

    fn get<R: Read>(input: &mut R) -> io::Result<Self> {
        let id = input.read_u32::<LittleEndian>()?;
        let count = input.read_u32::<LittleEndian>()?;
        let mut ranges = Vec::new();
        for _ in 0..count {
            ranges.push(ChunkRange {
                chunk: input.read_u64::<LittleEndian>()?,
                chunks: input.read_u32::<LittleEndian>()?,
            });
        }
        Ok(Self { id, ranges })
    }
}

/// A run of logical chunks in a reply, with the snapshot store chunk of each
/// when the reply lists exceptions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRange {
    pub chunk: u64,
    pub chunks: u32,
    pub exceptions: Vec<u64>,
}

/// Reply to a read or write query. Snapshot replies list one exception per
/// chunk after each range; origin replies list ranges only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RwReply {
    pub id: u32,
    pub ranges: Vec<ReplyRange>,
}

impl RwReply {
    /// Whether replies with this code carry exceptions
    pub fn has_exceptions(code: u32) -> bool {
        matches!(
            code,
            code::SNAPSHOT_READ_OK
                | code::SNAPSHOT_READ_ERROR
                | code::SNAPSHOT_WRITE_OK
                | code::SNAPSHOT_WRITE_ERROR
        )
    }

    pub fn encode(&self, code: u32) -> Message {
        let mut out = Vec::new();
        let with_exceptions = Self::has_exceptions(code);
        let _ = (|| -> io::Result<()> {
            out.write_u32::<LittleEndian>(self.id)?;
            out.write_u32::<LittleEndian>(self.ranges.len() as u32)?;
            for range in &self.ranges {
                out.write_u64::<LittleEndian>(range.chunk)?;
                out.write_u32::<LittleEndian>(range.chunks)?;
                if with_exceptions {
                    for &exception in &range.exceptions {
                        out.write_u64::<LittleEndian>(exception)?;
                    }
                }
            }
            Ok(())
        })();
        Message { code, body: out }
    }

    pub fn decode(message: &Message) -> Result<Self, ProtocolError> {
        let with_exceptions = Self::has_exceptions(message.code);
        let short = |_| ProtocolError::TooShort {
            code: message.code,
            length: message.body.len(),
        };
        let mut input = Cursor::new(&message.body[..]);
        let id = input.read_u32::<LittleEndian>().map_err(short)?;
        let count = input.read_u32::<LittleEndian>().map_err(short)?;
        let mut ranges = Vec::new();
        for _ in 0..count {
            let chunk = input.read_u64::<LittleEndian>().map_err(short)?;
            let chunks = input.read_u32::<LittleEndian>().map_err(short)?;
            let mut exceptions = Vec::new();
            if with_exceptions {
                for _ in 0..chunks {
                    exceptions.push(input.read_u64::<LittleEndian>().map_err(short)?);
                }
            }
            ranges.push(ReplyRange {
                chunk,
                chunks,
                exceptions,
            });
        }
        Ok(Self { id, ranges })
    }
}

/// Gathers chunks, in request order, into as few ranges as possible
#[derive(Debug, Default)]
pub struct ReplyBuilder {
    ranges: Vec<ReplyRange>,
}

impl ReplyBuilder {
    pub fn add(&mut self, chunk: u64, exception: Option<u64>) {
        match self.ranges.last_mut() {
            Some(last) if last.chunk + last.chunks as u64 == chunk => {
                last.chunks += 1;
                last.exceptions.extend(exception);
            }
            _ => self.ranges.push(ReplyRange {
                chunk,
                chunks: 1,
                exceptions: exception.into_iter().collect(),
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The finished reply, or `None` when no chunk was added
    pub fn finish(self, id: u32) -> Option<RwReply> {
        if self.ranges.is_empty() {
            None
        } else {
            Some(RwReply {
                id,
                ranges: self.ranges,
            })
        }
    }
}

/// Body naming one snapshot tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapTag {
    pub snap: u32,
}

impl Wire for SnapTag {
    fn put<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.snap)
    }

    fn get<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self {
            snap: input.read_u32::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityInfo {
    pub snap: u32,
    pub prio: i8,
}

impl Wire for PriorityInfo {
    fn put<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.snap)?;
        out.write_i8(self.prio)
    }

    fn get<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self {
            snap: input.read_u32::<LittleEndian>()?,
            prio: input.read_i8()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityOk {
    pub prio: i8,
}

impl Wire for PriorityOk {
    fn put<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_i8(self.prio)
    }

    fn get<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self {
            prio: input.read_i8()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsecountInfo {
    pub snap: u32,
    pub usecnt_dev: i32,
}

impl Wire for UsecountInfo {
    fn put<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.snap)?;
        out.write_i32::<LittleEndian>(self.usecnt_dev)
    }

    fn get<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self {
            snap: input.read_u32::<LittleEndian>()?,
            usecnt_dev: input.read_i32::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsecountOk {
    pub usecount: u16,
}

impl Wire for UsecountOk {
    fn put<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u16::<LittleEndian>(self.usecount)
    }

    fn get<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self {
            usecount: input.read_u16::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamChangelist {
    pub snap1: u32,
    pub snap2: u32,
}

impl Wire for StreamChangelist {
    fn put<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.snap1)?;
        out.write_u32::<LittleEndian>(self.snap2)
    }

    fn get<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self {
            snap1: input.read_u32::<LittleEndian>()?,
            snap2: input.read_u32::<LittleEndian>()?,
        })
    }
}

/// Changed chunks between two snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelistStream {
    pub chunksize_bits: u32,
    pub chunks: Vec<u64>,
}

impl Wire for ChangelistStream {
    fn put<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.chunks.len() as u64)?;
        out.write_u32::<LittleEndian>(self.chunksize_bits)?;
        for &chunk in &self.chunks {
            out.write_u64::<LittleEndian>(chunk)?;
        }
        Ok(())
    }

    fn get<R: Read>(input: &mut R) -> io::Result<Self> {
        let count = input.read_u64::<LittleEndian>()?;
        let chunksize_bits = input.read_u32::<LittleEndian>()?;
        let mut chunks = Vec::new();
        for _ in 0..count {
            chunks.push(input.read_u64::<LittleEndian>()?);
        }
        Ok(Self {
            chunksize_bits,
            chunks,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapInfo {
    pub snap: u32,
    pub prio: i8,
    pub usecnt: u16,
    pub ctime: u64,
}

impl Wire for SnapInfo {
    fn put<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.snap)?;
        out.write_i8(self.prio)?;
        out.write_u16::<LittleEndian>(self.usecnt)?;
        out.write_u64::<LittleEndian>(self.ctime)
    }

    fn get<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self {
            snap: input.read_u32::<LittleEndian>()?,
            prio: input.read_i8()?,
            usecnt: input.read_u16::<LittleEndian>()?,
            ctime: input.read_u64::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotList {
    pub snapshots: Vec<SnapInfo>,
}

impl Wire for SnapshotList {
    fn put<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.snapshots.len() as u32)?;
        self.snapshots.iter().try_for_each(|info| info.put(out))
    }

    fn get<R: Read>(input: &mut R) -> io::Result<Self> {
        let count = input.read_u32::<LittleEndian>()? as usize;
        let snapshots = (0..count.min(MAX_SNAPSHOTS))
            .map(|_| SnapInfo::get(input))
            .collect::<io::Result<_>>()?;
        Ok(Self { snapshots })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpTreeRange {
    pub start: u64,
    pub finish: u64,
}

impl Wire for DumpTreeRange {
    fn put<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.start)?;
        out.write_u64::<LittleEndian>(self.finish)
    }

    fn get<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self {
            start: input.read_u64::<LittleEndian>()?,
            finish: input.read_u64::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceStatus {
    pub chunksize_bits: u32,
    pub total: u64,
    pub free: u64,
}

impl Wire for SpaceStatus {
    fn put<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.chunksize_bits)?;
        out.write_u64::<LittleEndian>(self.total)?;
        out.write_u64::<LittleEndian>(self.free)
    }

    fn get<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self {
            chunksize_bits: input.read_u32::<LittleEndian>()?,
            total: input.read_u64::<LittleEndian>()?,
            free: input.read_u64::<LittleEndian>()?,
        })
    }
}

/// One snapshot row of a status reply. `sharing[k]` counts exceptions the
/// snapshot shares with exactly `k` others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDetails {
    pub info: SnapInfo,
    pub sharing: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReply {
    pub ctime: u64,
    pub write_density: u32,
    pub meta: SpaceStatus,
    pub store: SpaceStatus,
    pub details: Vec<SnapshotDetails>,
}

impl Wire for StatusReply {
    fn put<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.ctime)?;
        out.write_u32::<LittleEndian>(self.write_density)?;
        self.meta.put(out)?;
        self.store.put(out)?;
        let snapshots = self.details.len();
        out.write_u32::<LittleEndian>(snapshots as u32)?;
        for row in &self.details {
            row.info.put(out)?;
            for col in 0..snapshots {
                out.write_u64::<LittleEndian>(row.sharing.get(col).copied().unwrap_or(0))?;
            }
        }
        Ok(())
    }

    fn get<R: Read>(input: &mut R) -> io::Result<Self> {
        let ctime = input.read_u64::<LittleEndian>()?;
        let write_density = input.read_u32::<LittleEndian>()?;
        let meta = SpaceStatus::get(input)?;
        let store = SpaceStatus::get(input)?;
        let snapshots = (input.read_u32::<LittleEndian>()? as usize).min(MAX_SNAPSHOTS);
        let mut details = Vec::with_capacity(snapshots);
        for _ in 0..snapshots {
            let info = SnapInfo::get(input)?;
            let sharing = (0..snapshots)
                .map(|_| input.read_u64::<LittleEndian>())
                .collect::<io::Result<_>>()?;
            details.push(SnapshotDetails { info, sharing });
        }
        Ok(Self {
            ctime,
            write_density,
            meta,
            store,
            details,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMessage {
    pub snap: u32,
    pub state: u32,
}

impl Wire for StateMessage {
    fn put<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.snap)?;
        out.write_u32::<LittleEndian>(self.state)
    }

    fn get<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self {
            snap: input.read_u32::<LittleEndian>()?,
            state: input.read_u32::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSectors {
    pub snap: u32,
    pub count: u64,
}

impl Wire for SnapshotSectors {
    fn put<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.snap)?;
        out.write_u64::<LittleEndian>(self.count)
    }

    fn get<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self {
            snap: input.read_u32::<LittleEndian>()?,
            count: input.read_u64::<LittleEndian>()?,
        })
    }
}

/// Device sizes in bytes; zero leaves a size unchanged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResizeRequest {
    pub orgsize: u64,
    pub snapsize: u64,
    pub metasize: u64,
}

impl Wire for ResizeRequest {
    fn put<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.orgsize)?;
        out.write_u64::<LittleEndian>(self.snapsize)?;
        out.write_u64::<LittleEndian>(self.metasize)
    }

    fn get<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self {
            orgsize: input.read_u64::<LittleEndian>()?,
            snapsize: input.read_u64::<LittleEndian>()?,
            metasize: input.read_u64::<LittleEndian>()?,
        })
    }
}

/// Empty body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Empty;

impl Wire for Empty {
    fn put<W: Write>(&self, _out: &mut W) -> io::Result<()> {
        Ok(())
    }

    fn get<R: Read>(_input: &mut R) -> io::Result<Self> {
        Ok(Self)
    }
}
