//! One handler per request code

use log::{debug, info, warn};

use super::{Engine, Outcome, Session};
use crate::blockdev::SECTOR_BITS;
use crate::btree::Target;
use crate::error::{Error, Result};
use crate::locks::ClientId;
use crate::modules::snapshot::{SnapshotError, ORIGIN_TAG};
use crate::protocol::{
    code, code_name, errcode, ChangelistStream, DumpTreeRange, ErrorReply, Identify, IdentifyOk,
    Message, PriorityInfo, PriorityOk, ProtocolErrorReply, ReplyBuilder, ResizeRequest, RwRequest,
    SnapInfo, SnapTag, SnapshotDetails, SnapshotList, SnapshotSectors, SpaceStatus, StateMessage,
    StatusReply, StreamChangelist, UsecountInfo, UsecountOk,
};

fn error_reply(code: u32, err: u32, msg: impl Into<String>) -> Message {
    let msg = msg.into();
    warn!("SERVER: {} ({})", msg, code_name(code));
    Message::new(code, &ErrorReply { err, msg })
}

fn refuse(culprit: u32, msg: &str) -> Message {
    warn!("SERVER: {} ({})", msg, code_name(culprit));
    Message::new(
        code::PROTOCOL_ERROR,
        &ProtocolErrorReply {
            err: errcode::ERROR_REFUSED,
            culprit,
            msg: msg.to_string(),
        },
    )
}

impl Engine {
    fn session_of(&self, client: ClientId) -> Session {
        self.sessions.get(&client).copied().unwrap_or_default()
    }

    /// Chunks covering the origin, counting a partial last chunk
    fn origin_chunks(&self) -> u64 {
        let bits = self.store.chunksize_bits() - SECTOR_BITS;
        let sectors = self.store.superblock().orgsectors;
        (sectors >> bits) + u64::from(sectors & ((1 << bits) - 1) != 0)
    }

    pub(super) async fn query_write(
        &mut self,
        client: ClientId,
        message: &Message,
        out: &mut Outcome,
    ) -> Result<()> {
        let request: RwRequest = message.parse()?;
        let session = self.session_of(client);
        match session.snaptag {
            None => {
                out.send(client, refuse(message.code, "client has not identified"));
                Ok(())
            }
            Some(_) if !request.within(self.origin_chunks()) => {
                let reply = if Engine::is_origin(&session) {
                    warn!("SERVER: origin write {} beyond the end of the origin", request.id);
                    Message {
                        code: code::ORIGIN_WRITE_ERROR,
                        body: message.body.clone(),
                    }
                } else {
                    refuse(message.code, "snapshot write beyond the end of the origin")
                };
                out.send(client, reply);
                Ok(())
            }
            Some(_) if Engine::is_origin(&session) => {
                self.origin_write(client, message, &request, out).await
            }
            Some(tag) => self.snapshot_write(client, tag, &request, out).await,
        }
    }

    /// Preserve every chunk the origin is about to overwrite. The reply echoes
    /// the request and is held back while any snapshot client still reads one
    /// of the chunks from the origin.
    async fn origin_write(
        &mut self,
        client: ClientId,
        message: &Message,
        request: &RwRequest,
        out: &mut Outcome,
    ) -> Result<()> {
        debug!("SERVER: origin write query, {} ranges", request.ranges.len());
        let mut reply_code = code::ORIGIN_WRITE_OK;
        let pending = self.locks.begin_wait((
            client,
            Message {
                code: reply_code,
                body: message.body.clone(),
            },
        ));
        let mut waiting = false;
        for chunk in request.chunks() {
            match self.store.make_unique(chunk, Target::Origin).await {
                Ok(_) => waiting |= self.locks.waitfor_chunk(chunk, pending),
                Err(err) => {
                    warn!("SERVER: unable to perform copyout during origin write: {}", err);
                    reply_code = code::ORIGIN_WRITE_ERROR;
                }
            }
        }
        if let Err(err) = self.store.finish_copyout().await {
            warn!("SERVER: copyout failed during origin write: {}", err);
            reply_code = code::ORIGIN_WRITE_ERROR;
        }
        self.store.commit_transaction(false).await?;

        if let Some(reply) = self.locks.reply_mut(pending) {
            reply.1.code = reply_code;
        }
        match self.locks.finish_wait(pending) {
            Some(reply) => out.replies.push(reply),
            None if waiting => debug!("SERVER: origin write {} waits for snapshot reads", request.id),
            None => warn!("SERVER: origin write {} lost its reply", request.id),
        }
        Ok(())
    }

    async fn snapshot_write(
        &mut self,
        client: ClientId,
        tag: u32,
        request: &RwRequest,
        out: &mut Outcome,
    ) -> Result<()> {
        debug!("SERVER: snapshot {} write query, {} ranges", tag, request.ranges.len());
        let mut reply_code = code::SNAPSHOT_WRITE_OK;
        let mut reply = ReplyBuilder::default();
        for chunk in request.chunks() {
            // making room for an earlier chunk may have released this snapshot;
            // make_unique refuses a bit released while it makes room itself
            let bit = self
                .store
                .snapshot(tag)
                .filter(|snap| !snap.is_squashed())
                .map(|snap| snap.bit);
            let exception = match bit {
                Some(bit) => match self.store.make_unique(chunk, Target::Snapshot(bit)).await {
                    Ok(exception) => exception,
                    Err(err) => {
                        warn!("SERVER: unable to perform copyout during snapshot write: {}", err);
                        None
                    }
                },
                None => {
                    warn!("SERVER: write to squashed snapshot {}, id {}", tag, request.id);
                    None
                }
            };
            if exception.is_none() {
                reply_code = code::SNAPSHOT_WRITE_ERROR;
            }
            reply.add(chunk, Some(exception.unwrap_or(u64::MAX)));
        }
        if let Err(err) = self.store.finish_copyout().await {
            warn!("SERVER: copyout failed during snapshot write: {}", err);
            reply_code = code::SNAPSHOT_WRITE_ERROR;
        }
        self.store.commit_transaction(false).await?;
        if let Some(reply) = reply.finish(request.id) {
            out.send(client, reply.encode(reply_code));
        }
        Ok(())
    }

    /// Split a snapshot read into chunks with their own copy and chunks still
    /// read from the origin. The latter stay read locked until the client
    /// sends FINISH_SNAPSHOT_READ.
    pub(super) async fn query_snapshot_read(
        &mut self,
        client: ClientId,
        message: &Message,
        out: &mut Outcome,
    ) -> Result<()> {
        let request: RwRequest = message.parse()?;
        let session = self.session_of(client);
        let tag = match session.snaptag {
            Some(tag) if tag != ORIGIN_TAG => tag,
            _ => {
                out.send(client, refuse(message.code, "client is not a snapshot client"));
                return Ok(());
            }
        };
        debug!("SERVER: snapshot {} read query, {} ranges", tag, request.ranges.len());
        if !request.within(self.origin_chunks()) {
            out.send(client, refuse(message.code, "snapshot read beyond the end of the origin"));
            return Ok(());
        }

        let live = self.store.snapshot(tag).filter(|snap| !snap.is_squashed()).copied();
        let Some(snap) = live else {
            warn!("SERVER: read from squashed snapshot {}", tag);
            let mut reply = ReplyBuilder::default();
            for chunk in request.chunks() {
                reply.add(chunk, Some(0));
            }
            if let Some(reply) = reply.finish(request.id) {
                out.send(client, reply.encode(code::SNAPSHOT_READ_ERROR));
            }
            return Ok(());
        };

        let mut snap_reply = ReplyBuilder::default();
        let mut org_reply = ReplyBuilder::default();
        for chunk in request.chunks() {
            match self.store.test_unique(chunk, Target::Snapshot(snap.bit)).await? {
                (_, Some(exception)) => snap_reply.add(chunk, Some(exception)),
                (_, None) => {
                    org_reply.add(chunk, None);
                    self.locks.readlock_chunk(chunk, client);
                }
            }
        }
        if let Some(reply) = org_reply.finish(request.id) {
            out.send(client, reply.encode(code::SNAPSHOT_READ_ORIGIN_OK));
        }
        if let Some(reply) = snap_reply.finish(request.id) {
            out.send(client, reply.encode(code::SNAPSHOT_READ_OK));
        }
        Ok(())
    }

    pub(super) fn finish_snapshot_read(
        &mut self,
        client: ClientId,
        message: &Message,
        out: &mut Outcome,
    ) -> Result<()> {
        let request: RwRequest = message.parse()?;
        if !request.within(self.origin_chunks()) {
            warn!("SERVER: client {} released chunks beyond the end of the origin", client);
            return Ok(());
        }
        for chunk in request.chunks() {
            match self.locks.release_chunk(chunk, client) {
                Ok(ready) => out.replies.extend(ready),
                Err(err) => warn!("SERVER: client {}: {}", client, err),
            }
        }
        Ok(())
    }

    pub(super) fn identify(&mut self, client: ClientId, message: &Message, out: &mut Outcome) -> Result<()> {
        let request: Identify = message.parse()?;
        info!("SERVER: client id {:#x}, snaptag {}", request.id, request.snap);

        let previous = self.session_of(client);
        self.detach(&previous);
        self.sessions.insert(client, Session::default());

        let reply = match self.check_identify(&request) {
            Ok(attached) => {
                self.sessions.insert(
                    client,
                    Session {
                        id: request.id,
                        snaptag: Some(request.snap),
                        attached,
                    },
                );
                Message::new(
                    code::IDENTIFY_OK,
                    &IdentifyOk {
                        chunksize_bits: self.store.chunksize_bits(),
                    },
                )
            }
            Err((err, msg)) => error_reply(code::IDENTIFY_ERROR, err, msg),
        };
        out.send(client, reply);
        Ok(())
    }

    /// Validate an IDENTIFY and take the transient use count last, so a
    /// refused client never holds one
    fn check_identify(&mut self, request: &Identify) -> std::result::Result<Option<u8>, (u32, String)> {
        let tag = request.snap;
        let sectors = if tag == ORIGIN_TAG {
            self.store.superblock().orgsectors
        } else {
            let snap = match self.store.snapshot(tag) {
                Some(snap) if !snap.is_squashed() => *snap,
                _ => {
                    return Err((
                        errcode::ERROR_INVALID_SNAPSHOT,
                        format!("Snapshot tag {} is not valid", tag),
                    ))
                }
            };
            if self.store.usecount(&snap) == u16::MAX {
                return Err((errcode::ERROR_USECOUNT, "Usecount overflow.".into()));
            }
            snap.sectors
        };
        if request.len != sectors {
            return Err((
                errcode::ERROR_SIZE_MISMATCH,
                format!("volume size mismatch for snapshot {}", tag),
            ));
        }
        if request.off != self.store.superblock().orgoffset {
            return Err((
                errcode::ERROR_OFFSET_MISMATCH,
                format!("volume offset mismatch for snapshot {}", tag),
            ));
        }
        if tag == ORIGIN_TAG {
            return Ok(None);
        }
        self.store
            .attach_snapshot(tag)
            .map(Some)
            .map_err(|err| (errcode::ERROR_USECOUNT, err.to_string()))
    }

    pub(super) async fn create(&mut self, client: ClientId, message: &Message, out: &mut Outcome) -> Result<()> {
        let request: SnapTag = message.parse()?;
        let reply = match self.store.create_snapshot(request.snap).await {
            Ok(_) => {
                self.store.save_sb_check().await?;
                Message::empty(code::CREATE_SNAPSHOT_OK)
            }
            Err(Error::Snapshot(SnapshotError::TooManySnapshots)) => {
                error_reply(code::CREATE_SNAPSHOT_ERROR, libc::ENOMEM as u32, "too many snapshots")
            }
            Err(Error::Snapshot(SnapshotError::Exists(_))) => {
                error_reply(code::CREATE_SNAPSHOT_ERROR, libc::EEXIST as u32, "snapshot already exists")
            }
            Err(Error::InvalidArgument(msg)) => error_reply(code::CREATE_SNAPSHOT_ERROR, libc::EINVAL as u32, msg),
            Err(err) => {
                warn!("SERVER: create snapshot {}: {}", request.snap, err);
                error_reply(code::CREATE_SNAPSHOT_ERROR, libc::EIO as u32, "unknown snapshot create error")
            }
        };
        out.send(client, reply);
        Ok(())
    }

    pub(super) async fn delete(&mut self, client: ClientId, message: &Message, out: &mut Outcome) -> Result<()> {
        let request: SnapTag = message.parse()?;
        let reply = match self.store.delete_snapshot(request.snap).await {
            Ok(()) => {
                self.store.save_sb_check().await?;
                Message::empty(code::DELETE_SNAPSHOT_OK)
            }
            Err(Error::Snapshot(SnapshotError::NotFound(_))) => {
                error_reply(code::DELETE_SNAPSHOT_ERROR, libc::EINVAL as u32, "snapshot doesn't exist")
            }
            Err(Error::Snapshot(SnapshotError::InUse(_))) => error_reply(
                code::DELETE_SNAPSHOT_ERROR,
                libc::EINVAL as u32,
                "snapshot has non-zero usecount",
            ),
            Err(err) => {
                warn!("SERVER: delete snapshot {}: {}", request.snap, err);
                error_reply(code::DELETE_SNAPSHOT_ERROR, libc::EIO as u32, "fail to delete snapshot")
            }
        };
        out.send(client, reply);
        Ok(())
    }

    fn snapinfo(&self, index: usize) -> SnapInfo {
        let snap = &self.store.snapshots()[index];
        SnapInfo {
            snap: snap.tag,
            prio: snap.prio,
            usecnt: self.store.usecount(snap),
            ctime: snap.ctime as u64,
        }
    }

    pub(super) fn list(&mut self, client: ClientId, out: &mut Outcome) -> Result<()> {
        let snapshots = (0..self.store.snapshots().len())
            .map(|index| self.snapinfo(index))
            .collect();
        out.send(client, Message::new(code::SNAPSHOT_LIST, &SnapshotList { snapshots }));
        Ok(())
    }

    pub(super) async fn priority(&mut self, client: ClientId, message: &Message, out: &mut Outcome) -> Result<()> {
        let request: PriorityInfo = message.parse()?;
        let reply = if request.snap == ORIGIN_TAG {
            error_reply(
                code::PRIORITY_ERROR,
                errcode::ERROR_INVALID_SNAPSHOT,
                "Can not set priority for origin",
            )
        } else {
            match self.store.set_priority(request.snap, request.prio) {
                Ok(prio) => {
                    self.store.save_sb_check().await?;
                    Message::new(code::PRIORITY_OK, &PriorityOk { prio })
                }
                Err(_) => error_reply(
                    code::PRIORITY_ERROR,
                    errcode::ERROR_INVALID_SNAPSHOT,
                    format!("Snapshot tag {} is not valid", request.snap),
                ),
            }
        };
        out.send(client, reply);
        Ok(())
    }

    pub(super) async fn usecount(&mut self, client: ClientId, message: &Message, out: &mut Outcome) -> Result<()> {
        let request: UsecountInfo = message.parse()?;
        let reply = if request.snap == ORIGIN_TAG {
            error_reply(
                code::USECOUNT_ERROR,
                errcode::ERROR_INVALID_SNAPSHOT,
                "Setting the usecount of the origin.",
            )
        } else {
            match self.store.adjust_usecount(request.snap, request.usecnt_dev) {
                Ok(usecount) => {
                    self.store.save_sb_check().await?;
                    Message::new(code::USECOUNT_OK, &UsecountOk { usecount })
                }
                Err(Error::Snapshot(SnapshotError::UsecountOverflow(_))) => {
                    error_reply(code::USECOUNT_ERROR, errcode::ERROR_USECOUNT, "Usecount overflow.")
                }
                Err(Error::Snapshot(SnapshotError::UsecountUnderflow(_))) => {
                    error_reply(code::USECOUNT_ERROR, errcode::ERROR_USECOUNT, "Usecount underflow.")
                }
                Err(_) => error_reply(
                    code::USECOUNT_ERROR,
                    errcode::ERROR_INVALID_SNAPSHOT,
                    format!("Snapshot tag {} is not valid", request.snap),
                ),
            }
        };
        out.send(client, reply);
        Ok(())
    }

    pub(super) async fn stream_changelist(
        &mut self,
        client: ClientId,
        message: &Message,
        out: &mut Outcome,
    ) -> Result<()> {
        let request: StreamChangelist = message.parse()?;
        info!(
            "SERVER: changelist from {} to {}",
            request.snap1, request.snap2
        );
        let reply = match self.store.gen_changelist(request.snap1, request.snap2).await {
            Ok(list) => Message::new(
                code::STREAM_CHANGELIST_OK,
                &ChangelistStream {
                    chunksize_bits: list.chunksize_bits,
                    chunks: list.chunks,
                },
            ),
            Err(Error::Snapshot(SnapshotError::NotFound(tag) | SnapshotError::Squashed(tag))) => {
                let msg = if tag == request.snap1 {
                    "source snapshot does not exist"
                } else {
                    "destination snapshot does not exist"
                };
                error_reply(code::STREAM_CHANGELIST_ERROR, libc::EINVAL as u32, msg)
            }
            Err(err) => return Err(err),
        };
        out.send(client, reply);
        Ok(())
    }

    pub(super) async fn status(&mut self, client: ClientId, message: &Message, out: &mut Outcome) -> Result<()> {
        message.parse_exact::<SnapTag>()?;
        let table = self.store.sharing_table().await?;
        let count = self.store.snapshots().len();
        let details = (0..count)
            .map(|index| {
                let snap = self.store.snapshots()[index];
                let sharing = if snap.is_squashed() {
                    let mut row = vec![0; count];
                    row[0] = u64::MAX;
                    row
                } else {
                    table[snap.bit as usize][..count].to_vec()
                };
                SnapshotDetails {
                    info: self.snapinfo(index),
                    sharing,
                }
            })
            .collect();

        let meta = self.store.metadata_usage();
        let store = self.store.snapdata_usage();
        // snapshot copies share the metadata space in a combined store
        let data = if self.store.superblock().is_combined() { meta } else { store };
        let reply = StatusReply {
            ctime: self.store.superblock().create_time,
            write_density: data.density(),
            meta: SpaceStatus {
                chunksize_bits: meta.chunksize_bits,
                total: meta.total,
                free: meta.free,
            },
            store: SpaceStatus {
                chunksize_bits: store.chunksize_bits,
                total: store.total,
                free: store.free,
            },
            details,
        };
        out.send(client, Message::new(code::STATUS_OK, &reply));
        self.store.selfcheck_freespace().await
    }

    pub(super) fn snapshot_state(&mut self, client: ClientId, message: &Message, out: &mut Outcome) -> Result<()> {
        let reply = match message.parse_exact::<SnapTag>() {
            Ok(request) => Message::new(
                code::SNAPSHOT_STATE,
                &StateMessage {
                    snap: request.snap,
                    state: self.store.snapshot_state(request.snap) as u32,
                },
            ),
            Err(_) => error_reply(code::GENERIC_ERROR, libc::EINVAL as u32, "state_request has wrong length"),
        };
        out.send(client, reply);
        Ok(())
    }

    pub(super) fn snapshot_sectors(&mut self, client: ClientId, message: &Message, out: &mut Outcome) -> Result<()> {
        let request: SnapTag = message.parse()?;
        let count = if request.snap == ORIGIN_TAG {
            self.store.superblock().orgsectors
        } else {
            match self.store.snapshot(request.snap) {
                Some(snap) if !snap.is_squashed() => snap.sectors,
                _ => 0,
            }
        };
        let reply = if count == 0 {
            error_reply(
                code::GENERIC_ERROR,
                libc::EINVAL as u32,
                format!("Snapshot {} is not valid", request.snap),
            )
        } else {
            Message::new(
                code::SNAPSHOT_SECTORS,
                &SnapshotSectors {
                    snap: request.snap,
                    count,
                },
            )
        };
        out.send(client, reply);
        Ok(())
    }

    /// Apply new device sizes and answer with the sizes now in effect
    pub(super) async fn resize(&mut self, client: ClientId, message: &Message, out: &mut Outcome) -> Result<()> {
        let mut request: ResizeRequest = message.parse()?;
        let combined = self.store.layout().combined;
        if combined {
            if request.snapsize != 0 && request.metasize != 0 && request.snapsize != request.metasize {
                out.send(
                    client,
                    error_reply(
                        code::GENERIC_ERROR,
                        libc::EINVAL as u32,
                        "snapshot device and metadata device are the same, can't resize them to two values",
                    ),
                );
                return Ok(());
            }
            if request.metasize == 0 {
                request.metasize = request.snapsize;
            }
        }

        if let Err(err) = self
            .store
            .change_device_sizes(request.orgsize, request.snapsize, request.metasize)
            .await
        {
            out.send(client, error_reply(code::GENERIC_ERROR, libc::EINVAL as u32, err.to_string()));
            return Ok(());
        }
        self.store.check_freespace().await?;
        self.store.save_sb_check().await?;

        let image = self.store.superblock();
        let metasize = image.metadata.chunks << image.metadata.allocsize_bits;
        let snapsize = if combined {
            metasize
        } else {
            image.snapdata.chunks << image.snapdata.allocsize_bits
        };
        let reply = ResizeRequest {
            orgsize: image.orgsectors << crate::blockdev::SECTOR_BITS,
            snapsize,
            metasize,
        };
        out.send(client, Message::new(code::RESIZE, &reply));
        Ok(())
    }

    pub(super) async fn dump_tree_range(&mut self, message: &Message) -> Result<()> {
        let request: DumpTreeRange = message.parse()?;
        self.store.dump_tree_range(request.start, request.finish).await
    }

    pub(super) fn protocol_error(&mut self, client: ClientId, message: &Message) {
        match message.parse::<ProtocolErrorReply>() {
            Ok(err) => warn!(
                "SERVER: protocol error from client {}: error {:#x}, culprit {:#x}: {}",
                client,
                err.err,
                err.culprit,
                if err.msg.is_empty() { "No message sent" } else { &err.msg }
            ),
            Err(_) => warn!("SERVER: protocol error from client {}, no information", client),
        }
    }

    pub(super) fn unknown_message(&mut self, client: ClientId, message: &Message, out: &mut Outcome) {
        warn!(
            "SERVER: unknown message code {:#x}, length {} from client {}",
            message.code,
            message.body.len(),
            client
        );
        out.send(
            client,
            Message::new(
                code::PROTOCOL_ERROR,
                &ProtocolErrorReply {
                    err: errcode::ERROR_UNKNOWN_MESSAGE,
                    culprit: message.code,
                    msg: "Server received unknown message".into(),
                },
            ),
        );
    }
}
