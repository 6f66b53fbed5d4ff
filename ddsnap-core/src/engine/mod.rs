//! Request engine
//!
//! The engine is the single owner of the snapshot store, the chunk lock
//! table and the per-connection sessions. Transports feed it one message at a
//! time and deliver whatever replies it returns, including replies owed to
//! other clients whose origin writes were waiting on a read lock.

mod handlers;

use std::collections::HashMap;

use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::locks::{ClientId, LockTable};
use crate::modules::snapshot::ORIGIN_TAG;
use crate::protocol::{code, code_name, Message, ProtocolError};
use crate::store::{Devices, EngineConfig, SnapStore};

/// A message for one client
pub type Reply = (ClientId, Message);

/// What the transport must do after a message was handled
#[derive(Debug, Default)]
pub struct Outcome {
    pub replies: Vec<Reply>,
    /// Drop the connection that sent the message
    pub disconnect: bool,
    /// Stop serving and shut the store down
    pub shutdown: bool,
}

impl Outcome {
    fn send(&mut self, client: ClientId, message: Message) {
        self.replies.push((client, message));
    }
}

/// What a connection identified itself as
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Session {
    /// Device id sent with IDENTIFY
    pub id: u64,
    /// Volume the client serves; `None` until it identifies
    pub snaptag: Option<u32>,
    /// Snapshot bit whose transient use count this session holds
    attached: Option<u8>,
}

pub struct Engine {
    store: SnapStore,
    locks: LockTable<Reply>,
    sessions: HashMap<ClientId, Session>,
}

impl Engine {
    pub fn new(store: SnapStore) -> Self {
        let locks = LockTable::new(store.config().lock_hash_bits);
        Self {
            store,
            locks,
            sessions: HashMap::new(),
        }
    }

    /// Activate the store on `devices` and wrap it
    pub async fn open(devices: Devices, config: EngineConfig) -> Result<Self> {
        let store = SnapStore::open(devices, config).await?;
        Ok(Self::new(store))
    }

    pub fn store(&self) -> &SnapStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SnapStore {
        &mut self.store
    }

    pub fn session(&self, client: ClientId) -> Option<&Session> {
        self.sessions.get(&client)
    }

    /// Origin write replies still waiting for snapshot reads to finish
    pub fn waiting_replies(&self) -> usize {
        self.locks.pending_count()
    }

    pub fn connect(&mut self, client: ClientId) {
        debug!("SERVER: client {} connected", client);
        self.sessions.insert(client, Session::default());
    }

    /// Forget a connection: release its read locks and its hold on a
    /// snapshot. Returns the replies those locks were holding back.
    pub fn disconnect(&mut self, client: ClientId) -> Vec<Reply> {
        debug!("SERVER: client {} disconnected", client);
        let ready = self.locks.release_client(client);
        if let Some(session) = self.sessions.remove(&client) {
            self.detach(&session);
        }
        ready
            .into_iter()
            .filter(|(to, _)| self.sessions.contains_key(to))
            .collect()
    }

    fn detach(&mut self, session: &Session) {
        let (Some(tag), Some(bit)) = (session.snaptag, session.attached) else {
            return;
        };
        // a squashed or replaced snapshot no longer carries this hold
        if self.store.snapshot(tag).map(|snap| snap.bit) == Some(bit) {
            self.store.detach_snapshot(tag);
        }
    }

    /// Handle one message from `client`.
    ///
    /// A message whose body is too short or too long for its code asks the
    /// transport to drop the client. Errors returned here are failures of
    /// the store itself and leave it in an unknown state.
    pub async fn handle(&mut self, client: ClientId, message: Message) -> Result<Outcome> {
        trace!(
            "SERVER: client {} sent {} ({} bytes)",
            client,
            code_name(message.code),
            message.body.len()
        );
        self.sessions.entry(client).or_default();
        let mut out = Outcome::default();
        let result = match message.code {
            code::QUERY_WRITE => self.query_write(client, &message, &mut out).await,
            code::QUERY_SNAPSHOT_READ => self.query_snapshot_read(client, &message, &mut out).await,
            code::FINISH_SNAPSHOT_READ => self.finish_snapshot_read(client, &message, &mut out),
            code::IDENTIFY => self.identify(client, &message, &mut out),
            code::CREATE_SNAPSHOT => self.create(client, &message, &mut out).await,
            code::DELETE_SNAPSHOT => self.delete(client, &message, &mut out).await,
            code::LIST_SNAPSHOTS => self.list(client, &mut out),
            code::PRIORITY => self.priority(client, &message, &mut out).await,
            code::USECOUNT => self.usecount(client, &message, &mut out).await,
            code::STREAM_CHANGELIST => self.stream_changelist(client, &message, &mut out).await,
            code::STATUS => self.status(client, &message, &mut out).await,
            code::REQUEST_SNAPSHOT_STATE => self.snapshot_state(client, &message, &mut out),
            code::REQUEST_SNAPSHOT_SECTORS => self.snapshot_sectors(client, &message, &mut out),
            code::RESIZE => self.resize(client, &message, &mut out).await,
            code::DUMP_TREE_RANGE => self.dump_tree_range(&message).await,
            code::START_SERVER => {
                info!("SERVER: server already active");
                Ok(())
            }
            code::SHUTDOWN_SERVER => {
                info!("SERVER: shutdown requested by client {}", client);
                out.shutdown = true;
                Ok(())
            }
            code::PROTOCOL_ERROR => {
                self.protocol_error(client, &message);
                Ok(())
            }
            _ => {
                self.unknown_message(client, &message, &mut out);
                Ok(())
            }
        };

        match result {
            Ok(()) => Ok(out),
            Err(Error::Protocol(err @ (ProtocolError::TooShort { .. } | ProtocolError::TooLong { .. }))) => {
                warn!("SERVER: {} (disconnecting client {})", err, client);
                out.disconnect = true;
                Ok(out)
            }
            Err(err) => Err(err),
        }
    }

    /// Flush everything and mark the store cleanly shut down
    pub async fn shutdown(mut self) -> Result<()> {
        let waiting = self.locks.pending_count();
        if waiting > 0 {
            warn!("SERVER: {} origin write replies never sent", waiting);
        }
        for session in std::mem::take(&mut self.sessions).into_values() {
            self.detach(&session);
        }
        self.store.cleanup().await
    }

    fn is_origin(session: &Session) -> bool {
        session.snaptag == Some(ORIGIN_TAG)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::Target;
    use crate::protocol::{
        errcode, ChunkRange, ErrorReply, Identify, IdentifyOk, ProtocolErrorReply, RwReply,
        RwRequest, SnapTag,
    };
    use crate::store::test_store;

    async fn engine() -> Engine {
        Engine::new(test_store().await)
    }

    fn identify(snap: u32, len: u64) -> Message {
        Message::new(
            code::IDENTIFY,
            &Identify {
                id: 7,
                snap,
                off: 0,
                len,
            },
        )
    }

    fn rw(code: u32, id: u32, chunk: u64, chunks: u32) -> Message {
        Message::new(
            code,
            &RwRequest {
                id,
                ranges: vec![ChunkRange { chunk, chunks }],
            },
        )
    }

    #[tokio::test]
    async fn test_identify_checks_volume_size() {
        let mut engine = engine().await;
        let sectors = engine.store().superblock().orgsectors;
        engine.connect(1);

        let out = engine.handle(1, identify(ORIGIN_TAG, sectors + 8)).await.unwrap();
        assert_eq!(out.replies[0].1.code, code::IDENTIFY_ERROR);
        let err = out.replies[0].1.parse::<ErrorReply>().unwrap();
        assert_eq!(err.err, errcode::ERROR_SIZE_MISMATCH);

        let out = engine.handle(1, identify(ORIGIN_TAG, sectors)).await.unwrap();
        assert_eq!(out.replies[0].1.code, code::IDENTIFY_OK);
        assert_eq!(out.replies[0].1.parse::<IdentifyOk>().unwrap().chunksize_bits, 12);
        assert_eq!(engine.session(1).unwrap().snaptag, Some(ORIGIN_TAG));
    }

    #[tokio::test]
    async fn test_failed_identify_takes_no_usecount() {
        let mut engine = engine().await;
        engine.store_mut().create_snapshot(3).await.unwrap();
        engine.connect(1);
        let out = engine.handle(1, identify(3, 1)).await.unwrap();
        assert_eq!(out.replies[0].1.code, code::IDENTIFY_ERROR);
        let snap = *engine.store().snapshot(3).unwrap();
        assert_eq!(engine.store().usecount(&snap), 0);
    }

    #[tokio::test]
    async fn test_disconnect_drops_transient_usecount() {
        let mut engine = engine().await;
        engine.store_mut().create_snapshot(3).await.unwrap();
        let sectors = engine.store().snapshot(3).unwrap().sectors;
        engine.connect(1);
        let out = engine.handle(1, identify(3, sectors)).await.unwrap();
        assert_eq!(out.replies[0].1.code, code::IDENTIFY_OK);
        let snap = *engine.store().snapshot(3).unwrap();
        assert_eq!(engine.store().usecount(&snap), 1);

        engine.disconnect(1);
        assert_eq!(engine.store().usecount(&snap), 0);
    }

    #[tokio::test]
    async fn test_origin_write_waits_for_snapshot_read() {
        let mut engine = engine().await;
        engine.store_mut().create_snapshot(5).await.unwrap();
        let sectors = engine.store().superblock().orgsectors;
        engine.connect(1);
        engine.connect(2);
        engine.handle(1, identify(ORIGIN_TAG, sectors)).await.unwrap();
        engine.handle(2, identify(5, sectors)).await.unwrap();

        let out = engine.handle(2, rw(code::QUERY_SNAPSHOT_READ, 1, 40, 2)).await.unwrap();
        assert_eq!(out.replies.len(), 1);
        assert_eq!(out.replies[0].1.code, code::SNAPSHOT_READ_ORIGIN_OK);

        let out = engine.handle(1, rw(code::QUERY_WRITE, 9, 41, 1)).await.unwrap();
        assert!(out.replies.is_empty());
        assert_eq!(engine.waiting_replies(), 1);

        let out = engine.handle(2, rw(code::FINISH_SNAPSHOT_READ, 1, 40, 2)).await.unwrap();
        assert_eq!(out.replies.len(), 1);
        let (to, reply) = &out.replies[0];
        assert_eq!(*to, 1);
        assert_eq!(reply.code, code::ORIGIN_WRITE_OK);
        assert_eq!(reply.parse::<RwRequest>().unwrap().id, 9);

        // the read now sees the preserved copy
        let out = engine.handle(2, rw(code::QUERY_SNAPSHOT_READ, 2, 41, 1)).await.unwrap();
        assert_eq!(out.replies[0].1.code, code::SNAPSHOT_READ_OK);
        let reply = RwReply::decode(&out.replies[0].1).unwrap();
        let (unique, exception) = engine
            .store_mut()
            .test_unique(41, Target::Snapshot(0))
            .await
            .unwrap();
        assert!(unique);
        assert_eq!(reply.ranges[0].exceptions, vec![exception.unwrap()]);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_messages() {
        let mut engine = engine().await;
        engine.connect(1);
        let out = engine.handle(1, Message::empty(0xbead0099)).await.unwrap();
        assert_eq!(out.replies[0].1.code, code::PROTOCOL_ERROR);
        let err = out.replies[0].1.parse::<ProtocolErrorReply>().unwrap();
        assert_eq!(err.err, errcode::ERROR_UNKNOWN_MESSAGE);
        assert_eq!(err.culprit, 0xbead0099);
        assert!(!out.disconnect);

        let out = engine.handle(1, Message::empty(code::CREATE_SNAPSHOT)).await.unwrap();
        assert!(out.disconnect);

        let status = Message {
            code: code::STATUS,
            body: vec![0; 8],
        };
        assert!(engine.handle(1, status).await.unwrap().disconnect);

        let out = engine
            .handle(1, Message::new(code::STATUS, &SnapTag { snap: 0 }))
            .await
            .unwrap();
        assert_eq!(out.replies[0].1.code, code::STATUS_OK);
    }

    #[tokio::test]
    async fn test_queries_need_identify() {
        let mut engine = engine().await;
        engine.connect(1);
        let out = engine.handle(1, rw(code::QUERY_WRITE, 1, 0, 1)).await.unwrap();
        assert_eq!(out.replies[0].1.code, code::PROTOCOL_ERROR);
        let err = out.replies[0].1.parse::<ProtocolErrorReply>().unwrap();
        assert_eq!(err.err, errcode::ERROR_REFUSED);
    }

    #[tokio::test]
    async fn test_shutdown_message() {
        let mut engine = engine().await;
        let out = engine.handle(1, Message::empty(code::SHUTDOWN_SERVER)).await.unwrap();
        assert!(out.shutdown);
        engine.shutdown().await.unwrap();
    }
}
