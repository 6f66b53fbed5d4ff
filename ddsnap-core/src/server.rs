//! Unix socket front end of the engine
//!
//! Every connection gets a reader task and a writer task. Readers forward
//! framed messages to a single engine task over a channel; the engine task
//! owns the [`Engine`] and routes its replies to the writers, so all store
//! mutation stays on one task.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::{Engine, Reply};
use crate::error::{Error, Result};
use crate::locks::ClientId;
use crate::protocol::{read_message, write_message, Message, MAX_BODY};
use crate::store::EngineConfig;

/// Settings of a running server, loadable from a JSON file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path of the listening socket
    pub socket: PathBuf,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl ServerConfig {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            engine: EngineConfig::default(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&text).map_err(|err| {
            Error::InvalidArgument(format!("{}: {}", path.as_ref().display(), err))
        })
    }
}

enum Event {
    Connected(ClientId, Connection),
    Received(ClientId, Message),
    Closed(ClientId),
}

struct Connection {
    replies: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

pub struct Server {
    engine: Engine,
    listener: UnixListener,
    socket: PathBuf,
}

impl Server {
    /// Bind the socket, replacing a stale socket file left by a previous run
    pub fn bind(engine: Engine, socket: impl Into<PathBuf>) -> Result<Self> {
        let socket = socket.into();
        match std::fs::remove_file(&socket) {
            Ok(()) => debug!("SERVER: removed stale socket {}", socket.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let listener = UnixListener::bind(&socket)?;
        info!("SERVER: listening on {}", socket.display());
        Ok(Self {
            engine,
            listener,
            socket,
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Serve until a client sends SHUTDOWN_SERVER or `cancel` fires, then
    /// shut the store down cleanly. A store failure stops the server at once
    /// and leaves the store for journal replay.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let Self {
            mut engine,
            listener,
            socket,
        } = self;
        let (events, mut incoming) = mpsc::unbounded_channel();
        let accepting = cancel.child_token();
        let acceptor = tokio::spawn(accept_loop(listener, events, accepting.clone()));

        let mut clients: HashMap<ClientId, Connection> = HashMap::new();
        let result = loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("SERVER: cancelled");
                    break Ok(());
                }
                event = incoming.recv() => event,
            };
            let Some(event) = event else {
                break Ok(());
            };
            match event {
                Event::Connected(client, connection) => {
                    engine.connect(client);
                    clients.insert(client, connection);
                }
                Event::Closed(client) => {
                    if let Some(connection) = clients.remove(&client) {
                        connection.cancel.cancel();
                    }
                    let ready = engine.disconnect(client);
                    deliver(&clients, ready);
                }
                Event::Received(client, message) => match engine.handle(client, message).await {
                    Ok(outcome) => {
                        deliver(&clients, outcome.replies);
                        if outcome.disconnect {
                            if let Some(connection) = clients.remove(&client) {
                                connection.cancel.cancel();
                            }
                            let ready = engine.disconnect(client);
                            deliver(&clients, ready);
                        }
                        if outcome.shutdown {
                            break Ok(());
                        }
                    }
                    Err(err) => {
                        error!("SERVER: store failure: {}", err);
                        break Err(err);
                    }
                },
            }
        };

        accepting.cancel();
        for connection in clients.into_values() {
            connection.cancel.cancel();
        }
        let _ = acceptor.await;
        if let Err(err) = std::fs::remove_file(&socket) {
            warn!("SERVER: unable to remove {}: {}", socket.display(), err);
        }
        result?;
        engine.shutdown().await?;
        info!("SERVER: exiting");
        Ok(())
    }
}

fn deliver(clients: &HashMap<ClientId, Connection>, replies: Vec<Reply>) {
    for (client, message) in replies {
        match clients.get(&client) {
            Some(connection) => {
                if connection.replies.send(message).is_err() {
                    debug!("SERVER: client {} is gone", client);
                }
            }
            None => debug!("SERVER: dropping reply for client {}", client),
        }
    }
}

async fn accept_loop(
    listener: UnixListener,
    events: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
) {
    let mut next_client: ClientId = 1;
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(err) => {
                    warn!("SERVER: accept failed: {}", err);
                    continue;
                }
            },
        };
        let client = next_client;
        next_client += 1;
        if !spawn_connection(client, stream, events.clone(), cancel.child_token()) {
            return;
        }
    }
}

/// Register the connection with the engine task, then start its reader and
/// writer. Returns false once the engine task is gone.
fn spawn_connection(
    client: ClientId,
    stream: UnixStream,
    events: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
) -> bool {
    let (mut reader, mut writer) = stream.into_split();
    let (replies, mut outgoing) = mpsc::unbounded_channel::<Message>();
    let connection = Connection {
        replies,
        cancel: cancel.clone(),
    };
    if events.send(Event::Connected(client, connection)).is_err() {
        return false;
    }

    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = writer_cancel.cancelled() => break,
                message = outgoing.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            if let Err(err) = write_message(&mut writer, &message).await {
                warn!("SERVER: write to client {} failed: {}", client, err);
                writer_cancel.cancel();
                break;
            }
        }
    });

    let reader_cancel = cancel;
    tokio::spawn(async move {
        loop {
            let read = tokio::select! {
                _ = reader_cancel.cancelled() => break,
                read = read_message(&mut reader, MAX_BODY) => read,
            };
            match read {
                Ok(Some(message)) => {
                    if events.send(Event::Received(client, message)).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("SERVER: client {}: {}", client, err);
                    break;
                }
            }
        }
        let _ = events.send(Event::Closed(client));
    });
    true
}
