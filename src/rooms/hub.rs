//! Connection hub: the single owner of room membership.
//!
//! The hub runs as one task. Everything else talks to it through a
//! [`HubHandle`], which turns each request into a [`Command`] on a single
//! channel. Because the loop is the only code that ever touches the room map,
//! membership changes are totally ordered and need no lock. Reads such as
//! occupancy go through the same channel and get their answer on a oneshot.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::ChatId;
use super::msg::ChatFrame;
use crate::error::{ChatError, ChatResult};

/// Maximum number of live participants in one room.
pub const ROOM_CAPACITY: usize = 2;

/// Process-unique id of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Everything the hub needs to admit a client.
///
/// `outbound` is the only sender for the client's queue. Once the hub drops
/// it, the write pump sees the queue close and shuts the socket.
#[derive(Debug)]
pub struct Registration {
    pub conn_id: ConnectionId,
    pub chat_id: ChatId,
    pub identity: String,
    pub outbound: mpsc::Sender<ChatFrame>,
}

#[derive(Debug)]
struct Member {
    conn_id: ConnectionId,
    outbound: mpsc::Sender<ChatFrame>,
}

type Room = HashMap<String, Member>;

enum Command {
    Register {
        registration: Registration,
        reply: oneshot::Sender<ChatResult<()>>,
    },
    Unregister {
        chat_id: ChatId,
        conn_id: ConnectionId,
    },
    Broadcast {
        origin: Option<ConnectionId>,
        frame: ChatFrame,
    },
    Occupancy {
        chat_id: ChatId,
        reply: oneshot::Sender<usize>,
    },
    Members {
        chat_id: ChatId,
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown,
}

/// The hub's control loop and the room registry it owns.
pub struct Hub {
    rooms: HashMap<ChatId, Room>,
    commands: mpsc::Receiver<Command>,
}

impl Hub {
    /// Create a hub and the handle used to reach it.
    ///
    /// The hub does nothing until [`Hub::run`] is polled.
    pub fn new(buffer: usize) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(buffer);
        let hub = Self {
            rooms: HashMap::new(),
            commands: rx,
        };
        let handle = HubHandle {
            commands: tx,
            next_conn: Arc::new(AtomicU64::new(1)),
        };
        (hub, handle)
    }

    /// Process commands until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        info!("connection hub started");

        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Register {
                    registration,
                    reply,
                } => {
                    let result = self.register(registration);
                    let _ = reply.send(result);
                }
                Command::Unregister { chat_id, conn_id } => self.unregister(chat_id, conn_id),
                Command::Broadcast { origin, frame } => self.broadcast(origin, frame),
                Command::Occupancy { chat_id, reply } => {
                    let _ = reply.send(self.rooms.get(&chat_id).map_or(0, HashMap::len));
                }
                Command::Members { chat_id, reply } => {
                    let mut members: Vec<String> = self
                        .rooms
                        .get(&chat_id)
                        .map(|room| room.keys().cloned().collect())
                        .unwrap_or_default();
                    members.sort();
                    let _ = reply.send(members);
                }
                Command::Shutdown => break,
            }
        }

        // Dropping the rooms drops every outbound sender, which closes every
        // client's queue.
        let open = self.rooms.len();
        self.rooms.clear();
        info!(open_rooms = open, "connection hub stopped");
    }

    fn register(&mut self, registration: Registration) -> ChatResult<()> {
        let Registration {
            conn_id,
            chat_id,
            identity,
            outbound,
        } = registration;

        // A full room refuses everyone, including an identity it already
        // holds, and stays exactly as it was.
        if self.rooms.get(&chat_id).map_or(0, HashMap::len) >= ROOM_CAPACITY {
            info!(chat_id, client = %identity, %conn_id, "Rejecting client, chat is full");
            return Err(ChatError::CapacityExceeded { chat_id });
        }

        let room = self.rooms.entry(chat_id).or_default();
        if let Some(stale) = room.remove(&identity) {
            info!(
                chat_id,
                client = %identity,
                stale = %stale.conn_id,
                %conn_id,
                "Replacing stale connection"
            );
        }

        room.insert(identity.clone(), Member { conn_id, outbound });
        info!(
            chat_id,
            client = %identity,
            %conn_id,
            members = room.len(),
            "Client connected"
        );
        Ok(())
    }

    fn unregister(&mut self, chat_id: ChatId, conn_id: ConnectionId) {
        let Some(room) = self.rooms.get_mut(&chat_id) else {
            debug!(chat_id, %conn_id, "Unregister for unknown chat ignored");
            return;
        };

        let identity = room
            .iter()
            .find(|(_, member)| member.conn_id == conn_id)
            .map(|(identity, _)| identity.clone());

        match identity {
            Some(identity) => {
                room.remove(&identity);
                info!(chat_id, client = %identity, %conn_id, "Client disconnected");
            }
            None => debug!(chat_id, %conn_id, "Client already unregistered"),
        }

        if room.is_empty() {
            self.rooms.remove(&chat_id);
            debug!(chat_id, "Chat closed");
        }
    }

    fn broadcast(&mut self, origin: Option<ConnectionId>, frame: ChatFrame) {
        let chat_id = frame.chat_id;
        let Some(room) = self.rooms.get_mut(&chat_id) else {
            debug!(chat_id, "No live members for broadcast");
            return;
        };

        let mut evicted = Vec::new();
        for (identity, member) in room.iter() {
            if Some(member.conn_id) == origin {
                continue;
            }
            match member.outbound.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(chat_id, client = %identity, conn_id = %member.conn_id, "Evicting slow consumer");
                    evicted.push(identity.clone());
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(chat_id, client = %identity, conn_id = %member.conn_id, "Outbound queue gone");
                    evicted.push(identity.clone());
                }
            }
        }

        for identity in evicted {
            room.remove(&identity);
        }
        if room.is_empty() {
            self.rooms.remove(&chat_id);
        }
    }
}

/// Cloneable entry point to a running [`Hub`].
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
    next_conn: Arc<AtomicU64>,
}

impl HubHandle {
    /// Build a hub and spawn its loop on the current runtime.
    pub fn spawn(buffer: usize) -> Self {
        let (hub, handle) = Hub::new(buffer);
        tokio::spawn(hub.run());
        handle
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed))
    }

    /// Admit a client to its room, or refuse it if the room is full.
    ///
    /// Capacity is checked inside the hub loop, so two connections racing
    /// for the last seat can never both get in.
    pub async fn register(&self, registration: Registration) -> ChatResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Register {
            registration,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ChatError::HubClosed)?
    }

    /// Remove a connection from its room. Unknown connections are ignored.
    pub async fn unregister(&self, chat_id: ChatId, conn_id: ConnectionId) {
        if self
            .send(Command::Unregister { chat_id, conn_id })
            .await
            .is_err()
        {
            debug!(chat_id, %conn_id, "Hub closed before unregister");
        }
    }

    /// Deliver a frame to every member of `frame.chat_id` except `origin`.
    pub async fn broadcast(&self, origin: Option<ConnectionId>, frame: ChatFrame) -> ChatResult<()> {
        self.send(Command::Broadcast { origin, frame }).await
    }

    /// Number of live members in a room.
    pub async fn occupancy(&self, chat_id: ChatId) -> ChatResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Occupancy { chat_id, reply }).await?;
        rx.await.map_err(|_| ChatError::HubClosed)
    }

    /// Identities of the live members in a room, sorted.
    pub async fn members(&self, chat_id: ChatId) -> ChatResult<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Members { chat_id, reply }).await?;
        rx.await.map_err(|_| ChatError::HubClosed)
    }

    /// Stop the hub, closing every client's queue.
    pub async fn shutdown(&self) {
        let _ = self.send(Command::Shutdown).await;
    }

    async fn send(&self, command: Command) -> ChatResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ChatError::HubClosed)
    }
}
