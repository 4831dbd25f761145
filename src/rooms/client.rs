//! One live connection and the two pumps that bridge it to the hub.

use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::ChatId;
use super::hub::{ConnectionId, HubHandle, ROOM_CAPACITY, Registration};
use super::msg::{ChatFrame, NewMessage, StoredMessage};
use crate::AppState;
use crate::error::{ChatError, ChatResult};
use crate::tasks::{ReadMessages, Task};

/// Server-side actor for one accepted connection.
///
/// A client is bound to one room for its whole life. Its outbound queue is
/// fed only by the hub.
#[derive(Debug)]
pub struct Client {
    conn_id: ConnectionId,
    chat_id: ChatId,
    identity: String,
    outbound: mpsc::Receiver<ChatFrame>,
}

impl Client {
    /// Create a client and the registration that hands its queue to the hub.
    pub fn new(
        hub: &HubHandle,
        chat_id: ChatId,
        identity: String,
        queue: usize,
    ) -> (Self, Registration) {
        let (tx, rx) = mpsc::channel(queue);
        let conn_id = hub.next_connection_id();
        let registration = Registration {
            conn_id,
            chat_id,
            identity: identity.clone(),
            outbound: tx,
        };
        let client = Self {
            conn_id,
            chat_id,
            identity,
            outbound: rx,
        };
        (client, registration)
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn into_pumps(self, state: AppState) -> (ReadPump, WritePump) {
        let write = WritePump {
            conn_id: self.conn_id,
            chat_id: self.chat_id,
            hub: state.hub.clone(),
            outbound: self.outbound,
        };
        let read = ReadPump {
            conn_id: self.conn_id,
            chat_id: self.chat_id,
            identity: self.identity,
            sender_id: None,
            state,
        };
        (read, write)
    }
}

/// Reads frames off the socket, persists them and hands them to the hub.
pub struct ReadPump {
    conn_id: ConnectionId,
    chat_id: ChatId,
    identity: String,
    /// Bound by the first frame; every later frame must carry the same id.
    sender_id: Option<i64>,
    state: AppState,
}

impl ReadPump {
    /// Run until the peer goes away or a frame cannot be handled, then
    /// unregister. Returns why the pump stopped.
    pub async fn run<S>(mut self, mut stream: S) -> ChatResult<()>
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        let reason = loop {
            let message = match stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(err)) => break Err(ChatError::Connection(err)),
                None => break Ok(()),
            };

            let frame = match message {
                Message::Text(_) | Message::Binary(_) => match ChatFrame::decode(&message) {
                    Ok(frame) => frame,
                    Err(err) => break Err(err),
                },
                Message::Close(_) => break Ok(()),
                Message::Ping(_) | Message::Pong(_) => continue,
            };

            if let Err(err) = self.deliver(frame).await {
                break Err(err);
            }
        };

        self.state.hub.unregister(self.chat_id, self.conn_id).await;
        reason
    }

    /// Persist, then broadcast. A frame that fails to persist is never sent.
    async fn deliver(&mut self, frame: ChatFrame) -> ChatResult<()> {
        let frame = frame.stamped(self.chat_id);
        self.bind_sender(frame.sender_id)?;
        debug!(
            chat_id = self.chat_id,
            client = %self.identity,
            conn_id = %self.conn_id,
            "Received message"
        );

        let peer_present = self.state.hub.occupancy(self.chat_id).await? >= ROOM_CAPACITY;
        let previous = if peer_present {
            self.previous_message().await
        } else {
            None
        };

        self.state
            .store
            .append(&NewMessage::from_frame(&frame, peer_present))
            .await?;

        if let Some(previous) = previous {
            self.notify_read(&previous, &frame);
        }

        self.state.hub.broadcast(Some(self.conn_id), frame).await
    }

    fn bind_sender(&mut self, claimed: i64) -> ChatResult<()> {
        match self.sender_id {
            Some(bound) if bound != claimed => Err(ChatError::SenderMismatch { bound, claimed }),
            Some(_) => Ok(()),
            None => {
                self.sender_id = Some(claimed);
                Ok(())
            }
        }
    }

    async fn previous_message(&self) -> Option<StoredMessage> {
        match self.state.store.last_message(self.chat_id).await {
            Ok(last) => last,
            Err(err) => {
                warn!(chat_id = self.chat_id, "Failed to load last message: {}", err);
                None
            }
        }
    }

    /// The writer is answering with the peer present, so the peer's earlier
    /// messages have been seen. Failures here never affect delivery.
    fn notify_read(&self, previous: &StoredMessage, frame: &ChatFrame) {
        if previous.sender_id == frame.sender_id {
            return;
        }

        let task = Task::ReadMessages(ReadMessages {
            chat_id: self.chat_id,
            user_id: previous.sender_id,
        });
        if let Err(err) = self.state.tasks.enqueue(task) {
            warn!(chat_id = self.chat_id, "Failed to enqueue read receipt: {}", err);
        }
    }
}

/// Drains the client's queue onto the socket.
pub struct WritePump {
    conn_id: ConnectionId,
    chat_id: ChatId,
    hub: HubHandle,
    outbound: mpsc::Receiver<ChatFrame>,
}

impl WritePump {
    /// Run until the hub closes the queue or a write fails, then close the
    /// socket. A failed write also unregisters the client.
    pub async fn run<W>(mut self, mut sink: W) -> ChatResult<()>
    where
        W: Sink<Message, Error = axum::Error> + Unpin,
    {
        let reason = loop {
            let Some(frame) = self.outbound.recv().await else {
                break Ok(());
            };
            let message = match frame.encode() {
                Ok(message) => message,
                Err(err) => break Err(err),
            };
            if let Err(err) = sink.send(message).await {
                break Err(ChatError::Connection(err));
            }
        };

        if reason.is_err() {
            self.hub.unregister(self.chat_id, self.conn_id).await;
        }
        let _ = sink.close().await;
        reason
    }
}
