//! End-to-end tests: a real server on a random port, tungstenite clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use heartline::config::Config;
use heartline::rooms::{CHAT_FULL_NOTICE, Presence};
use heartline::store::{MessageStore, SqliteMessageStore};
use heartline::{AppState, build_router};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    store: Arc<SqliteMessageStore>,
}

impl TestServer {
    async fn start() -> Self {
        let store = Arc::new(SqliteMessageStore::in_memory().await.unwrap());
        let state = AppState::start(Config::default(), store.clone());
        let app = build_router(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state, store }
    }

    async fn connect(&self, chat_id: i64, username: &str) -> Socket {
        let url = format!("ws://{}/ws/{}/{}", self.addr, chat_id, username);
        let (socket, _) = connect_async(url).await.expect("websocket handshake");
        socket
    }

    /// Connect and wait until the hub has admitted the client.
    async fn join(&self, chat_id: i64, username: &str) -> Socket {
        let socket = self.connect(chat_id, username).await;
        self.wait_for(chat_id, |members| members.iter().any(|m| m == username))
            .await;
        socket
    }

    async fn wait_for(&self, chat_id: i64, done: impl Fn(&[String]) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let members = self.state.hub.members(chat_id).await.unwrap();
                if done(&members) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("room never reached the expected membership");
    }
}

async fn send_json(socket: &mut Socket, value: Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn next_json(socket: &mut Socket) -> Value {
    let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("socket closed")
        .expect("socket error");
    match message {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_message_reaches_peer_once_persisted() {
    let server = TestServer::start().await;
    let mut alice = server.join(7, "alice").await;
    let mut bob = server.join(7, "bob").await;

    send_json(
        &mut alice,
        json!({"chat_id": 7, "sender_id": 1, "receiver_id": 2, "content": "hi"}),
    )
    .await;

    let received = next_json(&mut bob).await;
    assert_eq!(
        received,
        json!({"chat_id": 7, "sender_id": 1, "receiver_id": 2, "content": "hi"})
    );

    let stored = server.store.messages(7).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].sender_id, 1);
    assert_eq!(stored[0].receiver_id, 2);
    assert_eq!(stored[0].content, "hi");

    // The sender does not get an echo.
    let echo = tokio::time::timeout(Duration::from_millis(200), alice.next()).await;
    assert!(echo.is_err());
}

#[tokio::test]
async fn test_client_chat_id_is_ignored() {
    let server = TestServer::start().await;
    let mut alice = server.join(7, "alice").await;
    let mut bob = server.join(7, "bob").await;
    let mut mallory = server.join(99, "mallory").await;

    send_json(
        &mut alice,
        json!({"chat_id": 99, "sender_id": 1, "receiver_id": 2, "content": "psst"}),
    )
    .await;

    let received = next_json(&mut bob).await;
    assert_eq!(received["chat_id"], 7);
    assert_eq!(received["content"], "psst");
    assert!(server.store.messages(99).await.unwrap().is_empty());

    let leaked = tokio::time::timeout(Duration::from_millis(200), mallory.next()).await;
    assert!(leaked.is_err());
}

#[tokio::test]
async fn test_third_participant_gets_chat_full() {
    let server = TestServer::start().await;
    let _alice = server.join(7, "alice").await;
    let _bob = server.join(7, "bob").await;

    let mut carol = server.connect(7, "carol").await;
    let notice = tokio::time::timeout(Duration::from_secs(5), carol.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(notice, Message::Text(CHAT_FULL_NOTICE.into()));

    let closing = tokio::time::timeout(Duration::from_secs(5), carol.next())
        .await
        .unwrap();
    assert!(matches!(closing, Some(Ok(Message::Close(_))) | None));

    assert_eq!(server.state.hub.members(7).await.unwrap(), vec!["alice", "bob"]);
}

#[tokio::test]
async fn test_disconnect_frees_seat_and_room() {
    let server = TestServer::start().await;
    let alice = server.join(7, "alice").await;
    let mut bob = server.join(7, "bob").await;

    drop(alice);
    server.wait_for(7, |members| members == ["bob"]).await;

    bob.close(None).await.unwrap();
    server.wait_for(7, |members| members.is_empty()).await;
    assert_eq!(server.state.hub.occupancy(7).await.unwrap(), 0);

    // The freed room admits newcomers again.
    let _carol = server.join(7, "carol").await;
}

#[tokio::test]
async fn test_malformed_frame_disconnects_sender() {
    let server = TestServer::start().await;
    let mut alice = server.join(7, "alice").await;
    let _bob = server.join(7, "bob").await;

    alice
        .send(Message::Text("this is not json".into()))
        .await
        .unwrap();

    server.wait_for(7, |members| members == ["bob"]).await;
    assert!(server.store.messages(7).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reply_marks_peer_messages_read() {
    let server = TestServer::start().await;
    let mut alice = server.join(7, "alice").await;
    let mut bob = server.join(7, "bob").await;

    // Bob writes while alice is away, so his message is stored unread.
    drop(alice);
    server.wait_for(7, |members| members == ["bob"]).await;
    send_json(
        &mut bob,
        json!({"sender_id": 2, "receiver_id": 1, "content": "are you there?"}),
    )
    .await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.store.messages(7).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(!server.store.messages(7).await.unwrap()[0].is_read);

    // Alice comes back and answers with bob online.
    alice = server.join(7, "alice").await;
    send_json(
        &mut alice,
        json!({"sender_id": 1, "receiver_id": 2, "content": "yes!"}),
    )
    .await;
    assert_eq!(next_json(&mut bob).await["content"], "yes!");

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let messages = server.store.messages(7).await.unwrap();
            if messages.iter().all(|m| m.is_read) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bob's message was never marked read");
}

#[tokio::test]
async fn test_presence_and_history_endpoints() {
    let server = TestServer::start().await;
    let mut alice = server.join(7, "alice").await;
    let mut bob = server.join(7, "bob").await;

    send_json(
        &mut alice,
        json!({"sender_id": 1, "receiver_id": 2, "content": "hi"}),
    )
    .await;
    next_json(&mut bob).await;

    let response = reqwest::get(format!("http://{}/chats/7/presence", server.addr))
        .await
        .unwrap();
    assert!(response.status().is_success());
    let presence = response.json::<Presence>().await.unwrap();
    assert_eq!(presence.chat_id, 7);
    assert_eq!(presence.members, vec!["alice", "bob"]);

    let response = reqwest::get(format!("http://{}/chats/7/messages", server.addr))
        .await
        .unwrap();
    assert!(response.status().is_success());
    let history = response.json::<Vec<Value>>().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["content"], "hi");
    assert_eq!(history[0]["is_read"], true);
}

/// Bob writes alone, so his message is stored unread.
async fn store_unread_from_bob(server: &TestServer) {
    let mut bob = server.join(7, "bob").await;
    send_json(
        &mut bob,
        json!({"sender_id": 2, "receiver_id": 1, "content": "are you there?"}),
    )
    .await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.store.messages(7).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(!server.store.messages(7).await.unwrap()[0].is_read);
}

#[tokio::test]
async fn test_history_read_by_peer_marks_messages_read() {
    let server = TestServer::start().await;
    store_unread_from_bob(&server).await;

    let response = reqwest::get(format!("http://{}/chats/7/messages?reader_id=1", server.addr))
        .await
        .unwrap();
    assert!(response.status().is_success());
    let history = response.json::<Vec<Value>>().await.unwrap();
    assert_eq!(history.len(), 1);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !server.store.messages(7).await.unwrap()[0].is_read {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("opening the history never marked bob's message read");
}

#[tokio::test]
async fn test_history_read_by_sender_leaves_messages_unread() {
    let server = TestServer::start().await;
    store_unread_from_bob(&server).await;

    for url in [
        format!("http://{}/chats/7/messages?reader_id=2", server.addr),
        format!("http://{}/chats/7/messages", server.addr),
    ] {
        let response = reqwest::get(url).await.unwrap();
        assert!(response.status().is_success());
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!server.store.messages(7).await.unwrap()[0].is_read);
}

#[tokio::test]
async fn test_shutdown_closes_live_sockets() {
    let server = TestServer::start().await;
    let mut alice = server.join(7, "alice").await;

    server.state.hub.shutdown().await;

    let closing = tokio::time::timeout(Duration::from_secs(5), alice.next())
        .await
        .expect("socket stayed open after shutdown");
    assert!(matches!(closing, Some(Ok(Message::Close(_))) | Some(Err(_)) | None));
}
