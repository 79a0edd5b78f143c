//! Integration tests for the relay room over the loopback TCP transport.
//!
//! These drive a full room end to end: real sockets, real frame codec, real
//! actor. Peers are plain `TcpSession`s whose event streams are consumed by
//! the test instead of a relay engine.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test relay_room -- --nocapture

use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

use conclave::{
    RelayRoom, RoomConfig, Session, SessionConnector, SessionEvent, SessionEvents, TcpSession,
    TcpSessionConnector, load_state, store_state,
};

/// One-time tracing initialization
static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("debug")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Spin up a room and an accept loop feeding it inbound sessions.
/// Returns the room handle and the address peers should dial.
async fn serve_room(config: RoomConfig) -> (RelayRoom, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr").to_string();

    let connector = Arc::new(TcpSessionConnector::new("relay".to_string()));
    let room = RelayRoom::new(connector, config);

    let accept_room = room.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let (session, events) = TcpSession::spawn(stream, "relay".to_string(), false);
            if accept_room.attach(session, events).await.is_err() {
                break;
            }
        }
    });

    (room, addr)
}

/// A test peer: one session into the room, events consumed by the test.
struct Peer {
    session: Arc<dyn Session>,
    events: SessionEvents,
    opened: bool,
}

impl Peer {
    /// Connect and swallow the transport's Ready + Authenticated preamble.
    async fn join(addr: &str, identity: &str) -> Self {
        let connector = TcpSessionConnector::new(identity.to_string());
        let (session, events) = connector
            .connect(addr)
            .await
            .expect("peer failed to connect");
        let mut peer = Self {
            session,
            events,
            opened: false,
        };
        assert_eq!(peer.next_event().await, SessionEvent::Ready);
        assert_eq!(
            peer.next_event().await,
            SessionEvent::Authenticated {
                identity: "relay".to_string()
            }
        );
        peer
    }

    async fn say(&mut self, text: &str) {
        if !self.opened {
            self.session
                .open_channel(conclave::INITIATING_CHAT_CHANNEL)
                .await
                .expect("open_channel failed");
            self.opened = true;
        }
        self.session
            .send_text(conclave::INITIATING_CHAT_CHANNEL, text)
            .await
            .expect("send_text failed");
    }

    async fn next_event(&mut self) -> SessionEvent {
        timeout(TEST_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream ended")
    }

    /// Next chat line, skipping transport bookkeeping events.
    async fn next_chat(&mut self) -> String {
        loop {
            if let SessionEvent::ChatMessage { text, .. } = self.next_event().await {
                return text;
            }
        }
    }

    /// Assert no chat line arrives within a grace period.
    async fn expect_silence(&mut self) {
        let got = timeout(Duration::from_millis(200), async {
            loop {
                if let Some(SessionEvent::ChatMessage { text, .. }) = self.events.recv().await {
                    return text;
                }
            }
        })
        .await;
        assert!(got.is_err(), "unexpected chat line: {:?}", got);
    }
}

async fn wait_for_sessions(room: &RelayRoom, n: usize) {
    timeout(TEST_TIMEOUT, async {
        while room.active_sessions().await != n {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session count not reached in time");
}

async fn wait_for_contacts(room: &RelayRoom, n: usize) {
    timeout(TEST_TIMEOUT, async {
        while room.known_contacts().await != n {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("contact count not reached in time");
}

// ============================================================================
// Fan-out
// ============================================================================

#[tokio::test]
async fn chat_fans_out_to_everyone_but_the_sender() {
    init_tracing();
    let (room, addr) = serve_room(RoomConfig::default()).await;

    let mut alice = Peer::join(&addr, "alice").await;
    let mut bob = Peer::join(&addr, "bob").await;
    let mut carol = Peer::join(&addr, "carol").await;
    wait_for_contacts(&room, 3).await;

    alice.say("hi").await;

    assert_eq!(bob.next_chat().await, "alice: hi");
    assert_eq!(carol.next_chat().await, "alice: hi");
    alice.expect_silence().await;
}

// ============================================================================
// Join/part notices
// ============================================================================

#[tokio::test]
async fn joins_and_parts_are_announced() {
    init_tracing();
    let config = RoomConfig {
        announce_join_part: true,
        ..Default::default()
    };
    let (room, addr) = serve_room(config).await;

    let mut alice = Peer::join(&addr, "alice").await;
    wait_for_contacts(&room, 1).await;

    let bob = Peer::join(&addr, "bob").await;
    assert_eq!(alice.next_chat().await, "bob joined the room.");

    bob.session.close().await;
    assert_eq!(alice.next_chat().await, "bob left the room.");
    wait_for_sessions(&room, 1).await;
    // Disconnecting does not forget the peer
    assert_eq!(room.known_contacts().await, 2);
}

// ============================================================================
// In-band commands
// ============================================================================

#[tokio::test]
async fn rename_is_relayed_and_confirmed() {
    init_tracing();
    let (room, addr) = serve_room(RoomConfig::default()).await;

    let mut alice = Peer::join(&addr, "alice").await;
    let mut bob = Peer::join(&addr, "bob").await;
    wait_for_contacts(&room, 2).await;

    alice.say("/nick Wonderland").await;

    assert_eq!(bob.next_chat().await, "alice: /nick Wonderland");
    assert_eq!(alice.next_chat().await, "You are now known as Wonderland");

    alice.say("hello again").await;
    assert_eq!(bob.next_chat().await, "Wonderland: hello again");
}

#[tokio::test]
async fn part_disconnects_and_forgets_the_sender() {
    init_tracing();
    let (room, addr) = serve_room(RoomConfig::default()).await;

    let mut alice = Peer::join(&addr, "alice").await;
    let mut bob = Peer::join(&addr, "bob").await;
    wait_for_contacts(&room, 2).await;

    bob.say("/part").await;

    // The relay closes bob's session and drops its roster entry
    loop {
        if bob.next_event().await == SessionEvent::Disconnected {
            break;
        }
    }
    wait_for_sessions(&room, 1).await;
    wait_for_contacts(&room, 1).await;
    alice.expect_silence().await;
}

// ============================================================================
// Offline replay
// ============================================================================

#[tokio::test]
async fn offline_peers_catch_up_on_reconnect() {
    init_tracing();
    let config = RoomConfig {
        replay_to_offline_contacts: true,
        ..Default::default()
    };
    let (room, addr) = serve_room(config).await;

    let mut alice = Peer::join(&addr, "alice").await;
    let bob = Peer::join(&addr, "bob").await;
    wait_for_contacts(&room, 2).await;

    bob.session.close().await;
    wait_for_sessions(&room, 1).await;

    alice.say("m1").await;
    alice.say("m2").await;

    // Wait until both lines are queued for bob
    timeout(TEST_TIMEOUT, async {
        loop {
            let state = room.snapshot().await.unwrap();
            let queued = state
                .contacts
                .iter()
                .find(|c| c.identity == "bob")
                .map_or(0, |c| c.pending.len());
            if queued == 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("lines never queued");

    let mut bob = Peer::join(&addr, "bob").await;
    assert_eq!(bob.next_chat().await, "alice: m1");
    assert_eq!(bob.next_chat().await, "alice: m2");

    let state = room.snapshot().await.unwrap();
    let contact = state.contacts.iter().find(|c| c.identity == "bob").unwrap();
    assert!(contact.pending.is_empty());
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn room_state_survives_a_restart() {
    init_tracing();
    let (room, addr) = serve_room(RoomConfig::default()).await;

    let _alice = Peer::join(&addr, "alice").await;
    let _bob = Peer::join(&addr, "bob").await;
    wait_for_contacts(&room, 2).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("room_state.json");

    let state = room.snapshot().await.unwrap();
    store_state(&path, &state).await.unwrap();
    let loaded = load_state(&path).await;
    assert_eq!(loaded, state);

    // A room restored from the document knows the same peers and tries to
    // re-invite them (the dials fail here; "alice" is not a dialable
    // address, which is fine - failed invites are not fatal).
    let connector = Arc::new(TcpSessionConnector::new("relay".to_string()));
    let restarted = RelayRoom::restore(connector, loaded);
    assert_eq!(restarted.known_contacts().await, 2);
}

// ============================================================================
// Outbound invites
// ============================================================================

#[tokio::test]
async fn operator_invite_dials_out_and_requests_contact() {
    init_tracing();
    let (room, _addr) = serve_room(RoomConfig::default()).await;

    // The invited "peer" is a bare listener accepting one session
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap().to_string();
    let accepted = tokio::spawn(async move {
        let (stream, _) = target.accept().await.unwrap();
        TcpSession::spawn(stream, "dave".to_string(), false)
    });

    room.invite(&target_addr, Some("Dave".to_string()))
        .await
        .expect("invite failed");

    let (_session, mut events) = accepted.await.unwrap();
    // Ready, then the relay's identity, then the contact request
    loop {
        match timeout(TEST_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for contact request")
            .expect("event stream ended")
        {
            SessionEvent::ContactRequest {
                channel,
                nickname,
                greeting,
            } => {
                assert_eq!(channel, conclave::CONTACT_REQUEST_CHANNEL);
                assert_eq!(nickname, "Dave");
                assert_eq!(greeting, conclave::INVITE_GREETING);
                break;
            }
            _ => continue,
        }
    }

    // The invited address is on the roster under the suggested nickname.
    // (The peer also authenticates as "dave", which this transport treats
    // as a second identity, hence a second contact.)
    wait_for_contacts(&room, 2).await;
    let state = room.snapshot().await.unwrap();
    let contact = state
        .contacts
        .iter()
        .find(|c| c.identity == target_addr)
        .expect("invited address not on roster");
    assert_eq!(contact.nickname, "Dave");
}

#[tokio::test]
async fn invite_to_unreachable_address_fails_cleanly() {
    init_tracing();
    let (room, _addr) = serve_room(RoomConfig::default()).await;

    // A port nothing listens on
    let err = room.invite("127.0.0.1:1", None).await;
    assert!(err.is_err());
    assert_eq!(room.known_contacts().await, 0);
    assert_eq!(room.active_sessions().await, 0);
}
