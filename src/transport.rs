//! Loopback TCP transport.
//!
//! A plaintext implementation of the [`Session`] contract over TCP, used by
//! the bundled binary, the integration tests, and local rooms. It carries
//! the same channel/acknowledgement conventions a production transport
//! would, without the cryptographic handshake: the peer's identity is simply
//! whatever it announces in its `Identify` frame. Deployments that need
//! authenticated peers plug their own session layer into the same traits.
//!
//! ## Wire format
//!
//! Length-prefixed frames: a u32 big-endian length followed by a
//! bincode-encoded [`Frame`]. Deserialization is size-bounded so a hostile
//! peer cannot make the relay allocate unbounded buffers.
//!
//! Each session runs two tasks: a writer draining an outbound frame queue,
//! and a reader translating inbound frames into [`SessionEvent`]s. A read
//! error, an oversized frame, or an undecodable frame all end the session.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bincode::Options;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::session::{Session, SessionConnector, SessionEvent, SessionEvents};

/// Maximum encoded frame size. Frames carry chat lines, not payloads.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Outbound frame queue depth per session.
const FRAME_QUEUE: usize = 64;

/// Event queue depth per session.
const EVENT_QUEUE: usize = 64;

/// Everything that crosses the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum Frame {
    /// Identity announcement, sent once by each side after connecting.
    /// Surfaces on the peer as its authentication event.
    Identify { identity: String },
    OpenChannel { channel: u16 },
    CloseChannel { channel: u16 },
    ContactRequest {
        channel: u16,
        nickname: String,
        greeting: String,
    },
    ContactAccept { channel: u16, response: String },
    Text {
        channel: u16,
        message_id: u32,
        text: String,
    },
    Ack { channel: u16, message_id: u32 },
}

/// Bincode options with the size limit enforced. Always used for
/// deserialization so a bad length prefix cannot cause large allocations.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

fn encode_frame(frame: &Frame) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(frame)
}

fn decode_frame(bytes: &[u8]) -> Result<Frame, bincode::Error> {
    bincode_options().deserialize(bytes)
}

enum Outbound {
    Frame(Frame),
    Shutdown,
}

/// A [`Session`] over one TCP stream.
pub struct TcpSession {
    initiator: bool,
    frame_tx: mpsc::Sender<Outbound>,
    next_message_id: AtomicU32,
    reader: AbortHandle,
}

impl TcpSession {
    /// Wrap an established stream, spawning its reader and writer tasks.
    /// Announces `local_identity` to the peer and immediately reports the
    /// session ready.
    pub fn spawn(
        stream: TcpStream,
        local_identity: String,
        initiator: bool,
    ) -> (Arc<dyn Session>, SessionEvents) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (read_half, write_half) = stream.into_split();

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);

        // Queued before the tasks start: the identity announcement is the
        // first frame on the wire, and Ready is the first event delivered.
        // The queues are empty here, so neither send can fail.
        let _ = frame_tx.try_send(Outbound::Frame(Frame::Identify {
            identity: local_identity,
        }));
        let _ = event_tx.try_send(SessionEvent::Ready);

        tokio::spawn(write_loop(write_half, frame_rx));
        let reader = tokio::spawn(read_loop(read_half, event_tx.clone(), peer.clone()));

        debug!(peer = %peer, initiator, "session transport up");

        let session = Arc::new(Self {
            initiator,
            frame_tx,
            next_message_id: AtomicU32::new(1),
            reader: reader.abort_handle(),
        });
        (session, event_rx)
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        self.frame_tx
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| anyhow!("session closed"))
    }
}

#[async_trait]
impl Session for TcpSession {
    fn is_initiator(&self) -> bool {
        self.initiator
    }

    async fn open_channel(&self, channel: u16) -> Result<()> {
        self.send(Frame::OpenChannel { channel }).await
    }

    async fn send_text(&self, channel: u16, text: &str) -> Result<()> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        self.send(Frame::Text {
            channel,
            message_id,
            text: text.to_string(),
        })
        .await
    }

    async fn acknowledge(&self, channel: u16, message_id: u32) -> Result<()> {
        self.send(Frame::Ack {
            channel,
            message_id,
        })
        .await
    }

    async fn send_contact_request(
        &self,
        channel: u16,
        nickname: &str,
        greeting: &str,
    ) -> Result<()> {
        self.send(Frame::ContactRequest {
            channel,
            nickname: nickname.to_string(),
            greeting: greeting.to_string(),
        })
        .await
    }

    async fn accept_contact_request(&self, channel: u16, response: &str) -> Result<()> {
        self.send(Frame::ContactAccept {
            channel,
            response: response.to_string(),
        })
        .await
    }

    async fn close_channel(&self, channel: u16) -> Result<()> {
        self.send(Frame::CloseChannel { channel }).await
    }

    async fn close(&self) {
        let _ = self.frame_tx.send(Outbound::Shutdown).await;
        // Dropping the reader drops the event senders; the relay's pump
        // turns the closed stream into a disconnect.
        self.reader.abort();
    }
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut frames: mpsc::Receiver<Outbound>) {
    while let Some(outbound) = frames.recv().await {
        let frame = match outbound {
            Outbound::Frame(frame) => frame,
            Outbound::Shutdown => break,
        };
        let bytes = match encode_frame(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode frame");
                continue;
            }
        };
        let len = (bytes.len() as u32).to_be_bytes();
        if write_half.write_all(&len).await.is_err()
            || write_half.write_all(&bytes).await.is_err()
        {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

async fn read_loop(read_half: OwnedReadHalf, events: mpsc::Sender<SessionEvent>, peer: String) {
    let mut reader = BufReader::new(read_half);
    loop {
        let mut len_buf = [0u8; 4];
        if reader.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            warn!(peer = %peer, len, "oversized frame, closing session");
            break;
        }
        let mut buf = vec![0u8; len];
        if reader.read_exact(&mut buf).await.is_err() {
            break;
        }
        let frame = match decode_frame(&buf) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %peer, error = %e, "undecodable frame, closing session");
                break;
            }
        };

        let event = match frame {
            Frame::Identify { identity } => Some(SessionEvent::Authenticated { identity }),
            Frame::Text {
                channel,
                message_id,
                text,
            } => Some(SessionEvent::ChatMessage {
                channel,
                message_id,
                text,
            }),
            Frame::ContactRequest {
                channel,
                nickname,
                greeting,
            } => Some(SessionEvent::ContactRequest {
                channel,
                nickname,
                greeting,
            }),
            // Channel bookkeeping needs no relay-side reaction.
            Frame::OpenChannel { channel } => {
                trace!(peer = %peer, channel, "peer opened channel");
                None
            }
            Frame::CloseChannel { channel } => {
                trace!(peer = %peer, channel, "peer closed channel");
                None
            }
            Frame::ContactAccept { channel, response } => {
                trace!(peer = %peer, channel, response = %response, "contact request answered");
                None
            }
            Frame::Ack {
                channel,
                message_id,
            } => {
                trace!(peer = %peer, channel, message_id, "message acknowledged");
                None
            }
        };

        if let Some(event) = event
            && events.send(event).await.is_err()
        {
            return;
        }
    }
    let _ = events.send(SessionEvent::Disconnected).await;
}

/// Outbound connection establishment over TCP.
pub struct TcpSessionConnector {
    identity: String,
}

impl TcpSessionConnector {
    /// `identity` is announced to every peer this connector dials.
    pub fn new(identity: String) -> Self {
        Self { identity }
    }
}

#[async_trait]
impl SessionConnector for TcpSessionConnector {
    async fn connect(&self, address: &str) -> Result<(Arc<dyn Session>, SessionEvents)> {
        let stream = TcpStream::connect(address)
            .await
            .with_context(|| format!("failed to connect to {address}"))?;
        Ok(TcpSession::spawn(stream, self.identity.clone(), true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use crate::session::{CONTACT_REQUEST_CHANNEL, INVITE_GREETING};

    #[test]
    fn frame_codec_round_trip() {
        let frame = Frame::Text {
            channel: 6,
            message_id: 42,
            text: "hello".to_string(),
        };
        let bytes = encode_frame(&frame).unwrap();
        match decode_frame(&bytes).unwrap() {
            Frame::Text {
                channel,
                message_id,
                text,
            } => {
                assert_eq!(channel, 6);
                assert_eq!(message_id, 42);
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_frame(&[0xFF; 32]).is_err());
    }

    async fn session_pair() -> (
        (Arc<dyn Session>, SessionEvents),
        (Arc<dyn Session>, SessionEvents),
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            TcpSession::spawn(stream, "server".to_string(), false)
        });
        let connector = TcpSessionConnector::new("client".to_string());
        let client = connector.connect(&addr.to_string()).await.unwrap();
        let server = accept.await.unwrap();
        (client, server)
    }

    async fn next_event(events: &mut SessionEvents) -> SessionEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream ended")
    }

    #[tokio::test]
    async fn sessions_identify_and_exchange_chat() {
        let ((client, mut client_events), (server, mut server_events)) = session_pair().await;
        assert!(client.is_initiator());
        assert!(!server.is_initiator());

        assert_eq!(next_event(&mut client_events).await, SessionEvent::Ready);
        assert_eq!(
            next_event(&mut client_events).await,
            SessionEvent::Authenticated {
                identity: "server".to_string()
            }
        );
        assert_eq!(next_event(&mut server_events).await, SessionEvent::Ready);
        assert_eq!(
            next_event(&mut server_events).await,
            SessionEvent::Authenticated {
                identity: "client".to_string()
            }
        );

        client.open_channel(7).await.unwrap();
        client.send_text(7, "hello").await.unwrap();
        match next_event(&mut server_events).await {
            SessionEvent::ChatMessage {
                channel,
                message_id,
                text,
            } => {
                assert_eq!(channel, 7);
                assert_eq!(text, "hello");
                server.acknowledge(channel, message_id).await.unwrap();
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn contact_requests_surface_as_events() {
        let ((client, _client_events), (_server, mut server_events)) = session_pair().await;

        client
            .send_contact_request(CONTACT_REQUEST_CHANNEL, "bob", INVITE_GREETING)
            .await
            .unwrap();

        assert_eq!(next_event(&mut server_events).await, SessionEvent::Ready);
        let _ = next_event(&mut server_events).await; // Authenticated
        assert_eq!(
            next_event(&mut server_events).await,
            SessionEvent::ContactRequest {
                channel: CONTACT_REQUEST_CHANNEL,
                nickname: "bob".to_string(),
                greeting: INVITE_GREETING.to_string(),
            }
        );
    }

    #[tokio::test]
    async fn close_disconnects_the_peer() {
        let ((client, _client_events), (_server, mut server_events)) = session_pair().await;

        assert_eq!(next_event(&mut server_events).await, SessionEvent::Ready);
        let _ = next_event(&mut server_events).await; // Authenticated

        client.close().await;
        assert_eq!(
            next_event(&mut server_events).await,
            SessionEvent::Disconnected
        );
    }
}
