//! Session contract for the underlying encrypted transport.
//!
//! The relay never speaks to the wire directly. Each remote peer holds one
//! authenticated, bidirectional session with the process, and everything the
//! relay knows about that session arrives through the types defined here:
//!
//! - [`Session`]: the operations the relay may invoke on a live connection
//!   (open a channel, send chat text, acknowledge, answer a contact request,
//!   close).
//! - [`SessionEvent`]: lifecycle and protocol callbacks delivered to the
//!   relay over an mpsc receiver, one stream per session.
//! - [`SessionConnector`]: outbound connection establishment, used when a
//!   peer is invited into the room.
//!
//! ## Design
//!
//! Traits are defined here separately from implementations so the relay
//! engine depends only on the seam, never on a concrete transport. The
//! bundled TCP transport in [`crate::transport`] is one implementation;
//! production deployments supply their own authenticated session layer.
//!
//! ## Channel conventions
//!
//! Chat text flows over a numbered channel that each side opens lazily before
//! its first send. To keep the two directions from colliding on one id, the
//! answering side of a connection opens channel 6 and the initiating side
//! opens channel 7. Contact requests travel on channel 5.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Chat channel id opened by the side that answered the connection.
pub const ANSWERING_CHAT_CHANNEL: u16 = 6;

/// Chat channel id opened by the side that initiated the connection.
pub const INITIATING_CHAT_CHANNEL: u16 = 7;

/// Channel id used for outbound contact requests.
pub const CONTACT_REQUEST_CHANNEL: u16 = 5;

/// Greeting attached to every outbound invitation.
pub const INVITE_GREETING: &str = "You've been invited to join a group chat";

/// Response text sent when a contact request is accepted.
pub const CONTACT_ACCEPT_RESPONSE: &str = "Accepted";

/// Lifecycle and protocol events a session delivers to the relay.
///
/// Events for one session arrive in order on a dedicated receiver. The
/// stream ends at or shortly after [`SessionEvent::Disconnected`]; the relay
/// treats a closed stream as an implicit disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The peer asked to become a contact.
    ContactRequest {
        channel: u16,
        nickname: String,
        greeting: String,
    },
    /// The peer proved ownership of its identity. After this point the
    /// session's identity is authoritative.
    Authenticated { identity: String },
    /// Chat text arrived on an open channel.
    ChatMessage {
        channel: u16,
        message_id: u32,
        text: String,
    },
    /// The session is ready to carry requests (channel opens, contact
    /// requests). Outbound invites wait for this before sending theirs.
    Ready,
    /// The transport connection ended. Delivered at most once per session,
    /// but the relay must tolerate duplicates.
    Disconnected,
}

/// Receiver half of a session's event stream.
pub type SessionEvents = mpsc::Receiver<SessionEvent>;

/// One authenticated duplex connection to a remote peer.
///
/// All operations are fire-and-forget from the relay's point of view: an
/// `Err` means the session is unusable, never that the room is in trouble.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// True when the local side initiated this connection.
    ///
    /// Decides which chat channel id the relay opens for outbound text
    /// ([`INITIATING_CHAT_CHANNEL`] vs [`ANSWERING_CHAT_CHANNEL`]).
    fn is_initiator(&self) -> bool;

    /// Open a channel for subsequent sends.
    async fn open_channel(&self, channel: u16) -> Result<()>;

    /// Send chat text on a previously opened channel.
    async fn send_text(&self, channel: u16, text: &str) -> Result<()>;

    /// Acknowledge receipt of a chat message.
    async fn acknowledge(&self, channel: u16, message_id: u32) -> Result<()>;

    /// Ask the peer to become a contact.
    async fn send_contact_request(
        &self,
        channel: u16,
        nickname: &str,
        greeting: &str,
    ) -> Result<()>;

    /// Accept a pending contact request from the peer.
    async fn accept_contact_request(&self, channel: u16, response: &str) -> Result<()>;

    /// Close a single channel.
    async fn close_channel(&self, channel: u16) -> Result<()>;

    /// Tear down the whole session. Triggers a `Disconnected` event.
    async fn close(&self);
}

/// Outbound session establishment.
#[async_trait]
pub trait SessionConnector: Send + Sync + 'static {
    /// Connect to a peer by its transport-level address.
    ///
    /// Returns the session handle together with its event stream. The
    /// connection attempt may block indefinitely; callers run it off the
    /// relay's main loop.
    async fn connect(&self, address: &str) -> Result<(Arc<dyn Session>, SessionEvents)>;
}
