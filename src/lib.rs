//! # Conclave - Multi-Party Chat Relay
//!
//! Conclave turns a set of point-to-point encrypted sessions into one shared
//! chatroom. Each remote peer holds a single authenticated, bidirectional
//! session with the relay process; the relay fans chat text out to everyone
//! else, applies in-band commands, and remembers the room across restarts:
//!
//! - **Roster**: durable registry of known peers with per-peer queues of
//!   messages that arrived while they were offline
//! - **Commands**: `/invite`, `/part` and `/nick` recognized in plain chat
//!   text
//! - **Policies**: contact-request acceptance, invite permission, generated
//!   nicknames, join/part announcements and offline replay, all per-room
//!   flags
//! - **Persistence**: one versioned state document written at shutdown and
//!   reloaded (with automatic re-invites) at startup
//!
//! ## Architecture
//!
//! The codebase uses the **Actor Pattern** for safe concurrent state:
//! [`RelayRoom`] is a cheap-to-clone handle, and a private actor owns the
//! roster and the live connection set, processing commands sequentially.
//! Each session feeds its events into the actor's queue from its own task,
//! so peers can authenticate, chat and disconnect concurrently without any
//! shared locks.
//!
//! The transport is an external collaborator: the relay consumes the
//! [`Session`] trait and never touches the wire. A plaintext TCP
//! implementation ships in [`transport`] for local rooms and tests;
//! production deployments plug in their own authenticated session layer.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `room` | Relay engine: room state machine behind an actor |
//! | `roster` | Durable registry of known peers |
//! | `connection` | Live session records and the set holding them |
//! | `command` | In-band slash-command parsing, nickname validation |
//! | `config` | Room-wide relay policy flags |
//! | `persist` | Room state serialization |
//! | `session` | Session contract consumed from the transport |
//! | `transport` | Loopback TCP implementation of the session contract |

mod command;
mod config;
mod connection;
mod persist;
mod room;
mod roster;
mod session;
mod transport;

pub use command::{Command, MAX_NICKNAME_CHARS, parse, valid_nickname};
pub use config::RoomConfig;
pub use connection::ConnId;
pub use persist::{RoomState, STATE_VERSION, load_state, store_state};
pub use room::RelayRoom;
pub use roster::Contact;
pub use session::{
    ANSWERING_CHAT_CHANNEL, CONTACT_ACCEPT_RESPONSE, CONTACT_REQUEST_CHANNEL,
    INITIATING_CHAT_CHANNEL, INVITE_GREETING, Session, SessionConnector, SessionEvent,
    SessionEvents,
};
pub use transport::{TcpSession, TcpSessionConnector};
