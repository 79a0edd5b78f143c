//! Live session records and the set that holds them.
//!
//! An [`ActiveSession`] pairs a transport [`Session`] handle with the relay's
//! per-connection metadata: the peer identity (unresolved until
//! authentication), the effective nickname, the lazily opened outbound chat
//! channel, and the pending-invite flag. The record composes over the
//! session handle rather than extending any transport type, so the relay's
//! state stays separable from the transport's.
//!
//! The [`ConnectionSet`] is the live counterpart of the roster: one entry per
//! attached session, inserted at attach and removed exactly once on
//! disconnect. Like the roster it is a linear `Vec` with swap-removal.

use std::sync::Arc;

use anyhow::Result;

use crate::session::{ANSWERING_CHAT_CHANNEL, INITIATING_CHAT_CHANNEL, Session};

/// Identifier for one attached session, unique for the process lifetime.
pub type ConnId = u64;

/// A live connection plus its relay-specific metadata.
pub struct ActiveSession {
    id: ConnId,
    session: Arc<dyn Session>,
    /// Peer address. May stay unset on an inbound session until the peer
    /// authenticates; for outbound invites it is the dialed address.
    pub identity: Option<String>,
    /// Effective display name for this connection. Resolved at
    /// authentication time, mutable via `/nick`.
    pub nickname: Option<String>,
    /// Outbound chat channel, opened on first send.
    outbound_channel: Option<u16>,
    /// True while this session still owes the peer a contact request
    /// (outbound invites only). Cleared once the request is sent.
    pub invite_pending: bool,
}

impl ActiveSession {
    pub fn new(
        id: ConnId,
        session: Arc<dyn Session>,
        identity: Option<String>,
        nickname: Option<String>,
        invite_pending: bool,
    ) -> Self {
        Self {
            id,
            session,
            identity,
            nickname,
            outbound_channel: None,
            invite_pending,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Name shown to the rest of the room: nickname, else identity, else
    /// empty (a session that speaks before authenticating).
    pub fn display_name(&self) -> &str {
        self.nickname
            .as_deref()
            .or(self.identity.as_deref())
            .unwrap_or("")
    }

    /// Send one chat line to this peer, opening the outbound channel first
    /// if this is the session's first send.
    pub async fn deliver(&mut self, text: &str) -> Result<()> {
        let channel = match self.outbound_channel {
            Some(channel) => channel,
            None => {
                let channel = if self.session.is_initiator() {
                    INITIATING_CHAT_CHANNEL
                } else {
                    ANSWERING_CHAT_CHANNEL
                };
                self.session.open_channel(channel).await?;
                self.outbound_channel = Some(channel);
                channel
            }
        };
        self.session.send_text(channel, text).await
    }
}

impl std::fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSession")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("nickname", &self.nickname)
            .field("outbound_channel", &self.outbound_channel)
            .field("invite_pending", &self.invite_pending)
            .finish()
    }
}

/// The live set of attached sessions.
#[derive(Debug, Default)]
pub struct ConnectionSet {
    sessions: Vec<ActiveSession>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: ActiveSession) {
        self.sessions.push(session);
    }

    /// Remove a session by id. Returns `None` when already removed, which
    /// makes disconnect reconciliation idempotent.
    pub fn remove(&mut self, id: ConnId) -> Option<ActiveSession> {
        let pos = self.sessions.iter().position(|s| s.id() == id)?;
        Some(self.sessions.swap_remove(pos))
    }

    pub fn get(&self, id: ConnId) -> Option<&ActiveSession> {
        self.sessions.iter().find(|s| s.id() == id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut ActiveSession> {
        self.sessions.iter_mut().find(|s| s.id() == id)
    }

    /// First live session authenticated as the given identity.
    pub fn by_identity_mut(&mut self, identity: &str) -> Option<&mut ActiveSession> {
        self.sessions
            .iter_mut()
            .find(|s| s.identity.as_deref() == Some(identity))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ActiveSession> {
        self.sessions.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
