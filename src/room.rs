//! The relay engine: room state machine behind an actor.
//!
//! # Architecture
//!
//! - [`RelayRoom`]: the public handle (cheap to clone, sends commands to the
//!   actor)
//! - `RelayRoomActor`: owns the [`Roster`] and [`ConnectionSet`], processes
//!   commands sequentially
//! - `RoomCommand`: commands sent from handles and session tasks to the actor
//!
//! Every attached session gets a pump task that forwards its
//! [`SessionEvent`]s into the actor's command queue, so all roster and
//! connection mutation happens on one task and needs no locking. Outbound
//! connection attempts (invites) run in their own tasks and report back
//! through the same queue; a hung connect never stalls the room.
//!
//! # Lifecycle
//!
//! A session moves through connecting → authenticating → active →
//! disconnected. It is registered in the connection set as soon as it is
//! attached (receiving broadcasts even before authentication), acquires its
//! identity and nickname when the peer authenticates, and is removed exactly
//! once when the transport reports disconnection.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::command::{self, Command};
use crate::config::RoomConfig;
use crate::connection::{ActiveSession, ConnId, ConnectionSet};
use crate::persist::RoomState;
use crate::roster::Roster;
use crate::session::{
    CONTACT_ACCEPT_RESPONSE, CONTACT_REQUEST_CHANNEL, INVITE_GREETING, Session, SessionConnector,
    SessionEvent, SessionEvents,
};

/// Capacity of the actor's command queue.
const COMMAND_BUFFER: usize = 256;

/// Placeholder nickname assigned when generated nicknames are enabled.
const GENERATED_NICKNAME: &str = "anonymous";

// ============================================================================
// Commands sent from handles and session tasks to the actor
// ============================================================================

enum RoomCommand {
    Attach {
        session: Arc<dyn Session>,
        events: SessionEvents,
        identity: Option<String>,
        nickname: Option<String>,
        invite_pending: bool,
        reply: Option<oneshot::Sender<ConnId>>,
    },
    Invite {
        address: String,
        nickname: Option<String>,
        requester: Option<ConnId>,
        reply: Option<oneshot::Sender<Result<(), String>>>,
    },
    Event {
        conn: ConnId,
        event: SessionEvent,
    },
    Notice {
        conn: ConnId,
        text: String,
    },
    Snapshot {
        reply: oneshot::Sender<RoomState>,
    },
    ActiveSessions {
        reply: oneshot::Sender<usize>,
    },
    KnownContacts {
        reply: oneshot::Sender<usize>,
    },
    Quit,
}

// ============================================================================
// RelayRoom handle (public API - cheap to clone)
// ============================================================================

/// Handle to the relay room actor. Cheap to clone.
#[derive(Clone)]
pub struct RelayRoom {
    cmd_tx: mpsc::Sender<RoomCommand>,
}

impl RelayRoom {
    /// Start an empty room.
    pub fn new(connector: Arc<dyn SessionConnector>, config: RoomConfig) -> Self {
        Self::with_roster(connector, config, Roster::new())
    }

    /// Start a room from persisted state. Every restored contact is treated
    /// as a standing invitation: the room immediately attempts an outbound
    /// connection to each one.
    pub fn restore(connector: Arc<dyn SessionConnector>, state: RoomState) -> Self {
        Self::with_roster(connector, state.config, Roster::from_contacts(state.contacts))
    }

    fn with_roster(
        connector: Arc<dyn SessionConnector>,
        config: RoomConfig,
        roster: Roster,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = RelayRoomActor {
            config,
            roster,
            connections: ConnectionSet::new(),
            connector,
            cmd_tx: cmd_tx.clone(),
            next_conn_id: 1,
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    /// Register an inbound session. Accepted unconditionally; whether its
    /// contact request is honored is decided later by room policy.
    pub async fn attach(
        &self,
        session: Arc<dyn Session>,
        events: SessionEvents,
    ) -> Result<ConnId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RoomCommand::Attach {
                session,
                events,
                identity: None,
                nickname: None,
                invite_pending: false,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| anyhow!("relay room closed"))?;
        reply_rx.await.map_err(|_| anyhow!("relay room closed"))
    }

    /// Invite a peer into the room by address. Returns an error when the
    /// outbound connection cannot be established.
    pub async fn invite(&self, address: &str, nickname: Option<String>) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RoomCommand::Invite {
                address: address.to_string(),
                nickname,
                requester: None,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| anyhow!("relay room closed"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("relay room closed"))?
            .map_err(|e| anyhow!(e))
            .with_context(|| format!("failed to invite {address}"))
    }

    /// Capture the room's persistable state.
    pub async fn snapshot(&self) -> Result<RoomState> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RoomCommand::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| anyhow!("relay room closed"))?;
        reply_rx.await.map_err(|_| anyhow!("relay room closed"))
    }

    /// Number of live sessions.
    pub async fn active_sessions(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RoomCommand::ActiveSessions { reply: reply_tx })
            .await
            .is_err()
        {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    /// Number of known contacts on the roster.
    pub async fn known_contacts(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RoomCommand::KnownContacts { reply: reply_tx })
            .await
            .is_err()
        {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    /// Shut down the room actor.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(RoomCommand::Quit).await;
    }
}

// ============================================================================
// RelayRoomActor (owns all state, processes commands sequentially)
// ============================================================================

struct RelayRoomActor {
    config: RoomConfig,
    roster: Roster,
    connections: ConnectionSet,
    connector: Arc<dyn SessionConnector>,
    /// Cloned into pump and invite tasks so they can report back.
    cmd_tx: mpsc::Sender<RoomCommand>,
    next_conn_id: ConnId,
}

impl RelayRoomActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RoomCommand>) {
        // Restored contacts are re-invited on startup so the room reassembles
        // itself after a restart.
        let targets: Vec<(String, String)> = self
            .roster
            .iter()
            .map(|c| (c.identity.clone(), c.nickname.clone()))
            .collect();
        for (address, nickname) in targets {
            info!(address = %address, "re-inviting persisted contact");
            let nickname = (!nickname.is_empty()).then_some(nickname);
            self.spawn_invite(address, nickname, None, None);
        }

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                RoomCommand::Attach {
                    session,
                    events,
                    identity,
                    nickname,
                    invite_pending,
                    reply,
                } => {
                    let id = self.attach(session, events, identity, nickname, invite_pending);
                    if let Some(reply) = reply {
                        let _ = reply.send(id);
                    }
                }
                RoomCommand::Invite {
                    address,
                    nickname,
                    requester,
                    reply,
                } => self.spawn_invite(address, nickname, requester, reply),
                RoomCommand::Event { conn, event } => self.handle_event(conn, event).await,
                RoomCommand::Notice { conn, text } => self.notify(conn, &text).await,
                RoomCommand::Snapshot { reply } => {
                    let _ = reply.send(RoomState::new(
                        self.config.clone(),
                        self.roster.to_contacts(),
                    ));
                }
                RoomCommand::ActiveSessions { reply } => {
                    let _ = reply.send(self.connections.len());
                }
                RoomCommand::KnownContacts { reply } => {
                    let _ = reply.send(self.roster.len());
                }
                RoomCommand::Quit => break,
            }
        }
        debug!("relay room actor shutting down");
    }

    /// Register a session and start pumping its events into the command
    /// queue. The pump appends a synthetic `Disconnected` when the stream
    /// ends without one; removal is idempotent so the duplicate is harmless.
    fn attach(
        &mut self,
        session: Arc<dyn Session>,
        mut events: SessionEvents,
        identity: Option<String>,
        nickname: Option<String>,
        invite_pending: bool,
    ) -> ConnId {
        let id = self.next_conn_id;
        self.next_conn_id += 1;

        if invite_pending
            && let Some(identity) = &identity
        {
            self.roster.upsert(identity, nickname.as_deref().unwrap_or(""));
        }

        self.connections.insert(ActiveSession::new(
            id,
            session,
            identity,
            nickname,
            invite_pending,
        ));
        debug!(conn = id, live = self.connections.len(), "session attached");

        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if cmd_tx
                    .send(RoomCommand::Event { conn: id, event })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            let _ = cmd_tx
                .send(RoomCommand::Event {
                    conn: id,
                    event: SessionEvent::Disconnected,
                })
                .await;
        });

        id
    }

    async fn handle_event(&mut self, conn: ConnId, event: SessionEvent) {
        match event {
            SessionEvent::ContactRequest {
                channel,
                nickname,
                greeting,
            } => self.handle_contact_request(conn, channel, &nickname, &greeting).await,
            SessionEvent::Authenticated { identity } => {
                self.handle_authenticated(conn, identity).await
            }
            SessionEvent::ChatMessage {
                channel,
                message_id,
                text,
            } => self.handle_chat(conn, channel, message_id, &text).await,
            SessionEvent::Ready => self.handle_ready(conn).await,
            SessionEvent::Disconnected => self.handle_disconnect(conn).await,
        }
    }

    /// Accept a contact request when unsolicited connections are allowed or
    /// the peer is already on the roster; otherwise drop the session.
    async fn handle_contact_request(
        &mut self,
        conn: ConnId,
        channel: u16,
        nickname: &str,
        greeting: &str,
    ) {
        let Some(active) = self.connections.get(conn) else {
            return;
        };
        info!(conn, nickname = %nickname, greeting = %greeting, "contact request");

        let known = active
            .identity
            .as_deref()
            .is_some_and(|id| self.roster.lookup(id).is_some());
        let session = active.session().clone();

        if self.config.allow_unsolicited_connections || known {
            if let Err(e) = session
                .accept_contact_request(channel, CONTACT_ACCEPT_RESPONSE)
                .await
            {
                warn!(conn, error = %e, "failed to accept contact request");
                return;
            }
            if let Err(e) = session.close_channel(channel).await {
                warn!(conn, error = %e, "failed to close contact request channel");
            }
        } else {
            debug!(conn, "rejecting contact request from unknown peer");
            session.close().await;
        }
    }

    /// The peer proved its identity: settle the nickname, announce the join,
    /// and reconcile the roster (delivering any queued messages).
    async fn handle_authenticated(&mut self, conn: ConnId, identity: String) {
        let nickname = {
            let Some(active) = self.connections.get_mut(conn) else {
                return;
            };
            active.identity = Some(identity.clone());

            // Nickname priority: already set, generated placeholder, roster
            // entry, raw identity.
            if active.nickname.as_deref().is_none_or(str::is_empty) {
                let resolved = if self.config.use_generated_nicknames {
                    GENERATED_NICKNAME.to_string()
                } else {
                    match self.roster.lookup(&identity) {
                        Some(contact) if !contact.nickname.is_empty() => contact.nickname.clone(),
                        _ => identity.clone(),
                    }
                };
                active.nickname = Some(resolved);
            }
            active.nickname.clone().unwrap_or_default()
        };
        info!(conn, identity = %identity, nickname = %nickname, "session authenticated");

        if self.config.announce_join_part {
            self.notify_others(conn, &format!("{} joined the room.", nickname))
                .await;
        }

        if self.roster.lookup(&identity).is_some() {
            let queued = self.roster.drain_pending(&identity);
            if !queued.is_empty() {
                debug!(conn, count = queued.len(), "delivering queued messages");
                if let Some(active) = self.connections.get_mut(conn) {
                    for text in queued {
                        if let Err(e) = active.deliver(&text).await {
                            warn!(conn, error = %e, "failed to deliver queued message");
                        }
                    }
                }
            }
        } else {
            self.roster.upsert(&identity, &nickname);
        }
    }

    /// An invited session became ready: send the contact request that was
    /// deferred at creation to avoid racing transport readiness.
    async fn handle_ready(&mut self, conn: ConnId) {
        let Some(active) = self.connections.get_mut(conn) else {
            return;
        };
        if !active.invite_pending {
            return;
        }
        active.invite_pending = false;
        let nickname = active.nickname.clone().unwrap_or_default();
        let session = active.session().clone();

        debug!(conn, "sending contact request for pending invite");
        if let Err(e) = session
            .send_contact_request(CONTACT_REQUEST_CHANNEL, &nickname, INVITE_GREETING)
            .await
        {
            warn!(conn, error = %e, "failed to send contact request");
        }
    }

    async fn handle_chat(&mut self, conn: ConnId, channel: u16, message_id: u32, text: &str) {
        let (session, sender_identity, sender_name) = match self.connections.get(conn) {
            Some(active) => (
                active.session().clone(),
                active.identity.clone(),
                active.display_name().to_string(),
            ),
            None => return,
        };
        info!(conn, from = %sender_name, text = %text, "chat message");

        if let Err(e) = session.acknowledge(channel, message_id).await {
            warn!(conn, error = %e, "failed to acknowledge message");
        }

        match command::parse(text) {
            Some(Command::Invite { address, nickname }) => {
                if !self.config.allow_invite_command {
                    debug!(conn, "ignoring invite command (invites disabled)");
                    return;
                }
                self.notify(conn, &format!("Inviting {}", address)).await;
                // A bad nickname does not sink the invite, it is just dropped.
                let nickname = nickname.filter(|n| command::valid_nickname(n));
                self.spawn_invite(address, nickname, Some(conn), None);
            }
            Some(Command::Part) => {
                info!(conn, "peer left the room");
                session.close().await;
                if let Some(identity) = &sender_identity {
                    self.roster.remove(identity);
                }
            }
            other => {
                // Ordinary chat, including a rename request: the original
                // line is relayed first, then the rename applied.
                let line = format!("{}: {}", sender_name, text);
                self.broadcast(conn, sender_identity.as_deref(), &line).await;

                if let Some(Command::Nick { nickname }) = other {
                    if !command::valid_nickname(&nickname) {
                        debug!(conn, candidate = %nickname, "rejecting invalid nickname");
                        return;
                    }
                    if let Some(active) = self.connections.get_mut(conn) {
                        active.nickname = Some(nickname.clone());
                    }
                    if let Some(identity) = &sender_identity {
                        self.roster.rename(identity, &nickname);
                    }
                    self.notify(conn, &format!("You are now known as {}", nickname))
                        .await;
                }
            }
        }
    }

    /// Remove the session exactly once; later duplicates are no-ops.
    async fn handle_disconnect(&mut self, conn: ConnId) {
        let Some(removed) = self.connections.remove(conn) else {
            return;
        };
        info!(
            conn,
            identity = removed.identity.as_deref().unwrap_or(""),
            live = self.connections.len(),
            "session disconnected"
        );

        if self.config.announce_join_part {
            let line = format!("{} left the room.", removed.display_name());
            for active in self.connections.iter_mut() {
                if let Err(e) = active.deliver(&line).await {
                    warn!(conn = active.id(), error = %e, "failed to deliver part notice");
                }
            }
        }
    }

    /// Fan a room line out according to the broadcast policy.
    ///
    /// Replay disabled: every live session except the sender. Replay
    /// enabled: every roster contact except the sender's own entry, queueing
    /// for contacts without a live session.
    async fn broadcast(&mut self, sender: ConnId, sender_identity: Option<&str>, line: &str) {
        if self.config.replay_to_offline_contacts {
            let identities: Vec<String> = self
                .roster
                .iter()
                .map(|c| c.identity.clone())
                .filter(|id| Some(id.as_str()) != sender_identity)
                .collect();
            for identity in identities {
                if let Some(active) = self.connections.by_identity_mut(&identity) {
                    if let Err(e) = active.deliver(line).await {
                        warn!(conn = active.id(), error = %e, "failed to relay message");
                    }
                } else {
                    self.roster.enqueue_pending(&identity, line);
                }
            }
        } else {
            for active in self.connections.iter_mut() {
                if active.id() == sender {
                    continue;
                }
                if let Err(e) = active.deliver(line).await {
                    warn!(conn = active.id(), error = %e, "failed to relay message");
                }
            }
        }
    }

    /// Deliver a notice to a single session.
    async fn notify(&mut self, conn: ConnId, text: &str) {
        if let Some(active) = self.connections.get_mut(conn)
            && let Err(e) = active.deliver(text).await
        {
            warn!(conn, error = %e, "failed to deliver notice");
        }
    }

    /// Deliver a notice to every session except one.
    async fn notify_others(&mut self, conn: ConnId, text: &str) {
        for active in self.connections.iter_mut() {
            if active.id() == conn {
                continue;
            }
            if let Err(e) = active.deliver(text).await {
                warn!(conn = active.id(), error = %e, "failed to deliver notice");
            }
        }
    }

    /// Establish an outbound invite off the actor task. Success comes back
    /// as an `Attach` command; failure is reported to the requester as an
    /// in-room notice and to the caller through the reply channel.
    fn spawn_invite(
        &self,
        address: String,
        nickname: Option<String>,
        requester: Option<ConnId>,
        reply: Option<oneshot::Sender<Result<(), String>>>,
    ) {
        let connector = self.connector.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            debug!(address = %address, "connecting to invited peer");
            match connector.connect(&address).await {
                Ok((session, events)) => {
                    let _ = cmd_tx
                        .send(RoomCommand::Attach {
                            session,
                            events,
                            identity: Some(address),
                            nickname,
                            invite_pending: true,
                            reply: None,
                        })
                        .await;
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(()));
                    }
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "outbound invite failed");
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(e.to_string()));
                    }
                    if let Some(requester) = requester {
                        let _ = cmd_tx
                            .send(RoomCommand::Notice {
                                conn: requester,
                                text: format!("Failed in invite contact: {}", e),
                            })
                            .await;
                    }
                }
            }
        });
    }
}

// ============================================================================
// Tests
// ============================================================================
