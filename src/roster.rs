//! Durable registry of known peers.
//!
//! A [`Contact`] is a peer the room remembers across restarts: its
//! transport-level identity, a display nickname, and a FIFO queue of chat
//! lines that arrived while the peer was offline. The [`Roster`] holds at
//! most one Contact per identity and is owned exclusively by the relay
//! actor; all access goes through its command loop.
//!
//! The roster is a plain `Vec` with linear scans and swap-removal. Rooms are
//! small (tens of peers), so an index keyed by identity would buy nothing.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// A known peer, persisted across restarts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Transport-level address uniquely naming the peer.
    pub identity: String,
    /// Display nickname. May be empty until the peer authenticates or
    /// renames itself.
    #[serde(default)]
    pub nickname: String,
    /// Chat lines queued while the peer was offline, oldest first.
    /// Drained in one shot when the peer's session authenticates.
    #[serde(default)]
    pub pending: VecDeque<String>,
}

impl Contact {
    pub fn new(identity: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            nickname: nickname.into(),
            pending: VecDeque::new(),
        }
    }
}

/// The set of known Contacts. At most one entry per identity.
#[derive(Debug, Default)]
pub struct Roster {
    contacts: Vec<Contact>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a roster from persisted contacts, dropping duplicate
    /// identities (first occurrence wins).
    pub fn from_contacts(contacts: Vec<Contact>) -> Self {
        let mut roster = Self::new();
        for contact in contacts {
            if roster.lookup(&contact.identity).is_none() {
                roster.contacts.push(contact);
            }
        }
        roster
    }

    /// Find a contact by identity.
    pub fn lookup(&self, identity: &str) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.identity == identity)
    }

    /// Insert a contact if the identity is unknown. An existing entry is
    /// left untouched; renames go through [`Roster::rename`].
    pub fn upsert(&mut self, identity: &str, nickname: &str) {
        if self.lookup(identity).is_none() {
            self.contacts.push(Contact::new(identity, nickname));
        }
    }

    /// Update a known contact's nickname. No-op for unknown identities.
    pub fn rename(&mut self, identity: &str, nickname: &str) {
        if let Some(contact) = self.contacts.iter_mut().find(|c| c.identity == identity) {
            contact.nickname = nickname.to_string();
        }
    }

    /// Remove a contact. Idempotent; with duplicate identities (which only
    /// arise transiently) the first match is removed.
    pub fn remove(&mut self, identity: &str) {
        if let Some(pos) = self.contacts.iter().position(|c| c.identity == identity) {
            self.contacts.swap_remove(pos);
        }
    }

    /// Queue a chat line for an offline contact. Silently drops the line if
    /// the identity is unknown; callers upsert first when they mean to keep
    /// it.
    pub fn enqueue_pending(&mut self, identity: &str, text: &str) {
        if let Some(contact) = self.contacts.iter_mut().find(|c| c.identity == identity) {
            contact.pending.push_back(text.to_string());
        }
    }

    /// Return and clear a contact's pending queue in one step.
    pub fn drain_pending(&mut self, identity: &str) -> Vec<String> {
        match self.contacts.iter_mut().find(|c| c.identity == identity) {
            Some(contact) => contact.pending.drain(..).collect(),
            None => Vec::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Clone the contacts for persistence.
    pub fn to_contacts(&self) -> Vec<Contact> {
        self.contacts.clone()
    }
}
