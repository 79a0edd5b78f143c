//! Room state serialization.
//!
//! The whole durable state of a room is one JSON document:
//!
//! ```json
//! { "version": 1, "config": { ...policy flags... }, "contacts": [ ... ] }
//! ```
//!
//! Written once at shutdown, read once at startup. A missing or unreadable
//! document means the room starts empty; a failed write at shutdown is
//! logged and otherwise ignored (the process is exiting either way). Flags
//! absent from an older document deserialize to false, unknown fields are
//! ignored, so documents travel across versions in both directions.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RoomConfig;
use crate::roster::Contact;

/// Current state document version.
pub const STATE_VERSION: u32 = 1;

/// Everything a room persists across restarts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomState {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub config: RoomConfig,
    #[serde(default)]
    pub contacts: Vec<Contact>,
}

impl Default for RoomState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            config: RoomConfig::default(),
            contacts: Vec::new(),
        }
    }
}

impl RoomState {
    pub fn new(config: RoomConfig, contacts: Vec<Contact>) -> Self {
        Self {
            version: STATE_VERSION,
            config,
            contacts,
        }
    }
}

/// Serialize a state document.
pub fn encode(state: &RoomState) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(state).context("failed to serialize room state")
}

/// Parse a state document, rejecting versions from the future.
pub fn decode(bytes: &[u8]) -> Result<RoomState> {
    let state: RoomState =
        serde_json::from_slice(bytes).context("malformed room state document")?;
    if state.version > STATE_VERSION {
        bail!("unsupported room state version {}", state.version);
    }
    Ok(state)
}

/// Load persisted state, or an empty room when there is none to load.
/// Never fails: an unreadable document is logged and discarded.
pub async fn load_state(path: impl AsRef<Path>) -> RoomState {
    let path = path.as_ref();
    match tokio::fs::read(path).await {
        Ok(bytes) => match decode(&bytes) {
            Ok(state) => {
                info!(
                    path = %path.display(),
                    contacts = state.contacts.len(),
                    "room state loaded"
                );
                state
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable room state");
                RoomState::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no prior room state");
            RoomState::default()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read room state");
            RoomState::default()
        }
    }
}

/// Write the state document. Best-effort: callers at shutdown log the error
/// and move on.
pub async fn store_state(path: impl AsRef<Path>, state: &RoomState) -> Result<()> {
    let path = path.as_ref();
    let bytes = encode(state)?;
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("failed to write room state to {}", path.display()))?;
    debug!(path = %path.display(), contacts = state.contacts.len(), "room state stored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> RoomState {
        let mut carol = Contact::new("ccccddddeeeeffff", "carol");
        carol.pending.push_back("m1".to_string());
        carol.pending.push_back("m2".to_string());
        RoomState::new(
            RoomConfig {
                allow_unsolicited_connections: true,
                allow_invite_command: true,
                use_generated_nicknames: false,
                announce_join_part: true,
                replay_to_offline_contacts: true,
            },
            vec![Contact::new("aaaabbbbccccdddd", "alice"), carol],
        )
    }

    #[test]
    fn round_trip_is_field_for_field_equal() {
        let state = sample_state();
        let decoded = decode(&encode(&state).unwrap()).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn missing_fields_default() {
        let decoded = decode(br#"{"version":1}"#).unwrap();
        assert_eq!(decoded.config, RoomConfig::default());
        assert!(decoded.contacts.is_empty());
    }

    #[test]
    fn future_version_is_rejected() {
        let err = decode(br#"{"version":99}"#).unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode(b"not json at all").is_err());
    }

    #[tokio::test]
    async fn load_missing_file_starts_empty() {
        let state = load_state("/nonexistent/room_state.json").await;
        assert_eq!(state, RoomState::default());
    }

    #[tokio::test]
    async fn store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("room_state.json");

        let state = sample_state();
        store_state(&path, &state).await.unwrap();
        let loaded = load_state(&path).await;
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn load_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("room_state.json");
        tokio::fs::write(&path, b"{{{{").await.unwrap();

        let state = load_state(&path).await;
        assert_eq!(state, RoomState::default());
    }
}
