//! Room-wide relay policy flags.
//!
//! Loaded once at startup (all false when absent), flipped only by operator
//! configuration, and persisted alongside the roster. Every flag defaults to
//! false independently so a state document written by an older build that
//! knew fewer flags still loads.

use serde::{Deserialize, Serialize};

/// Process-wide flags controlling relay policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Accept contact requests from peers not already on the roster.
    #[serde(default)]
    pub allow_unsolicited_connections: bool,

    /// Honor the in-band `/invite` command. When false, invites from peers
    /// are ignored without acknowledgement.
    #[serde(default)]
    pub allow_invite_command: bool,

    /// Assign a generated placeholder nickname to authenticating peers
    /// instead of consulting the roster.
    #[serde(default)]
    pub use_generated_nicknames: bool,

    /// Announce joins and parts to the rest of the room.
    #[serde(default)]
    pub announce_join_part: bool,

    /// Fan out to known contacts instead of the live session set, queueing
    /// messages for contacts that are offline.
    #[serde(default)]
    pub replay_to_offline_contacts: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_all_false() {
        let config = RoomConfig::default();
        assert!(!config.allow_unsolicited_connections);
        assert!(!config.allow_invite_command);
        assert!(!config.use_generated_nicknames);
        assert!(!config.announce_join_part);
        assert!(!config.replay_to_offline_contacts);
    }

    #[test]
    fn missing_flags_deserialize_false() {
        // A document from a build that only knew two flags
        let config: RoomConfig =
            serde_json::from_str(r#"{"allow_unsolicited_connections":true,"allow_invite_command":true}"#)
                .unwrap();
        assert!(config.allow_unsolicited_connections);
        assert!(config.allow_invite_command);
        assert!(!config.replay_to_offline_contacts);
    }
}
