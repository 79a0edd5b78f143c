//! In-band slash-command recognition and nickname validation.
//!
//! Peers steer the room with plain chat text. Three commands are recognized,
//! matched in fixed priority order and anchored at the start of the line:
//!
//! | Command | Form |
//! |---------|------|
//! | Invite | `/invite [ricochet:]<16-char lowercase alphanumeric>[.onion] [nickname]` |
//! | Part | `/part` (exact) |
//! | Nick | `/nick <rest of line>` |
//!
//! Anything else is ordinary chat. The parser only recognizes; whether a
//! command is honored (and whether a candidate nickname survives
//! [`valid_nickname`]) is the relay engine's call.

use std::sync::OnceLock;

use regex::Regex;
use unicode_properties::{GeneralCategory, UnicodeGeneralCategory};

/// Maximum nickname length in characters.
pub const MAX_NICKNAME_CHARS: usize = 20;

/// Characters never allowed in a nickname.
const RESERVED_CHARS: [char; 5] = ['"', '<', '>', '&', '\\'];

static INVITE_REGEX: OnceLock<Regex> = OnceLock::new();
static PART_REGEX: OnceLock<Regex> = OnceLock::new();
static NICK_REGEX: OnceLock<Regex> = OnceLock::new();

fn invite_regex() -> &'static Regex {
    INVITE_REGEX.get_or_init(|| {
        Regex::new(r"^/invite (?:ricochet:)?([a-z0-9]{16})(?:\.onion)?\s?(.*)$")
            .expect("invalid invite regex")
    })
}

fn part_regex() -> &'static Regex {
    PART_REGEX.get_or_init(|| Regex::new(r"^/part$").expect("invalid part regex"))
}

fn nick_regex() -> &'static Regex {
    NICK_REGEX.get_or_init(|| Regex::new(r"^/nick (.*)$").expect("invalid nick regex"))
}

/// A recognized in-band command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Invite a peer into the room, optionally under a suggested nickname.
    Invite {
        address: String,
        nickname: Option<String>,
    },
    /// Leave the room and be forgotten.
    Part,
    /// Request a new nickname. Not yet validated.
    Nick { nickname: String },
}

/// Recognize a command at the start of a chat line.
pub fn parse(text: &str) -> Option<Command> {
    if let Some(caps) = invite_regex().captures(text) {
        let address = caps[1].to_string();
        let nickname = caps
            .get(2)
            .map(|m| m.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        return Some(Command::Invite { address, nickname });
    }
    if part_regex().is_match(text) {
        return Some(Command::Part);
    }
    if let Some(caps) = nick_regex().captures(text) {
        return Some(Command::Nick {
            nickname: caps[1].to_string(),
        });
    }
    None
}

/// Check a candidate nickname.
///
/// Valid iff every character is outside the Unicode Format and Control
/// general categories, none is reserved (`" < > & \`), and the total length
/// is 1..=20 characters. Rejection leaves the caller's previous nickname in
/// force. Malformed byte sequences never reach this function: the transport
/// fails the frame decode first.
pub fn valid_nickname(candidate: &str) -> bool {
    let mut length = 0usize;
    for c in candidate.chars() {
        if matches!(
            c.general_category(),
            GeneralCategory::Format | GeneralCategory::Control
        ) {
            return false;
        }
        if RESERVED_CHARS.contains(&c) {
            return false;
        }
        length += 1;
        if length > MAX_NICKNAME_CHARS {
            return false;
        }
    }
    length > 0
}
