//! Recipient classification and group id conversion.
//!
//! Callers address recipients with plain strings. A string is one of:
//!
//! - **Group**: `group.` followed by base64 of the *internal* group id, which
//!   is itself base64 of 32 raw bytes.
//! - **Number**: `+` followed by digits, or an account UUID (ACI).
//! - **Username**: everything else, e.g. `alice.42`.
//!
//! Usernames may legitimately start with `group.` (`group.07`), so a
//! prefixed value whose payload does not decode is still accepted as a
//! username when the remainder is at most 10 characters long.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use uuid::Uuid;

use crate::error::BridgeError;

/// Prefix of externally visible group ids.
pub const GROUP_PREFIX: &str = "group.";

/// Length in bytes of a decoded group identifier.
pub const GROUP_ID_BYTES: usize = 32;

/// Longest `group.`-prefixed remainder still treated as a username.
pub const MAX_PREFIXED_USERNAME_CHARS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecipientKind {
    Group,
    Number,
    Username,
}

impl RecipientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientKind::Group => "group",
            RecipientKind::Number => "number",
            RecipientKind::Username => "username",
        }
    }
}

/// `+` followed by one or more ASCII digits.
pub fn is_phone_number(s: &str) -> bool {
    match s.strip_prefix('+') {
        Some(digits) => !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// Strip both base64 layers of a prefixed group id payload.
fn decode_group_payload(payload: &str) -> Option<Vec<u8>> {
    let outer = STANDARD.decode(payload).ok()?;
    let internal = std::str::from_utf8(&outer).ok()?;
    STANDARD.decode(internal).ok()
}

/// Classify a single recipient string.
///
/// # Errors
///
/// Returns `BridgeError::InvalidArgument` for a `group.`-prefixed value that
/// is neither a valid group id nor short enough to be a username.
pub fn classify(recipient: &str) -> Result<RecipientKind, BridgeError> {
    if let Some(payload) = recipient.strip_prefix(GROUP_PREFIX) {
        return match decode_group_payload(payload) {
            Some(bytes) if bytes.len() == GROUP_ID_BYTES => Ok(RecipientKind::Group),
            None if payload.chars().count() <= MAX_PREFIXED_USERNAME_CHARS => {
                Ok(RecipientKind::Username)
            }
            _ => Err(BridgeError::InvalidArgument(format!(
                "Invalid identifier {}",
                recipient
            ))),
        };
    }

    if is_phone_number(recipient) {
        return Ok(RecipientKind::Number);
    }

    if Uuid::parse_str(recipient).is_ok() {
        return Ok(RecipientKind::Number);
    }

    Ok(RecipientKind::Username)
}

/// Convert an external id (`group.<base64>`) to the internal id signal-cli
/// expects.
pub fn internal_group_id(external: &str) -> Result<String, BridgeError> {
    let invalid = || BridgeError::InvalidArgument(format!("Invalid group id {}", external));

    let payload = external.strip_prefix(GROUP_PREFIX).ok_or_else(invalid)?;
    let outer = STANDARD.decode(payload).map_err(|_| invalid())?;
    String::from_utf8(outer).map_err(|_| invalid())
}

/// Convert an internal signal-cli group id to the external form.
pub fn external_group_id(internal: &str) -> String {
    format!("{}{}", GROUP_PREFIX, STANDARD.encode(internal.as_bytes()))
}

/// Recipients of one logical send, split by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipientSet {
    pub groups: Vec<String>,
    pub numbers: Vec<String>,
    pub usernames: Vec<String>,
}

impl RecipientSet {
    /// Classify `recipients` and enforce the send constraints: at least one
    /// recipient, at most one group, and groups never mixed with numbers or
    /// usernames.
    pub fn classify<I, S>(recipients: I) -> Result<Self, BridgeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        for recipient in recipients {
            let recipient = recipient.as_ref();
            if recipient.trim().is_empty() {
                return Err(BridgeError::InvalidArgument(
                    "Recipients must not be empty".to_string(),
                ));
            }
            match classify(recipient)? {
                RecipientKind::Group => set.groups.push(recipient.to_string()),
                RecipientKind::Number => set.numbers.push(recipient.to_string()),
                RecipientKind::Username => set.usernames.push(recipient.to_string()),
            }
        }

        if set.is_empty() {
            return Err(BridgeError::InvalidArgument(
                "Please specify at least one recipient".to_string(),
            ));
        }

        if set.groups.len() > 1 {
            return Err(BridgeError::InvalidArgument(
                "More than one group is currently not supported".to_string(),
            ));
        }

        if !set.groups.is_empty() && (!set.numbers.is_empty() || !set.usernames.is_empty()) {
            return Err(BridgeError::InvalidArgument(
                "Groups and phone numbers/usernames cannot be specified together in one request"
                    .to_string(),
            ));
        }

        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.numbers.is_empty() && self.usernames.is_empty()
    }

    /// Non-empty batches in send order: group, numbers, usernames.
    pub fn batches(&self) -> Vec<(RecipientKind, &[String])> {
        [
            (RecipientKind::Group, self.groups.as_slice()),
            (RecipientKind::Number, self.numbers.as_slice()),
            (RecipientKind::Username, self.usernames.as_slice()),
        ]
        .into_iter()
        .filter(|(_, batch)| !batch.is_empty())
        .collect()
    }
}
