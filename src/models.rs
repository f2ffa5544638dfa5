//! Data models for the bridge API.
//!
//! Request types are what callers hand to [`crate::bridge::Bridge`]; result
//! types are what it returns. The `Engine*` structs mirror the JSON signal-cli
//! prints with `--output json` (and returns over JSON-RPC) and are converted
//! into result types before leaving the crate.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::recipient::external_group_id;

// =============================================================================
// Requests
// =============================================================================

/// How the message body of a send is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextMode {
    /// Sent as-is.
    #[default]
    Normal,
    /// Markdown-like delimiters become text styles (see [`crate::textstyle`]).
    Styled,
}

/// Reply-to reference attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub timestamp: i64,
    pub author: String,
    #[serde(default)]
    pub message: Option<String>,
    /// `start:length:recipient` entries.
    #[serde(default)]
    pub mentions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPreview {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Path of a staged preview image.
    #[serde(default)]
    pub image: Option<String>,
}

/// One logical send to one or more recipients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendRequest {
    pub account: String,
    pub recipients: Vec<String>,
    pub message: String,
    pub text_mode: TextMode,
    /// Paths of already staged attachment files.
    pub attachments: Vec<String>,
    /// `start:length:recipient` entries.
    pub mentions: Vec<String>,
    pub quote: Option<Quote>,
    /// `packId:stickerId`.
    pub sticker: Option<String>,
    /// Timestamp of the message this one replaces.
    pub edit_timestamp: Option<i64>,
    pub link_preview: Option<LinkPreview>,
    pub notify_self: bool,
    pub view_once: bool,
}

impl SendRequest {
    pub fn new(account: &str, recipients: &[&str], message: &str) -> Self {
        Self {
            account: account.to_string(),
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            message: message.to_string(),
            ..Self::default()
        }
    }

    pub fn styled(mut self) -> Self {
        self.text_mode = TextMode::Styled;
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Who may perform a group action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupPermission {
    EveryMember,
    OnlyAdmins,
}

impl GroupPermission {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupPermission::EveryMember => "every-member",
            GroupPermission::OnlyAdmins => "only-admins",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupLinkState {
    Enabled,
    EnabledWithApproval,
    Disabled,
}

impl GroupLinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupLinkState::Enabled => "enabled",
            GroupLinkState::EnabledWithApproval => "enabled-with-approval",
            GroupLinkState::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupPermissions {
    pub add_members: Option<GroupPermission>,
    pub edit_details: Option<GroupPermission>,
    pub send_messages: Option<GroupPermission>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateGroup {
    pub name: String,
    pub members: Vec<String>,
    pub description: Option<String>,
    pub permissions: GroupPermissions,
    pub group_link: Option<GroupLinkState>,
    /// Disappearing-message timer in seconds.
    pub expiration_secs: Option<u32>,
}

/// Changes to a group's details. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateGroup {
    pub name: Option<String>,
    pub description: Option<String>,
    pub avatar: Option<PathBuf>,
    pub expiration_secs: Option<u32>,
    pub permissions: GroupPermissions,
    pub group_link: Option<GroupLinkState>,
}

impl UpdateGroup {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// How to trust an identity key. Exactly one of the two must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustIdentity {
    pub verified_safety_number: Option<String>,
    pub trust_all_known_keys: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub about: Option<String>,
    pub about_emoji: Option<String>,
    /// Path of a staged avatar image.
    pub avatar: Option<PathBuf>,
    pub remove_avatar: bool,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    /// Author of the message being reacted to.
    pub target_author: String,
    /// Timestamp of the message being reacted to.
    pub timestamp: i64,
    #[serde(default)]
    pub remove: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptKind {
    Read,
    Viewed,
}

impl ReceiptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptKind::Read => "read",
            ReceiptKind::Viewed => "viewed",
        }
    }
}

/// Options for a one-shot `receive` in process mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveOptions {
    /// Seconds to wait for new messages.
    pub timeout_secs: f64,
    pub max_messages: Option<u32>,
    pub ignore_attachments: bool,
    pub ignore_stories: bool,
    pub send_read_receipts: bool,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            timeout_secs: 1.0,
            max_messages: None,
            ignore_attachments: false,
            ignore_stories: false,
            send_read_receipts: false,
        }
    }
}

// =============================================================================
// Results
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub name: String,
    /// External id (`group.<base64>`).
    pub id: String,
    pub internal_id: String,
    pub members: Vec<String>,
    pub blocked: bool,
    pub pending_invites: Vec<String>,
    pub pending_requests: Vec<String>,
    pub invite_link: String,
    pub admins: Vec<String>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityEntry {
    pub number: String,
    #[serde(default)]
    pub uuid: Option<String>,
    /// Trust level, e.g. `TRUSTED_UNVERIFIED`.
    pub status: String,
    pub fingerprint: String,
    pub safety_number: String,
    /// When the key was first seen, serialized as RFC 3339.
    #[serde(default)]
    pub added: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub number: String,
    pub registered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameInfo {
    pub username: String,
    pub username_link: String,
}

// =============================================================================
// signal-cli JSON shapes
// =============================================================================

/// A group member as listed by signal-cli. Older releases print bare
/// numbers instead of address objects.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum EngineAddress {
    Object {
        #[serde(default)]
        number: Option<String>,
        #[serde(default)]
        uuid: Option<String>,
    },
    Plain(String),
}

impl EngineAddress {
    /// Phone number when known, otherwise the UUID.
    fn into_identifier(self) -> Option<String> {
        match self {
            EngineAddress::Object { number, uuid } => number.or(uuid),
            EngineAddress::Plain(address) => Some(address),
        }
    }
}

fn identifiers(addresses: Vec<EngineAddress>) -> Vec<String> {
    addresses
        .into_iter()
        .filter_map(EngineAddress::into_identifier)
        .collect()
}

/// Matches an entry of signal-cli's `listGroups -d` output.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EngineGroup {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_blocked: bool,
    #[serde(default)]
    pub members: Vec<EngineAddress>,
    #[serde(default)]
    pub pending_members: Vec<EngineAddress>,
    #[serde(default)]
    pub requesting_members: Vec<EngineAddress>,
    #[serde(default)]
    pub admins: Vec<EngineAddress>,
    #[serde(default)]
    pub group_invite_link: Option<String>,
}

impl From<EngineGroup> for GroupEntry {
    fn from(group: EngineGroup) -> Self {
        Self {
            name: group.name.unwrap_or_default(),
            id: external_group_id(&group.id),
            internal_id: group.id,
            members: identifiers(group.members),
            blocked: group.is_blocked,
            pending_invites: identifiers(group.pending_members),
            pending_requests: identifiers(group.requesting_members),
            invite_link: group.group_invite_link.unwrap_or_default(),
            admins: identifiers(group.admins),
            description: group.description.unwrap_or_default(),
        }
    }
}

/// Matches an entry of signal-cli's `listIdentities` output.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EngineIdentity {
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub safety_number: Option<String>,
    #[serde(default)]
    pub trust_level: Option<String>,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub added_timestamp: Option<i64>,
}

impl From<EngineIdentity> for IdentityEntry {
    fn from(identity: EngineIdentity) -> Self {
        Self {
            number: identity
                .number
                .or_else(|| identity.uuid.clone())
                .unwrap_or_default(),
            uuid: identity.uuid,
            status: identity.trust_level.unwrap_or_default(),
            fingerprint: identity.fingerprint.unwrap_or_default(),
            safety_number: identity.safety_number.unwrap_or_default(),
            added: identity
                .added_timestamp
                .filter(|millis| *millis > 0)
                .and_then(DateTime::<Utc>::from_timestamp_millis),
        }
    }
}

/// Matches an entry of signal-cli's `getUserStatus` output.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EngineUserStatus {
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub is_registered: bool,
}

impl From<EngineUserStatus> for SearchResult {
    fn from(status: EngineUserStatus) -> Self {
        Self {
            number: status.number.or(status.recipient).unwrap_or_default(),
            registered: status.is_registered,
        }
    }
}

/// Matches signal-cli's `updateAccount --username` output.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EngineUsername {
    pub username: String,
    #[serde(default)]
    pub username_link: Option<String>,
}

impl From<EngineUsername> for UsernameInfo {
    fn from(username: EngineUsername) -> Self {
        Self {
            username: username.username,
            username_link: username.username_link.unwrap_or_default(),
        }
    }
}

/// Matches an entry of signal-cli's `listAccounts` output.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct EngineAccount {
    pub number: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_group_deserialize() {
        let json = r#"{
            "id": "ZmFrZS1ncm91cC1pZA==",
            "name": "Climbing",
            "description": "Tuesdays",
            "isMember": true,
            "isBlocked": false,
            "members": [{"number": "+4915112345678", "uuid": "b1f2a3c4-1234-4abc-9def-0123456789ab"},
                        {"number": null, "uuid": "c2f2a3c4-1234-4abc-9def-0123456789ab"}],
            "pendingMembers": [],
            "requestingMembers": [{"number": "+15551234567"}],
            "admins": [{"number": "+4915112345678"}],
            "groupInviteLink": "https://signal.group/#abc"
        }"#;

        let entry: GroupEntry = serde_json::from_str::<EngineGroup>(json).unwrap().into();

        assert_eq!(entry.name, "Climbing");
        assert_eq!(entry.internal_id, "ZmFrZS1ncm91cC1pZA==");
        assert_eq!(entry.id, external_group_id("ZmFrZS1ncm91cC1pZA=="));
        assert_eq!(
            entry.members,
            vec![
                "+4915112345678".to_string(),
                "c2f2a3c4-1234-4abc-9def-0123456789ab".to_string()
            ]
        );
        assert_eq!(entry.pending_requests, vec!["+15551234567".to_string()]);
        assert_eq!(entry.admins, vec!["+4915112345678".to_string()]);
        assert_eq!(entry.invite_link, "https://signal.group/#abc");
        assert!(!entry.blocked);
    }

    #[test]
    fn test_group_with_plain_member_strings() {
        let json = r#"{"id": "aWQ=", "members": ["+4915112345678"]}"#;
        let entry: GroupEntry = serde_json::from_str::<EngineGroup>(json).unwrap().into();

        assert_eq!(entry.members, vec!["+4915112345678".to_string()]);
        assert_eq!(entry.name, "");
        assert_eq!(entry.description, "");
    }

    #[test]
    fn test_identity_added_is_rfc3339() {
        let json = r#"{
            "number": "+4915112345678",
            "uuid": "b1f2a3c4-1234-4abc-9def-0123456789ab",
            "fingerprint": "05 aa bb",
            "safetyNumber": "12345 67890",
            "trustLevel": "TRUSTED_UNVERIFIED",
            "addedTimestamp": 1700000000000
        }"#;

        let entry: IdentityEntry = serde_json::from_str::<EngineIdentity>(json).unwrap().into();
        assert_eq!(entry.status, "TRUSTED_UNVERIFIED");
        assert_eq!(entry.safety_number, "12345 67890");

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["added"], "2023-11-14T22:13:20Z");
    }

    #[test]
    fn test_identity_without_number_uses_uuid() {
        let json = r#"{"uuid": "b1f2a3c4-1234-4abc-9def-0123456789ab", "addedTimestamp": 0}"#;
        let entry: IdentityEntry = serde_json::from_str::<EngineIdentity>(json).unwrap().into();

        assert_eq!(entry.number, "b1f2a3c4-1234-4abc-9def-0123456789ab");
        assert_eq!(entry.added, None);
    }

    #[test]
    fn test_user_status_deserialize() {
        let json = r#"[{"recipient": "+4915112345678", "number": "+4915112345678", "uuid": "x", "isRegistered": true},
                       {"recipient": "+15551234567", "number": null, "isRegistered": false}]"#;
        let results: Vec<SearchResult> = serde_json::from_str::<Vec<EngineUserStatus>>(json)
            .unwrap()
            .into_iter()
            .map(SearchResult::from)
            .collect();

        assert_eq!(
            results,
            vec![
                SearchResult {
                    number: "+4915112345678".to_string(),
                    registered: true
                },
                SearchResult {
                    number: "+15551234567".to_string(),
                    registered: false
                },
            ]
        );
    }

    #[test]
    fn test_update_group_is_empty() {
        assert!(UpdateGroup::default().is_empty());
        let update = UpdateGroup {
            name: Some("New".to_string()),
            ..UpdateGroup::default()
        };
        assert!(!update.is_empty());
    }

    #[test]
    fn test_send_request_builder() {
        let request = SendRequest::new("+4915112345678", &["alice.42"], "hi").styled();
        assert_eq!(request.text_mode, TextMode::Styled);
        assert_eq!(request.recipients, vec!["alice.42".to_string()]);
        assert!(request.attachments.is_empty());
    }

    #[test]
    fn test_permission_strings() {
        assert_eq!(GroupPermission::OnlyAdmins.as_str(), "only-admins");
        assert_eq!(GroupLinkState::EnabledWithApproval.as_str(), "enabled-with-approval");
        let parsed: GroupPermission = serde_json::from_str(r#""every-member""#).unwrap();
        assert_eq!(parsed, GroupPermission::EveryMember);
    }
}
