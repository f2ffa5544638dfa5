//! Operation dispatcher.
//!
//! [`Bridge`] is the single entry point for callers. For every operation it
//! validates the input, builds either a signal-cli argument list (process
//! mode) or JSON-RPC params (json-rpc mode), hands that to the configured
//! [`Transport`] and turns the reply into a result model or a
//! [`BridgeError`].
//!
//! ```ignore
//! let bridge = Bridge::from_config(&BridgeConfig::load()?).await;
//! let request = SendRequest::new("+4915112345678", &["+4915187654321"], "**hi**").styled();
//! let timestamps = bridge.send(&request).await?;
//! ```
//!
//! Nothing reaches the transport until validation has passed, so an
//! `InvalidArgument` error always means no message was sent.

use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{BridgeConfig, TransportMode};
use crate::error::{BridgeError, BridgeResult};
use crate::models::{
    CreateGroup, EngineAccount, EngineGroup, EngineIdentity, EngineUserStatus, EngineUsername,
    GroupEntry, IdentityEntry, ProfileUpdate, Reaction, ReceiptKind, ReceiveOptions, SearchResult,
    SendRequest, TextMode, TrustIdentity, UpdateGroup, UsernameInfo,
};
use crate::recipient::{
    classify, external_group_id, internal_group_id, is_phone_number, RecipientKind, RecipientSet,
};
use crate::rpc::Subscription;
use crate::textstyle;
use crate::transport::{Transport, TransportStrategy};

// =============================================================================
// Argument lists and params
// =============================================================================

/// signal-cli command line under construction.
#[derive(Debug, Default)]
struct Argv(Vec<String>);

impl Argv {
    fn arg(mut self, arg: impl Into<String>) -> Self {
        self.0.push(arg.into());
        self
    }

    fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.0.extend(args.into_iter().map(Into::into));
        self
    }

    fn flag(self, flag: &str, enabled: bool) -> Self {
        if enabled {
            self.arg(flag)
        } else {
            self
        }
    }

    fn opt<T: ToString>(self, flag: &str, value: Option<T>) -> Self {
        match value {
            Some(value) => self.arg(flag).arg(value.to_string()),
            None => self,
        }
    }

    /// `flag v1 v2 ...`, omitted when `values` is empty.
    fn list(self, flag: &str, values: &[String]) -> Self {
        if values.is_empty() {
            self
        } else {
            self.arg(flag).args(values)
        }
    }
}

/// Drop null and empty-array params so signal-cli sees them as unset.
fn compact(params: Value) -> Value {
    match params {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, value)| match value {
                    Value::Null => false,
                    Value::Array(items) => !items.is_empty(),
                    _ => true,
                })
                .collect(),
        ),
        other => other,
    }
}

/// Params value of a boolean switch: present only when set.
fn switch(enabled: bool) -> Option<bool> {
    enabled.then_some(true)
}

fn require(value: &str, what: &str) -> BridgeResult<()> {
    if value.trim().is_empty() {
        return Err(BridgeError::InvalidArgument(format!("{} must not be empty", what)));
    }
    Ok(())
}

fn parse_list<T: DeserializeOwned>(output: &str) -> BridgeResult<Vec<T>> {
    let output = output.trim();
    if output.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(output)?)
}

fn from_value<T: DeserializeOwned>(value: Value) -> BridgeResult<T> {
    Ok(serde_json::from_value(value)?)
}

/// Timestamp from a JSON `send` reply.
fn timestamp_from_value(reply: &Value) -> Option<i64> {
    reply.get("timestamp").and_then(Value::as_i64)
}

/// Timestamp from process-mode `send` output: the last line that is a bare
/// number or a JSON object with a `timestamp` field.
fn timestamp_from_output(output: &str) -> Option<i64> {
    output.lines().rev().map(str::trim).find_map(|line| {
        line.parse::<i64>().ok().or_else(|| {
            serde_json::from_str::<Value>(line)
                .ok()
                .as_ref()
                .and_then(timestamp_from_value)
        })
    })
}

/// Internal id of a group created in process mode. signal-cli prints either
/// `{"groupId": "..."}` or `Created new group: "..."`.
fn group_id_from_output(output: &str) -> Option<String> {
    for line in output.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if let Ok(value) = serde_json::from_str::<Value>(line) {
            if let Some(id) = value.get("groupId").and_then(Value::as_str) {
                return Some(id.to_string());
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("Created new group:") {
            let id = rest.trim().trim_matches('"');
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }
    None
}

/// Accounts from `listAccounts`, JSON or `Number: +49...` lines.
fn accounts_from_output(output: &str) -> BridgeResult<Vec<String>> {
    if let Ok(accounts) = parse_list::<EngineAccount>(output) {
        return Ok(accounts.into_iter().map(|account| account.number).collect());
    }

    Ok(output
        .lines()
        .map(str::trim)
        .map(|line| line.strip_prefix("Number:").unwrap_or(line).trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// A single conversation: a group, a number or a username.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Group(String),
    Number(String),
    Username(String),
}

impl Target {
    fn resolve(recipient: &str) -> BridgeResult<Self> {
        require(recipient, "recipient")?;
        Ok(match classify(recipient)? {
            RecipientKind::Group => Target::Group(internal_group_id(recipient)?),
            RecipientKind::Number => Target::Number(recipient.to_string()),
            RecipientKind::Username => Target::Username(recipient.to_string()),
        })
    }

    fn push_args(&self, argv: Argv) -> Argv {
        match self {
            Target::Group(id) => argv.arg("-g").arg(id),
            Target::Number(number) => argv.arg(number),
            Target::Username(username) => argv.arg("-u").arg(username),
        }
    }

    /// Merge the target into an object of params.
    fn with_params(&self, params: Value) -> Value {
        let mut map = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let (key, value) = match self {
            Target::Group(id) => ("groupId", json!(id)),
            Target::Number(number) => ("recipient", json!([number])),
            Target::Username(username) => ("username", json!([username])),
        };
        map.insert(key.to_string(), value);
        Value::Object(map)
    }
}

#[derive(Debug, Clone, Copy)]
enum MemberChange {
    AddMembers,
    RemoveMembers,
    AddAdmins,
    RemoveAdmins,
}

impl MemberChange {
    fn cli_flag(&self) -> &'static str {
        match self {
            MemberChange::AddMembers => "-m",
            MemberChange::RemoveMembers => "-r",
            MemberChange::AddAdmins => "--admin",
            MemberChange::RemoveAdmins => "--remove-admin",
        }
    }

    fn rpc_key(&self) -> &'static str {
        match self {
            MemberChange::AddMembers => "member",
            MemberChange::RemoveMembers => "removeMember",
            MemberChange::AddAdmins => "admin",
            MemberChange::RemoveAdmins => "removeAdmin",
        }
    }
}

// =============================================================================
// Bridge
// =============================================================================

/// Facade over the configured transport.
#[derive(Clone)]
pub struct Bridge {
    transport: Arc<dyn Transport>,
    engine_config_dir: Option<PathBuf>,
}

impl Bridge {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            engine_config_dir: None,
        }
    }

    /// Pass `--config <dir>` to every signal-cli invocation.
    pub fn with_engine_config_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.engine_config_dir = dir;
        self
    }

    /// Select the transport for `config.mode` and build a bridge on it.
    pub async fn from_config(config: &BridgeConfig) -> Self {
        let strategy = TransportStrategy::from_config(config).await;
        Self::new(Arc::new(strategy)).with_engine_config_dir(config.engine_config_dir.clone())
    }

    pub fn mode(&self) -> TransportMode {
        self.transport.mode()
    }

    fn is_rpc(&self) -> bool {
        self.mode() == TransportMode::JsonRpc
    }

    fn argv(&self, account: Option<&str>, json_output: bool) -> Argv {
        let mut argv = Argv::default();
        if let Some(dir) = &self.engine_config_dir {
            argv = argv.arg("--config").arg(dir.display().to_string());
        }
        if json_output {
            argv = argv.arg("-o").arg("json");
        }
        if let Some(account) = account {
            argv = argv.arg("-a").arg(account);
        }
        argv
    }

    async fn run(&self, argv: Argv, stdin: Option<String>) -> BridgeResult<String> {
        Ok(self.transport.execute(true, argv.0, stdin).await?)
    }

    async fn rpc(&self, account: &str, method: &str, params: Value) -> BridgeResult<Value> {
        let params = compact(params);
        let unset = match &params {
            Value::Object(map) => map.is_empty(),
            Value::Null => true,
            _ => false,
        };
        let params = (!unset).then_some(params);
        Ok(self.transport.call(account, method, params).await?)
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Send a message and return one timestamp per recipient class.
    ///
    /// Recipients are split into group, numbers and usernames; each non-empty
    /// class is one underlying send, in that order. The first failing send
    /// aborts the rest. Earlier sends are not undone.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for an empty account, no recipients, more than one
    ///   group, or a group mixed with other recipients
    /// - `RateLimited` with the challenge tokens needed to continue
    /// - any transport failure, mapped to `BridgeError`
    pub async fn send(&self, request: &SendRequest) -> BridgeResult<Vec<i64>> {
        require(&request.account, "account")?;
        let recipients = RecipientSet::classify(&request.recipients)?;

        let (text, text_styles) = match request.text_mode {
            TextMode::Styled => textstyle::parse(&request.message),
            TextMode::Normal => (request.message.clone(), Vec::new()),
        };

        let mut timestamps = Vec::new();
        for (kind, batch) in recipients.batches() {
            let timestamp = self.send_batch(request, kind, batch, &text, &text_styles).await?;
            debug!(account = %request.account, kind = kind.as_str(), timestamp, "Message sent");
            timestamps.push(timestamp);
        }
        Ok(timestamps)
    }

    async fn send_batch(
        &self,
        request: &SendRequest,
        kind: RecipientKind,
        batch: &[String],
        text: &str,
        text_styles: &[String],
    ) -> BridgeResult<i64> {
        let quote = request.quote.as_ref();
        let preview = request.link_preview.as_ref();

        if self.is_rpc() {
            let target = match kind {
                RecipientKind::Group => json!({"groupId": internal_group_id(&batch[0])?}),
                RecipientKind::Number => json!({"recipient": batch}),
                RecipientKind::Username => json!({"username": batch}),
            };
            let mut params = json!({
                "message": text,
                "attachments": request.attachments,
                "textStyle": text_styles,
                "mention": request.mentions,
                "quoteTimestamp": quote.map(|q| q.timestamp),
                "quoteAuthor": quote.map(|q| q.author.as_str()),
                "quoteMessage": quote.and_then(|q| q.message.as_deref()),
                "quoteMention": quote.map(|q| q.mentions.as_slice()),
                "sticker": request.sticker,
                "editTimestamp": request.edit_timestamp,
                "previewUrl": preview.map(|p| p.url.as_str()),
                "previewTitle": preview.and_then(|p| p.title.as_deref()),
                "previewDescription": preview.and_then(|p| p.description.as_deref()),
                "previewImage": preview.and_then(|p| p.image.as_deref()),
                "notifySelf": switch(request.notify_self),
                "viewOnce": switch(request.view_once),
            });
            if let (Value::Object(params), Value::Object(target)) = (&mut params, target) {
                params.extend(target);
            }

            let reply = self.rpc(&request.account, "send", params).await?;
            return timestamp_from_value(&reply).ok_or_else(|| {
                BridgeError::Internal("signal-cli did not return a message timestamp".to_string())
            });
        }

        let argv = self.argv(Some(&request.account), false).arg("send");
        let argv = match kind {
            RecipientKind::Group => argv.arg("-g").arg(internal_group_id(&batch[0])?),
            RecipientKind::Number => argv.args(batch),
            RecipientKind::Username => argv.arg("-u").args(batch),
        };
        let argv = argv
            .arg("--message-from-stdin")
            .list("--attachment", &request.attachments)
            .list("--text-style", text_styles)
            .list("--mention", &request.mentions)
            .opt("--quote-timestamp", quote.map(|q| q.timestamp))
            .opt("--quote-author", quote.map(|q| q.author.as_str()))
            .opt("--quote-message", quote.and_then(|q| q.message.as_deref()))
            .list("--quote-mention", quote.map(|q| q.mentions.as_slice()).unwrap_or_default())
            .opt("--sticker", request.sticker.as_deref())
            .opt("--edit-timestamp", request.edit_timestamp)
            .opt("--preview-url", preview.map(|p| p.url.as_str()))
            .opt("--preview-title", preview.and_then(|p| p.title.as_deref()))
            .opt("--preview-description", preview.and_then(|p| p.description.as_deref()))
            .opt("--preview-image", preview.and_then(|p| p.image.as_deref()))
            .flag("--notify-self", request.notify_self)
            .flag("--view-once", request.view_once);

        let output = self.run(argv, Some(text.to_string())).await?;
        timestamp_from_output(&output).ok_or_else(|| {
            BridgeError::Internal(format!(
                "Unexpected send output from signal-cli: {}",
                output.trim()
            ))
        })
    }

    pub async fn send_reaction(
        &self,
        account: &str,
        recipient: &str,
        reaction: &Reaction,
    ) -> BridgeResult<()> {
        require(account, "account")?;
        require(&reaction.emoji, "emoji")?;
        require(&reaction.target_author, "target author")?;
        if reaction.timestamp <= 0 {
            return Err(BridgeError::InvalidArgument(
                "timestamp of the target message must be set".to_string(),
            ));
        }
        let target = Target::resolve(recipient)?;

        if self.is_rpc() {
            let params = target.with_params(json!({
                "emoji": reaction.emoji,
                "targetAuthor": reaction.target_author,
                "targetTimestamp": reaction.timestamp,
                "remove": switch(reaction.remove),
            }));
            self.rpc(account, "sendReaction", params).await?;
            return Ok(());
        }

        let argv = target
            .push_args(self.argv(Some(account), false).arg("sendReaction"))
            .arg("-e")
            .arg(&reaction.emoji)
            .arg("-a")
            .arg(&reaction.target_author)
            .arg("-t")
            .arg(reaction.timestamp.to_string())
            .flag("-r", reaction.remove);
        self.run(argv, None).await?;
        Ok(())
    }

    pub async fn send_receipt(
        &self,
        account: &str,
        recipient: &str,
        kind: ReceiptKind,
        timestamp: i64,
    ) -> BridgeResult<()> {
        require(account, "account")?;
        let target = Target::resolve(recipient)?;
        let recipient = match target {
            Target::Group(_) => {
                return Err(BridgeError::InvalidArgument(
                    "Receipts can only be sent to a single recipient".to_string(),
                ))
            }
            Target::Number(recipient) | Target::Username(recipient) => recipient,
        };

        if self.is_rpc() {
            let params = json!({
                "recipient": recipient,
                "type": kind.as_str(),
                "targetTimestamp": [timestamp],
            });
            self.rpc(account, "sendReceipt", params).await?;
            return Ok(());
        }

        let argv = self
            .argv(Some(account), false)
            .arg("sendReceipt")
            .arg(recipient)
            .arg("--type")
            .arg(kind.as_str())
            .arg("-t")
            .arg(timestamp.to_string());
        self.run(argv, None).await?;
        Ok(())
    }

    pub async fn start_typing(&self, account: &str, recipient: &str) -> BridgeResult<()> {
        self.send_typing(account, recipient, false).await
    }

    pub async fn stop_typing(&self, account: &str, recipient: &str) -> BridgeResult<()> {
        self.send_typing(account, recipient, true).await
    }

    async fn send_typing(&self, account: &str, recipient: &str, stop: bool) -> BridgeResult<()> {
        require(account, "account")?;
        let target = Target::resolve(recipient)?;

        if self.is_rpc() {
            let params = target.with_params(json!({"stop": switch(stop)}));
            self.rpc(account, "sendTyping", params).await?;
            return Ok(());
        }

        let argv = target
            .push_args(self.argv(Some(account), false).arg("sendTyping"))
            .flag("-s", stop);
        self.run(argv, None).await?;
        Ok(())
    }

    /// Answer a rate-limit challenge with a solved captcha.
    pub async fn submit_rate_limit_challenge(
        &self,
        account: &str,
        challenge_token: &str,
        captcha: &str,
    ) -> BridgeResult<()> {
        require(account, "account")?;
        require(challenge_token, "challenge token")?;
        require(captcha, "captcha")?;

        if self.is_rpc() {
            let params = json!({"challenge": challenge_token, "captcha": captcha});
            self.rpc(account, "submitRateLimitChallenge", params).await?;
            return Ok(());
        }

        let argv = self
            .argv(Some(account), false)
            .arg("submitRateLimitChallenge")
            .arg("--challenge")
            .arg(challenge_token)
            .arg("--captcha")
            .arg(captcha);
        self.run(argv, None).await?;
        Ok(())
    }

    /// Fetch pending messages once (process mode). Lines that are not JSON
    /// are skipped.
    pub async fn receive(&self, account: &str, options: &ReceiveOptions) -> BridgeResult<Vec<Value>> {
        require(account, "account")?;
        if self.is_rpc() {
            return Err(BridgeError::InvalidArgument(
                "receive is not available in json-rpc mode, use subscribe instead".to_string(),
            ));
        }

        let argv = self
            .argv(Some(account), true)
            .arg("receive")
            .arg("-t")
            .arg(options.timeout_secs.to_string())
            .opt("--max-messages", options.max_messages)
            .flag("--ignore-attachments", options.ignore_attachments)
            .flag("--ignore-stories", options.ignore_stories)
            .flag("--send-read-receipts", options.send_read_receipts);
        let output = self.run(argv, None).await?;

        let mut messages = Vec::new();
        for line in output.lines().map(str::trim).filter(|line| !line.is_empty()) {
            match serde_json::from_str::<Value>(line) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(account, "Skipping malformed receive output line: {}", e),
            }
        }
        Ok(messages)
    }

    /// Subscribe to inbound events for `account` (json-rpc mode).
    pub fn subscribe(&self, account: &str) -> BridgeResult<Subscription> {
        require(account, "account")?;
        Ok(self.transport.subscribe(account)?)
    }

    pub fn unsubscribe(&self, account: &str, token: &Uuid) -> BridgeResult<bool> {
        require(account, "account")?;
        Ok(self.transport.unsubscribe(account, token)?)
    }

    // =========================================================================
    // Registration and devices
    // =========================================================================

    pub async fn register(
        &self,
        account: &str,
        use_voice: bool,
        captcha: Option<&str>,
    ) -> BridgeResult<()> {
        require(account, "account")?;

        if self.is_rpc() {
            let params = json!({"voice": switch(use_voice), "captcha": captcha});
            self.rpc(account, "register", params).await?;
            return Ok(());
        }

        let argv = self
            .argv(Some(account), false)
            .arg("register")
            .flag("--voice", use_voice)
            .opt("--captcha", captcha);
        self.run(argv, None).await?;
        Ok(())
    }

    pub async fn verify(&self, account: &str, token: &str, pin: Option<&str>) -> BridgeResult<()> {
        require(account, "account")?;
        require(token, "verification code")?;

        if self.is_rpc() {
            let params = json!({"verificationCode": token, "pin": pin});
            self.rpc(account, "verify", params).await?;
            return Ok(());
        }

        let argv = self
            .argv(Some(account), false)
            .arg("verify")
            .arg(token)
            .opt("--pin", pin);
        self.run(argv, None).await?;
        Ok(())
    }

    /// Unregister the account, optionally deleting it on the server and
    /// removing its local data afterwards.
    pub async fn unregister(
        &self,
        account: &str,
        delete_account: bool,
        delete_local_data: bool,
    ) -> BridgeResult<()> {
        require(account, "account")?;

        if self.is_rpc() {
            let params = json!({"deleteAccount": switch(delete_account)});
            self.rpc(account, "unregister", params).await?;
            if delete_local_data {
                self.rpc(account, "deleteLocalAccountData", Value::Null).await?;
            }
            return Ok(());
        }

        let argv = self
            .argv(Some(account), false)
            .arg("unregister")
            .flag("--delete-account", delete_account);
        self.run(argv, None).await?;

        if delete_local_data {
            let argv = self.argv(Some(account), false).arg("deleteLocalAccountData");
            self.run(argv, None).await?;
        }
        Ok(())
    }

    /// Start linking this machine as a secondary device and return the
    /// `sgnl://linkdevice?...` URI to show as a QR code.
    ///
    /// signal-cli keeps running until the primary device confirms, so only
    /// the first line of its output is awaited.
    pub async fn link_device(&self, device_name: &str) -> BridgeResult<String> {
        require(device_name, "device name")?;
        if self.is_rpc() {
            return Err(BridgeError::InvalidArgument(
                "Linking devices is only available in normal mode".to_string(),
            ));
        }

        let argv = self.argv(None, false).arg("link").arg("-n").arg(device_name);
        let uri = self.transport.execute(false, argv.0, None).await?;
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(BridgeError::Internal(
                "signal-cli did not print a link URI".to_string(),
            ));
        }
        Ok(uri.to_string())
    }

    // =========================================================================
    // Groups
    // =========================================================================

    /// Create a group and return its external id.
    pub async fn create_group(&self, account: &str, group: &CreateGroup) -> BridgeResult<String> {
        require(account, "account")?;
        require(&group.name, "group name")?;
        let permissions = &group.permissions;

        let internal_id = if self.is_rpc() {
            let params = json!({
                "name": group.name,
                "member": group.members,
                "description": group.description,
                "setPermissionAddMember": permissions.add_members.map(|p| p.as_str()),
                "setPermissionEditDetails": permissions.edit_details.map(|p| p.as_str()),
                "setPermissionSendMessages": permissions.send_messages.map(|p| p.as_str()),
                "link": group.group_link.map(|l| l.as_str()),
                "expiration": group.expiration_secs,
            });
            let reply = self.rpc(account, "updateGroup", params).await?;
            reply
                .get("groupId")
                .and_then(Value::as_str)
                .map(str::to_string)
        } else {
            let argv = self
                .argv(Some(account), true)
                .arg("updateGroup")
                .arg("-n")
                .arg(&group.name)
                .list("-m", &group.members)
                .opt("-d", group.description.as_deref())
                .opt("--set-permission-add-member", permissions.add_members.map(|p| p.as_str()))
                .opt("--set-permission-edit-details", permissions.edit_details.map(|p| p.as_str()))
                .opt("--set-permission-send-messages", permissions.send_messages.map(|p| p.as_str()))
                .opt("--link", group.group_link.map(|l| l.as_str()))
                .opt("-e", group.expiration_secs);
            let output = self.run(argv, None).await?;
            group_id_from_output(&output)
        };

        let internal_id = internal_id.ok_or_else(|| {
            BridgeError::Internal("signal-cli did not return the new group id".to_string())
        })?;
        Ok(external_group_id(&internal_id))
    }

    /// Change a group's name, description, avatar or settings. An empty
    /// update is a no-op.
    pub async fn update_group(
        &self,
        account: &str,
        group_id: &str,
        update: &UpdateGroup,
    ) -> BridgeResult<()> {
        require(account, "account")?;
        let internal_id = internal_group_id(group_id)?;
        if update.is_empty() {
            return Ok(());
        }
        let permissions = &update.permissions;
        let avatar = update.avatar.as_ref().map(|path| path.display().to_string());

        if self.is_rpc() {
            let params = json!({
                "groupId": internal_id,
                "name": update.name,
                "description": update.description,
                "avatar": avatar,
                "expiration": update.expiration_secs,
                "setPermissionAddMember": permissions.add_members.map(|p| p.as_str()),
                "setPermissionEditDetails": permissions.edit_details.map(|p| p.as_str()),
                "setPermissionSendMessages": permissions.send_messages.map(|p| p.as_str()),
                "link": update.group_link.map(|l| l.as_str()),
            });
            self.rpc(account, "updateGroup", params).await?;
            return Ok(());
        }

        let argv = self
            .argv(Some(account), false)
            .arg("updateGroup")
            .arg("-g")
            .arg(internal_id)
            .opt("-n", update.name.as_deref())
            .opt("-d", update.description.as_deref())
            .opt("--avatar", avatar)
            .opt("-e", update.expiration_secs)
            .opt("--set-permission-add-member", permissions.add_members.map(|p| p.as_str()))
            .opt("--set-permission-edit-details", permissions.edit_details.map(|p| p.as_str()))
            .opt("--set-permission-send-messages", permissions.send_messages.map(|p| p.as_str()))
            .opt("--link", update.group_link.map(|l| l.as_str()));
        self.run(argv, None).await?;
        Ok(())
    }

    pub async fn list_groups(&self, account: &str) -> BridgeResult<Vec<GroupEntry>> {
        require(account, "account")?;

        let groups: Vec<EngineGroup> = if self.is_rpc() {
            from_value(self.rpc(account, "listGroups", json!({"detailed": true})).await?)?
        } else {
            let argv = self.argv(Some(account), true).arg("listGroups").arg("-d");
            parse_list(&self.run(argv, None).await?)?
        };

        Ok(groups.into_iter().map(GroupEntry::from).collect())
    }

    /// Look up one group by external id. `Ok(None)` if the account is not in
    /// such a group.
    pub async fn get_group(&self, account: &str, group_id: &str) -> BridgeResult<Option<GroupEntry>> {
        let internal_id = internal_group_id(group_id)?;
        Ok(self
            .list_groups(account)
            .await?
            .into_iter()
            .find(|group| group.internal_id == internal_id))
    }

    /// Leave the group and delete it locally.
    pub async fn delete_group(&self, account: &str, group_id: &str) -> BridgeResult<()> {
        require(account, "account")?;
        let internal_id = internal_group_id(group_id)?;

        if self.is_rpc() {
            let params = json!({"groupId": internal_id, "delete": true});
            self.rpc(account, "quitGroup", params).await?;
            return Ok(());
        }

        let argv = self
            .argv(Some(account), false)
            .arg("quitGroup")
            .arg("-g")
            .arg(internal_id)
            .arg("--delete");
        self.run(argv, None).await?;
        Ok(())
    }

    pub async fn add_members(&self, account: &str, group_id: &str, members: &[String]) -> BridgeResult<()> {
        self.change_members(account, group_id, MemberChange::AddMembers, members).await
    }

    pub async fn remove_members(&self, account: &str, group_id: &str, members: &[String]) -> BridgeResult<()> {
        self.change_members(account, group_id, MemberChange::RemoveMembers, members).await
    }

    pub async fn add_admins(&self, account: &str, group_id: &str, admins: &[String]) -> BridgeResult<()> {
        self.change_members(account, group_id, MemberChange::AddAdmins, admins).await
    }

    pub async fn remove_admins(&self, account: &str, group_id: &str, admins: &[String]) -> BridgeResult<()> {
        self.change_members(account, group_id, MemberChange::RemoveAdmins, admins).await
    }

    /// Apply a membership change. An empty list succeeds without touching
    /// the transport; otherwise the group must still exist.
    async fn change_members(
        &self,
        account: &str,
        group_id: &str,
        change: MemberChange,
        members: &[String],
    ) -> BridgeResult<()> {
        require(account, "account")?;
        if members.is_empty() {
            return Ok(());
        }
        for member in members {
            require(member, "member")?;
        }
        let internal_id = internal_group_id(group_id)?;

        if self.get_group(account, group_id).await?.is_none() {
            return Err(BridgeError::NotFound(format!("No group with id {}", group_id)));
        }

        if self.is_rpc() {
            let mut params = Map::new();
            params.insert("groupId".to_string(), json!(internal_id));
            params.insert(change.rpc_key().to_string(), json!(members));
            self.rpc(account, "updateGroup", Value::Object(params)).await?;
            return Ok(());
        }

        let argv = self
            .argv(Some(account), false)
            .arg("updateGroup")
            .arg("-g")
            .arg(internal_id)
            .list(change.cli_flag(), members);
        self.run(argv, None).await?;
        Ok(())
    }

    pub async fn block_group(&self, account: &str, group_id: &str) -> BridgeResult<()> {
        require(account, "account")?;
        let internal_id = internal_group_id(group_id)?;

        if self.is_rpc() {
            self.rpc(account, "block", json!({"groupId": [internal_id]})).await?;
            return Ok(());
        }

        let argv = self.argv(Some(account), false).arg("block").arg("-g").arg(internal_id);
        self.run(argv, None).await?;
        Ok(())
    }

    /// Accept a pending group invitation.
    pub async fn join_group(&self, account: &str, group_id: &str) -> BridgeResult<()> {
        require(account, "account")?;
        let internal_id = internal_group_id(group_id)?;

        if self.is_rpc() {
            self.rpc(account, "updateGroup", json!({"groupId": internal_id})).await?;
            return Ok(());
        }

        let argv = self.argv(Some(account), false).arg("updateGroup").arg("-g").arg(internal_id);
        self.run(argv, None).await?;
        Ok(())
    }

    pub async fn quit_group(&self, account: &str, group_id: &str) -> BridgeResult<()> {
        require(account, "account")?;
        let internal_id = internal_group_id(group_id)?;

        if self.is_rpc() {
            self.rpc(account, "quitGroup", json!({"groupId": internal_id})).await?;
            return Ok(());
        }

        let argv = self.argv(Some(account), false).arg("quitGroup").arg("-g").arg(internal_id);
        self.run(argv, None).await?;
        Ok(())
    }

    // =========================================================================
    // Identities, profile and account
    // =========================================================================

    pub async fn list_identities(&self, account: &str) -> BridgeResult<Vec<IdentityEntry>> {
        require(account, "account")?;

        let identities: Vec<EngineIdentity> = if self.is_rpc() {
            from_value(self.rpc(account, "listIdentities", Value::Null).await?)?
        } else {
            let argv = self.argv(Some(account), true).arg("listIdentities");
            parse_list(&self.run(argv, None).await?)?
        };

        Ok(identities.into_iter().map(IdentityEntry::from).collect())
    }

    /// Mark the identity key of `number` as trusted, either by a verified
    /// safety number or by trusting all its known keys.
    pub async fn trust_identity(
        &self,
        account: &str,
        number: &str,
        trust: &TrustIdentity,
    ) -> BridgeResult<()> {
        require(account, "account")?;
        require(number, "number to trust")?;
        let safety_number = trust.verified_safety_number.as_deref().filter(|s| !s.is_empty());
        if safety_number.is_some() == trust.trust_all_known_keys {
            return Err(BridgeError::InvalidArgument(
                "Exactly one of verified_safety_number or trust_all_known_keys must be set"
                    .to_string(),
            ));
        }

        if self.is_rpc() {
            let params = json!({
                "recipient": [number],
                "verifiedSafetyNumber": safety_number,
                "trustAllKnownKeys": switch(trust.trust_all_known_keys),
            });
            self.rpc(account, "trust", params).await?;
            return Ok(());
        }

        let argv = self
            .argv(Some(account), false)
            .arg("trust")
            .arg(number)
            .opt("--verified-safety-number", safety_number)
            .flag("--trust-all-known-keys", trust.trust_all_known_keys);
        self.run(argv, None).await?;
        Ok(())
    }

    pub async fn update_profile(&self, account: &str, profile: &ProfileUpdate) -> BridgeResult<()> {
        require(account, "account")?;
        if profile.avatar.is_some() && profile.remove_avatar {
            return Err(BridgeError::InvalidArgument(
                "Cannot set and remove the avatar in the same update".to_string(),
            ));
        }
        if profile.is_empty() {
            return Ok(());
        }
        let avatar = profile.avatar.as_ref().map(|path| path.display().to_string());

        if self.is_rpc() {
            let params = json!({
                "givenName": profile.name,
                "about": profile.about,
                "aboutEmoji": profile.about_emoji,
                "avatar": avatar,
                "removeAvatar": switch(profile.remove_avatar),
            });
            self.rpc(account, "updateProfile", params).await?;
            return Ok(());
        }

        let argv = self
            .argv(Some(account), false)
            .arg("updateProfile")
            .opt("--given-name", profile.name.as_deref())
            .opt("--about", profile.about.as_deref())
            .opt("--about-emoji", profile.about_emoji.as_deref())
            .opt("--avatar", avatar)
            .flag("--remove-avatar", profile.remove_avatar);
        self.run(argv, None).await?;
        Ok(())
    }

    /// Accounts this bridge can act as.
    ///
    /// In json-rpc mode these are the configured accounts; in normal mode
    /// signal-cli is asked for its registered accounts.
    pub async fn get_accounts(&self) -> BridgeResult<Vec<String>> {
        if self.is_rpc() {
            return Ok(self.transport.accounts());
        }

        let argv = self.argv(None, true).arg("listAccounts");
        accounts_from_output(&self.run(argv, None).await?)
    }

    /// Check which phone numbers are registered with Signal.
    pub async fn search_accounts(&self, account: &str, numbers: &[String]) -> BridgeResult<Vec<SearchResult>> {
        require(account, "account")?;
        if numbers.is_empty() {
            return Err(BridgeError::InvalidArgument(
                "Please provide at least one number".to_string(),
            ));
        }
        if let Some(invalid) = numbers.iter().find(|number| !is_phone_number(number)) {
            return Err(BridgeError::InvalidArgument(format!(
                "Invalid phone number {}",
                invalid
            )));
        }

        let statuses: Vec<EngineUserStatus> = if self.is_rpc() {
            from_value(self.rpc(account, "getUserStatus", json!({"recipient": numbers})).await?)?
        } else {
            let argv = self.argv(Some(account), true).arg("getUserStatus").args(numbers);
            parse_list(&self.run(argv, None).await?)?
        };

        Ok(statuses.into_iter().map(SearchResult::from).collect())
    }

    pub async fn set_username(&self, account: &str, username: &str) -> BridgeResult<UsernameInfo> {
        require(account, "account")?;
        require(username, "username")?;

        let reply: EngineUsername = if self.is_rpc() {
            from_value(self.rpc(account, "updateAccount", json!({"username": username})).await?)?
        } else {
            let argv = self
                .argv(Some(account), true)
                .arg("updateAccount")
                .arg("-u")
                .arg(username);
            serde_json::from_str(self.run(argv, None).await?.trim())?
        };

        Ok(reply.into())
    }

    pub async fn remove_username(&self, account: &str) -> BridgeResult<()> {
        require(account, "account")?;

        if self.is_rpc() {
            self.rpc(account, "updateAccount", json!({"deleteUsername": true})).await?;
            return Ok(());
        }

        let argv = self
            .argv(Some(account), false)
            .arg("updateAccount")
            .arg("--delete-username");
        self.run(argv, None).await?;
        Ok(())
    }

    /// Change phone-number privacy settings. `None` leaves a setting alone.
    pub async fn update_account_settings(
        &self,
        account: &str,
        discoverable_by_number: Option<bool>,
        share_number: Option<bool>,
    ) -> BridgeResult<()> {
        require(account, "account")?;
        if discoverable_by_number.is_none() && share_number.is_none() {
            return Ok(());
        }

        if self.is_rpc() {
            let params = json!({
                "discoverableByNumber": discoverable_by_number,
                "numberSharing": share_number,
            });
            self.rpc(account, "updateAccount", params).await?;
            return Ok(());
        }

        let argv = self
            .argv(Some(account), false)
            .arg("updateAccount")
            .opt("--discoverable-by-number", discoverable_by_number)
            .opt("--number-sharing", share_number);
        self.run(argv, None).await?;
        Ok(())
    }

    /// Set the registration lock PIN.
    pub async fn set_pin(&self, account: &str, pin: &str) -> BridgeResult<()> {
        require(account, "account")?;
        require(pin, "pin")?;

        if self.is_rpc() {
            self.rpc(account, "setPin", json!({"pin": pin})).await?;
            return Ok(());
        }

        let argv = self.argv(Some(account), false).arg("setPin").arg(pin);
        self.run(argv, None).await?;
        Ok(())
    }

    pub async fn remove_pin(&self, account: &str) -> BridgeResult<()> {
        require(account, "account")?;

        if self.is_rpc() {
            self.rpc(account, "removePin", Value::Null).await?;
            return Ok(());
        }

        let argv = self.argv(Some(account), false).arg("removePin");
        self.run(argv, None).await?;
        Ok(())
    }
}
