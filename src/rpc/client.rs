//! Multiplexed JSON-RPC 2.0 session with a signal-cli daemon.
//!
//! This module provides `RpcClient`, one long-lived connection per account.
//! Any number of tasks may `call()` concurrently: each request carries a
//! fresh UUID and parks on a oneshot channel until the receive loop sees the
//! reply with the same id. Messages whose id matches no pending request are
//! unsolicited events (incoming chat messages, receipts, ...) and are copied
//! to every subscriber of the session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::rpc::framing::{read_frame, write_message, Frame};
use crate::rpc::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};

/// Default capacity of each subscriber's delivery channel.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 128;

/// RPC-specific error types.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Failed to connect to the daemon.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// The session is dead; no reply will ever arrive.
    #[error("JSON-RPC session closed")]
    TransportClosed,

    /// Protocol-level error (encoding).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Daemon returned a JSON-RPC error response.
    #[error("Server error {code}: {message}")]
    Remote {
        /// JSON-RPC error code
        code: i64,
        /// Error message
        message: String,
        /// Optional additional data (rate-limit details live here)
        data: Option<Value>,
    },
}

impl From<JsonRpcError> for RpcError {
    fn from(err: JsonRpcError) -> Self {
        RpcError::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

type Reply = Result<Value, RpcError>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A registered consumer of unsolicited events.
#[derive(Debug)]
pub struct Subscription {
    /// Token to pass to `unsubscribe`.
    pub token: Uuid,
    /// Delivery channel. Events are dropped when it is full.
    pub receiver: mpsc::Receiver<Value>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once the subscription has
    /// been removed.
    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }
}

#[derive(Default)]
struct PendingTable {
    closed: bool,
    waiters: HashMap<String, oneshot::Sender<Reply>>,
}

/// State shared between callers and the receive loop.
struct Session {
    account: String,
    pending: Mutex<PendingTable>,
    subscribers: Mutex<HashMap<Uuid, mpsc::Sender<Value>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    fn new(account: String) -> Self {
        Self {
            account,
            pending: Mutex::new(PendingTable::default()),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Park a waiter for `id`. Fails once the session has been closed, so a
    /// request can never be registered after the final drain.
    fn register(&self, id: String) -> Result<oneshot::Receiver<Reply>, RpcError> {
        let mut table = lock(&self.pending);
        if table.closed {
            return Err(RpcError::TransportClosed);
        }
        let (tx, rx) = oneshot::channel();
        table.waiters.insert(id, tx);
        Ok(rx)
    }

    fn forget(&self, id: &str) {
        lock(&self.pending).waiters.remove(id);
    }

    /// Handle one line read from the daemon.
    fn route(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        let message: Value = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(account = %self.account, error = %e, line, "Skipping malformed line from engine");
                return;
            }
        };

        let envelope = match JsonRpcResponse::deserialize(&message) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(account = %self.account, error = %e, "Skipping non-envelope message from engine");
                return;
            }
        };

        if let Some(id) = envelope.correlation_id() {
            let waiter = lock(&self.pending).waiters.remove(&id);
            if let Some(waiter) = waiter {
                let JsonRpcResponse { result, error, .. } = envelope;
                let reply = match error {
                    Some(err) if err.code != 0 => Err(RpcError::from(err)),
                    _ => Ok(result.unwrap_or(Value::Null)),
                };
                debug!(account = %self.account, id = %id, ok = reply.is_ok(), "Routed JSON-RPC reply");
                // The caller may have been dropped; nothing to do then.
                let _ = waiter.send(reply);
                return;
            }
        }

        self.fan_out(message);
    }

    fn fan_out(&self, event: Value) {
        let mut subscribers = lock(&self.subscribers);
        if subscribers.is_empty() {
            debug!(account = %self.account, "No subscribers, dropping unsolicited event");
            return;
        }

        subscribers.retain(|token, sender| match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(account = %self.account, subscriber = %token, "Subscriber lagging, event dropped");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(account = %self.account, subscriber = %token, "Subscriber went away, removing");
                false
            }
        });
    }

    /// Mark the session dead and fail every pending request.
    fn close(&self) {
        let waiters = {
            let mut table = lock(&self.pending);
            table.closed = true;
            std::mem::take(&mut table.waiters)
        };

        if !waiters.is_empty() {
            info!(account = %self.account, pending = waiters.len(), "Failing pending requests on closed session");
        }
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(RpcError::TransportClosed));
        }
    }
}

/// Removes a request's waiter when its `call` future ends, including when
/// the caller drops it before a reply arrives.
struct WaiterGuard<'a> {
    session: &'a Session,
    id: &'a str,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.session.forget(self.id);
    }
}

async fn receive_loop<R>(session: Arc<Session>, mut reader: BufReader<R>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Line(line))) => session.route(&line),
            Ok(Some(Frame::Oversized(size))) => {
                warn!(account = %session.account, size, "Skipping oversized line from engine");
            }
            Ok(None) => {
                info!(account = %session.account, "JSON-RPC session closed by engine");
                break;
            }
            Err(e) => {
                warn!(account = %session.account, error = %format!("{e:#}"), "JSON-RPC read failed");
                break;
            }
        }
    }

    session.close();
}

/// Persistent JSON-RPC session for one account.
///
/// # Connection Lifecycle
///
/// - `dial()` - Connect to the daemon and start the receive loop
/// - `call()` - Send a request and wait for its correlated reply
/// - `subscribe()` / `unsubscribe()` - Manage unsolicited event consumers
///
/// There is no per-call timeout: a call resolves with the reply or when the
/// connection fails. Dropping the client stops the receive loop.
///
/// # Example
///
/// ```ignore
/// use signal_bridge::rpc::RpcClient;
/// use serde_json::json;
///
/// let client = RpcClient::dial("+4915112345678", "127.0.0.1:6001").await?;
/// let groups = client.call("listGroups", None).await?;
/// let sent = client
///     .call("send", Some(json!({"recipient": ["+4915187654321"], "message": "hi"})))
///     .await?;
/// ```
pub struct RpcClient {
    session: Arc<Session>,
    writer: AsyncMutex<BoxedWriter>,
    receive_task: JoinHandle<()>,
    subscriber_buffer: usize,
}

impl RpcClient {
    /// Connect to the daemon serving `account` at `address` (`host:port`).
    ///
    /// # Errors
    ///
    /// Returns `RpcError::ConnectionFailed` if the TCP connection cannot be
    /// established.
    pub async fn dial(account: &str, address: &str) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(RpcError::ConnectionFailed)?;

        info!(account, address, "Connected to JSON-RPC daemon");
        Ok(Self::from_stream(account, stream))
    }

    /// Run a session over an already-connected stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<S>(account: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let session = Arc::new(Session::new(account.into()));
        let receive_task = tokio::spawn(receive_loop(session.clone(), BufReader::new(read_half)));

        Self {
            session,
            writer: AsyncMutex::new(Box::new(write_half)),
            receive_task,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }

    /// Set the capacity of channels handed out by `subscribe()`.
    pub fn with_subscriber_buffer(mut self, capacity: usize) -> Self {
        self.subscriber_buffer = capacity.max(1);
        self
    }

    /// Account this session acts as.
    pub fn account(&self) -> &str {
        &self.session.account
    }

    /// Send a JSON-RPC 2.0 request and wait for the correlated reply.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The session is or becomes closed (`RpcError::TransportClosed`)
    /// - The daemon answers with a non-zero error code (`RpcError::Remote`)
    /// - The request cannot be serialized (`RpcError::Protocol`)
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let id = Uuid::new_v4().to_string();
        let request = JsonRpcRequest::new(method, params, id.clone());
        let body = serde_json::to_string(&request)
            .map_err(|e| RpcError::Protocol(format!("Failed to serialize request: {}", e)))?;

        let reply = self.session.register(id.clone())?;
        let _guard = WaiterGuard {
            session: &*self.session,
            id: &id,
        };
        debug!(account = %self.session.account, method, id = %id, "Sending JSON-RPC request");

        let written = {
            let mut writer = self.writer.lock().await;
            write_message(&mut *writer, &body).await
        };

        if let Err(e) = written {
            warn!(account = %self.session.account, error = %format!("{e:#}"), "JSON-RPC write failed");
            self.receive_task.abort();
            self.session.close();
        }

        match reply.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::TransportClosed),
        }
    }

    /// Register a new consumer of unsolicited events.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_buffer(self.subscriber_buffer)
    }

    /// Register a consumer whose channel holds at most `capacity` events.
    pub fn subscribe_with_buffer(&self, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let token = Uuid::new_v4();
        lock(&self.session.subscribers).insert(token, tx);
        debug!(account = %self.session.account, subscriber = %token, "Subscriber registered");
        Subscription {
            token,
            receiver: rx,
        }
    }

    /// Remove a consumer. Returns `false` if the token was unknown.
    pub fn unsubscribe(&self, token: &Uuid) -> bool {
        lock(&self.session.subscribers).remove(token).is_some()
    }

    /// Whether the connection has failed.
    pub fn is_closed(&self) -> bool {
        lock(&self.session.pending).closed
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        lock(&self.session.pending).waiters.len()
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.session.subscribers).len()
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.receive_task.abort();
        self.session.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::framing::{read_message, MAX_MESSAGE_SIZE};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);
    const ACCOUNT: &str = "+4915112345678";

    /// The daemon side of an in-memory session.
    struct FakeEngine {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeEngine {
        async fn next_request(&mut self) -> Value {
            let line = timeout(TEST_TIMEOUT, read_message(&mut self.reader))
                .await
                .expect("Test timed out")
                .expect("Read failed")
                .expect("Client closed the connection");
            serde_json::from_str(&line).expect("Request is not JSON")
        }

        async fn send(&mut self, message: Value) {
            self.send_raw(&message.to_string()).await;
        }

        async fn send_raw(&mut self, line: &str) {
            write_message(&mut self.writer, line).await.expect("Write failed");
        }

        async fn reply(&mut self, request: &Value, result: Value) {
            self.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": result}))
                .await;
        }
    }

    fn connected_pair() -> (RpcClient, FakeEngine) {
        let (client_side, engine_side) = duplex(64 * 1024);
        let client = RpcClient::from_stream(ACCOUNT, client_side);
        let (read_half, write_half) = tokio::io::split(engine_side);
        let engine = FakeEngine {
            reader: BufReader::new(read_half),
            writer: write_half,
        };
        (client, engine)
    }

    #[tokio::test]
    async fn test_request_envelope_shape() {
        let (client, mut engine) = connected_pair();

        let engine_side = async {
            let request = engine.next_request().await;
            assert_eq!(request["jsonrpc"], "2.0");
            assert_eq!(request["method"], "listGroups");
            assert_eq!(request["params"], json!({"detailed": true}));
            assert!(Uuid::parse_str(request["id"].as_str().unwrap()).is_ok());
            engine.reply(&request, json!([])).await;
        };

        let (result, ()) = tokio::join!(
            client.call("listGroups", Some(json!({"detailed": true}))),
            engine_side
        );
        assert_eq!(result.unwrap(), json!([]));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_receive_own_replies() {
        let (client, mut engine) = connected_pair();

        let engine_side = async {
            let first = engine.next_request().await;
            let second = engine.next_request().await;
            // Answer out of order.
            engine.reply(&second, json!({"method": second["method"]})).await;
            engine.reply(&first, json!({"method": first["method"]})).await;
        };

        let (groups, identities, ()) = tokio::join!(
            client.call("listGroups", None),
            client.call("listIdentities", None),
            engine_side
        );

        assert_eq!(groups.unwrap(), json!({"method": "listGroups"}));
        assert_eq!(identities.unwrap(), json!({"method": "listIdentities"}));
    }

    #[tokio::test]
    async fn test_remote_error_is_surfaced() {
        let (client, mut engine) = connected_pair();

        let engine_side = async {
            let request = engine.next_request().await;
            engine
                .send(json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "error": {"code": -1, "message": "Invalid group id"}
                }))
                .await;
        };

        let (result, ()) = tokio::join!(client.call("quitGroup", None), engine_side);
        match result {
            Err(RpcError::Remote { code, message, .. }) => {
                assert_eq!(code, -1);
                assert_eq!(message, "Invalid group id");
            }
            other => panic!("Expected Remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_error_code_is_success() {
        let (client, mut engine) = connected_pair();

        let engine_side = async {
            let request = engine.next_request().await;
            engine
                .send(json!({"id": request["id"], "result": {"ok": true}, "error": {"code": 0, "message": ""}}))
                .await;
        };

        let (result, ()) = tokio::join!(client.call("setPin", None), engine_side);
        assert_eq!(result.unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_malformed_line_is_skipped() {
        let (client, mut engine) = connected_pair();

        let engine_side = async {
            let request = engine.next_request().await;
            engine.send_raw("INFO  DaemonCommand - listening").await;
            engine.send_raw("").await;
            engine.reply(&request, json!({"timestamp": 1})).await;
        };

        let (result, ()) = tokio::join!(client.call("send", None), engine_side);
        assert_eq!(result.unwrap(), json!({"timestamp": 1}));
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_oversized_line_does_not_close_session() {
        let (client, mut engine) = connected_pair();

        let engine_side = async {
            let request = engine.next_request().await;
            let filler = vec![b'x'; MAX_MESSAGE_SIZE + 10];
            engine.writer.write_all(&filler).await.unwrap();
            engine.writer.write_all(b"\n").await.unwrap();
            engine.reply(&request, json!({"timestamp": 2})).await;
        };

        let (result, ()) = timeout(TEST_TIMEOUT, async {
            tokio::join!(client.call("send", None), engine_side)
        })
        .await
        .expect("Test timed out");

        assert_eq!(result.unwrap(), json!({"timestamp": 2}));
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_abandoned_call_leaves_no_waiter() {
        let (client, mut engine) = connected_pair();

        let abandoned = timeout(Duration::from_millis(50), client.call("listGroups", None)).await;
        assert!(abandoned.is_err());
        assert_eq!(client.pending_count(), 0);

        // The engine saw the request but never answered it.
        let request = engine.next_request().await;
        assert_eq!(request["method"], "listGroups");
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_unsolicited_event_reaches_every_subscriber() {
        let (client, mut engine) = connected_pair();
        let mut first = client.subscribe();
        let mut second = client.subscribe();

        let event = json!({
            "jsonrpc": "2.0",
            "method": "receive",
            "params": {"envelope": {"source": "+4915187654321", "timestamp": 5}}
        });

        engine.send(event.clone()).await;

        let got_first = timeout(TEST_TIMEOUT, first.recv()).await.unwrap().unwrap();
        let got_second = timeout(TEST_TIMEOUT, second.recv()).await.unwrap().unwrap();
        assert_eq!(got_first, event);
        assert_eq!(got_second, event);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reply_with_unknown_id_is_fanned_out() {
        let (client, mut engine) = connected_pair();
        let mut subscription = client.subscribe();

        let stray = json!({"jsonrpc": "2.0", "id": "not-pending", "result": {}});
        engine.send(stray.clone()).await;

        let got = timeout(TEST_TIMEOUT, subscription.recv()).await.unwrap().unwrap();
        assert_eq!(got, stray);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_does_not_block_others() {
        let (client, mut engine) = connected_pair();
        let mut stalled = client.subscribe_with_buffer(1);
        let mut active = client.subscribe();

        let engine_side = async {
            let request = engine.next_request().await;
            for n in 0..3 {
                engine.send(json!({"method": "receive", "params": {"n": n}})).await;
            }
            engine.reply(&request, json!(null)).await;
        };

        // The reply is routed after the events, so they have all been handled.
        let (result, ()) = tokio::join!(client.call("version", None), engine_side);
        assert_eq!(result.unwrap(), Value::Null);

        let mut seen = Vec::new();
        while let Ok(event) = active.receiver.try_recv() {
            seen.push(event["params"]["n"].as_i64().unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2]);

        assert_eq!(stalled.receiver.try_recv().unwrap()["params"]["n"], 0);
        assert!(stalled.receiver.try_recv().is_err());
        assert_eq!(client.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_removed_on_delivery() {
        let (client, mut engine) = connected_pair();
        let gone = client.subscribe();
        let _kept = client.subscribe();
        drop(gone);

        let engine_side = async {
            let request = engine.next_request().await;
            engine.send(json!({"method": "receive", "params": {}})).await;
            engine.reply(&request, json!(null)).await;
        };

        let (result, ()) = tokio::join!(client.call("version", None), engine_side);
        assert!(result.is_ok());
        assert_eq!(client.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let (client, _engine) = connected_pair();
        let subscription = client.subscribe();

        assert_eq!(client.subscriber_count(), 1);
        assert!(client.unsubscribe(&subscription.token));
        assert!(!client.unsubscribe(&subscription.token));
        assert_eq!(client.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending_requests() {
        let (client, mut engine) = connected_pair();
        let _subscription = client.subscribe();

        let engine_side = async move {
            let _request = engine.next_request().await;
            drop(engine);
        };

        let (result, ()) = tokio::join!(client.call("send", None), engine_side);
        assert!(matches!(result, Err(RpcError::TransportClosed)));
        assert!(client.is_closed());
        assert_eq!(client.pending_count(), 0);

        // Later calls fail fast and subscribers survive for a reconnect.
        let again = timeout(TEST_TIMEOUT, client.call("send", None)).await.unwrap();
        assert!(matches!(again, Err(RpcError::TransportClosed)));
        assert_eq!(client.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port that is very likely closed.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = RpcClient::dial(ACCOUNT, &address).await;
        assert!(matches!(result, Err(RpcError::ConnectionFailed(_))));
    }

    #[test]
    fn test_rpc_error_display() {
        let remote = RpcError::Remote {
            code: -5,
            message: "Rate limit".to_string(),
            data: None,
        };
        assert_eq!(remote.to_string(), "Server error -5: Rate limit");
        assert_eq!(RpcError::TransportClosed.to_string(), "JSON-RPC session closed");
    }
}
