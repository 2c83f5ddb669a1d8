use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::context::ClientChannel;
use crate::dispatch;
use crate::error::ServerError;
use crate::protocol::{
    CancelledParams, InitializeParams, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId,
};
use crate::server::Server;

/// Maximum bytes per JSON-RPC message (1 MiB).
const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Register a just-spawned request task for cancellation. A fast task can
/// finish (and run its own removal) before the handle lands in the map; the
/// task's removal is ordered before `is_finished()` turning true, so
/// re-checking after the insert closes the race without leaving a stale
/// entry behind.
fn track_inflight(
    inflight: &Mutex<HashMap<String, AbortHandle>>,
    key: String,
    handle: &tokio::task::JoinHandle<()>,
) {
    lock(inflight).insert(key.clone(), handle.abort_handle());
    if handle.is_finished() {
        lock(inflight).remove(&key);
    }
}

/// The session end of capability calls for one connected client.
///
/// All outbound traffic — responses, notifications, server→client requests —
/// funnels through one mpsc writer task, so sends stay FIFO for the session.
/// Server→client round trips are correlated by id through `pending`.
struct SessionChannel {
    out: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value, ServerError>>>>,
    next_id: AtomicI64,
}

impl SessionChannel {
    fn new(out: mpsc::UnboundedSender<String>) -> Self {
        Self {
            out,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    fn send_line(&self, line: String) -> Result<(), ServerError> {
        self.out.send(line).map_err(|_| ServerError::Cancelled)
    }

    fn send_response(&self, resp: &JsonRpcResponse) {
        match serde_json::to_string(resp) {
            Ok(line) => {
                let _ = self.send_line(line);
            }
            Err(e) => warn!(error = %e, "response serialization failed"),
        }
    }

    /// Route a client reply to the suspended capability call that owns it.
    fn resolve_reply(&self, value: &Value) {
        let Some(id) = value.get("id").cloned() else {
            warn!("dropping client message with neither method nor id");
            return;
        };
        let Ok(id) = serde_json::from_value::<RpcId>(id) else {
            warn!("dropping client reply with malformed id");
            return;
        };
        let Some(sender) = lock(&self.pending).remove(&id.key()) else {
            warn!(id = %id.key(), "dropping client reply with no pending request");
            return;
        };
        let outcome = match value.get("error") {
            Some(err) => Err(ServerError::Internal(format!(
                "client replied with error: {err}"
            ))),
            None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = sender.send(outcome);
    }

    /// Wake every suspended round trip with a cancellation. Called on session
    /// teardown so no handler stays parked forever.
    fn fail_pending(&self) {
        lock(&self.pending).clear();
    }
}

#[async_trait]
impl ClientChannel for SessionChannel {
    async fn notify(&self, method: &str, params: Value) -> Result<(), ServerError> {
        let msg = JsonRpcRequest::notification(method, params);
        let line = serde_json::to_string(&msg)
            .map_err(|e| ServerError::Internal(format!("notification serialization failed: {e}")))?;
        self.send_line(line)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ServerError> {
        let id = RpcId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = oneshot::channel();
        lock(&self.pending).insert(id.key(), sender);
        // Taken back out on every exit path, including when this future is
        // dropped mid-await (sample timeout, aborted request task). Without
        // it an unanswered round trip would pin its entry for the session's
        // lifetime.
        let _guard = PendingGuard {
            pending: &self.pending,
            key: id.key(),
        };

        let msg = JsonRpcRequest::with_id(id, method, params);
        let line = serde_json::to_string(&msg)
            .map_err(|e| ServerError::Internal(format!("request serialization failed: {e}")))?;
        self.send_line(line)?;

        // Dropped sender (session teardown) means the round trip will never
        // complete; surface it as cancellation.
        receiver.await.map_err(|_| ServerError::Cancelled)?
    }
}

/// Removes a pending-correlation entry when the owning round trip ends,
/// however it ends. Removing an already-resolved id is a no-op.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<String, oneshot::Sender<Result<Value, ServerError>>>>,
    key: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.key);
    }
}

/// One client session over newline-delimited JSON-RPC 2.0.
///
/// Each inbound request runs in its own task, so requests within the session
/// never block one another; ordering of sends back to the client is FIFO via
/// the writer task. `notifications/cancelled` aborts the matching in-flight
/// task. Sessions over different connections share nothing but the server.
pub struct Session {
    server: Arc<Server>,
}

impl Session {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    /// Serve over stdio until EOF.
    pub async fn run_stdio(self) -> Result<(), ServerError> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve over an arbitrary byte-stream pair until the reader closes.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> Result<(), ServerError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out, mut rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(line) = rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                    || writer.flush().await.is_err()
                {
                    break;
                }
            }
        });

        let channel = Arc::new(SessionChannel::new(out));
        let dyn_channel: Arc<dyn ClientChannel> = channel.clone();
        let inflight: Arc<Mutex<HashMap<String, AbortHandle>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let mut reader = BufReader::new(reader);
        let mut raw = Vec::new();
        let mut initialized = false;
        let mut client_id: Option<String> = None;

        loop {
            raw.clear();
            let n = reader
                .read_until(b'\n', &mut raw)
                .await
                .map_err(|e| ServerError::Internal(format!("session read failed: {e}")))?;
            if n == 0 {
                break;
            }

            if n > MAX_MESSAGE_BYTES {
                warn!(bytes = n, limit = MAX_MESSAGE_BYTES, "message too large");
                channel.send_response(&JsonRpcResponse::error(None, JsonRpcError::parse_error()));
                continue;
            }

            let trimmed = match std::str::from_utf8(&raw) {
                Ok(s) => s.trim(),
                Err(_) => {
                    channel
                        .send_response(&JsonRpcResponse::error(None, JsonRpcError::parse_error()));
                    continue;
                }
            };
            if trimmed.is_empty() {
                continue;
            }

            let value: Value = match serde_json::from_str(trimmed) {
                Ok(v) => v,
                Err(e) => {
                    debug!(error = %e, "parse error");
                    channel
                        .send_response(&JsonRpcResponse::error(None, JsonRpcError::parse_error()));
                    continue;
                }
            };

            // No method: a reply to a server-initiated capability call.
            if value.get("method").is_none() {
                channel.resolve_reply(&value);
                continue;
            }

            let req: JsonRpcRequest = match serde_json::from_value(value) {
                Ok(r) => r,
                Err(e) => {
                    debug!(error = %e, "invalid request envelope");
                    channel
                        .send_response(&JsonRpcResponse::error(None, JsonRpcError::parse_error()));
                    continue;
                }
            };

            if req.jsonrpc != "2.0" {
                channel.send_response(&JsonRpcResponse::error(
                    req.id.clone(),
                    JsonRpcError::invalid_request(),
                ));
                continue;
            }

            if req.method == "notifications/cancelled" {
                self.handle_cancel(&req, &inflight);
                continue;
            }

            // Initialization gate: only `initialize` is allowed before the
            // handshake completes.
            if !initialized && req.method != "initialize" {
                if req.id.is_none() {
                    continue;
                }
                channel.send_response(&JsonRpcResponse::error(
                    req.id.clone(),
                    JsonRpcError::invalid_request_with("Server not initialized"),
                ));
                continue;
            }

            if req.method == "initialize" {
                // Handled inline so the gate flips before the next message.
                client_id = req
                    .params
                    .clone()
                    .and_then(|p| serde_json::from_value::<InitializeParams>(p).ok())
                    .and_then(|p| p.client_info)
                    .and_then(|info| info.name);
                if let Some(resp) =
                    dispatch::dispatch(&self.server, &req, &dyn_channel, client_id.as_deref()).await
                {
                    channel.send_response(&resp);
                }
                initialized = true;
                continue;
            }

            // Each request gets its own task: concurrent requests never
            // block one another, and cancellation can abort precisely one.
            let key = req.id.as_ref().map(RpcId::key);
            let server = Arc::clone(&self.server);
            let task_channel = Arc::clone(&channel);
            let task_dyn_channel = Arc::clone(&dyn_channel);
            let task_inflight = Arc::clone(&inflight);
            let task_client_id = client_id.clone();
            let task_key = key.clone();
            let handle = tokio::spawn(async move {
                if let Some(resp) = dispatch::dispatch(
                    &server,
                    &req,
                    &task_dyn_channel,
                    task_client_id.as_deref(),
                )
                .await
                {
                    task_channel.send_response(&resp);
                }
                if let Some(k) = task_key {
                    lock(&task_inflight).remove(&k);
                }
            });
            if let Some(k) = key {
                track_inflight(&inflight, k, &handle);
            }
        }

        // EOF: tear down without leaking suspended handlers.
        for (_, handle) in lock(&inflight).drain() {
            handle.abort();
        }
        channel.fail_pending();
        drop(dyn_channel);
        drop(channel);
        let _ = writer_task.await;
        Ok(())
    }

    /// Abort the in-flight task for a cancelled request, if it is still
    /// running. A cancelled request produces no response.
    fn handle_cancel(&self, req: &JsonRpcRequest, inflight: &Mutex<HashMap<String, AbortHandle>>) {
        let Some(params) = req.params.clone() else {
            return;
        };
        let Ok(cancel) = serde_json::from_value::<CancelledParams>(params) else {
            warn!("malformed notifications/cancelled params");
            return;
        };
        if let Some(handle) = lock(inflight).remove(&cancel.request_id.key()) {
            debug!(request_id = %cancel.request_id.key(), reason = ?cancel.reason, "cancelling request");
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn fast_task_leaves_no_inflight_entry() {
        let inflight: Arc<Mutex<HashMap<String, AbortHandle>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let map = Arc::clone(&inflight);
        let mut handle = tokio::spawn(async move {
            lock(&map).remove("n1");
        });
        // The task ran to completion before the session loop registers it.
        (&mut handle).await.unwrap();

        track_inflight(&inflight, "n1".to_string(), &handle);
        assert!(lock(&inflight).is_empty());
    }

    #[tokio::test]
    async fn abandoned_round_trip_leaves_no_pending_entry() {
        let (out, mut rx) = mpsc::unbounded_channel();
        let channel = SessionChannel::new(out);

        let round_trip = channel.request("sampling/createMessage", Value::Null);
        let outcome = tokio::time::timeout(Duration::from_millis(20), round_trip).await;
        assert!(outcome.is_err());

        // The request went out, but its correlation entry is gone.
        assert!(rx.recv().await.is_some());
        assert!(lock(&channel.pending).is_empty());
    }
}
