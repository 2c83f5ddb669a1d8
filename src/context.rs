use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::DEFAULT_SAMPLE_MAX_TOKENS;
use crate::error::ServerError;
use crate::protocol::{ResourceContents, Role};
use crate::server::Server;

/// Client-visible log severity for `Context::log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// One message in a sampling exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingMessage {
    pub role: Role,
    pub content: String,
}

impl SamplingMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Knobs for `Context::sample`. `max_tokens` defaults to 512.
#[derive(Debug, Clone)]
pub struct SampleOptions {
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: u32,
    /// Per-call timeout. Falls back to the server-level setting, then to the
    /// underlying session's own timeout.
    pub timeout: Option<Duration>,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            system_prompt: None,
            temperature: None,
            max_tokens: DEFAULT_SAMPLE_MAX_TOKENS,
            timeout: None,
        }
    }
}

/// The client model's reply to a sampling request.
#[derive(Debug, Clone, Deserialize)]
pub struct SampleResult {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, rename = "stopReason")]
    pub stop_reason: Option<String>,
}

/// The session side of capability calls: everything a running handler may
/// send back to the originating client.
///
/// `notify` is fire-and-forget and must preserve FIFO order relative to other
/// sends on the same session. `request` is a correlated round trip that
/// suspends the caller until the client answers or the session dies.
#[async_trait]
pub trait ClientChannel: Send + Sync {
    async fn notify(&self, method: &str, params: Value) -> Result<(), ServerError>;

    async fn request(&self, method: &str, params: Value) -> Result<Value, ServerError>;
}

/// Channel for contexts with no attached client session (background work,
/// tests, proxy-internal invocations). Notifications are dropped; round
/// trips fail.
pub struct NullChannel;

#[async_trait]
impl ClientChannel for NullChannel {
    async fn notify(&self, _method: &str, _params: Value) -> Result<(), ServerError> {
        Ok(())
    }

    async fn request(&self, method: &str, _params: Value) -> Result<Value, ServerError> {
        Err(ServerError::Internal(format!(
            "no client session attached; cannot send '{method}'"
        )))
    }
}

struct ContextInner {
    request_id: String,
    client_id: Option<String>,
    progress_token: Option<Value>,
    server: Weak<Server>,
    channel: Arc<dyn ClientChannel>,
    expired: AtomicBool,
}

/// Ephemeral, request-scoped handle passed to handlers during dispatch.
///
/// Grants logging, progress reporting, LLM sampling, and resource reads,
/// correlated to the originating session. Created immediately before the
/// handler runs; expired the moment the handler returns or fails. Every
/// capability call after expiry fails with `ContextExpired` — scoped-lifetime
/// enforcement, not silent loss.
///
/// Cloning is cheap (shared inner); clones share the expiry flag.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn new(
        request_id: impl Into<String>,
        client_id: Option<String>,
        progress_token: Option<Value>,
        server: &Arc<Server>,
        channel: Arc<dyn ClientChannel>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                request_id: request_id.into(),
                client_id,
                progress_token,
                server: Arc::downgrade(server),
                channel,
                expired: AtomicBool::new(false),
            }),
        }
    }

    /// A context bound to a server but to no client session. Never expires on
    /// its own; useful for internal invocations and tests.
    pub fn detached(server: &Arc<Server>) -> Self {
        Self::new("detached", None, None, server, Arc::new(NullChannel))
    }

    pub fn request_id(&self) -> &str {
        &self.inner.request_id
    }

    pub fn client_id(&self) -> Option<&str> {
        self.inner.client_id.as_deref()
    }

    /// Mark the owning request as finished. Called by the dispatch layer when
    /// the handler returns, fails, or is cancelled.
    pub fn expire(&self) {
        self.inner.expired.store(true, Ordering::Release);
    }

    fn ensure_live(&self) -> Result<(), ServerError> {
        if self.inner.expired.load(Ordering::Acquire) {
            return Err(ServerError::ContextExpired {
                request_id: self.inner.request_id.clone(),
            });
        }
        Ok(())
    }

    fn server(&self) -> Result<Arc<Server>, ServerError> {
        self.inner
            .server
            .upgrade()
            .ok_or_else(|| ServerError::Internal("owning server was dropped".into()))
    }

    /// Fire-and-forget log message to the client, FIFO relative to other
    /// sends on the same session.
    pub async fn log(
        &self,
        level: LogLevel,
        message: &str,
        logger: Option<&str>,
    ) -> Result<(), ServerError> {
        self.ensure_live()?;
        let mut params = json!({
            "level": level.as_str(),
            "data": message,
        });
        if let Some(name) = logger {
            params["logger"] = json!(name);
        }
        self.inner.channel.notify("notifications/message", params).await
    }

    pub async fn debug(&self, message: &str) -> Result<(), ServerError> {
        self.log(LogLevel::Debug, message, None).await
    }

    pub async fn info(&self, message: &str) -> Result<(), ServerError> {
        self.log(LogLevel::Info, message, None).await
    }

    pub async fn warning(&self, message: &str) -> Result<(), ServerError> {
        self.log(LogLevel::Warning, message, None).await
    }

    pub async fn error(&self, message: &str) -> Result<(), ServerError> {
        self.log(LogLevel::Error, message, None).await
    }

    /// Report progress for the originating request. A no-op if the request
    /// carried no progress token.
    pub async fn report_progress(
        &self,
        progress: f64,
        total: Option<f64>,
    ) -> Result<(), ServerError> {
        self.ensure_live()?;
        let Some(token) = &self.inner.progress_token else {
            return Ok(());
        };
        let mut params = json!({
            "progressToken": token,
            "progress": progress,
        });
        if let Some(total) = total {
            params["total"] = json!(total);
        }
        self.inner.channel.notify("notifications/progress", params).await
    }

    /// Read a resource through the owning server's registry, including
    /// through its mount/import/proxy chains.
    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, ServerError> {
        self.ensure_live()?;
        let server = self.server()?;
        server.read_resource(uri, self.clone()).await
    }

    /// Send a generation request to the client's model and suspend until the
    /// reply, a timeout, or cancellation. The effective timeout is the
    /// per-call one, else the server-level `sample_timeout`, else whatever
    /// the session itself enforces.
    pub async fn sample(
        &self,
        messages: Vec<SamplingMessage>,
        opts: SampleOptions,
    ) -> Result<SampleResult, ServerError> {
        self.ensure_live()?;
        let server = self.server()?;

        let wire_messages: Vec<Value> = messages
            .iter()
            .map(|m| {
                json!({
                    "role": m.role,
                    "content": { "type": "text", "text": m.content },
                })
            })
            .collect();
        let mut params = json!({
            "messages": wire_messages,
            "maxTokens": opts.max_tokens,
        });
        if let Some(system) = &opts.system_prompt {
            params["systemPrompt"] = json!(system);
        }
        if let Some(temperature) = opts.temperature {
            params["temperature"] = json!(temperature);
        }

        let timeout = opts.timeout.or(server.settings().sample_timeout);
        let round_trip = self.inner.channel.request("sampling/createMessage", params);
        let reply = match timeout {
            Some(limit) => tokio::time::timeout(limit, round_trip)
                .await
                .map_err(|_| ServerError::Cancelled)??,
            None => round_trip.await?,
        };

        parse_sample_reply(&reply)
    }
}

/// Decode a `sampling/createMessage` reply. The content may be a bare string
/// or the structured `{type: "text", text}` form.
fn parse_sample_reply(reply: &Value) -> Result<SampleResult, ServerError> {
    let malformed =
        |detail: &str| ServerError::Internal(format!("malformed sampling reply: {detail}"));

    let role = match reply.get("role").and_then(Value::as_str) {
        Some("assistant") | None => Role::Assistant,
        Some("user") => Role::User,
        Some(other) => return Err(malformed(&format!("unknown role '{other}'"))),
    };
    let content = match reply.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(obj) => obj
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("content has no text"))?
            .to_string(),
        None => return Err(malformed("missing content")),
    };

    Ok(SampleResult {
        role,
        content,
        model: reply
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string),
        stop_reason: reply
            .get("stopReason")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}
