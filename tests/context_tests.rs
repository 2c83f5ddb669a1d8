//! Request-context tests: scoped lifetime, capability isolation, sampling.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use mcp_compose::context::{
    ClientChannel, Context, LogLevel, SampleOptions, SamplingMessage,
};
use mcp_compose::error::ServerError;
use mcp_compose::protocol::{ResourceContents, ToolResult};
use mcp_compose::registry::{ResourceDef, ResourceHandler, ToolDef, ToolHandler};
use mcp_compose::{Server, ServerSettings};

/// Records notifications and answers round trips with a scripted reply.
struct RecordingChannel {
    notifications: Mutex<Vec<(String, Value)>>,
    reply: Value,
    requests: Mutex<Vec<(String, Value)>>,
}

impl RecordingChannel {
    fn new() -> Arc<Self> {
        Self::with_reply(json!({
            "role": "assistant",
            "content": { "type": "text", "text": "scripted" },
            "model": "test-model"
        }))
    }

    fn with_reply(reply: Value) -> Arc<Self> {
        Arc::new(Self {
            notifications: Mutex::new(Vec::new()),
            reply,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn notifications(&self) -> Vec<(String, Value)> {
        self.notifications.lock().unwrap().clone()
    }

    fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientChannel for RecordingChannel {
    async fn notify(&self, method: &str, params: Value) -> Result<(), ServerError> {
        self.notifications.lock().unwrap().push((method.to_string(), params));
        Ok(())
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ServerError> {
        self.requests.lock().unwrap().push((method.to_string(), params));
        Ok(self.reply.clone())
    }
}

/// A channel whose round trips never complete, for timeout tests.
struct StalledChannel;

#[async_trait]
impl ClientChannel for StalledChannel {
    async fn notify(&self, _method: &str, _params: Value) -> Result<(), ServerError> {
        Ok(())
    }

    async fn request(&self, _method: &str, _params: Value) -> Result<Value, ServerError> {
        std::future::pending().await
    }
}

fn context_for(
    server: &Arc<Server>,
    request_id: &str,
    progress_token: Option<Value>,
    channel: Arc<dyn ClientChannel>,
) -> Context {
    Context::new(request_id, None, progress_token, server, channel)
}

// ---------------------------------------------------------------------------
// Scoped lifetime
// ---------------------------------------------------------------------------

#[tokio::test]
async fn capability_calls_after_expiry_fail() {
    let server = Server::new(ServerSettings::new("ctx"));
    let channel = RecordingChannel::new();
    let ctx = context_for(&server, "r1", None, channel);

    ctx.info("still live").await.unwrap();
    ctx.expire();

    let err = ctx.info("too late").await.unwrap_err();
    assert!(matches!(err, ServerError::ContextExpired { .. }));
    let err = ctx.report_progress(1.0, None).await.unwrap_err();
    assert!(matches!(err, ServerError::ContextExpired { .. }));
    let err = ctx.read_resource("data://x").await.unwrap_err();
    assert!(matches!(err, ServerError::ContextExpired { .. }));
    let err = ctx
        .sample(vec![SamplingMessage::user("hi")], SampleOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::ContextExpired { .. }));
}

#[tokio::test]
async fn handler_context_expires_when_handler_returns() {
    struct LeakTool {
        leaked: Arc<Mutex<Option<Context>>>,
    }

    #[async_trait]
    impl ToolHandler for LeakTool {
        async fn call(&self, _args: Value, ctx: Context) -> Result<ToolResult, ServerError> {
            *self.leaked.lock().unwrap() = Some(ctx);
            Ok(ToolResult::text("done"))
        }
    }

    let server = Server::new(ServerSettings::new("ctx"));
    let leaked = Arc::new(Mutex::new(None));
    server
        .register_tool(ToolDef::new(
            "leak",
            "",
            json!({"type": "object"}),
            Arc::new(LeakTool { leaked: Arc::clone(&leaked) }),
        ))
        .unwrap();

    let channel = RecordingChannel::new();
    let ctx = context_for(&server, "r1", None, channel);
    server.call_tool("leak", json!({}), ctx.clone()).await.unwrap();
    // Dispatch owns expiry; emulate the dispatch boundary.
    ctx.expire();

    let smuggled = leaked.lock().unwrap().take().unwrap();
    let err = smuggled.info("post-completion").await.unwrap_err();
    assert!(matches!(err, ServerError::ContextExpired { .. }));
}

// ---------------------------------------------------------------------------
// Isolation between concurrent requests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_requests_get_distinct_contexts() {
    struct ProgressTool;

    #[async_trait]
    impl ToolHandler for ProgressTool {
        async fn call(&self, args: Value, ctx: Context) -> Result<ToolResult, ServerError> {
            let step = args["step"].as_f64().unwrap_or(0.0);
            ctx.report_progress(step, Some(100.0)).await?;
            Ok(ToolResult::text(ctx.request_id().to_string()))
        }
    }

    let server = Server::new(ServerSettings::new("ctx"));
    server
        .register_tool(ToolDef::new(
            "work",
            "",
            json!({"type": "object"}),
            Arc::new(ProgressTool),
        ))
        .unwrap();

    let channel_a = RecordingChannel::new();
    let channel_b = RecordingChannel::new();
    let ctx_a = context_for(&server, "req-a", Some(json!("tok-a")), channel_a.clone());
    let ctx_b = context_for(&server, "req-b", Some(json!("tok-b")), channel_b.clone());

    let (res_a, res_b) = tokio::join!(
        server.call_tool("work", json!({"step": 10.0}), ctx_a),
        server.call_tool("work", json!({"step": 90.0}), ctx_b),
    );
    assert_eq!(res_a.unwrap().content[0].text, "req-a");
    assert_eq!(res_b.unwrap().content[0].text, "req-b");

    // Progress from request A never shows up on request B's session.
    let sent_a = channel_a.notifications();
    assert_eq!(sent_a.len(), 1);
    assert_eq!(sent_a[0].1["progressToken"], json!("tok-a"));
    assert_eq!(sent_a[0].1["progress"], json!(10.0));

    let sent_b = channel_b.notifications();
    assert_eq!(sent_b.len(), 1);
    assert_eq!(sent_b[0].1["progressToken"], json!("tok-b"));
    assert_eq!(sent_b[0].1["progress"], json!(90.0));
}

#[tokio::test]
async fn progress_without_token_is_a_no_op() {
    let server = Server::new(ServerSettings::new("ctx"));
    let channel = RecordingChannel::new();
    let ctx = context_for(&server, "r1", None, channel.clone());

    ctx.report_progress(50.0, Some(100.0)).await.unwrap();
    assert!(channel.notifications().is_empty());
}

#[tokio::test]
async fn log_carries_level_and_logger_name() {
    let server = Server::new(ServerSettings::new("ctx"));
    let channel = RecordingChannel::new();
    let ctx = context_for(&server, "r1", None, channel.clone());

    ctx.log(LogLevel::Warning, "disk almost full", Some("storage"))
        .await
        .unwrap();

    let sent = channel.notifications();
    assert_eq!(sent[0].0, "notifications/message");
    assert_eq!(sent[0].1["level"], json!("warning"));
    assert_eq!(sent[0].1["logger"], json!("storage"));
    assert_eq!(sent[0].1["data"], json!("disk almost full"));
}

// ---------------------------------------------------------------------------
// Resource reads through the owning server
// ---------------------------------------------------------------------------

#[tokio::test]
async fn read_resource_resolves_through_mounts() {
    struct StaticResource;

    #[async_trait]
    impl ResourceHandler for StaticResource {
        async fn read(
            &self,
            uri: &str,
            _vars: &BTreeMap<String, String>,
            _ctx: Context,
        ) -> Result<Vec<ResourceContents>, ServerError> {
            Ok(vec![ResourceContents::text(uri, "mounted data")])
        }
    }

    let parent = Server::new(ServerSettings::new("parent"));
    let child = Server::new(ServerSettings::new("child"));
    child
        .register_resource(ResourceDef::new("data://item", "item", "", Arc::new(StaticResource)))
        .unwrap();
    parent.mount("kid", child).unwrap();

    let channel = RecordingChannel::new();
    let ctx = context_for(&parent, "r1", None, channel);
    let contents = ctx.read_resource("data://kid/item").await.unwrap();
    assert_eq!(contents[0].text, "mounted data");

    let err = ctx.read_resource("data://kid/missing").await.unwrap_err();
    assert!(matches!(err, ServerError::NotFound { .. }));
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sample_round_trips_with_defaults() {
    let server = Server::new(ServerSettings::new("ctx"));
    let channel = RecordingChannel::new();
    let ctx = context_for(&server, "r1", None, channel.clone());

    let reply = ctx
        .sample(vec![SamplingMessage::user("say hi")], SampleOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.content, "scripted");
    assert_eq!(reply.model.as_deref(), Some("test-model"));

    let sent = channel.requests();
    assert_eq!(sent[0].0, "sampling/createMessage");
    assert_eq!(sent[0].1["maxTokens"], json!(512));
    assert_eq!(sent[0].1["messages"][0]["role"], json!("user"));
    assert_eq!(sent[0].1["messages"][0]["content"]["text"], json!("say hi"));
    assert!(sent[0].1.get("systemPrompt").is_none());
}

#[tokio::test]
async fn sample_passes_system_prompt_and_temperature() {
    let server = Server::new(ServerSettings::new("ctx"));
    let channel = RecordingChannel::new();
    let ctx = context_for(&server, "r1", None, channel.clone());

    let opts = SampleOptions {
        system_prompt: Some("be terse".into()),
        temperature: Some(0.2),
        max_tokens: 64,
        timeout: None,
    };
    ctx.sample(vec![SamplingMessage::user("q")], opts).await.unwrap();

    let sent = channel.requests();
    assert_eq!(sent[0].1["systemPrompt"], json!("be terse"));
    assert_eq!(sent[0].1["temperature"], json!(0.2));
    assert_eq!(sent[0].1["maxTokens"], json!(64));
}

#[tokio::test]
async fn sample_times_out_instead_of_hanging() {
    let server = Server::new(ServerSettings::new("ctx"));
    let ctx = context_for(&server, "r1", None, Arc::new(StalledChannel));

    let opts = SampleOptions {
        timeout: Some(Duration::from_millis(50)),
        ..SampleOptions::default()
    };
    let err = ctx.sample(vec![SamplingMessage::user("q")], opts).await.unwrap_err();
    assert!(matches!(err, ServerError::Cancelled));
}

#[tokio::test]
async fn sample_honors_server_level_timeout() {
    let settings = ServerSettings::new("ctx").sample_timeout(Duration::from_millis(50));
    let server = Server::new(settings);
    let ctx = context_for(&server, "r1", None, Arc::new(StalledChannel));

    let err = ctx
        .sample(vec![SamplingMessage::user("q")], SampleOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::Cancelled));
}

#[tokio::test]
async fn malformed_sampling_reply_is_surfaced() {
    let server = Server::new(ServerSettings::new("ctx"));
    let channel = RecordingChannel::with_reply(json!({"role": "assistant"}));
    let ctx = context_for(&server, "r1", None, channel);

    let err = ctx
        .sample(vec![SamplingMessage::user("q")], SampleOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::Internal(_)));
}
