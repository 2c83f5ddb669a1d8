//! Proxy tests: manifest fetch, forwarding stubs, backend failure modes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use mcp_compose::context::Context;
use mcp_compose::error::ServerError;
use mcp_compose::protocol::{PromptMessage, ResourceContents, ToolResult};
use mcp_compose::proxy::{
    BackendClient, LocalBackend, PromptManifestEntry, ProxyServer, ResourceManifestEntry,
    ResourceTemplateManifestEntry, ToolManifestEntry,
};
use mcp_compose::registry::{ResourceTemplateDef, ResourceHandler, ToolDef, ToolHandler};
use mcp_compose::{Server, ServerSettings};

struct AddTool;

#[async_trait]
impl ToolHandler for AddTool {
    async fn call(&self, args: Value, _ctx: Context) -> Result<ToolResult, ServerError> {
        let a = args["a"].as_i64().unwrap_or(0);
        let b = args["b"].as_i64().unwrap_or(0);
        Ok(ToolResult::text((a + b).to_string()))
    }
}

struct ProfileResource;

#[async_trait]
impl ResourceHandler for ProfileResource {
    async fn read(
        &self,
        uri: &str,
        vars: &BTreeMap<String, String>,
        _ctx: Context,
    ) -> Result<Vec<ResourceContents>, ServerError> {
        let user_id = vars.get("user_id").cloned().unwrap_or_default();
        Ok(vec![ResourceContents::text(uri, format!("profile of {user_id}"))])
    }
}

fn backend_server() -> Arc<Server> {
    let server = Server::new(ServerSettings::new("backend"));
    server
        .register_tool(ToolDef::new("add", "adds", json!({"type": "object"}), Arc::new(AddTool)))
        .unwrap();
    server
        .register_resource_template(
            ResourceTemplateDef::new(
                "users://{user_id}/profile",
                "profile",
                "",
                Arc::new(ProfileResource),
            )
            .unwrap(),
        )
        .unwrap();
    server
}

/// A backend whose reachability can be toggled, for outage/recovery tests.
struct FlakyBackend {
    inner: LocalBackend,
    up: AtomicBool,
}

impl FlakyBackend {
    fn new(server: Arc<Server>, up: bool) -> Self {
        Self {
            inner: LocalBackend::new(server),
            up: AtomicBool::new(up),
        }
    }

    fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Release);
    }

    fn check(&self) -> Result<(), ServerError> {
        if self.up.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ServerError::upstream_unavailable("", "", "connection refused"))
        }
    }
}

#[async_trait]
impl BackendClient for FlakyBackend {
    async fn list_tools(&self) -> Result<Vec<ToolManifestEntry>, ServerError> {
        self.check()?;
        self.inner.list_tools().await
    }

    async fn list_resources(&self) -> Result<Vec<ResourceManifestEntry>, ServerError> {
        self.check()?;
        self.inner.list_resources().await
    }

    async fn list_resource_templates(
        &self,
    ) -> Result<Vec<ResourceTemplateManifestEntry>, ServerError> {
        self.check()?;
        self.inner.list_resource_templates().await
    }

    async fn list_prompts(&self) -> Result<Vec<PromptManifestEntry>, ServerError> {
        self.check()?;
        self.inner.list_prompts().await
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<ToolResult, ServerError> {
        self.check()?;
        self.inner.call_tool(name, args).await
    }

    async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, ServerError> {
        self.check()?;
        self.inner.read_resource(uri).await
    }

    async fn get_prompt(
        &self,
        name: &str,
        args: BTreeMap<String, String>,
    ) -> Result<Vec<PromptMessage>, ServerError> {
        self.check()?;
        self.inner.get_prompt(name, args).await
    }
}

// ---------------------------------------------------------------------------
// Forwarding
// ---------------------------------------------------------------------------

#[tokio::test]
async fn proxy_forwards_tool_calls_verbatim() {
    let backend = backend_server();
    let proxy = ProxyServer::from_backend(Arc::new(LocalBackend::new(backend)), "bridge").await;

    let result = proxy.call_tool("add", json!({"a": 20, "b": 22})).await.unwrap();
    assert_eq!(result.content[0].text, "42");
}

#[tokio::test]
async fn proxy_forwards_template_resources() {
    let backend = backend_server();
    let proxy = ProxyServer::from_backend(Arc::new(LocalBackend::new(backend)), "bridge").await;

    let contents = proxy.read_resource("users://7/profile").await.unwrap();
    assert_eq!(contents[0].text, "profile of 7");
}

#[tokio::test]
async fn proxy_manifest_mirrors_backend() {
    let backend = backend_server();
    let proxy = ProxyServer::from_backend(Arc::new(LocalBackend::new(backend)), "bridge").await;

    let names: Vec<String> = proxy.server().list_tools().into_iter().map(|d| d.name).collect();
    assert_eq!(names, vec!["add".to_string()]);
    let templates = proxy.server().list_resource_templates();
    assert_eq!(templates[0].template.as_str(), "users://{user_id}/profile");
}

#[tokio::test]
async fn mounted_proxy_bridges_to_backend() {
    let backend = backend_server();
    let proxy = ProxyServer::from_backend(Arc::new(LocalBackend::new(backend)), "bridge").await;

    let front = Server::new(ServerSettings::new("front"));
    front.mount("remote", proxy.server()).unwrap();

    let result = front
        .call_tool("remote/add", json!({"a": 1, "b": 2}), Context::detached(&front))
        .await
        .unwrap();
    assert_eq!(result.content[0].text, "3");
}

// ---------------------------------------------------------------------------
// Failure modes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unreachable_backend_fails_invocation_then_recovers() {
    let backend = Arc::new(FlakyBackend::new(backend_server(), true));
    let proxy = ProxyServer::from_backend(Arc::clone(&backend) as Arc<dyn BackendClient>, "bridge")
        .await;

    backend.set_up(false);
    let err = proxy.call_tool("add", json!({"a": 1, "b": 1})).await.unwrap_err();
    match &err {
        ServerError::UpstreamUnavailable { backend, capability, .. } => {
            assert_eq!(backend, "bridge");
            assert_eq!(capability, "add");
        }
        other => panic!("expected UpstreamUnavailable, got {other:?}"),
    }

    // The proxy stays usable; recovery needs no rebuild.
    backend.set_up(true);
    let result = proxy.call_tool("add", json!({"a": 1, "b": 1})).await.unwrap();
    assert_eq!(result.content[0].text, "2");
}

#[tokio::test]
async fn failed_manifest_fetch_degrades_then_retries() {
    let backend = Arc::new(FlakyBackend::new(backend_server(), false));
    let proxy = ProxyServer::from_backend(Arc::clone(&backend) as Arc<dyn BackendClient>, "bridge")
        .await;

    // Construction survived; the manifest is empty and invocations surface
    // the backend failure, not a bare lookup miss.
    assert!(proxy.server().list_tools().is_empty());
    let err = proxy.call_tool("add", json!({})).await.unwrap_err();
    assert!(matches!(err, ServerError::UpstreamUnavailable { .. }));

    // Once the backend is reachable the next invocation re-fetches.
    backend.set_up(true);
    let result = proxy.call_tool("add", json!({"a": 3, "b": 4})).await.unwrap();
    assert_eq!(result.content[0].text, "7");
    assert_eq!(proxy.server().list_tools().len(), 1);
}

#[tokio::test]
async fn refresh_tracks_backend_changes() {
    let backend = backend_server();
    let proxy =
        ProxyServer::from_backend(Arc::new(LocalBackend::new(Arc::clone(&backend))), "bridge")
            .await;
    assert_eq!(proxy.server().list_tools().len(), 1);

    struct NoopTool;

    #[async_trait]
    impl ToolHandler for NoopTool {
        async fn call(&self, _args: Value, _ctx: Context) -> Result<ToolResult, ServerError> {
            Ok(ToolResult::text("ok"))
        }
    }

    backend
        .register_tool(ToolDef::new("extra", "", json!({"type": "object"}), Arc::new(NoopTool)))
        .unwrap();

    // The manifest is a snapshot until refreshed.
    assert_eq!(proxy.server().list_tools().len(), 1);
    proxy.refresh().await.unwrap();
    assert_eq!(proxy.server().list_tools().len(), 2);
}
