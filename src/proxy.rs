use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{DuplicatePolicy, ServerSettings};
use crate::context::Context;
use crate::error::ServerError;
use crate::protocol::{PromptMessage, ResourceContents, ToolResult};
use crate::registry::{
    ComponentRegistry, PromptArgument, PromptDef, PromptHandler, ResourceDef, ResourceHandler,
    ResourceTemplateDef, ToolDef, ToolHandler,
};
use crate::server::Server;

// ---------------------------------------------------------------------------
// Backend manifest
// ---------------------------------------------------------------------------

/// One tool as advertised by a backend's capability manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolManifestEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// One exact-URI resource as advertised by a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceManifestEntry {
    pub uri: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "mimeType", default)]
    pub mime_type: Option<String>,
}

/// One resource template as advertised by a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceTemplateManifestEntry {
    #[serde(rename = "uriTemplate")]
    pub uri_template: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// One prompt as advertised by a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptManifestEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

/// Client for a remote or local backend server: list capabilities and invoke
/// them over an opaque session. Connection reuse, framing, and encoding are
/// the implementor's responsibility.
///
/// Implementors report connectivity failures as `UpstreamUnavailable` and
/// malformed replies as `UpstreamProtocol`; the proxy re-annotates both with
/// its own backend/capability identity.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolManifestEntry>, ServerError>;
    async fn list_resources(&self) -> Result<Vec<ResourceManifestEntry>, ServerError>;
    async fn list_resource_templates(&self)
        -> Result<Vec<ResourceTemplateManifestEntry>, ServerError>;
    async fn list_prompts(&self) -> Result<Vec<PromptManifestEntry>, ServerError>;

    async fn call_tool(&self, name: &str, args: Value) -> Result<ToolResult, ServerError>;
    async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, ServerError>;
    async fn get_prompt(
        &self,
        name: &str,
        args: BTreeMap<String, String>,
    ) -> Result<Vec<PromptMessage>, ServerError>;
}

/// Overwrite upstream error annotations with this proxy's identity so a
/// failure names the backend and capability as the caller sees them.
fn annotate(err: ServerError, backend: &str, capability: &str) -> ServerError {
    match err {
        ServerError::UpstreamUnavailable { detail, .. } => {
            ServerError::upstream_unavailable(backend, capability, detail)
        }
        ServerError::UpstreamProtocol { detail, .. } => {
            ServerError::upstream_protocol(backend, capability, detail)
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Forwarding stubs
// ---------------------------------------------------------------------------

struct ProxyTool {
    backend: Arc<dyn BackendClient>,
    backend_name: String,
    tool: String,
}

#[async_trait]
impl ToolHandler for ProxyTool {
    async fn call(&self, args: Value, _ctx: Context) -> Result<ToolResult, ServerError> {
        debug!(backend = %self.backend_name, tool = %self.tool, "forwarding tool call");
        self.backend
            .call_tool(&self.tool, args)
            .await
            .map_err(|e| annotate(e, &self.backend_name, &self.tool))
    }
}

struct ProxyResource {
    backend: Arc<dyn BackendClient>,
    backend_name: String,
}

#[async_trait]
impl ResourceHandler for ProxyResource {
    async fn read(
        &self,
        uri: &str,
        _vars: &BTreeMap<String, String>,
        _ctx: Context,
    ) -> Result<Vec<ResourceContents>, ServerError> {
        debug!(backend = %self.backend_name, %uri, "forwarding resource read");
        self.backend
            .read_resource(uri)
            .await
            .map_err(|e| annotate(e, &self.backend_name, uri))
    }
}

struct ProxyPrompt {
    backend: Arc<dyn BackendClient>,
    backend_name: String,
    prompt: String,
}

#[async_trait]
impl PromptHandler for ProxyPrompt {
    async fn render(
        &self,
        args: BTreeMap<String, String>,
        _ctx: Context,
    ) -> Result<Vec<PromptMessage>, ServerError> {
        debug!(backend = %self.backend_name, prompt = %self.prompt, "forwarding prompt render");
        self.backend
            .get_prompt(&self.prompt, args)
            .await
            .map_err(|e| annotate(e, &self.backend_name, &self.prompt))
    }
}

// ---------------------------------------------------------------------------
// ProxyServer
// ---------------------------------------------------------------------------

/// A server whose registry forwards every invocation to a backend session.
///
/// Construction fetches the backend's capability manifest and installs
/// forwarding stubs on an inner [`Server`]; only transport framing is
/// translated, never identifiers or semantics. A failed fetch degrades to an
/// empty manifest — the proxy stays constructible and retries the fetch on
/// the next invocation or on an explicit [`ProxyServer::refresh`].
///
/// The inner server can be mounted into (or imported by) any other server,
/// which is how transports are bridged: present a remotely-reachable backend
/// locally under a different transport.
pub struct ProxyServer {
    server: Arc<Server>,
    backend: Arc<dyn BackendClient>,
    backend_name: String,
    manifest_loaded: AtomicBool,
}

impl ProxyServer {
    /// Build a proxy over `backend`, advertising itself under `name`.
    pub async fn from_backend(backend: Arc<dyn BackendClient>, name: &str) -> Self {
        // Refresh replaces the whole registry, so collisions inside one
        // manifest just take the latest entry.
        let settings = ServerSettings::new(name)
            .on_duplicate_tools(DuplicatePolicy::Replace)
            .on_duplicate_resources(DuplicatePolicy::Replace)
            .on_duplicate_prompts(DuplicatePolicy::Replace);
        let proxy = Self {
            server: Server::new(settings),
            backend,
            backend_name: name.to_string(),
            manifest_loaded: AtomicBool::new(false),
        };
        if let Err(e) = proxy.refresh().await {
            warn!(backend = %proxy.backend_name, error = %e,
                "manifest fetch failed; proxy starts with an empty manifest");
        }
        proxy
    }

    /// The inner server carrying the forwarding stubs. Mount or serve this.
    pub fn server(&self) -> Arc<Server> {
        Arc::clone(&self.server)
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    /// Re-fetch the backend manifest and swap the stub registry atomically.
    /// Capabilities the backend no longer advertises disappear.
    pub async fn refresh(&self) -> Result<(), ServerError> {
        let tools = self
            .backend
            .list_tools()
            .await
            .map_err(|e| annotate(e, &self.backend_name, "tools/list"))?;
        let resources = self
            .backend
            .list_resources()
            .await
            .map_err(|e| annotate(e, &self.backend_name, "resources/list"))?;
        let templates = self
            .backend
            .list_resource_templates()
            .await
            .map_err(|e| annotate(e, &self.backend_name, "resources/templates/list"))?;
        let prompts = self
            .backend
            .list_prompts()
            .await
            .map_err(|e| annotate(e, &self.backend_name, "prompts/list"))?;

        let mut registry = ComponentRegistry::new();
        for entry in tools {
            let handler = Arc::new(ProxyTool {
                backend: Arc::clone(&self.backend),
                backend_name: self.backend_name.clone(),
                tool: entry.name.clone(),
            });
            registry.register_tool(
                ToolDef::new(entry.name, entry.description, entry.input_schema, handler),
                DuplicatePolicy::Replace,
            )?;
        }
        for entry in resources {
            let handler = Arc::new(ProxyResource {
                backend: Arc::clone(&self.backend),
                backend_name: self.backend_name.clone(),
            });
            let mut def = ResourceDef::new(entry.uri, entry.name, entry.description, handler);
            def.mime_type = entry.mime_type;
            registry.register_resource(def, DuplicatePolicy::Replace)?;
        }
        for entry in templates {
            let handler = Arc::new(ProxyResource {
                backend: Arc::clone(&self.backend),
                backend_name: self.backend_name.clone(),
            });
            let def =
                ResourceTemplateDef::new(&entry.uri_template, entry.name, entry.description, handler)
                    .map_err(|e| {
                        ServerError::upstream_protocol(
                            &self.backend_name,
                            &entry.uri_template,
                            e.to_string(),
                        )
                    })?;
            registry.register_resource_template(def, DuplicatePolicy::Replace)?;
        }
        for entry in prompts {
            let handler = Arc::new(ProxyPrompt {
                backend: Arc::clone(&self.backend),
                backend_name: self.backend_name.clone(),
                prompt: entry.name.clone(),
            });
            registry.register_prompt(
                PromptDef::new(entry.name, entry.description, entry.arguments, handler),
                DuplicatePolicy::Replace,
            )?;
        }

        self.server.install_registry(registry);
        self.manifest_loaded.store(true, Ordering::Release);
        info!(backend = %self.backend_name, "backend manifest installed");
        Ok(())
    }

    /// Retry the manifest fetch if construction degraded to an empty one.
    /// Surfaces the backend failure instead of a misleading lookup miss.
    async fn ensure_manifest(&self, capability: &str) -> Result<(), ServerError> {
        if self.manifest_loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        self.refresh()
            .await
            .map_err(|e| annotate(e, &self.backend_name, capability))
    }

    pub async fn call_tool(&self, name: &str, args: Value) -> Result<ToolResult, ServerError> {
        self.ensure_manifest(name).await?;
        let ctx = Context::detached(&self.server);
        self.server.call_tool(name, args, ctx).await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, ServerError> {
        self.ensure_manifest(uri).await?;
        let ctx = Context::detached(&self.server);
        self.server.read_resource(uri, ctx).await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        args: BTreeMap<String, String>,
    ) -> Result<Vec<PromptMessage>, ServerError> {
        self.ensure_manifest(name).await?;
        let ctx = Context::detached(&self.server);
        self.server.get_prompt(name, args, ctx).await
    }
}

// ---------------------------------------------------------------------------
// In-process backend
// ---------------------------------------------------------------------------

/// A backend client over another server in the same process. This is the
/// local end of transport bridging and the test double for remote backends.
pub struct LocalBackend {
    server: Arc<Server>,
}

impl LocalBackend {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl BackendClient for LocalBackend {
    async fn list_tools(&self) -> Result<Vec<ToolManifestEntry>, ServerError> {
        Ok(self
            .server
            .list_tools()
            .into_iter()
            .map(|def| ToolManifestEntry {
                name: def.name,
                description: def.description,
                input_schema: def.input_schema,
            })
            .collect())
    }

    async fn list_resources(&self) -> Result<Vec<ResourceManifestEntry>, ServerError> {
        Ok(self
            .server
            .list_resources()
            .into_iter()
            .map(|def| ResourceManifestEntry {
                uri: def.uri,
                name: def.name,
                description: def.description,
                mime_type: def.mime_type,
            })
            .collect())
    }

    async fn list_resource_templates(
        &self,
    ) -> Result<Vec<ResourceTemplateManifestEntry>, ServerError> {
        Ok(self
            .server
            .list_resource_templates()
            .into_iter()
            .map(|def| ResourceTemplateManifestEntry {
                uri_template: def.template.as_str().to_string(),
                name: def.name,
                description: def.description,
            })
            .collect())
    }

    async fn list_prompts(&self) -> Result<Vec<PromptManifestEntry>, ServerError> {
        Ok(self
            .server
            .list_prompts()
            .into_iter()
            .map(|def| PromptManifestEntry {
                name: def.name,
                description: def.description,
                arguments: def.arguments,
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<ToolResult, ServerError> {
        let ctx = Context::detached(&self.server);
        self.server.call_tool(name, args, ctx).await
    }

    async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, ServerError> {
        let ctx = Context::detached(&self.server);
        self.server.read_resource(uri, ctx).await
    }

    async fn get_prompt(
        &self,
        name: &str,
        args: BTreeMap<String, String>,
    ) -> Result<Vec<PromptMessage>, ServerError> {
        let ctx = Context::detached(&self.server);
        self.server.get_prompt(name, args, ctx).await
    }
}
