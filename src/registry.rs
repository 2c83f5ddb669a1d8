use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::DuplicatePolicy;
use crate::context::Context;
use crate::error::ServerError;
use crate::protocol::{PromptMessage, ResourceContents, ToolResult};
use crate::template::UriTemplate;

/// The four component kinds a registry can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Tool,
    Resource,
    ResourceTemplate,
    Prompt,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Tool => "tool",
            Self::Resource => "resource",
            Self::ResourceTemplate => "resource template",
            Self::Prompt => "prompt",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Handler seams
// ---------------------------------------------------------------------------

/// An invocable action. The dispatch layer passes the request-scoped
/// [`Context`] explicitly; handlers that do not need it ignore the argument.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: serde_json::Value, ctx: Context) -> Result<ToolResult, ServerError>;
}

/// A readable data source. For template-backed resources, `vars` carries the
/// path variables extracted from the matched URI.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn read(
        &self,
        uri: &str,
        vars: &BTreeMap<String, String>,
        ctx: Context,
    ) -> Result<Vec<ResourceContents>, ServerError>;
}

/// A reusable message template.
#[async_trait]
pub trait PromptHandler: Send + Sync {
    async fn render(
        &self,
        args: BTreeMap<String, String>,
        ctx: Context,
    ) -> Result<Vec<PromptMessage>, ServerError>;
}

// ---------------------------------------------------------------------------
// Component definitions
// ---------------------------------------------------------------------------

/// Tool definition: exact name, JSON Schema for arguments, handler, tags.
#[derive(Clone)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// JSON Schema validated against `tools/call` arguments before dispatch.
    pub input_schema: serde_json::Value,
    pub tags: BTreeSet<String>,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            tags: BTreeSet::new(),
            handler,
        }
    }

    pub fn with_tags<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tags: I) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

impl fmt::Debug for ToolDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDef")
            .field("name", &self.name)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// Resource definition with an exact URI.
#[derive(Clone)]
pub struct ResourceDef {
    pub uri: String,
    pub name: String,
    pub description: String,
    pub mime_type: Option<String>,
    pub tags: BTreeSet<String>,
    pub handler: Arc<dyn ResourceHandler>,
}

impl ResourceDef {
    pub fn new(
        uri: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn ResourceHandler>,
    ) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            description: description.into(),
            mime_type: None,
            tags: BTreeSet::new(),
            handler,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

impl fmt::Debug for ResourceDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDef")
            .field("uri", &self.uri)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Resource definition identified by a URI template with variable placeholders.
#[derive(Clone)]
pub struct ResourceTemplateDef {
    pub template: UriTemplate,
    pub name: String,
    pub description: String,
    pub mime_type: Option<String>,
    pub tags: BTreeSet<String>,
    pub handler: Arc<dyn ResourceHandler>,
}

impl ResourceTemplateDef {
    pub fn new(
        uri_template: &str,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn ResourceHandler>,
    ) -> Result<Self, ServerError> {
        Ok(Self {
            template: UriTemplate::parse(uri_template)?,
            name: name.into(),
            description: description.into(),
            mime_type: None,
            tags: BTreeSet::new(),
            handler,
        })
    }
}

impl fmt::Debug for ResourceTemplateDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTemplateDef")
            .field("template", &self.template.as_str())
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// One declared prompt argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

/// Prompt definition: exact name, declared arguments, handler, tags.
#[derive(Clone)]
pub struct PromptDef {
    pub name: String,
    pub description: String,
    pub arguments: Vec<PromptArgument>,
    pub tags: BTreeSet<String>,
    pub handler: Arc<dyn PromptHandler>,
}

impl PromptDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        arguments: Vec<PromptArgument>,
        handler: Arc<dyn PromptHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            arguments,
            tags: BTreeSet::new(),
            handler,
        }
    }
}

impl fmt::Debug for PromptDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromptDef")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A resolved resource lookup: the matched handler, the concrete URI, and any
/// path variables bound by template matching.
#[derive(Clone)]
pub struct ResourceMatch {
    pub uri: String,
    pub vars: BTreeMap<String, String>,
    pub handler: Arc<dyn ResourceHandler>,
}

impl fmt::Debug for ResourceMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceMatch")
            .field("uri", &self.uri)
            .field("vars", &self.vars)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Per-server mapping from (kind, identifier) to component definitions.
///
/// Exact-keyed maps back tools, prompts, and non-template resources;
/// templates keep a `Vec` because match order is registration order.
/// Mutation is expected at setup/composition time; dispatch only reads.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    tools: HashMap<String, ToolDef>,
    resources: HashMap<String, ResourceDef>,
    templates: Vec<ResourceTemplateDef>,
    prompts: HashMap<String, PromptDef>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under the given duplicate policy.
    pub fn register_tool(
        &mut self,
        def: ToolDef,
        policy: DuplicatePolicy,
    ) -> Result<(), ServerError> {
        if self.tools.contains_key(&def.name) {
            match policy {
                DuplicatePolicy::Error => {
                    return Err(ServerError::duplicate(ComponentKind::Tool, &def.name));
                }
                DuplicatePolicy::Warn => {
                    warn!(tool = %def.name, "duplicate tool registration ignored");
                    return Ok(());
                }
                DuplicatePolicy::Ignore => return Ok(()),
                DuplicatePolicy::Replace => {}
            }
        }
        self.tools.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn register_resource(
        &mut self,
        def: ResourceDef,
        policy: DuplicatePolicy,
    ) -> Result<(), ServerError> {
        if self.resources.contains_key(&def.uri) {
            match policy {
                DuplicatePolicy::Error => {
                    return Err(ServerError::duplicate(ComponentKind::Resource, &def.uri));
                }
                DuplicatePolicy::Warn => {
                    warn!(uri = %def.uri, "duplicate resource registration ignored");
                    return Ok(());
                }
                DuplicatePolicy::Ignore => return Ok(()),
                DuplicatePolicy::Replace => {}
            }
        }
        self.resources.insert(def.uri.clone(), def);
        Ok(())
    }

    pub fn register_resource_template(
        &mut self,
        def: ResourceTemplateDef,
        policy: DuplicatePolicy,
    ) -> Result<(), ServerError> {
        if let Some(pos) = self
            .templates
            .iter()
            .position(|t| t.template.as_str() == def.template.as_str())
        {
            match policy {
                DuplicatePolicy::Error => {
                    return Err(ServerError::duplicate(
                        ComponentKind::ResourceTemplate,
                        def.template.as_str(),
                    ));
                }
                DuplicatePolicy::Warn => {
                    warn!(template = %def.template.as_str(), "duplicate template registration ignored");
                    return Ok(());
                }
                DuplicatePolicy::Ignore => return Ok(()),
                // Replace keeps the original match position.
                DuplicatePolicy::Replace => {
                    self.templates[pos] = def;
                    return Ok(());
                }
            }
        }
        self.templates.push(def);
        Ok(())
    }

    pub fn register_prompt(
        &mut self,
        def: PromptDef,
        policy: DuplicatePolicy,
    ) -> Result<(), ServerError> {
        if self.prompts.contains_key(&def.name) {
            match policy {
                DuplicatePolicy::Error => {
                    return Err(ServerError::duplicate(ComponentKind::Prompt, &def.name));
                }
                DuplicatePolicy::Warn => {
                    warn!(prompt = %def.name, "duplicate prompt registration ignored");
                    return Ok(());
                }
                DuplicatePolicy::Ignore => return Ok(()),
                DuplicatePolicy::Replace => {}
            }
        }
        self.prompts.insert(def.name.clone(), def);
        Ok(())
    }

    /// Exact tool lookup.
    pub fn tool(&self, name: &str) -> Option<&ToolDef> {
        self.tools.get(name)
    }

    /// Exact prompt lookup.
    pub fn prompt(&self, name: &str) -> Option<&PromptDef> {
        self.prompts.get(name)
    }

    /// Resolve a concrete URI: exact resources first, then templates in
    /// registration order, binding path variables on first match.
    pub fn resolve_resource(&self, uri: &str) -> Option<ResourceMatch> {
        if let Some(def) = self.resources.get(uri) {
            return Some(ResourceMatch {
                uri: uri.to_string(),
                vars: BTreeMap::new(),
                handler: Arc::clone(&def.handler),
            });
        }
        for def in &self.templates {
            if let Some(vars) = def.template.matches(uri) {
                return Some(ResourceMatch {
                    uri: uri.to_string(),
                    vars,
                    handler: Arc::clone(&def.handler),
                });
            }
        }
        None
    }

    /// Tools sorted by name for deterministic listings.
    pub fn tools(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.tools.values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Resources sorted by URI for deterministic listings.
    pub fn resources(&self) -> Vec<ResourceDef> {
        let mut defs: Vec<ResourceDef> = self.resources.values().cloned().collect();
        defs.sort_by(|a, b| a.uri.cmp(&b.uri));
        defs
    }

    /// Templates in registration order (match order is meaningful).
    pub fn resource_templates(&self) -> Vec<ResourceTemplateDef> {
        self.templates.clone()
    }

    /// Prompts sorted by name for deterministic listings.
    pub fn prompts(&self) -> Vec<PromptDef> {
        let mut defs: Vec<PromptDef> = self.prompts.values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn contains_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn contains_resource(&self, uri: &str) -> bool {
        self.resources.contains_key(uri)
    }

    pub fn contains_resource_template(&self, uri_template: &str) -> bool {
        self.templates
            .iter()
            .any(|t| t.template.as_str() == uri_template)
    }

    pub fn contains_prompt(&self, name: &str) -> bool {
        self.prompts.contains_key(name)
    }
}
