use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ServerSettings;
use crate::context::Context;
use crate::error::ServerError;
use crate::protocol::{PromptMessage, ResourceContents, ToolResult};
use crate::registry::{
    ComponentKind, ComponentRegistry, PromptDef, ResourceDef, ResourceMatch, ResourceTemplateDef,
    ToolDef,
};
use crate::schema;
use crate::template::UriTemplate;

/// A live delegation of a child server's registry into a parent, under a
/// prefix. Lookups under the prefix are forwarded to the child's *current*
/// registry at call time; there is no caching, so a stale view is impossible.
///
/// Static composition (`import_server`) realizes the child into the parent's
/// own registry once and leaves no link behind.
#[derive(Clone)]
pub struct MountLink {
    pub prefix: String,
    pub server: Arc<Server>,
}

/// A composable capability server: one registry, one settings value, and a
/// list of live mounts. Shared as `Arc<Server>`; the `Arc` identity doubles
/// as the node identity for mount-cycle detection.
///
/// Registration is expected during a setup phase; dispatch-time traffic only
/// reads. Both are safe concurrently — the registry sits behind an `RwLock`.
pub struct Server {
    settings: ServerSettings,
    registry: RwLock<ComponentRegistry>,
    mounts: RwLock<Vec<MountLink>>,
}

impl Server {
    pub fn new(settings: ServerSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            registry: RwLock::new(ComponentRegistry::new()),
            mounts: RwLock::new(Vec::new()),
        })
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    // Poisoning only happens if a registration panicked mid-write; the
    // registry has no invariants that a half-applied insert can break.
    fn registry_read(&self) -> RwLockReadGuard<'_, ComponentRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_write(&self) -> RwLockWriteGuard<'_, ComponentRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn mounts_read(&self) -> RwLockReadGuard<'_, Vec<MountLink>> {
        self.mounts.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn mounts_write(&self) -> RwLockWriteGuard<'_, Vec<MountLink>> {
        self.mounts.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Swap in a freshly built registry wholesale. Used by the proxy layer to
    /// apply a re-fetched backend manifest atomically.
    pub(crate) fn install_registry(&self, registry: ComponentRegistry) {
        *self.registry_write() = registry;
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    pub fn register_tool(&self, def: ToolDef) -> Result<(), ServerError> {
        self.registry_write()
            .register_tool(def, self.settings.on_duplicate_tools)
    }

    pub fn register_resource(&self, def: ResourceDef) -> Result<(), ServerError> {
        self.registry_write()
            .register_resource(def, self.settings.on_duplicate_resources)
    }

    pub fn register_resource_template(&self, def: ResourceTemplateDef) -> Result<(), ServerError> {
        self.registry_write()
            .register_resource_template(def, self.settings.on_duplicate_resources)
    }

    pub fn register_prompt(&self, def: PromptDef) -> Result<(), ServerError> {
        self.registry_write()
            .register_prompt(def, self.settings.on_duplicate_prompts)
    }

    // -----------------------------------------------------------------------
    // Composition
    // -----------------------------------------------------------------------

    /// Mount `child` live under `prefix`. Components registered on the child
    /// after mounting are resolvable through the parent immediately.
    ///
    /// Fails with `Configuration` on an invalid prefix or if the mount would
    /// close a cycle (directly or transitively). Checked here, at mount time,
    /// never at first dispatch.
    pub fn mount(
        self: &Arc<Self>,
        prefix: &str,
        child: Arc<Server>,
    ) -> Result<(), ServerError> {
        validate_prefix(prefix)?;
        if Arc::ptr_eq(self, &child) || child.reaches(self) {
            return Err(ServerError::Configuration(format!(
                "mounting '{}' under '{prefix}' would create a cycle",
                child.name()
            )));
        }
        info!(parent = %self.name(), child = %child.name(), %prefix, "mounting server");
        self.mounts_write().push(MountLink {
            prefix: prefix.to_string(),
            server: child,
        });
        Ok(())
    }

    /// Remove the first live mount with the given prefix. Returns whether a
    /// link was removed.
    pub fn unmount(&self, prefix: &str) -> bool {
        let mut mounts = self.mounts_write();
        match mounts.iter().position(|link| link.prefix == prefix) {
            Some(pos) => {
                mounts.remove(pos);
                true
            }
            None => false,
        }
    }

    /// True if `target` is reachable through this server's transitive mounts.
    fn reaches(self: &Arc<Self>, target: &Arc<Server>) -> bool {
        let mounts = self.mounts_read();
        mounts
            .iter()
            .any(|link| Arc::ptr_eq(&link.server, target) || link.server.reaches(target))
    }

    /// Copy `child`'s current registry into this server under `prefix`, once.
    /// Later changes to `child` are not reflected — a deliberate value-copy,
    /// as opposed to the reference semantics of [`Server::mount`].
    ///
    /// Atomic with respect to duplicate policy `error`: the whole batch is
    /// checked for conflicts before the first definition lands, so a failed
    /// import leaves this registry untouched.
    pub fn import_server(&self, prefix: &str, child: &Server) -> Result<(), ServerError> {
        validate_prefix(prefix)?;

        // Snapshot under the child's read lock, then remap identifiers.
        let (child_tools, child_resources, child_templates, child_prompts) = {
            let reg = child.registry_read();
            (
                reg.tools(),
                reg.resources(),
                reg.resource_templates(),
                reg.prompts(),
            )
        };

        let tools: Vec<ToolDef> = child_tools
            .into_iter()
            .map(|mut def| {
                def.name = prefix_name(prefix, &def.name);
                def
            })
            .collect();
        let resources: Vec<ResourceDef> = child_resources
            .into_iter()
            .map(|mut def| {
                def.uri = prefix_uri(prefix, &def.uri);
                def
            })
            .collect();
        let templates: Vec<ResourceTemplateDef> = child_templates
            .into_iter()
            .map(|mut def| {
                // The prefix splices into the literal part, so a valid
                // template stays valid.
                def.template = UriTemplate::parse(&prefix_uri(prefix, def.template.as_str()))?;
                Ok(def)
            })
            .collect::<Result<_, ServerError>>()?;
        let prompts: Vec<PromptDef> = child_prompts
            .into_iter()
            .map(|mut def| {
                def.name = prefix_name(prefix, &def.name);
                def
            })
            .collect();

        let mut reg = self.registry_write();

        use crate::config::DuplicatePolicy;
        if self.settings.on_duplicate_tools == DuplicatePolicy::Error {
            for def in &tools {
                if reg.contains_tool(&def.name) {
                    return Err(ServerError::duplicate(ComponentKind::Tool, &def.name));
                }
            }
        }
        if self.settings.on_duplicate_resources == DuplicatePolicy::Error {
            for def in &resources {
                if reg.contains_resource(&def.uri) {
                    return Err(ServerError::duplicate(ComponentKind::Resource, &def.uri));
                }
            }
            for def in &templates {
                if reg.contains_resource_template(def.template.as_str()) {
                    return Err(ServerError::duplicate(
                        ComponentKind::ResourceTemplate,
                        def.template.as_str(),
                    ));
                }
            }
        }
        if self.settings.on_duplicate_prompts == DuplicatePolicy::Error {
            for def in &prompts {
                if reg.contains_prompt(&def.name) {
                    return Err(ServerError::duplicate(ComponentKind::Prompt, &def.name));
                }
            }
        }

        for def in tools {
            reg.register_tool(def, self.settings.on_duplicate_tools)?;
        }
        for def in resources {
            reg.register_resource(def, self.settings.on_duplicate_resources)?;
        }
        for def in templates {
            reg.register_resource_template(def, self.settings.on_duplicate_resources)?;
        }
        for def in prompts {
            reg.register_prompt(def, self.settings.on_duplicate_prompts)?;
        }

        info!(parent = %self.name(), child = %child.name(), %prefix, "imported server snapshot");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Chain resolution (own registry first, then live mounts in mount order)
    // -----------------------------------------------------------------------

    /// Resolve a tool by (possibly prefixed) name through the mount chain.
    pub fn find_tool(&self, name: &str) -> Option<ToolDef> {
        if let Some(def) = self.registry_read().tool(name) {
            return Some(def.clone());
        }
        let mounts = self.mounts_read();
        for link in mounts.iter() {
            if let Some(rest) = strip_name_prefix(&link.prefix, name) {
                if let Some(def) = link.server.find_tool(rest) {
                    return Some(def);
                }
            }
        }
        None
    }

    /// Resolve a prompt by (possibly prefixed) name through the mount chain.
    pub fn find_prompt(&self, name: &str) -> Option<PromptDef> {
        if let Some(def) = self.registry_read().prompt(name) {
            return Some(def.clone());
        }
        let mounts = self.mounts_read();
        for link in mounts.iter() {
            if let Some(rest) = strip_name_prefix(&link.prefix, name) {
                if let Some(def) = link.server.find_prompt(rest) {
                    return Some(def);
                }
            }
        }
        None
    }

    /// Resolve a resource URI through the mount chain. The returned match
    /// carries the URI in the owning child's own namespace.
    pub fn find_resource(&self, uri: &str) -> Option<ResourceMatch> {
        if let Some(found) = self.registry_read().resolve_resource(uri) {
            return Some(found);
        }
        let mounts = self.mounts_read();
        for link in mounts.iter() {
            if let Some(child_uri) = strip_uri_prefix(&link.prefix, uri) {
                if let Some(found) = link.server.find_resource(&child_uri) {
                    return Some(found);
                }
            }
        }
        None
    }

    // -----------------------------------------------------------------------
    // Listings (own components shadow mounted ones on collision)
    // -----------------------------------------------------------------------

    pub fn list_tools(&self) -> Vec<ToolDef> {
        let mut out = self.registry_read().tools();
        let mut seen: HashSet<String> = out.iter().map(|d| d.name.clone()).collect();
        let mounts = self.mounts_read();
        for link in mounts.iter() {
            for mut def in link.server.list_tools() {
                def.name = prefix_name(&link.prefix, &def.name);
                if seen.insert(def.name.clone()) {
                    out.push(def);
                } else {
                    debug!(tool = %def.name, "mounted tool shadowed in listing");
                }
            }
        }
        out
    }

    pub fn list_resources(&self) -> Vec<ResourceDef> {
        let mut out = self.registry_read().resources();
        let mut seen: HashSet<String> = out.iter().map(|d| d.uri.clone()).collect();
        let mounts = self.mounts_read();
        for link in mounts.iter() {
            for mut def in link.server.list_resources() {
                def.uri = prefix_uri(&link.prefix, &def.uri);
                if seen.insert(def.uri.clone()) {
                    out.push(def);
                } else {
                    debug!(uri = %def.uri, "mounted resource shadowed in listing");
                }
            }
        }
        out
    }

    pub fn list_resource_templates(&self) -> Vec<ResourceTemplateDef> {
        let mut out = self.registry_read().resource_templates();
        let mut seen: HashSet<String> =
            out.iter().map(|d| d.template.as_str().to_string()).collect();
        let mounts = self.mounts_read();
        for link in mounts.iter() {
            for mut def in link.server.list_resource_templates() {
                let prefixed = prefix_uri(&link.prefix, def.template.as_str());
                match UriTemplate::parse(&prefixed) {
                    Ok(template) => def.template = template,
                    Err(_) => {
                        warn!(template = %prefixed, "skipping unprefixable mounted template");
                        continue;
                    }
                }
                if seen.insert(def.template.as_str().to_string()) {
                    out.push(def);
                }
            }
        }
        out
    }

    pub fn list_prompts(&self) -> Vec<PromptDef> {
        let mut out = self.registry_read().prompts();
        let mut seen: HashSet<String> = out.iter().map(|d| d.name.clone()).collect();
        let mounts = self.mounts_read();
        for link in mounts.iter() {
            for mut def in link.server.list_prompts() {
                def.name = prefix_name(&link.prefix, &def.name);
                if seen.insert(def.name.clone()) {
                    out.push(def);
                } else {
                    debug!(prompt = %def.name, "mounted prompt shadowed in listing");
                }
            }
        }
        out
    }

    // -----------------------------------------------------------------------
    // Invocation entry points
    // -----------------------------------------------------------------------

    /// Look up a tool through the chain, validate arguments against its
    /// declared schema, and run the handler.
    pub async fn call_tool(
        &self,
        name: &str,
        args: Value,
        ctx: Context,
    ) -> Result<ToolResult, ServerError> {
        let def = self
            .find_tool(name)
            .ok_or_else(|| ServerError::not_found(ComponentKind::Tool, name))?;
        schema::validate_arguments(&def.input_schema, &args)?;
        def.handler.call(args, ctx).await
    }

    /// Resolve a URI through the chain and read it.
    pub async fn read_resource(
        &self,
        uri: &str,
        ctx: Context,
    ) -> Result<Vec<ResourceContents>, ServerError> {
        let found = self
            .find_resource(uri)
            .ok_or_else(|| ServerError::not_found(ComponentKind::Resource, uri))?;
        found.handler.read(&found.uri, &found.vars, ctx).await
    }

    /// Look up a prompt through the chain, check required arguments, and
    /// render it.
    pub async fn get_prompt(
        &self,
        name: &str,
        args: BTreeMap<String, String>,
        ctx: Context,
    ) -> Result<Vec<PromptMessage>, ServerError> {
        let def = self
            .find_prompt(name)
            .ok_or_else(|| ServerError::not_found(ComponentKind::Prompt, name))?;
        for arg in &def.arguments {
            if arg.required && !args.contains_key(&arg.name) {
                return Err(ServerError::InvalidArguments(format!(
                    "prompt '{name}' requires argument '{}'",
                    arg.name
                )));
            }
        }
        def.handler.render(args, ctx).await
    }
}

/// Prefixes must be usable as a path component of a composed identifier.
fn validate_prefix(prefix: &str) -> Result<(), ServerError> {
    if prefix.is_empty() {
        return Err(ServerError::Configuration("prefix must not be empty".into()));
    }
    if prefix.contains('/') {
        return Err(ServerError::Configuration(format!(
            "prefix '{prefix}' must not contain '/'"
        )));
    }
    Ok(())
}

fn prefix_name(prefix: &str, name: &str) -> String {
    format!("{prefix}/{name}")
}

fn strip_name_prefix<'a>(prefix: &str, name: &'a str) -> Option<&'a str> {
    name.strip_prefix(prefix)?.strip_prefix('/')
}

/// Splice a mount prefix into a URI after the scheme:
/// `users://42/profile` mounted under `api` becomes `users://api/42/profile`.
fn prefix_uri(prefix: &str, uri: &str) -> String {
    match uri.split_once("://") {
        Some((scheme, rest)) => format!("{scheme}://{prefix}/{rest}"),
        None => format!("{prefix}/{uri}"),
    }
}

/// Inverse of [`prefix_uri`]: recover the child-namespace URI, or `None` if
/// the URI does not sit under the prefix.
fn strip_uri_prefix(prefix: &str, uri: &str) -> Option<String> {
    match uri.split_once("://") {
        Some((scheme, rest)) => {
            let stripped = rest.strip_prefix(prefix)?.strip_prefix('/')?;
            Some(format!("{scheme}://{stripped}"))
        }
        None => {
            let stripped = uri.strip_prefix(prefix)?.strip_prefix('/')?;
            Some(stripped.to_string())
        }
    }
}
