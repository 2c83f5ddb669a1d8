use std::time::Duration;

/// Default maximum tokens requested from the client model by `Context::sample`.
pub const DEFAULT_SAMPLE_MAX_TOKENS: u32 = 512;

/// What `register` does when a component with the same identifier already
/// exists for that kind.
///
/// `Ignore` silently keeps the first-registered definition and drops the
/// newcomer; `Warn` does the same but logs the collision. This meaning is
/// uniform across direct registration and `import_server`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Fail the registration with `DuplicateComponent`.
    #[default]
    Error,
    /// Keep the existing definition and log a warning.
    Warn,
    /// Overwrite the existing definition.
    Replace,
    /// Keep the existing definition silently.
    Ignore,
}

/// Server-wide settings, constructed once at server creation and shared by
/// reference into the registry, composition, and dispatch layers.
///
/// There is no ambient global state: every server carries its own value.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Server name, reported during the `initialize` handshake.
    pub name: String,
    /// Server version, reported during the `initialize` handshake.
    pub version: String,
    pub on_duplicate_tools: DuplicatePolicy,
    pub on_duplicate_resources: DuplicatePolicy,
    pub on_duplicate_prompts: DuplicatePolicy,
    /// Server-level timeout for `Context::sample`. `None` defers to the
    /// underlying session's timeout.
    pub sample_timeout: Option<Duration>,
}

impl ServerSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            on_duplicate_tools: DuplicatePolicy::Error,
            on_duplicate_resources: DuplicatePolicy::Error,
            on_duplicate_prompts: DuplicatePolicy::Error,
            sample_timeout: None,
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn on_duplicate_tools(mut self, policy: DuplicatePolicy) -> Self {
        self.on_duplicate_tools = policy;
        self
    }

    pub fn on_duplicate_resources(mut self, policy: DuplicatePolicy) -> Self {
        self.on_duplicate_resources = policy;
        self
    }

    pub fn on_duplicate_prompts(mut self, policy: DuplicatePolicy) -> Self {
        self.on_duplicate_prompts = policy;
        self
    }

    pub fn sample_timeout(mut self, timeout: Duration) -> Self {
        self.sample_timeout = Some(timeout);
        self
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self::new("mcp-compose")
    }
}
