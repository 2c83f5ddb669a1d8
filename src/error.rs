use crate::registry::ComponentKind;

/// Error taxonomy for the composable server core.
///
/// Composition-time errors (`Configuration`, `DuplicateComponent`) surface
/// immediately to the composer and leave the registry unmodified.
/// Dispatch-time errors are caught at the dispatch boundary and converted
/// into a client-visible failure response.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Invalid composition: cyclic mount, bad prefix, malformed template.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Registration conflict under duplicate policy `error`.
    #[error("duplicate {kind}: {name}")]
    DuplicateComponent { kind: ComponentKind, name: String },

    /// Lookup miss anywhere in the resolved registry/mount/proxy chain.
    #[error("{kind} not found: {name}")]
    NotFound { kind: ComponentKind, name: String },

    /// Proxy backend unreachable.
    #[error("backend '{backend}' unreachable while invoking '{capability}': {detail}")]
    UpstreamUnavailable {
        backend: String,
        capability: String,
        detail: String,
    },

    /// Proxy backend replied in a shape the protocol does not allow.
    #[error("backend '{backend}' returned a malformed reply for '{capability}': {detail}")]
    UpstreamProtocol {
        backend: String,
        capability: String,
        detail: String,
    },

    /// A capability call made after the owning request completed.
    #[error("request context for '{request_id}' has expired")]
    ContextExpired { request_id: String },

    /// Request aborted mid-dispatch (client cancel, disconnect, or timeout).
    #[error("request cancelled")]
    Cancelled,

    /// Tool arguments rejected by the declared input schema.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Handler-reported execution failure.
    #[error("execution failed: {0}")]
    Execution(String),

    /// Serialization fault or broken internal invariant at the boundary.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn not_found(kind: ComponentKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn duplicate(kind: ComponentKind, name: impl Into<String>) -> Self {
        Self::DuplicateComponent {
            kind,
            name: name.into(),
        }
    }

    pub fn upstream_unavailable(
        backend: impl Into<String>,
        capability: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::UpstreamUnavailable {
            backend: backend.into(),
            capability: capability.into(),
            detail: detail.into(),
        }
    }

    pub fn upstream_protocol(
        backend: impl Into<String>,
        capability: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::UpstreamProtocol {
            backend: backend.into(),
            capability: capability.into(),
            detail: detail.into(),
        }
    }

    /// Map to the corresponding JSON-RPC 2.0 error code.
    ///
    /// Lookup and validation failures → -32602 (Invalid params)
    /// Server-side and upstream failures → -32603 (Internal error)
    pub fn json_rpc_code(&self) -> i32 {
        match self {
            Self::NotFound { .. }
            | Self::DuplicateComponent { .. }
            | Self::InvalidArguments(_) => -32602,
            Self::Configuration(_)
            | Self::UpstreamUnavailable { .. }
            | Self::UpstreamProtocol { .. }
            | Self::ContextExpired { .. }
            | Self::Cancelled
            | Self::Execution(_)
            | Self::Internal(_) => -32603,
        }
    }

    /// Stable machine-readable tag carried in the JSON-RPC `data` field.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::DuplicateComponent { .. } => "duplicate_component",
            Self::NotFound { .. } => "not_found",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::UpstreamProtocol { .. } => "upstream_protocol",
            Self::ContextExpired { .. } => "context_expired",
            Self::Cancelled => "cancelled",
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::Execution(_) => "execution",
            Self::Internal(_) => "internal",
        }
    }
}
