//! Composable MCP server core.
//!
//! A [`Server`] exposes callable capabilities — tools, resources, and prompt
//! templates — to a remote client over JSON-RPC 2.0. Servers compose: a child
//! can be mounted live under a prefix, imported as a one-time snapshot, or
//! fronted by a [`ProxyServer`] that forwards every invocation to a backend
//! session. During dispatch each handler receives a request-scoped
//! [`Context`] for logging, progress reporting, resource reads, and LLM
//! sampling round trips back to the client.
//!
//! Wire framing lives at the edges: [`Session`] speaks newline-delimited
//! JSON-RPC over any byte stream (stdio included), and the
//! [`proxy::BackendClient`] seam abstracts the far side of a proxy.

pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod schema;
pub mod server;
pub mod session;
pub mod template;

pub use config::{DuplicatePolicy, ServerSettings};
pub use context::{ClientChannel, Context, LogLevel, SampleOptions, SampleResult, SamplingMessage};
pub use error::ServerError;
pub use protocol::{ContentPart, PromptMessage, ResourceContents, Role, ToolResult};
pub use proxy::{BackendClient, LocalBackend, ProxyServer};
pub use registry::{
    ComponentKind, ComponentRegistry, PromptArgument, PromptDef, PromptHandler, ResourceDef,
    ResourceHandler, ResourceTemplateDef, ToolDef, ToolHandler,
};
pub use server::Server;
pub use session::Session;
