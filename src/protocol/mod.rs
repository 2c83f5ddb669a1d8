pub mod request;
pub mod response;

pub use request::{
    CancelledParams, ClientInfo, GetPromptParams, InitializeParams, JsonRpcRequest,
    ReadResourceParams, RequestMeta, RpcId, ToolCallParams,
};
pub use response::{
    ContentPart, JsonRpcError, JsonRpcResponse, PromptMessage, ResourceContents, Role, ToolResult,
};
