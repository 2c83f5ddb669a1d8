use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use crate::context::{ClientChannel, Context};
use crate::protocol::{
    GetPromptParams, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ReadResourceParams,
    ToolCallParams, ToolResult,
};
use crate::server::Server;

/// Dispatch one JSON-RPC request against a server.
///
/// Runs the request state machine: resolve the component through the
/// registry/mount/import/proxy chain, create the request-scoped [`Context`],
/// run the matched handler, expire the context, and convert the outcome into
/// a client-visible response. Handler failures never escape this boundary.
///
/// Returns `None` for notifications (no response required).
pub async fn dispatch(
    server: &Arc<Server>,
    req: &JsonRpcRequest,
    channel: &Arc<dyn ClientChannel>,
    client_id: Option<&str>,
) -> Option<JsonRpcResponse> {
    match req.method.as_str() {
        "initialize" => {
            let result = json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {
                    "tools": {},
                    "resources": {},
                    "prompts": {}
                },
                "serverInfo": {
                    "name": server.settings().name,
                    "version": server.settings().version
                }
            });
            Some(JsonRpcResponse::success(req.id.clone(), result))
        }

        "notifications/initialized" => None,

        // Cancellation is intercepted by the session loop before dispatch.
        "notifications/cancelled" => None,

        "ping" => Some(JsonRpcResponse::success(req.id.clone(), json!({}))),

        "tools/list" => {
            let tools: Vec<_> = server
                .list_tools()
                .iter()
                .map(|def| {
                    json!({
                        "name": def.name,
                        "description": def.description,
                        "inputSchema": def.input_schema,
                    })
                })
                .collect();
            Some(JsonRpcResponse::success(
                req.id.clone(),
                json!({ "tools": tools }),
            ))
        }

        "tools/call" => {
            let params: ToolCallParams = match parse_params(req) {
                Ok(p) => p,
                Err(resp) => return Some(resp),
            };
            let progress_token = params.meta.as_ref().and_then(|m| m.progress_token.clone());
            let ctx = request_context(server, req, channel, client_id, progress_token);
            let args = params.arguments.unwrap_or_else(|| json!({}));

            debug!(tool = %params.name, request_id = %ctx.request_id(), "dispatching tool call");
            let outcome = server.call_tool(&params.name, args, ctx.clone()).await;
            ctx.expire();

            // Tool failures are reported in-band as an isError result,
            // not as a protocol error (the call itself succeeded).
            let tool_result = match outcome {
                Ok(result) => result,
                Err(e) => ToolResult::error(e.to_string()),
            };
            match serde_json::to_value(&tool_result) {
                Ok(result_json) => Some(JsonRpcResponse::success(req.id.clone(), result_json)),
                Err(e) => Some(JsonRpcResponse::error(
                    req.id.clone(),
                    JsonRpcError::internal_error(format!("result serialization failed: {e}")),
                )),
            }
        }

        "resources/list" => {
            let resources: Vec<_> = server
                .list_resources()
                .iter()
                .map(|def| {
                    json!({
                        "uri": def.uri,
                        "name": def.name,
                        "description": def.description,
                        "mimeType": def.mime_type,
                    })
                })
                .collect();
            Some(JsonRpcResponse::success(
                req.id.clone(),
                json!({ "resources": resources }),
            ))
        }

        "resources/templates/list" => {
            let templates: Vec<_> = server
                .list_resource_templates()
                .iter()
                .map(|def| {
                    json!({
                        "uriTemplate": def.template.as_str(),
                        "name": def.name,
                        "description": def.description,
                        "mimeType": def.mime_type,
                    })
                })
                .collect();
            Some(JsonRpcResponse::success(
                req.id.clone(),
                json!({ "resourceTemplates": templates }),
            ))
        }

        "resources/read" => {
            let params: ReadResourceParams = match parse_params(req) {
                Ok(p) => p,
                Err(resp) => return Some(resp),
            };
            let progress_token = params.meta.as_ref().and_then(|m| m.progress_token.clone());
            let ctx = request_context(server, req, channel, client_id, progress_token);

            let outcome = server.read_resource(&params.uri, ctx.clone()).await;
            ctx.expire();

            Some(match outcome {
                Ok(contents) => JsonRpcResponse::success(
                    req.id.clone(),
                    json!({ "contents": contents }),
                ),
                Err(e) => JsonRpcResponse::error(req.id.clone(), JsonRpcError::from(&e)),
            })
        }

        "prompts/list" => {
            let prompts: Vec<_> = server
                .list_prompts()
                .iter()
                .map(|def| {
                    json!({
                        "name": def.name,
                        "description": def.description,
                        "arguments": def.arguments,
                    })
                })
                .collect();
            Some(JsonRpcResponse::success(
                req.id.clone(),
                json!({ "prompts": prompts }),
            ))
        }

        "prompts/get" => {
            let params: GetPromptParams = match parse_params(req) {
                Ok(p) => p,
                Err(resp) => return Some(resp),
            };
            let progress_token = params.meta.as_ref().and_then(|m| m.progress_token.clone());
            let ctx = request_context(server, req, channel, client_id, progress_token);
            let args = params.arguments.unwrap_or_default();

            let outcome = server.get_prompt(&params.name, args, ctx.clone()).await;
            ctx.expire();

            Some(match outcome {
                Ok(messages) => JsonRpcResponse::success(
                    req.id.clone(),
                    json!({ "messages": messages }),
                ),
                Err(e) => JsonRpcResponse::error(req.id.clone(), JsonRpcError::from(&e)),
            })
        }

        _ => Some(JsonRpcResponse::error(
            req.id.clone(),
            JsonRpcError::method_not_found(&req.method),
        )),
    }
}

fn request_context(
    server: &Arc<Server>,
    req: &JsonRpcRequest,
    channel: &Arc<dyn ClientChannel>,
    client_id: Option<&str>,
    progress_token: Option<serde_json::Value>,
) -> Context {
    let request_id = req
        .id
        .as_ref()
        .map(|id| id.key())
        .unwrap_or_else(|| "notification".to_string());
    Context::new(
        request_id,
        client_id.map(str::to_string),
        progress_token,
        server,
        Arc::clone(channel),
    )
}

fn parse_params<T: serde::de::DeserializeOwned>(
    req: &JsonRpcRequest,
) -> Result<T, JsonRpcResponse> {
    let Some(value) = &req.params else {
        return Err(JsonRpcResponse::error(
            req.id.clone(),
            JsonRpcError::invalid_params(format!("Missing params for {}", req.method)),
        ));
    };
    serde_json::from_value(value.clone()).map_err(|e| {
        JsonRpcResponse::error(
            req.id.clone(),
            JsonRpcError::invalid_params(format!("Invalid {} params: {e}", req.method)),
        )
    })
}
