//! Common wire types shared across the gateway.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Server identifier
pub type ServerId = String;

/// JSON-RPC 2.0 request envelope.
///
/// The gateway forwards only `method` and `params` to children; the client's
/// original `id` is re-applied to the response on the way out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn result(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC error object. Child errors pass through the gateway verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// The reply a child produced for one request: either its result or its own
/// JSON-RPC error object. Gateway-level failures travel as `crate::Error`.
#[derive(Debug, Clone)]
pub enum RpcReply {
    Result(Value),
    Error(RpcError),
}

impl RpcReply {
    /// Re-wrap as a full response envelope carrying the client's original id.
    pub fn into_response(self, id: Option<Value>) -> RpcResponse {
        match self {
            RpcReply::Result(result) => RpcResponse::result(id, result),
            RpcReply::Error(error) => RpcResponse::error(id, error),
        }
    }
}

/// A tool advertised by a child via `tools/list`.
///
/// `extra` flattens unrecognized keys so a descriptor re-emitted by the admin
/// API preserves the child's schema byte-for-byte up to JSON key ordering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", alias = "input_schema")]
    pub input_schema: Value,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Content blocks returned by `tools/call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_descriptor_round_trips_unknown_keys() {
        let raw = json!({
            "name": "read_file",
            "description": "Read a file",
            "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}}},
            "annotations": {"readOnlyHint": true}
        });
        let tool: ToolDescriptor = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(tool.name, "read_file");
        assert!(tool.extra.contains_key("annotations"));

        let back = serde_json::to_value(&tool).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn content_blocks_discriminate_on_type() {
        let blocks: Vec<Content> = serde_json::from_value(json!([
            {"type": "text", "text": "hello"},
            {"type": "image", "data": "aGk=", "mimeType": "image/png"},
            {"type": "resource", "resource": {"uri": "file:///tmp/x"}}
        ]))
        .unwrap();
        assert!(matches!(&blocks[0], Content::Text { text } if text == "hello"));
        assert!(matches!(&blocks[1], Content::Image { mime_type, .. } if mime_type == "image/png"));
        assert!(matches!(&blocks[2], Content::Resource { .. }));
    }

    #[test]
    fn reply_rewraps_client_id() {
        let reply = RpcReply::Result(json!({"tools": []}));
        let resp = reply.into_response(Some(json!(7)));
        assert_eq!(resp.id, Some(json!(7)));
        assert!(resp.error.is_none());

        let reply = RpcReply::Error(RpcError {
            code: -32601,
            message: "method not found".into(),
            data: None,
        });
        let resp = reply.into_response(Some(json!(0)));
        assert_eq!(resp.id, Some(json!(0)));
        assert_eq!(resp.error.unwrap().code, -32601);
    }
}
