//! Request dispatch: turns a decoded message into the reply to send.

use bytes::Bytes;
use serde_json::json;
use skein_cluster::NodeRegistry;
use skein_transport::codec::{
    BinaryFrame, HttpMessage, KeepAlive, Message, MsgBody, RspResult,
};
use tracing::{debug, trace};

/// Liveness probe; answered with an empty response frame.
pub const CMD_HEARTBEAT: u32 = 1;
/// Routing query; `body.data` is the key, `body.add_on` optionally the node type.
pub const CMD_ROUTE: u32 = 2;

/// Response code for an unknown command.
pub const RSP_UNKNOWN_COMMAND: i32 = -1;
/// Response code when no node of the requested type is registered.
pub const RSP_NO_NODE: i32 = 404;

/// Stateless request router.
#[derive(Debug, Clone)]
pub struct Router {
    default_type: String,
}

impl Router {
    /// Routes queries without an explicit type to `default_type`.
    pub fn new(default_type: impl Into<String>) -> Self {
        Self {
            default_type: default_type.into(),
        }
    }

    /// Reply for `msg`, or `None` if nothing should be sent back.
    pub fn handle(&self, registry: &NodeRegistry, msg: Message) -> Option<Message> {
        match msg {
            Message::Binary(frame) => self.handle_frame(registry, frame).map(Message::Binary),
            Message::Http(req) => self.handle_http(registry, req).map(Message::Http),
        }
    }

    fn handle_frame(&self, registry: &NodeRegistry, frame: BinaryFrame) -> Option<BinaryFrame> {
        if frame.is_response() {
            trace!(cmd = frame.head.cmd, seq = frame.head.seq, "dropping unsolicited response");
            return None;
        }
        let body = match frame.head.cmd {
            CMD_HEARTBEAT => MsgBody::default(),
            CMD_ROUTE => {
                let node_type = if frame.body.add_on.is_empty() {
                    self.default_type.clone()
                } else {
                    String::from_utf8_lossy(&frame.body.add_on).into_owned()
                };
                match registry.lookup(&node_type, &frame.body.data) {
                    Some(node) => MsgBody {
                        data: Bytes::copy_from_slice(node.identity.as_bytes()),
                        trace_id: frame.body.trace_id.clone(),
                        rsp_result: Some(RspResult::default()),
                        ..MsgBody::default()
                    },
                    None => MsgBody {
                        trace_id: frame.body.trace_id.clone(),
                        rsp_result: Some(RspResult {
                            code: RSP_NO_NODE,
                            msg: format!("no {node_type} node registered"),
                        }),
                        ..MsgBody::default()
                    },
                }
            }
            cmd => {
                debug!(cmd, seq = frame.head.seq, "unknown command");
                MsgBody {
                    trace_id: frame.body.trace_id.clone(),
                    rsp_result: Some(RspResult {
                        code: RSP_UNKNOWN_COMMAND,
                        msg: format!("unknown command {cmd}"),
                    }),
                    ..MsgBody::default()
                }
            }
        };
        if frame.head.flags.one_way {
            return None;
        }
        Some(frame.make_response(body))
    }

    fn handle_http(&self, registry: &NodeRegistry, req: HttpMessage) -> Option<HttpMessage> {
        if !req.is_request() {
            trace!(status = req.status, "dropping unsolicited HTTP response");
            return None;
        }
        let known = matches!(req.path.as_str(), "/health" | "/route");
        let mut resp = if known && !req.method.eq_ignore_ascii_case("GET") {
            text(405, "method not allowed")
        } else {
            match req.path.as_str() {
                "/health" => text(200, "ok"),
                "/route" => self.route_query(registry, &req),
                _ => text(404, "not found"),
            }
        };
        resp.version = req.version;
        if req.keep_alive == Some(KeepAlive::Close) {
            resp.keep_alive = Some(KeepAlive::Close);
        }
        debug!(method = %req.method, path = %req.path, status = resp.status, "handled HTTP request");
        Some(resp)
    }

    fn route_query(&self, registry: &NodeRegistry, req: &HttpMessage) -> HttpMessage {
        let node_type = req.param("type").unwrap_or(self.default_type.as_str());
        let Some(key) = req.param("key") else {
            return json_response(400, json!({ "error": "missing key parameter" }));
        };
        match registry.lookup(node_type, key.as_bytes()) {
            Some(node) => json_response(
                200,
                json!({
                    "type": node_type,
                    "key": key,
                    "node": &*node.identity,
                    "host": node.host,
                    "port": node.port,
                    "worker": node.worker_index,
                }),
            ),
            None => json_response(
                503,
                json!({ "error": format!("no {node_type} node registered") }),
            ),
        }
    }
}

fn text(status: u16, body: &str) -> HttpMessage {
    HttpMessage::response(status)
        .with_header("Content-Type", "text/plain")
        .with_body(body)
}

fn json_response(status: u16, value: serde_json::Value) -> HttpMessage {
    HttpMessage::response(status)
        .with_header("Content-Type", "application/json")
        .with_body(value.to_string())
}
