//! Plain HTTP status endpoints.
//!
//! Only the request head is parsed; bodies are never read. Every response
//! closes the connection.

use std::path::Path;

use ledsand_engine::Engine;
use serde_json::json;

use crate::listing::list_examples;
use crate::ServerMetrics;

/// Largest request head accepted before the connection is dropped.
pub const MAX_HEAD_LEN: usize = 8 * 1024;

/// Parsed request line plus the one header the reactor cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    /// `Upgrade: websocket` was present.
    pub upgrade: bool,
}

/// Length of the request head including the blank line, if complete.
pub fn head_len(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Parse a complete request head.
pub fn parse_head(head: &[u8]) -> Option<Request> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.split("\r\n");
    let mut parts = lines.next()?.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }

    let upgrade = lines.any(|line| {
        let Some((name, value)) = line.split_once(':') else {
            return false;
        };
        name.trim().eq_ignore_ascii_case("upgrade") && value.trim().eq_ignore_ascii_case("websocket")
    });
    Some(Request { method, path, upgrade })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl Response {
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into().into_bytes(),
        }
    }

    pub fn json(value: &serde_json::Value) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body: value.to_string().into_bytes(),
        }
    }

    pub fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            431 => "Request Header Fields Too Large",
            503 => "Service Unavailable",
            _ => "Internal Server Error",
        }
    }

    /// Serialize as an HTTP/1.1 response with `Connection: close`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status,
            self.reason(),
            self.content_type,
            self.body.len()
        )
        .into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

/// Read-only state the endpoints report on.
pub struct StatusContext<'a> {
    pub engine: &'a Engine,
    pub examples_dir: &'a Path,
    pub connections: usize,
    pub metrics: &'a ServerMetrics,
}

/// Dispatch one request under the mount path.
pub fn route(method: &str, path: &str, mount: &str, ctx: &StatusContext<'_>) -> Response {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let Some(leaf) = strip_mount(path, mount) else {
        return Response::text(404, "Not Found");
    };

    let known = matches!(leaf, "code" | "examples" | "status");
    if known && method != "GET" {
        return Response::text(405, "Method Not Allowed");
    }

    match leaf {
        "code" => Response::text(200, ctx.engine.current_source().unwrap_or_default()),
        "examples" => match list_examples(ctx.examples_dir) {
            Ok(names) => Response::text(200, names.join("\n")),
            Err(e) => {
                log::warn!("Cannot list examples in {}: {}", ctx.examples_dir.display(), e);
                Response::text(404, "examples directory not found")
            }
        },
        "status" => Response::json(&status_json(ctx)),
        _ => Response::text(404, "Not Found"),
    }
}

fn strip_mount<'p>(path: &'p str, mount: &str) -> Option<&'p str> {
    let base = mount.trim_end_matches('/');
    let rest = path.strip_prefix(base)?;
    rest.strip_prefix('/')
}

fn status_json(ctx: &StatusContext<'_>) -> serde_json::Value {
    let source_len = ctx.engine.current_source().map(|s| s.len());
    let engine = ctx.engine.metrics().snapshot();
    let server = ctx.metrics;
    json!({
        "running": source_len.is_some(),
        "source_len": source_len.unwrap_or(0),
        "connections": ctx.connections,
        "engine": {
            "compiles": engine.compiles,
            "uploads_accepted": engine.uploads_accepted,
            "uploads_rejected": engine.uploads_rejected,
            "periodic_runs": engine.periodic_runs,
            "periodic_failures": engine.periodic_failures,
            "frames_written": engine.frames_written,
            "sink_errors": engine.sink_errors,
            "resets_adopted": engine.resets_adopted,
        },
        "server": {
            "connections_accepted": ServerMetrics::get(&server.connections_accepted),
            "connections_refused": ServerMetrics::get(&server.connections_refused),
            "oversize_closed": ServerMetrics::get(&server.oversize_closed),
            "notifications_dropped": ServerMetrics::get(&server.notifications_dropped),
            "http_requests": ServerMetrics::get(&server.http_requests),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledsand_engine::{DiscardSink, Sandbox, SandboxConfig};
    use std::fs;

    fn engine() -> Engine {
        let sandbox = Sandbox::new(SandboxConfig { pixel_count: 1, ..Default::default() }).unwrap();
        Engine::new(sandbox, Box::new(DiscardSink))
    }

    fn body(response: &Response) -> &str {
        std::str::from_utf8(&response.body).unwrap()
    }

    #[test]
    fn test_parse_head_detects_upgrade() {
        let head = b"GET /ws HTTP/1.1\r\nHost: x\r\nUPGRADE:  WebSocket \r\nConnection: Upgrade\r\n\r\n";
        assert_eq!(head_len(head), Some(head.len()));
        let req = parse_head(head).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/ws");
        assert!(req.upgrade);

        let req = parse_head(b"POST /code HTTP/1.0\r\n\r\n").unwrap();
        assert!(!req.upgrade);
        assert!(parse_head(b"garbage\r\n\r\n").is_none());
        assert_eq!(head_len(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn test_code_endpoint_reports_current_source() {
        let engine = engine();
        let dir = tempfile::tempdir().unwrap();
        let metrics = ServerMetrics::new();
        let ctx = StatusContext { engine: &engine, examples_dir: dir.path(), connections: 0, metrics: &metrics };

        let idle = route("GET", "/leds/code", "/leds", &ctx);
        assert_eq!(idle.status, 200);
        assert!(idle.body.is_empty());

        let source = "return {1, 2, 3}, 100";
        engine.submit(source).unwrap();
        let response = route("GET", "/leds/code?x=1", "/leds/", &ctx);
        assert_eq!(body(&response), source);
    }

    #[test]
    fn test_examples_and_status_endpoints() {
        let engine = engine();
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.lua"), "").unwrap();
        fs::write(dir.path().join("a.lua"), "").unwrap();
        let metrics = ServerMetrics::new();
        ServerMetrics::bump(&metrics.connections_refused, 2);
        let ctx = StatusContext { engine: &engine, examples_dir: dir.path(), connections: 3, metrics: &metrics };

        assert_eq!(body(&route("GET", "/examples", "/", &ctx)), "a.lua\nb.lua");

        let status = route("GET", "/status", "/", &ctx);
        assert_eq!(status.content_type, "application/json");
        let value: serde_json::Value = serde_json::from_slice(&status.body).unwrap();
        assert_eq!(value["running"], false);
        assert_eq!(value["connections"], 3);
        assert_eq!(value["server"]["connections_refused"], 2);
    }

    #[test]
    fn test_unknown_paths_and_methods() {
        let engine = engine();
        let dir = tempfile::tempdir().unwrap();
        let metrics = ServerMetrics::new();
        let ctx = StatusContext { engine: &engine, examples_dir: dir.path(), connections: 0, metrics: &metrics };

        assert_eq!(route("GET", "/nope", "/", &ctx).status, 404);
        assert_eq!(route("GET", "/code", "/leds", &ctx).status, 404);
        assert_eq!(route("POST", "/code", "/", &ctx).status, 405);

        let missing = dir.path().join("missing");
        let ctx = StatusContext { examples_dir: &missing, ..ctx };
        assert_eq!(route("GET", "/examples", "/", &ctx).status, 404);
    }

    #[test]
    fn test_response_serialization() {
        let bytes = Response::text(404, "Not Found").to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Length: 9\r\n"));
        assert!(text.ends_with("\r\n\r\nNot Found"));
    }
}
