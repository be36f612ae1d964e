//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use mcp_hangar::bus::EventBus;
use mcp_hangar::domain::events::DomainEvent;

/// A stdio MCP provider good enough for the supervisor: answers
/// `initialize`, `tools/list`, `ping`, `shutdown` and `tools/call` for the
/// tools `add`, `pid` and `sleep`. Setting `MOCK_FAIL_ADD=1` in its
/// environment makes every `add` call return a synthetic RPC error.
const MOCK_PROVIDER_PY: &str = r#"
import json, os, sys, time

FAIL_ADD = os.environ.get("MOCK_FAIL_ADD") == "1"

def reply(mid, result=None, error=None):
    msg = {"jsonrpc": "2.0", "id": mid}
    if error is not None:
        msg["error"] = error
    else:
        msg["result"] = result
    sys.stdout.write(json.dumps(msg) + "\n")
    sys.stdout.flush()

TOOLS = [
    {"name": "add", "description": "Add two numbers", "inputSchema": {"type": "object"}},
    {"name": "pid", "description": "Return the provider pid", "inputSchema": {"type": "object"}},
    {"name": "sleep", "description": "Sleep then answer", "inputSchema": {"type": "object"}},
]

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    try:
        msg = json.loads(line)
    except ValueError:
        continue
    mid = msg.get("id")
    method = msg.get("method")
    if mid is None:
        continue
    if method == "initialize":
        reply(mid, {"protocolVersion": "2024-11-05", "capabilities": {},
                    "serverInfo": {"name": "mock-provider", "version": "1.0.0"}})
    elif method == "tools/list":
        reply(mid, {"tools": TOOLS})
    elif method == "ping":
        reply(mid, {})
    elif method == "shutdown":
        reply(mid, {})
        break
    elif method == "tools/call":
        params = msg.get("params") or {}
        name = params.get("name")
        args = params.get("arguments") or {}
        if name == "add":
            if FAIL_ADD:
                reply(mid, error={"code": -32000, "message": "synthetic failure"})
            else:
                reply(mid, args.get("a", 0) + args.get("b", 0))
        elif name == "pid":
            reply(mid, os.getpid())
        elif name == "sleep":
            time.sleep(float(args.get("seconds", 1)))
            reply(mid, "done")
        else:
            reply(mid, error={"code": -32601, "message": "unknown tool"})
    else:
        reply(mid, error={"code": -32601, "message": "method not found"})
"#;

/// Write the mock provider script to a temp file; keep the handle alive
/// for the lifetime of the test.
pub fn write_mock_provider() -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .prefix("mock-provider-")
        .suffix(".py")
        .tempfile()
        .expect("create mock provider script");
    file.write_all(MOCK_PROVIDER_PY.as_bytes())
        .expect("write mock provider script");
    file.flush().expect("flush mock provider script");
    file
}

/// Subscribe a firehose collector; returns the shared event log
pub fn attach_collector(event_bus: &EventBus) -> Arc<Mutex<Vec<DomainEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    event_bus.subscribe_all(Arc::new(move |event| {
        sink.lock().push(event.clone());
        Ok(())
    }));
    events
}

/// Event type tags in arrival order, for ordering assertions
pub fn event_tags(events: &[DomainEvent]) -> Vec<String> {
    events
        .iter()
        .map(|e| {
            serde_json::to_value(e).unwrap()["event_type"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect()
}
