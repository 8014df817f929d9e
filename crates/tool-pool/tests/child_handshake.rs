//! Spawns a tiny python3 stub speaking the newline-delimited JSON-RPC
//! duplex and drives a full initialize/tools-list/tools-call round trip.
//!
//! Requires `python3` on PATH; ignored by default since it depends on an
//! external interpreter rather than anything built in this workspace.

use std::time::Duration;

use tool_pool::{ServerSpec, ToolChild};

const STUB: &str = r#"
import sys, json

def send(obj):
    sys.stdout.write(json.dumps(obj) + "\n")
    sys.stdout.flush()

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    msg = json.loads(line)
    method = msg.get("method")
    if method == "initialize":
        send({"jsonrpc": "2.0", "id": msg["id"], "result": {"protocolVersion": "2024-11-05"}})
        send({"jsonrpc": "2.0", "method": "notifications/initialized"})
    elif method == "tools/list":
        send({"jsonrpc": "2.0", "id": msg["id"], "result": {"tools": [{"name": "echo"}]}})
    elif method == "tools/call":
        args = msg["params"]["arguments"]
        send({"jsonrpc": "2.0", "id": msg["id"], "result": {"echoed": args}})
"#;

#[tokio::test]
#[ignore = "spawns a python3 stub process; run with --ignored"]
async fn handshake_list_and_call_round_trip() {
    let spec = ServerSpec {
        name: "stub".into(),
        command: "python3".into(),
        args: vec!["-c".into(), STUB.into()],
        env: Default::default(),
    };

    let child = ToolChild::spawn(&spec, Duration::from_secs(5))
        .await
        .expect("handshake should succeed");

    let tools = child.tools(Duration::from_secs(5)).await.expect("tools/list");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");

    let result = child
        .call_tool("echo", serde_json::json!({"x": 1}), serde_json::json!({}), Duration::from_secs(5))
        .await
        .expect("tools/call");
    assert_eq!(result["echoed"]["x"], 1);

    child.shutdown().await;
}
