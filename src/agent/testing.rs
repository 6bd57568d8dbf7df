//! In-memory fake agent for channel, client and arbitrator tests

use crate::agent::rpc::{ChannelOptions, RpcChannel};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Agent side of a duplex pair
pub struct FakeAgent {
    lines: tokio::io::Lines<BufReader<DuplexStream>>,
    out: DuplexStream,
}

impl FakeAgent {
    /// Next JSON line written by the bridge
    pub async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("bridge did not write in time")
            .unwrap()
            .expect("bridge closed its output");
        serde_json::from_str(&line).unwrap()
    }

    /// Next line, `None` once the bridge closes its output
    pub async fn next(&mut self) -> Option<Value> {
        loop {
            let line = self.lines.next_line().await.ok()??;
            if let Ok(value) = serde_json::from_str(&line) {
                return Some(value);
            }
        }
    }

    /// Next line, or `None` if nothing arrives within `wait`
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Value> {
        match tokio::time::timeout(wait, self.lines.next_line()).await {
            Ok(Ok(Some(line))) => Some(serde_json::from_str(&line).unwrap()),
            _ => None,
        }
    }

    pub async fn send(&mut self, message: Value) {
        let mut line = serde_json::to_string(&message).unwrap();
        line.push('\n');
        self.out.write_all(line.as_bytes()).await.unwrap();
        self.out.flush().await.unwrap();
    }

    /// Answer a call read with [`FakeAgent::recv`]
    pub async fn reply(&mut self, call: &Value, result: Value) {
        self.send(serde_json::json!({"jsonrpc": "2.0", "id": call["id"], "result": result}))
            .await;
    }

    pub async fn notify_update(&mut self, session_id: &str, update: Value) {
        self.send(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": {"sessionId": session_id, "update": update}
        }))
        .await;
    }

    /// Simulate the agent exiting
    pub async fn hang_up(mut self) {
        let _ = self.out.shutdown().await;
    }
}

/// Play a minimal well-behaved agent: handshake, numbered sessions, and
/// prompts echoed back as one message chunk before the turn ends.
pub fn spawn_scripted(mut agent: FakeAgent) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sessions = 0;
        while let Some(message) = agent.next().await {
            match message["method"].as_str() {
                Some("initialize") => {
                    agent
                        .reply(&message, serde_json::json!({"protocolVersion": 1}))
                        .await;
                }
                Some("session/new") => {
                    sessions += 1;
                    let session_id = format!("sess-{}", sessions);
                    agent
                        .reply(&message, serde_json::json!({"sessionId": session_id}))
                        .await;
                }
                Some("session/prompt") => {
                    let session_id = message["params"]["sessionId"].as_str().unwrap_or_default().to_string();
                    let text = message["params"]["prompt"][0]["text"].as_str().unwrap_or_default().to_string();
                    agent
                        .notify_update(
                            &session_id,
                            serde_json::json!({
                                "sessionUpdate": "agent_message_chunk",
                                "content": {"type": "text", "text": format!("echo: {}", text)}
                            }),
                        )
                        .await;
                    agent
                        .reply(&message, serde_json::json!({"stopReason": "end_turn"}))
                        .await;
                }
                _ => {}
            }
        }
    })
}

/// Raw streams for a bridge-side consumer plus the fake agent
pub fn pipes() -> (DuplexStream, DuplexStream, FakeAgent) {
    let (agent_out, bridge_in) = tokio::io::duplex(256 * 1024);
    let (bridge_out, agent_in) = tokio::io::duplex(256 * 1024);
    let agent = FakeAgent {
        lines: BufReader::new(agent_in).lines(),
        out: agent_out,
    };
    (bridge_in, bridge_out, agent)
}

/// A started channel connected to a fake agent
pub fn connect() -> (Arc<RpcChannel>, FakeAgent, CancellationToken) {
    let (reader, writer, agent) = pipes();
    let exited = CancellationToken::new();
    let channel = RpcChannel::start(reader, writer, ChannelOptions::default(), exited.clone());
    (channel, agent, exited)
}
