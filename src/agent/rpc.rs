//! Newline-delimited JSON-RPC channel to the agent process
//!
//! One background reader task owns the agent's output stream. Every line is
//! classified as a response, a notification or an incoming call:
//!
//! ```text
//! agent stdout ──► reader task ──┬─► pending[id] (oneshot) ──► call() caller
//!                                ├─► notifications queue (bounded, drop on full)
//!                                └─► incoming calls queue (bounded, drop on full)
//! call()/notify()/respond() ──► write lock ──► agent stdin
//! ```
//!
//! When the agent exits (output EOF, read error or the supervisor's exit
//! token), every pending call fails with [`Error::ProcessTerminated`] and both
//! queues close. A terminated channel is never revived.

use crate::agent::types::*;
use crate::config::ProtocolConfig;
use crate::error::{Error, Result};
use bytes::BytesMut;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type ResultSlot = oneshot::Sender<Result<Value>>;

/// Channel tuning
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub notification_capacity: usize,
    pub incoming_capacity: usize,
    /// Deadline applied by [`RpcChannel::call`]
    pub default_timeout: Option<Duration>,
    pub max_line_bytes: usize,
    /// First id handed out by the call counter
    pub first_id: u64,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::from(&ProtocolConfig::default())
    }
}

impl From<&ProtocolConfig> for ChannelOptions {
    fn from(config: &ProtocolConfig) -> Self {
        Self {
            notification_capacity: config.notification_capacity,
            incoming_capacity: config.incoming_capacity,
            default_timeout: config.call_timeout(),
            max_line_bytes: config.max_line_bytes,
            first_id: 1,
        }
    }
}

/// Pending-call table plus the terminated flag, guarded together so a call
/// can never register after the table has been drained.
#[derive(Default)]
struct PendingTable {
    calls: HashMap<u64, ResultSlot>,
    terminated: bool,
}

/// Bidirectional JSON-RPC channel over the agent's stdio
pub struct RpcChannel {
    writer: Mutex<Option<BufWriter<BoxedWriter>>>,
    pending: Arc<Mutex<PendingTable>>,
    next_id: AtomicU64,
    default_timeout: Option<Duration>,
    notifications: std::sync::Mutex<Option<mpsc::Receiver<Notification>>>,
    incoming_calls: std::sync::Mutex<Option<mpsc::Receiver<IncomingCall>>>,
    closed: CancellationToken,
}

impl RpcChannel {
    /// Start the channel over an agent's output (`reader`) and input (`writer`).
    ///
    /// `exited` is cancelled by the process supervisor when the agent exits;
    /// it terminates the channel even if the output pipe stays open.
    pub fn start<R, W>(
        reader: R,
        writer: W,
        options: ChannelOptions,
        exited: CancellationToken,
    ) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (notification_tx, notification_rx) = mpsc::channel(options.notification_capacity);
        let (incoming_tx, incoming_rx) = mpsc::channel(options.incoming_capacity);
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let closed = CancellationToken::new();

        let channel = Arc::new(Self {
            writer: Mutex::new(Some(BufWriter::new(Box::new(writer) as BoxedWriter))),
            pending: pending.clone(),
            next_id: AtomicU64::new(options.first_id),
            default_timeout: options.default_timeout,
            notifications: std::sync::Mutex::new(Some(notification_rx)),
            incoming_calls: std::sync::Mutex::new(Some(incoming_rx)),
            closed: closed.clone(),
        });

        let lines = FramedRead::new(reader, AgentLines::new(options.max_line_bytes));
        tokio::spawn(reader_loop(
            lines,
            pending,
            notification_tx,
            incoming_tx,
            exited,
            closed,
        ));

        channel
    }

    /// Issue a call with the default deadline
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.call_with_timeout(method, params, self.default_timeout)
            .await
    }

    /// Issue a call and wait for its response, process death, or `timeout`.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.terminated {
                return Err(Error::ProcessTerminated);
            }
            pending.calls.insert(id, tx);
        }

        let line = serde_json::to_string(&OutgoingCall {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params: &params,
        })?;
        tracing::debug!(id, method, "Sending call to agent");

        if let Err(e) = self.write_line(&line).await {
            self.pending.lock().await.calls.remove(&id);
            return Err(e);
        }

        let outcome = match timeout {
            Some(after) => match tokio::time::timeout(after, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.lock().await.calls.remove(&id);
                    tracing::warn!(id, method, ?after, "Call timed out");
                    return Err(Error::Timeout {
                        method: method.to_string(),
                        after,
                    });
                }
            },
            None => rx.await,
        };

        // Slot dropped without a value: the table was drained.
        outcome.unwrap_or(Err(Error::ProcessTerminated))
    }

    /// Send a one-way notification to the agent
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let line = serde_json::to_string(&OutgoingNotification {
            jsonrpc: JSONRPC_VERSION,
            method,
            params: &params,
        })?;
        self.write_line(&line).await
    }

    /// Answer an incoming call with a result
    pub async fn respond(&self, id: u64, result: Value) -> Result<()> {
        let line = serde_json::to_string(&OutgoingResponse {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(&result),
            error: None,
        })?;
        self.write_line(&line).await
    }

    /// Answer an incoming call with an error object
    pub async fn respond_error(&self, id: u64, code: i64, message: &str) -> Result<()> {
        let error = RpcErrorObject {
            code,
            message: message.to_string(),
            data: None,
        };
        let line = serde_json::to_string(&OutgoingResponse {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(&error),
        })?;
        self.write_line(&line).await
    }

    /// Take the notification stream. Only the first caller gets it.
    pub fn notifications(&self) -> Option<ReceiverStream<Notification>> {
        take_receiver(&self.notifications).map(ReceiverStream::new)
    }

    /// Take the incoming-call stream. Only the first caller gets it.
    pub fn incoming_calls(&self) -> Option<ReceiverStream<IncomingCall>> {
        take_receiver(&self.incoming_calls).map(ReceiverStream::new)
    }

    /// Shut down the agent's input stream. Subsequent writes fail.
    pub async fn close_input(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("Closing agent input failed: {}", e);
            }
        }
    }

    /// True once the agent side is gone
    pub async fn is_terminated(&self) -> bool {
        self.pending.lock().await.terminated
    }

    /// Resolves once the reader task has stopped and pending calls have failed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Number of calls awaiting a response
    pub async fn pending_calls(&self) -> usize {
        self.pending.lock().await.calls.len()
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::ProcessTerminated)?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }
}

/// One frame of agent output
enum Frame {
    Line(String),
    /// A line over the length cap; its bytes are being skipped
    Oversized,
    /// A complete line that is not valid UTF-8; already consumed
    Malformed,
}

/// `LinesCodec` that reports over-long and non-UTF-8 lines as frames, not
/// stream errors
struct AgentLines(LinesCodec);

impl AgentLines {
    fn new(max_line_bytes: usize) -> Self {
        Self(LinesCodec::new_with_max_length(max_line_bytes))
    }
}

impl Decoder for AgentLines {
    type Item = Frame;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<Frame>, Self::Error> {
        to_frame(self.0.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<Frame>, Self::Error> {
        to_frame(self.0.decode_eof(buf))
    }
}

fn to_frame(
    decoded: std::result::Result<Option<String>, LinesCodecError>,
) -> std::result::Result<Option<Frame>, LinesCodecError> {
    match decoded {
        Ok(line) => Ok(line.map(Frame::Line)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::Oversized)),
        // The codec splits the line off the buffer before checking UTF-8.
        Err(LinesCodecError::Io(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
            Ok(Some(Frame::Malformed))
        }
        Err(e) => Err(e),
    }
}

fn take_receiver<T>(slot: &std::sync::Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

/// Classify one line by field presence.
///
/// Priority: incoming call (id present, non-empty method), then response (id
/// present, no method), then notification (method present, no id).
pub fn classify_line(line: &str) -> Result<IncomingMessage> {
    let raw: RawMessage = serde_json::from_str(line)
        .map_err(|e| Error::ProtocolDecode(format!("invalid JSON object: {}", e)))?;

    let has_method = raw.method.as_deref().is_some_and(|m| !m.is_empty());

    match (raw.id, raw.method) {
        (Some(id), Some(method)) if has_method => Ok(IncomingMessage::IncomingCall(IncomingCall {
            id,
            method,
            params: raw.params.unwrap_or(Value::Null),
        })),
        (Some(id), None) => {
            let outcome = match raw.error {
                Some(error) => Err(error),
                None => Ok(raw.result.unwrap_or(Value::Null)),
            };
            Ok(IncomingMessage::Response(Response { id, outcome }))
        }
        (None, Some(method)) if has_method => Ok(IncomingMessage::Notification(Notification {
            method,
            params: raw.params.unwrap_or(Value::Null),
        })),
        _ => Err(Error::ProtocolDecode(
            "message matches no known shape".to_string(),
        )),
    }
}

async fn reader_loop<R>(
    mut lines: FramedRead<R, AgentLines>,
    pending: Arc<Mutex<PendingTable>>,
    notification_tx: mpsc::Sender<Notification>,
    incoming_tx: mpsc::Sender<IncomingCall>,
    exited: CancellationToken,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            next = lines.next() => next,
            _ = exited.cancelled() => {
                tracing::info!("Agent process exited, closing protocol channel");
                break;
            }
        };

        let line = match next {
            Some(Ok(Frame::Line(line))) => line,
            Some(Ok(Frame::Oversized)) => {
                tracing::warn!("Discarding over-long line from agent");
                continue;
            }
            Some(Ok(Frame::Malformed)) => {
                tracing::warn!("Discarding non-UTF-8 line from agent");
                continue;
            }
            Some(Err(e)) => {
                tracing::warn!("Agent output read error: {}", e);
                break;
            }
            None => {
                tracing::info!("Agent output closed");
                break;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match classify_line(trimmed) {
            Ok(IncomingMessage::Response(response)) => {
                let slot = pending.lock().await.calls.remove(&response.id);
                match slot {
                    Some(tx) => {
                        let result = response.outcome.map_err(|e| Error::Rpc {
                            code: e.code,
                            message: e.message,
                            data: e.data,
                        });
                        let _ = tx.send(result);
                    }
                    None => {
                        tracing::debug!(id = response.id, "Discarding response with no pending call");
                    }
                }
            }
            Ok(IncomingMessage::Notification(notification)) => {
                let method = notification.method.clone();
                if let Err(e) = notification_tx.try_send(notification) {
                    tracing::warn!(method = %method, "Dropping notification: {}", e);
                }
            }
            Ok(IncomingMessage::IncomingCall(call)) => {
                let (id, method) = (call.id, call.method.clone());
                if let Err(e) = incoming_tx.try_send(call) {
                    tracing::warn!(id, method = %method, "Dropping incoming call: {}", e);
                }
            }
            Err(e) => {
                let preview: String = trimmed.chars().take(200).collect();
                tracing::warn!("{} (raw: {})", e, preview);
            }
        }
    }

    let drained: Vec<ResultSlot> = {
        let mut table = pending.lock().await;
        table.terminated = true;
        table.calls.drain().map(|(_, tx)| tx).collect()
    };
    if !drained.is_empty() {
        tracing::warn!(count = drained.len(), "Failing pending calls: agent terminated");
    }
    for tx in drained {
        let _ = tx.send(Err(Error::ProcessTerminated));
    }

    // Dropping the senders closes both queues.
    drop(notification_tx);
    drop(incoming_tx);
    closed.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    /// Agent side of an in-memory channel
    struct FakeAgent {
        lines: tokio::io::Lines<BufReader<DuplexStream>>,
        out: DuplexStream,
    }

    impl FakeAgent {
        async fn read_json(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, line: &str) {
            self.out.write_all(line.as_bytes()).await.unwrap();
            self.out.write_all(b"\n").await.unwrap();
            self.out.flush().await.unwrap();
        }
    }

    fn start_with(options: ChannelOptions) -> (Arc<RpcChannel>, FakeAgent, CancellationToken) {
        let (agent_out, bridge_in) = tokio::io::duplex(64 * 1024);
        let (bridge_out, agent_in) = tokio::io::duplex(64 * 1024);
        let exited = CancellationToken::new();
        let channel = RpcChannel::start(bridge_in, bridge_out, options, exited.clone());
        let agent = FakeAgent {
            lines: BufReader::new(agent_in).lines(),
            out: agent_out,
        };
        (channel, agent, exited)
    }

    fn start() -> (Arc<RpcChannel>, FakeAgent, CancellationToken) {
        start_with(ChannelOptions::default())
    }

    #[test]
    fn test_classify_incoming_call_with_id_zero() {
        let msg = classify_line(r#"{"jsonrpc":"2.0","id":0,"method":"session/request_permission","params":{}}"#)
            .unwrap();
        match msg {
            IncomingMessage::IncomingCall(call) => {
                assert_eq!(call.id, 0);
                assert_eq!(call.method, "session/request_permission");
            }
            other => panic!("expected incoming call, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_response_with_id_zero() {
        let msg = classify_line(r#"{"jsonrpc":"2.0","id":0,"result":{"ok":true}}"#).unwrap();
        assert_eq!(
            msg,
            IncomingMessage::Response(Response {
                id: 0,
                outcome: Ok(serde_json::json!({"ok": true}))
            })
        );
    }

    #[test]
    fn test_classify_error_response() {
        let msg =
            classify_line(r#"{"id":3,"error":{"code":-32602,"message":"bad params"}}"#).unwrap();
        match msg {
            IncomingMessage::Response(Response { id: 3, outcome: Err(e) }) => {
                assert_eq!(e.code, -32602);
                assert_eq!(e.message, "bad params");
            }
            other => panic!("expected error response, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_null_result_is_response() {
        let msg = classify_line(r#"{"id":4,"result":null}"#).unwrap();
        assert_eq!(
            msg,
            IncomingMessage::Response(Response {
                id: 4,
                outcome: Ok(Value::Null)
            })
        );
    }

    #[test]
    fn test_classify_notification() {
        let msg = classify_line(r#"{"jsonrpc":"2.0","method":"session/update","params":{"a":1}}"#)
            .unwrap();
        assert_eq!(
            msg,
            IncomingMessage::Notification(Notification {
                method: "session/update".to_string(),
                params: serde_json::json!({"a": 1})
            })
        );
    }

    #[test]
    fn test_classify_malformed() {
        assert!(matches!(
            classify_line(r#"{"jsonrpc":"2.0","method":"session/upd"#),
            Err(Error::ProtocolDecode(_))
        ));
        assert!(matches!(
            classify_line(r#"{"jsonrpc":"2.0"}"#),
            Err(Error::ProtocolDecode(_))
        ));
        assert!(matches!(
            classify_line(r#"{"method":""}"#),
            Err(Error::ProtocolDecode(_))
        ));
        assert!(matches!(classify_line("[1,2]"), Err(Error::ProtocolDecode(_))));
    }

    #[tokio::test]
    async fn test_call_resolves_with_matching_response() {
        let (channel, mut agent, _exited) = start();

        let caller = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.call("initialize", serde_json::json!({})).await })
        };

        let request = agent.read_json().await;
        assert_eq!(request["jsonrpc"], "2.0");
        assert_eq!(request["method"], "initialize");
        let id = request["id"].as_u64().unwrap();
        assert!(id >= 1);

        agent
            .send(&format!(r#"{{"jsonrpc":"2.0","id":{},"result":{{"protocolVersion":1}}}}"#, id))
            .await;

        let result = caller.await.unwrap().unwrap();
        assert_eq!(result["protocolVersion"], 1);
        assert_eq!(channel.pending_calls().await, 0);
    }

    #[tokio::test]
    async fn test_call_with_id_zero_resolves() {
        let options = ChannelOptions {
            first_id: 0,
            ..ChannelOptions::default()
        };
        let (channel, mut agent, _exited) = start_with(options);

        let caller = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.call("session/new", serde_json::json!({})).await })
        };

        let request = agent.read_json().await;
        assert_eq!(request["id"], 0);
        agent
            .send(r#"{"jsonrpc":"2.0","id":0,"result":{"sessionId":"zero"}}"#)
            .await;

        let result = tokio::time::timeout(Duration::from_secs(5), caller)
            .await
            .expect("id zero call must not hang")
            .unwrap()
            .unwrap();
        assert_eq!(result["sessionId"], "zero");
    }

    #[tokio::test]
    async fn test_rpc_error_surfaces_to_caller() {
        let (channel, mut agent, _exited) = start();
        let caller = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.call("session/prompt", Value::Null).await })
        };
        let id = agent.read_json().await["id"].as_u64().unwrap();
        agent
            .send(&format!(
                r#"{{"id":{},"error":{{"code":-32000,"message":"auth required"}}}}"#,
                id
            ))
            .await;

        match caller.await.unwrap() {
            Err(Error::Rpc { code, message, .. }) => {
                assert_eq!(code, -32000);
                assert_eq!(message, "auth required");
            }
            other => panic!("expected rpc error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_out_of_order_responses_correlate_by_id() {
        let (channel, mut agent, _exited) = start();

        let mut callers = Vec::new();
        for n in 0..5u64 {
            let channel = channel.clone();
            callers.push(tokio::spawn(async move {
                channel
                    .call("echo", serde_json::json!({ "n": n }))
                    .await
                    .map(|v| (n, v))
            }));
        }

        let mut requests = Vec::new();
        for _ in 0..5 {
            requests.push(agent.read_json().await);
        }
        for request in requests.iter().rev() {
            let id = request["id"].as_u64().unwrap();
            let n = request["params"]["n"].as_u64().unwrap();
            agent
                .send(&format!(r#"{{"id":{},"result":{{"echo":{}}}}}"#, id, n))
                .await;
        }

        for caller in callers {
            let (n, value) = caller.await.unwrap().unwrap();
            assert_eq!(value["echo"].as_u64(), Some(n));
        }
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_and_ignores_late_response() {
        let (channel, mut agent, _exited) = start();

        let err = {
            let channel = channel.clone();
            let call = tokio::spawn(async move {
                channel
                    .call_with_timeout("slow", Value::Null, Some(Duration::from_millis(50)))
                    .await
            });
            let _ = agent.read_json().await;
            call.await.unwrap().unwrap_err()
        };
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(channel.pending_calls().await, 0);

        // Late response is discarded; the channel keeps working.
        agent.send(r#"{"id":1,"result":"late"}"#).await;
        let caller = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.call("next", Value::Null).await })
        };
        let id = agent.read_json().await["id"].as_u64().unwrap();
        assert_eq!(id, 2);
        agent.send(r#"{"id":2,"result":"fresh"}"#).await;
        assert_eq!(caller.await.unwrap().unwrap(), Value::String("fresh".to_string()));
    }

    #[tokio::test]
    async fn test_notifications_and_incoming_calls_use_separate_queues() {
        let (channel, mut agent, _exited) = start();
        let mut notifications = channel.notifications().unwrap();
        let mut calls = channel.incoming_calls().unwrap();
        assert!(channel.notifications().is_none());

        agent
            .send(r#"{"jsonrpc":"2.0","method":"session/update","params":{"n":1}}"#)
            .await;
        agent
            .send(r#"{"jsonrpc":"2.0","id":0,"method":"session/request_permission","params":{}}"#)
            .await;
        agent
            .send(r#"{"jsonrpc":"2.0","method":"session/update","params":{"n":2}}"#)
            .await;

        let call = calls.next().await.unwrap();
        assert_eq!(call.id, 0);
        assert_eq!(call.method, "session/request_permission");

        let first = notifications.next().await.unwrap();
        let second = notifications.next().await.unwrap();
        assert_eq!(first.params["n"], 1);
        assert_eq!(second.params["n"], 2);

        agent.out.shutdown().await.unwrap();
        drop(agent);
        assert!(notifications.next().await.is_none());
        assert!(calls.next().await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_stop_reader() {
        let (channel, mut agent, _exited) = start();
        let mut notifications = channel.notifications().unwrap();

        agent.send(r#"{"method":"session/update","params":{"n":1}}"#).await;
        agent.send(r#"{"method":"session/update","par"#).await;
        agent.send(r#"{"method":"session/update","params":{"n":2}}"#).await;

        assert_eq!(notifications.next().await.unwrap().params["n"], 1);
        assert_eq!(notifications.next().await.unwrap().params["n"], 2);
    }

    #[tokio::test]
    async fn test_non_utf8_line_does_not_stop_reader() {
        let (channel, mut agent, _exited) = start();
        let mut notifications = channel.notifications().unwrap();

        agent.send(r#"{"method":"session/update","params":{"n":1}}"#).await;
        agent.out.write_all(b"\xff\xfe garbage\n").await.unwrap();
        agent.out.flush().await.unwrap();
        agent.send(r#"{"method":"session/update","params":{"n":2}}"#).await;

        assert_eq!(notifications.next().await.unwrap().params["n"], 1);
        let second = tokio::time::timeout(Duration::from_secs(5), notifications.next())
            .await
            .expect("reader stalled after a non-UTF-8 line")
            .expect("notification stream closed");
        assert_eq!(second.params["n"], 2);
        assert!(!channel.is_terminated().await);
    }

    #[tokio::test]
    async fn test_over_long_line_is_skipped() {
        let options = ChannelOptions {
            max_line_bytes: 64,
            ..ChannelOptions::default()
        };
        let (channel, mut agent, _exited) = start_with(options);
        let mut notifications = channel.notifications().unwrap();

        let huge = format!(
            r#"{{"method":"session/update","params":{{"blob":"{}"}}}}"#,
            "x".repeat(500)
        );
        agent.send(&huge).await;
        agent.send(r#"{"method":"session/update","params":{"n":7}}"#).await;

        assert_eq!(notifications.next().await.unwrap().params["n"], 7);
        assert!(!channel.is_terminated().await);
    }

    #[tokio::test]
    async fn test_full_notification_queue_drops_instead_of_blocking() {
        let options = ChannelOptions {
            notification_capacity: 1,
            ..ChannelOptions::default()
        };
        let (channel, mut agent, _exited) = start_with(options);
        let mut notifications = channel.notifications().unwrap();

        for n in 0..3 {
            agent
                .send(&format!(r#"{{"method":"session/update","params":{{"n":{}}}}}"#, n))
                .await;
        }

        // The reader is still responsive to responses even though the queue is full.
        let caller = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.call("ping", Value::Null).await })
        };
        let id = agent.read_json().await["id"].as_u64().unwrap();
        agent.send(&format!(r#"{{"id":{},"result":"pong"}}"#, id)).await;
        assert_eq!(caller.await.unwrap().unwrap(), "pong");

        assert_eq!(notifications.next().await.unwrap().params["n"], 0);
    }

    #[tokio::test]
    async fn test_respond_and_notify_wire_format() {
        let (channel, mut agent, _exited) = start();

        channel
            .respond(0, serde_json::json!({"outcome": {"outcome": "cancelled"}}))
            .await
            .unwrap();
        let line = agent.read_json().await;
        assert_eq!(line["id"], 0);
        assert_eq!(line["result"]["outcome"]["outcome"], "cancelled");
        assert!(line.get("error").is_none());

        channel
            .respond_error(7, METHOD_NOT_FOUND, "Method not found")
            .await
            .unwrap();
        let line = agent.read_json().await;
        assert_eq!(line["id"], 7);
        assert_eq!(line["error"]["code"], METHOD_NOT_FOUND);
        assert!(line.get("result").is_none());

        channel
            .notify("session/cancel", serde_json::json!({"sessionId": "s1"}))
            .await
            .unwrap();
        let line = agent.read_json().await;
        assert!(line.get("id").is_none());
        assert_eq!(line["method"], "session/cancel");
    }

    #[tokio::test]
    async fn test_exit_token_fails_pending_calls() {
        let (channel, mut agent, exited) = start();

        let first = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.call_with_timeout("a", Value::Null, None).await })
        };
        let second = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.call_with_timeout("b", Value::Null, None).await })
        };
        let _ = agent.read_json().await;
        let _ = agent.read_json().await;

        exited.cancel();

        for caller in [first, second] {
            let result = tokio::time::timeout(Duration::from_secs(5), caller)
                .await
                .expect("pending call must fail, not hang")
                .unwrap();
            assert!(matches!(result, Err(Error::ProcessTerminated)));
        }

        channel.closed().await;
        assert!(channel.is_terminated().await);
        assert!(matches!(
            channel.call("late", Value::Null).await,
            Err(Error::ProcessTerminated)
        ));
    }

    #[tokio::test]
    async fn test_close_input_ends_agent_stream() {
        let (channel, mut agent, _exited) = start();
        channel.close_input().await;
        assert!(agent.lines.next_line().await.unwrap().is_none());
        assert!(channel.notify("x", Value::Null).await.is_err());
    }
}
