//! Agent session client
//!
//! Domain API over the protocol channel: handshake, session creation and
//! prompt submission. Session updates streamed by the agent are decoded into
//! [`DomainEvent`]s and published to the conversation bound to the session.
//!
//! A turn's closing event (`turn_complete` or `error`) is published by the
//! notification dispatch task, after every update the reader queued before
//! the prompt response arrived.

use crate::agent::hub::BroadcastHub;
use crate::agent::rpc::RpcChannel;
use crate::agent::types::*;
use crate::error::{Error, Result};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Agent session id → conversation id
#[derive(Debug, Clone, Default)]
pub struct SessionMap {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn bind(&self, session_id: &str, conversation_id: &str) {
        self.inner
            .write()
            .await
            .insert(session_id.to_string(), conversation_id.to_string());
    }

    pub async fn conversation_for(&self, session_id: &str) -> Option<String> {
        self.inner.read().await.get(session_id).cloned()
    }

    pub async fn unbind(&self, session_id: &str) -> Option<String> {
        self.inner.write().await.remove(session_id)
    }

    /// Remove every binding, returning `(session_id, conversation_id)` pairs
    pub async fn drain(&self) -> Vec<(String, String)> {
        self.inner.write().await.drain().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Client for one agent connection
pub struct AgentClient {
    channel: Arc<RpcChannel>,
    sessions: SessionMap,
    hub: Arc<BroadcastHub>,
    prompt_timeout: Option<Duration>,
    handshake: RwLock<Option<HandshakeResult>>,
    /// Turn endings, published in order with session updates
    completions: mpsc::Sender<DomainEvent>,
    completions_rx: std::sync::Mutex<Option<mpsc::Receiver<DomainEvent>>>,
}

const COMPLETION_QUEUE: usize = 64;

impl AgentClient {
    pub fn new(
        channel: Arc<RpcChannel>,
        sessions: SessionMap,
        hub: Arc<BroadcastHub>,
        prompt_timeout: Option<Duration>,
    ) -> Self {
        let (completions, completions_rx) = mpsc::channel(COMPLETION_QUEUE);
        Self {
            channel,
            sessions,
            hub,
            prompt_timeout,
            handshake: RwLock::new(None),
            completions,
            completions_rx: std::sync::Mutex::new(Some(completions_rx)),
        }
    }

    pub fn sessions(&self) -> &SessionMap {
        &self.sessions
    }

    /// Perform the `initialize` handshake. May be repeated; the latest result
    /// is kept.
    pub async fn initialize(&self) -> Result<HandshakeResult> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientCapabilities": {
                "fs": { "readTextFile": false, "writeTextFile": false },
                "terminal": false,
            },
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let value = self.channel.call(methods::INITIALIZE, params).await?;
        let result: HandshakeResult = serde_json::from_value(value)?;
        tracing::info!(
            protocol_version = %result.protocol_version,
            auth_methods = result.auth_methods.len(),
            "Agent handshake complete"
        );
        *self.handshake.write().await = Some(result.clone());
        Ok(result)
    }

    /// Last handshake result, if [`AgentClient::initialize`] succeeded
    pub async fn handshake(&self) -> Option<HandshakeResult> {
        self.handshake.read().await.clone()
    }

    /// Create an agent session bound to `conversation_id`.
    ///
    /// `cwd` must already be absolute.
    pub async fn new_session(
        &self,
        conversation_id: &str,
        cwd: &Path,
        mcp_servers: Vec<Value>,
    ) -> Result<String> {
        if !cwd.is_absolute() {
            return Err(Error::Session(format!(
                "working directory must be absolute: {}",
                cwd.display()
            )));
        }

        let params = serde_json::json!({
            "cwd": cwd.to_string_lossy(),
            "mcpServers": mcp_servers,
        });
        let value = self.channel.call(methods::SESSION_NEW, params).await?;
        let result: NewSessionResult = serde_json::from_value(value)?;

        self.sessions.bind(&result.session_id, conversation_id).await;
        tracing::info!(
            session_id = %result.session_id,
            conversation_id,
            cwd = %cwd.display(),
            "Agent session created"
        );
        Ok(result.session_id)
    }

    /// Submit a prompt without waiting for the turn to finish.
    ///
    /// The turn's output arrives as session updates; completion or failure is
    /// published as `turn_complete` or `error` once the preceding updates have
    /// been published. The handle resolves when the turn has ended.
    pub async fn prompt(self: &Arc<Self>, session_id: &str, text: &str) -> Result<JoinHandle<()>> {
        let conversation_id = self
            .sessions
            .conversation_for(session_id)
            .await
            .ok_or_else(|| Error::Session(format!("unknown session: {}", session_id)))?;

        let params = serde_json::json!({
            "sessionId": session_id,
            "prompt": [{ "type": "text", "text": text }],
        });

        tracing::debug!(session_id, conversation_id = %conversation_id, "Submitting prompt");

        let client = Arc::clone(self);
        let session_id = session_id.to_string();
        Ok(tokio::spawn(async move {
            let outcome = client
                .channel
                .call_with_timeout(methods::SESSION_PROMPT, params, client.prompt_timeout)
                .await
                .and_then(|v| match v {
                    Value::Null => Ok(PromptResult::default()),
                    v => Ok(serde_json::from_value::<PromptResult>(v)?),
                });

            let event = match outcome {
                Ok(result) => {
                    let stop_reason = result.stop_reason.unwrap_or_else(|| "end_turn".to_string());
                    tracing::info!(
                        session_id = %session_id,
                        stop_reason = %stop_reason,
                        "Prompt turn complete"
                    );
                    DomainEvent::TurnComplete {
                        conversation_id,
                        stop_reason,
                    }
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, "Prompt failed: {}", e);
                    DomainEvent::from_error(&conversation_id, &e)
                }
            };
            client.finish_turn(event).await;
        }))
    }

    /// Queue a turn's closing event behind the updates already received
    async fn finish_turn(&self, event: DomainEvent) {
        if let Err(mpsc::error::SendError(event)) = self.completions.send(event).await {
            // Dispatch has stopped, so no update can still be pending.
            self.hub.publish(&event);
        }
    }

    fn take_completions(&self) -> Option<mpsc::Receiver<DomainEvent>> {
        self.completions_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Ask the agent to stop the session's current turn
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        tracing::info!(session_id, "Cancelling prompt turn");
        self.channel
            .notify(
                methods::SESSION_CANCEL,
                serde_json::json!({ "sessionId": session_id }),
            )
            .await
    }

    /// Forget a session. Later updates for it are dropped.
    pub async fn close_session(&self, session_id: &str) -> Option<String> {
        let conversation_id = self.sessions.unbind(session_id).await;
        if conversation_id.is_some() {
            tracing::info!(session_id, "Agent session closed");
        }
        conversation_id
    }

    /// Consume the notification stream until the channel closes, publishing
    /// turn endings in between. Only the first caller dispatches.
    pub async fn run_notifications<S>(self: Arc<Self>, mut notifications: S)
    where
        S: Stream<Item = Notification> + Unpin,
    {
        let Some(mut completions) = self.take_completions() else {
            tracing::warn!("Notification dispatch already running");
            return;
        };

        loop {
            tokio::select! {
                biased;
                notification = notifications.next() => match notification {
                    Some(notification) => {
                        self.dispatch(notification).await;
                    }
                    None => break,
                },
                Some(event) = completions.recv() => {
                    self.hub.publish(&event);
                }
            }
        }

        // Turns ending from here on publish directly.
        completions.close();
        while let Some(event) = completions.recv().await {
            self.hub.publish(&event);
        }
        tracing::debug!("Notification stream ended");
    }

    /// Decode one notification and publish the resulting event, if any
    pub async fn dispatch(&self, notification: Notification) -> Option<DomainEvent> {
        if notification.method != methods::SESSION_UPDATE {
            tracing::debug!(method = %notification.method, "Ignoring agent notification");
            return None;
        }

        let update: SessionNotification = match serde_json::from_value(notification.params) {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!("Undecodable session update: {}", e);
                return None;
            }
        };

        let Some(conversation_id) = self.sessions.conversation_for(&update.session_id).await else {
            tracing::debug!(session_id = %update.session_id, "Update for unbound session");
            return None;
        };

        let event = to_domain_event(conversation_id, update.update)?;
        self.hub.publish(&event);
        Some(event)
    }
}

/// Map a session update onto the event published to subscribers
pub fn to_domain_event(conversation_id: String, update: SessionUpdate) -> Option<DomainEvent> {
    match update {
        SessionUpdate::AgentMessageChunk {
            content: ContentBlock::Text { text },
        } => Some(DomainEvent::TextChunk {
            conversation_id,
            chunk: text,
        }),
        SessionUpdate::ToolCall {
            tool_call_id,
            title,
            kind,
            status,
        } => Some(DomainEvent::ToolCallStarted {
            conversation_id,
            tool_call_id,
            title,
            kind,
            status,
        }),
        SessionUpdate::ToolCallUpdate {
            tool_call_id,
            status: Some(status),
        } => Some(DomainEvent::ToolCallUpdated {
            conversation_id,
            tool_call_id,
            status,
        }),
        other => {
            tracing::debug!(update = ?other, "Dropping unhandled session update");
            None
        }
    }
}
