//! Agent bridge: the composition root of the agent subsystem
//!
//! Owns the one live agent connection (process, protocol channel, session
//! client, permission arbitrator) and the broadcast hub that outlives it.
//!
//! ```text
//! AgentProcess ──stdio──► RpcChannel ──notifications──► AgentClient ──┐
//!                              │                                      ├─► BroadcastHub ─► transports
//!                              └──incoming calls──► PermissionArbitrator ┘
//! ```
//!
//! A supervisor task watches the channel. When the agent goes away, bound
//! sessions are dropped and their conversations receive an `error` event; if
//! restarts are enabled a fresh process and channel are built after a backoff.
//! A terminated channel is never reused.

use crate::agent::client::{AgentClient, SessionMap};
use crate::agent::hub::BroadcastHub;
use crate::agent::launcher::AgentProcess;
use crate::agent::permission::PermissionArbitrator;
use crate::agent::rpc::{ChannelOptions, RpcChannel};
use crate::agent::types::{DomainEvent, HandshakeResult};
use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One agent connection and the components built on it
struct AgentRuntime {
    generation: u64,
    process: Option<AgentProcess>,
    channel: Arc<RpcChannel>,
    client: Arc<AgentClient>,
    arbitrator: Arc<PermissionArbitrator>,
    tasks: Vec<JoinHandle<()>>,
    /// Spawned by the bridge, so it can be spawned again
    restartable: bool,
}

impl AgentRuntime {
    async fn is_alive(&self) -> bool {
        let process_alive = self.process.as_ref().map_or(true, |p| p.is_alive());
        process_alive && !self.channel.is_terminated().await
    }

    async fn stop(&self, graceful: bool) {
        self.channel.close_input().await;
        if let Some(process) = &self.process {
            process.terminate(graceful).await;
        }
        for task in &self.tasks {
            task.abort();
        }
        self.arbitrator.cancel_all("agent_stopped").await;
    }
}

/// Agent bridge
pub struct AgentBridge {
    config: BridgeConfig,
    hub: Arc<BroadcastHub>,
    runtime: RwLock<Option<Arc<AgentRuntime>>>,
    generation: AtomicU64,
    shutting_down: CancellationToken,
    /// Held from the vacancy check until a new runtime is installed
    starting: Mutex<()>,
}

impl AgentBridge {
    /// Create a bridge with no agent attached
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            hub: Arc::new(BroadcastHub::new()),
            runtime: RwLock::new(None),
            generation: AtomicU64::new(0),
            shutting_down: CancellationToken::new(),
            starting: Mutex::new(()),
        })
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the configured agent, complete the handshake and start
    /// supervising it.
    pub async fn start(self: &Arc<Self>) -> Result<HandshakeResult> {
        let _starting = self.starting.lock().await;
        self.ensure_vacant().await?;
        let runtime = self.launch().await?;
        let handshake = runtime.client.handshake().await.unwrap_or_default();
        self.install(runtime.clone()).await?;
        tokio::spawn(supervise(
            Arc::downgrade(self),
            runtime,
            self.shutting_down.clone(),
        ));
        Ok(handshake)
    }

    /// Attach an agent that is already running elsewhere, given its output
    /// (`reader`) and input (`writer`). Such a connection is not restarted.
    pub async fn attach<R, W>(self: &Arc<Self>, reader: R, writer: W) -> Result<HandshakeResult>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let _starting = self.starting.lock().await;
        self.ensure_vacant().await?;
        let runtime = self
            .connect(reader, writer, CancellationToken::new(), None)
            .await?;
        let handshake = runtime.client.handshake().await.unwrap_or_default();
        self.install(runtime.clone()).await?;
        tokio::spawn(supervise(
            Arc::downgrade(self),
            runtime,
            self.shutting_down.clone(),
        ));
        Ok(handshake)
    }

    /// Stop the agent. Graceful closes its input and allows the configured
    /// grace period; forceful kills it. Safe to call more than once.
    pub async fn shutdown(&self, graceful: bool) {
        self.shutting_down.cancel();
        let runtime = self.runtime.write().await.take();
        let Some(runtime) = runtime else {
            return;
        };

        tracing::info!(generation = runtime.generation, graceful, "Shutting down agent");
        runtime.stop(graceful).await;

        for (session_id, conversation_id) in runtime.client.sessions().drain().await {
            tracing::debug!(session_id = %session_id, "Dropping session on shutdown");
            self.hub.publish(&DomainEvent::Error {
                conversation_id,
                code: "agent_stopped".to_string(),
                message: "Agent bridge is shutting down".to_string(),
            });
        }
    }

    async fn ensure_vacant(&self) -> Result<()> {
        if self.shutting_down.is_cancelled() {
            return Err(Error::Gateway("agent bridge is shut down".to_string()));
        }
        if let Some(current) = self.runtime.read().await.as_ref() {
            if current.is_alive().await {
                return Err(Error::Spawn("an agent is already running".to_string()));
            }
        }
        Ok(())
    }

    async fn launch(&self) -> Result<Arc<AgentRuntime>> {
        let process = AgentProcess::spawn(&self.config.agent)?;
        let io = process
            .take_io()
            .ok_or_else(|| Error::Spawn("agent stdio unavailable".to_string()))?;
        let exited = process.exit_token();
        self.connect(io.stdout, io.stdin, exited, Some(process)).await
    }

    async fn connect<R, W>(
        &self,
        reader: R,
        writer: W,
        exited: CancellationToken,
        process: Option<AgentProcess>,
    ) -> Result<Arc<AgentRuntime>>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let channel = RpcChannel::start(
            reader,
            writer,
            ChannelOptions::from(&self.config.protocol),
            exited,
        );
        let notifications = channel
            .notifications()
            .ok_or_else(|| Error::Gateway("notification stream already taken".to_string()))?;
        let calls = channel
            .incoming_calls()
            .ok_or_else(|| Error::Gateway("incoming call stream already taken".to_string()))?;

        let sessions = SessionMap::new();
        let client = Arc::new(AgentClient::new(
            channel.clone(),
            sessions.clone(),
            self.hub.clone(),
            self.config.protocol.prompt_timeout(),
        ));
        let arbitrator = Arc::new(PermissionArbitrator::new(
            channel.clone(),
            sessions,
            self.hub.clone(),
            self.config.permissions.clone(),
        ));

        let tasks = vec![
            tokio::spawn(client.clone().run_notifications(notifications)),
            tokio::spawn(arbitrator.clone().run(calls)),
        ];

        let restartable = process.is_some();
        let runtime = Arc::new(AgentRuntime {
            generation: self.generation.fetch_add(1, Ordering::Relaxed) + 1,
            process,
            channel,
            client,
            arbitrator,
            tasks,
            restartable,
        });

        if let Err(e) = runtime.client.initialize().await {
            tracing::error!(generation = runtime.generation, "Agent handshake failed: {}", e);
            runtime.stop(false).await;
            return Err(e);
        }

        tracing::info!(
            generation = runtime.generation,
            pid = ?runtime.process.as_ref().and_then(|p| p.pid()),
            "Agent connected"
        );
        Ok(runtime)
    }

    /// Publish a connected runtime unless the bridge was shut down meanwhile
    async fn install(&self, runtime: Arc<AgentRuntime>) -> Result<()> {
        let mut slot = self.runtime.write().await;
        if self.shutting_down.is_cancelled() {
            drop(slot);
            runtime.stop(false).await;
            return Err(Error::Gateway("agent bridge is shut down".to_string()));
        }
        *slot = Some(runtime);
        Ok(())
    }

    /// Detach a dead runtime and tell its conversations
    async fn retire(&self, runtime: &Arc<AgentRuntime>, restarting: bool) {
        {
            let mut slot = self.runtime.write().await;
            if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, runtime)) {
                *slot = None;
            }
        }

        let (code, message) = if restarting {
            ("agent_restarted", "Agent process restarted; the session was closed")
        } else {
            ("agent_exited", "Agent process exited; the session was closed")
        };

        for (session_id, conversation_id) in runtime.client.sessions().drain().await {
            tracing::info!(
                session_id = %session_id,
                conversation_id = %conversation_id,
                "Session lost with agent"
            );
            self.hub.publish(&DomainEvent::Error {
                conversation_id,
                code: code.to_string(),
                message: message.to_string(),
            });
        }
    }

    async fn current(&self) -> Result<Arc<AgentRuntime>> {
        self.runtime
            .read()
            .await
            .clone()
            .ok_or(Error::ProcessTerminated)
    }

    // =========================================================================
    // Operations used by the gateway
    // =========================================================================

    /// True when an agent is connected and its channel is open
    pub async fn is_agent_alive(&self) -> bool {
        match self.current().await {
            Ok(runtime) => runtime.is_alive().await,
            Err(_) => false,
        }
    }

    /// Session client of the live agent
    pub async fn client(&self) -> Result<Arc<AgentClient>> {
        Ok(self.current().await?.client.clone())
    }

    pub async fn create_session(
        &self,
        conversation_id: &str,
        cwd: &Path,
        mcp_servers: Vec<Value>,
    ) -> Result<String> {
        self.client()
            .await?
            .new_session(conversation_id, cwd, mcp_servers)
            .await
    }

    /// Submit a prompt; the turn's output is delivered through the hub
    pub async fn prompt(&self, session_id: &str, text: &str) -> Result<()> {
        self.client().await?.prompt(session_id, text).await?;
        Ok(())
    }

    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let client = self.client().await?;
        if client.sessions().conversation_for(session_id).await.is_none() {
            return Err(Error::Session(format!("unknown session: {}", session_id)));
        }
        client.cancel(session_id).await
    }

    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        self.client()
            .await?
            .close_session(session_id)
            .await
            .map(|_| ())
            .ok_or_else(|| Error::Session(format!("unknown session: {}", session_id)))
    }

    /// Answer a deferred permission request on behalf of a reviewer
    pub async fn resolve_permission(&self, request_id: &str, option_id: Option<&str>) -> Result<()> {
        self.current()
            .await?
            .arbitrator
            .resolve(request_id, option_id)
            .await
    }
}

/// Watch the live runtime and replace it when the agent goes away
async fn supervise(
    bridge: Weak<AgentBridge>,
    mut runtime: Arc<AgentRuntime>,
    shutting_down: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = runtime.channel.closed() => {}
            _ = shutting_down.cancelled() => return,
        }
        if shutting_down.is_cancelled() {
            return;
        }
        let Some(this) = bridge.upgrade() else {
            return;
        };

        let restart = runtime.restartable && this.config.agent.restart_on_exit;
        let exit = runtime.process.as_ref().and_then(|p| p.exit_status());
        tracing::warn!(
            generation = runtime.generation,
            exit = ?exit,
            restart,
            "Agent connection lost"
        );
        this.retire(&runtime, restart).await;
        if !restart {
            return;
        }

        let backoff = this.config.agent.restart_backoff();
        drop(this);

        runtime = loop {
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutting_down.cancelled() => return,
            }
            let Some(this) = bridge.upgrade() else {
                return;
            };
            let _starting = this.starting.lock().await;
            if shutting_down.is_cancelled() {
                return;
            }
            if let Some(current) = this.runtime.read().await.as_ref() {
                if current.is_alive().await {
                    tracing::info!(
                        generation = current.generation,
                        "Agent already started elsewhere, not restarting"
                    );
                    return;
                }
            }
            match this.launch().await {
                Ok(next) => {
                    if this.install(next.clone()).await.is_err() {
                        return;
                    }
                    tracing::info!(generation = next.generation, "Agent restarted");
                    break next;
                }
                Err(e) => tracing::warn!("Agent restart failed, retrying: {}", e),
            }
        };
    }
}
