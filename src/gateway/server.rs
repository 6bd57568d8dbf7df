//! Gateway server implementation

use crate::agent::AgentBridge;
use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::gateway::handler::{gateway_router, AppState};
use axum::http::{header, Method};
use axum::Router;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Gateway server state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayState {
    /// Not started
    Stopped,
    /// Starting up
    Starting,
    /// Running
    Running,
    /// Shutting down
    ShuttingDown,
}

/// Gateway status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub state: GatewayState,
    pub agent_alive: bool,
    pub listen_addr: Option<SocketAddr>,
}

/// Agentbridge gateway: hosts the agent bridge behind HTTP and WebSocket.
///
/// A gateway is single-use. Once `stop` has run, or `start` has failed, the
/// agent bridge is shut down for good and `start` returns an error; build a
/// new `Gateway` to serve again.
pub struct Gateway {
    config: BridgeConfig,
    state: Arc<RwLock<GatewayState>>,
    bridge: Arc<AgentBridge>,
    shutdown: CancellationToken,
    server: RwLock<Option<JoinHandle<()>>>,
    listen_addr: RwLock<Option<SocketAddr>>,
}

impl Gateway {
    /// Create a new gateway with the given configuration
    pub fn new(config: BridgeConfig) -> Self {
        let bridge = AgentBridge::new(config.clone());
        Self {
            config,
            state: Arc::new(RwLock::new(GatewayState::Stopped)),
            bridge,
            shutdown: CancellationToken::new(),
            server: RwLock::new(None),
            listen_addr: RwLock::new(None),
        }
    }

    /// Get current state
    pub async fn state(&self) -> GatewayState {
        *self.state.read().await
    }

    pub fn bridge(&self) -> &Arc<AgentBridge> {
        &self.bridge
    }

    pub async fn status(&self) -> GatewayStatus {
        GatewayStatus {
            state: self.state().await,
            agent_alive: self.bridge.is_agent_alive().await,
            listen_addr: *self.listen_addr.read().await,
        }
    }

    /// Build the HTTP application with tracing and CORS layers
    pub fn router(&self) -> Router {
        let state = AppState {
            bridge: self.bridge.clone(),
            transport_buffer: self.config.gateway.transport_buffer,
        };
        gateway_router(state)
            .layer(TraceLayer::new_for_http())
            .layer(build_cors(&self.config.gateway.cors_origins))
    }

    /// Start the agent and begin serving. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut state = self.state.write().await;
        if *state != GatewayState::Stopped {
            return Err(Error::Gateway("Gateway already running".to_string()));
        }
        if self.shutdown.is_cancelled() {
            return Err(Error::Gateway(
                "Gateway was stopped and cannot be restarted; build a new Gateway".to_string(),
            ));
        }
        *state = GatewayState::Starting;
        drop(state);

        tracing::info!("Starting Agentbridge gateway");

        match self.serve().await {
            Ok(addr) => {
                *self.state.write().await = GatewayState::Running;
                tracing::info!(addr = %addr, "Agentbridge gateway listening");
                Ok(addr)
            }
            Err(e) => {
                self.shutdown.cancel();
                self.bridge.shutdown(false).await;
                *self.state.write().await = GatewayState::Stopped;
                Err(e)
            }
        }
    }

    async fn serve(&self) -> Result<SocketAddr> {
        let handshake = self.bridge.start().await?;
        tracing::info!(
            protocol_version = %handshake.protocol_version,
            "Agent ready"
        );

        let bind = format!("{}:{}", self.config.gateway.host, self.config.gateway.port);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .map_err(|e| Error::Gateway(format!("Failed to bind {}: {}", bind, e)))?;
        let addr = listener.local_addr()?;

        let app = self.router();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::error!("Gateway server error: {}", e);
            }
        });

        *self.server.write().await = Some(handle);
        *self.listen_addr.write().await = Some(addr);
        Ok(addr)
    }

    /// Stop serving and shut the agent down gracefully
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != GatewayState::Running {
            return Ok(());
        }
        *state = GatewayState::ShuttingDown;
        drop(state);

        tracing::info!("Stopping Agentbridge gateway");

        self.shutdown.cancel();
        if let Some(handle) = self.server.write().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!("Gateway server task failed: {}", e);
            }
        }
        self.bridge.shutdown(true).await;

        *self.listen_addr.write().await = None;
        *self.state.write().await = GatewayState::Stopped;

        tracing::info!("Agentbridge gateway stopped");
        Ok(())
    }
}

// =============================================================================
// CORS
// =============================================================================

fn build_cors(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        cors.allow_origin(parsed)
    }
}

/// Builder for creating a gateway
pub struct GatewayBuilder {
    config: BridgeConfig,
}

impl GatewayBuilder {
    /// Create a new builder with default config
    pub fn new() -> Self {
        Self {
            config: BridgeConfig::default(),
        }
    }

    /// Set the configuration
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the gateway host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.gateway.host = host.into();
        self
    }

    /// Set the gateway port
    pub fn port(mut self, port: u16) -> Self {
        self.config.gateway.port = port;
        self
    }

    /// Build the gateway
    pub fn build(self) -> Gateway {
        Gateway::new(self.config)
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}
