//! Gateway for Agentbridge
//!
//! Hosts the agent bridge behind an HTTP API for session management and a
//! WebSocket transport that streams conversation events to subscribers.

mod handler;
mod server;

pub use handler::{gateway_router, handle_command, AppState};
pub use server::{Gateway, GatewayBuilder, GatewayState, GatewayStatus};
