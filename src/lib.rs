//! Agentbridge - supervised agent subprocess with a JSON-RPC bridge and
//! conversation event fan-out
//!
//! Agentbridge runs one long-lived external agent process, speaks the Agent
//! Client Protocol with it over newline-delimited JSON-RPC on stdio, and
//! delivers the resulting event stream to any number of WebSocket clients
//! subscribed to a conversation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      Agentbridge Gateway (axum)                   │
//! │   POST /api/sessions   POST /api/sessions/:id/prompt   GET /ws    │
//! └──────────┬───────────────────────────────────────────────┬───────┘
//!            │                                               │
//! ┌──────────▼───────────────────────────┐      ┌────────────▼───────┐
//! │             Agent Bridge              │      │   Broadcast Hub    │
//! │  ┌──────────────┐  ┌──────────────┐  │      │  conversation_id → │
//! │  │ AgentClient  │  │  Permission  │──┼─────►│   {transports}     │
//! │  │              │──┼─►Arbitrator  │  │      └────────────────────┘
//! │  └──────┬───────┘  └──────┬───────┘  │
//! │         │   RpcChannel    │          │
//! │  ┌──────▼─────────────────▼───────┐  │
//! │  │ reader task · pending calls    │  │
//! │  │ notification / call queues     │  │
//! │  └──────────────┬─────────────────┘  │
//! └─────────────────┼────────────────────┘
//!                   │ stdin / stdout (NDJSON)
//!           ┌───────▼────────┐
//!           │  agent process │
//!           └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`agent`]: process supervision, protocol channel, sessions, permissions, fan-out
//! - [`gateway`]: HTTP API and WebSocket transport
//! - [`config`]: Configuration management
//! - [`error`]: Error types

pub mod agent;
pub mod config;
pub mod error;
pub mod gateway;

pub use config::BridgeConfig;
pub use error::{Error, Result};
