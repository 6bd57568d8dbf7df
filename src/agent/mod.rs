//! Agent module: supervised agent process, JSON-RPC bridge and event fan-out
//!
//! ## Architecture
//!
//! ```text
//! agent process ←stdio (NDJSON JSON-RPC)→ rpc ─┬→ client ──────┐
//!   (launcher)                                 └→ permission ──┴→ hub → transports (/ws)
//! ```
//!
//! - [`launcher`]: spawn, liveness and termination of the agent process
//! - [`rpc`]: line classification, call correlation, bounded inbound queues
//! - [`client`]: handshake, sessions, prompts, session update decoding
//! - [`permission`]: tool permission heuristic and review table
//! - [`hub`]: conversation-keyed subscriber registry
//! - [`bridge`]: wires the above together and restarts the agent on exit

pub mod bridge;
pub mod client;
pub mod hub;
pub mod launcher;
pub mod permission;
pub mod rpc;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::AgentBridge;
pub use client::{AgentClient, SessionMap};
pub use hub::BroadcastHub;
pub use launcher::AgentProcess;
pub use permission::PermissionArbitrator;
pub use rpc::RpcChannel;
