//! Gatehouse - multi-tenant agent gateway
//!
//! Gatehouse brokers bidirectional connections between *nodes* (devices that
//! expose capabilities such as canvas, camera, or SMS) and *operators*
//! (dashboards, chat clients, OpenAI-compatible HTTP callers), mediating agent
//! runs between them.
//!
//! ## Services
//!
//! - **Router**: HTTP + WebSocket front door with bearer/identity auth
//! - **OpenAI adapter**: `/v1/chat/completions` bridged onto the agent-event bus
//! - **Billing**: cached prepaid-balance and subscription admission, usage reporting
//! - **Identity**: JWT validation against provider-discovered JWKS
//! - **Tunnel**: supervised egress tunnel child process with a public URL

pub mod agent;
pub mod auth;
pub mod billing;
pub mod config;
pub mod origin;
pub mod routes;
pub mod secrets;
pub mod server;
pub mod tunnel;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{GatewayError, Result};
