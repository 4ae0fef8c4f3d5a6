//! HTTP and WebSocket server

pub mod http;
pub mod session;
pub mod websocket;

pub use http::{run, AppState};
pub use session::{PeerRole, Session, SessionRegistry};
