//! HTTP routes for Gatehouse

pub mod auth_proxy;
pub mod health;
pub mod openai;

pub use auth_proxy::handle_auth_request;
pub use health::{health_check, version_info};
pub use openai::handle_chat_completions;
