//! Agent engine seam and run event types
//!
//! The execution engine itself lives outside the gateway. This module pins
//! down the contract the gateway consumes: a run produces payload texts plus
//! token metadata, and publishes assistant/lifecycle events onto the bus as
//! it goes. Events for one run are FIFO from a single producer.

pub mod bus;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{GatewayError, Result};

pub use bus::EventBus;

/// Which stream an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStream {
    Assistant,
    Lifecycle,
}

/// Lifecycle phase of a run; `End` and `Error` are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Start,
    End,
    Error,
}

/// One event on the agent-event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub run_id: String,
    pub stream: EventStream,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<RunPhase>,
    /// Assistant text delta
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    /// Error detail on lifecycle errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AgentEvent {
    pub fn assistant_delta(run_id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            stream: EventStream::Assistant,
            phase: None,
            delta: Some(delta.into()),
            message: None,
        }
    }

    pub fn lifecycle(run_id: impl Into<String>, phase: RunPhase) -> Self {
        Self {
            run_id: run_id.into(),
            stream: EventStream::Lifecycle,
            phase: Some(phase),
            delta: None,
            message: None,
        }
    }

    pub fn lifecycle_error(run_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            stream: EventStream::Lifecycle,
            phase: Some(RunPhase::Error),
            delta: None,
            message: Some(message.into()),
        }
    }

    /// Terminal events end every subscription for the run
    pub fn is_terminal(&self) -> bool {
        self.stream == EventStream::Lifecycle
            && matches!(self.phase, Some(RunPhase::End) | Some(RunPhase::Error))
    }
}

/// Everything the engine needs to execute one run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: String,
    /// Stable conversation key, e.g. `openai:{agent}:{user}`
    pub session_key: String,
    pub agent_id: String,
    pub extra_system_prompt: Option<String>,
    pub prompt: String,
    pub model: Option<String>,
    pub user: Option<String>,
}

/// Token accounting the engine reports for a finished run
#[derive(Debug, Clone, Default)]
pub struct RunMetadata {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub duration_ms: Option<u64>,
    pub model: Option<String>,
    pub provider: Option<String>,
}

/// Result of an awaited run
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// Payload texts in emission order; empty texts are permitted
    pub payloads: Vec<String>,
    pub metadata: RunMetadata,
}

/// The external agent execution engine.
///
/// Implementations publish this run's events to the bus while executing and
/// return the collected payloads when the run settles.
#[async_trait]
pub trait AgentEngine: Send + Sync {
    async fn run(&self, request: RunRequest, bus: &EventBus) -> Result<RunOutcome>;
}

/// Placeholder engine wired when no real engine is attached. Every run
/// fails, which callers see as an internal error.
pub struct UnavailableEngine;

#[async_trait]
impl AgentEngine for UnavailableEngine {
    async fn run(&self, _request: RunRequest, _bus: &EventBus) -> Result<RunOutcome> {
        Err(GatewayError::internal("agent engine unavailable"))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        assert!(AgentEvent::lifecycle("r", RunPhase::End).is_terminal());
        assert!(AgentEvent::lifecycle_error("r", "boom").is_terminal());
        assert!(!AgentEvent::lifecycle("r", RunPhase::Start).is_terminal());
        assert!(!AgentEvent::assistant_delta("r", "hi").is_terminal());
    }

    #[test]
    fn test_event_wire_shape() {
        let event = AgentEvent::lifecycle("chatcmpl_x", RunPhase::End);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["runId"], "chatcmpl_x");
        assert_eq!(json["stream"], "lifecycle");
        assert_eq!(json["phase"], "end");
        assert!(json.get("delta").is_none());
    }
}
