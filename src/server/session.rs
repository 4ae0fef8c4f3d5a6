//! Live WebSocket session registry
//!
//! One entry per connected peer, created after the connect frame is accepted
//! and removed when the socket closes or the idle sweeper reaps it.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use crate::auth::TenantContext;

/// Which population a peer belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Device exposing capabilities (canvas, camera, screen, ...)
    Node,
    /// Control surface initiating runs and observing state
    Operator,
}

/// One live connection
pub struct Session {
    pub connection_id: String,
    pub role: PeerRole,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    pub commands: Vec<String>,
    pub client: Option<Value>,
    pub user_agent: Option<String>,
    pub presence_key: Option<String>,
    pub client_ip: Option<IpAddr>,
    pub auth_method: &'static str,
    pub tenant: Option<TenantContext>,
    pub connected_at: Instant,
    last_seen: Mutex<Instant>,
    /// Server-to-client frames (acceptance, pongs, close)
    pub outbound: mpsc::UnboundedSender<Message>,
}

impl Session {
    pub fn touch(&self) {
        *self.last_seen.lock().expect("session last_seen lock") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .expect("session last_seen lock")
            .elapsed()
    }
}

/// Builder-ish bag for session construction
pub struct SessionParams {
    pub role: PeerRole,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    pub commands: Vec<String>,
    pub client: Option<Value>,
    pub user_agent: Option<String>,
    pub presence_key: Option<String>,
    pub client_ip: Option<IpAddr>,
    pub auth_method: &'static str,
    pub tenant: Option<TenantContext>,
}

/// All live sessions, keyed by connection id
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        connection_id: String,
        params: SessionParams,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Arc<Session> {
        let now = Instant::now();
        let session = Arc::new(Session {
            connection_id: connection_id.clone(),
            role: params.role,
            scopes: params.scopes,
            caps: params.caps,
            commands: params.commands,
            client: params.client,
            user_agent: params.user_agent,
            presence_key: params.presence_key,
            client_ip: params.client_ip,
            auth_method: params.auth_method,
            tenant: params.tenant,
            connected_at: now,
            last_seen: Mutex::new(now),
            outbound,
        });
        self.sessions.insert(connection_id, Arc::clone(&session));
        session
    }

    pub fn remove(&self, connection_id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(connection_id).map(|(_, s)| s)
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(connection_id).map(|s| Arc::clone(&s))
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn count_role(&self, role: PeerRole) -> usize {
        self.sessions.iter().filter(|s| s.role == role).count()
    }

    /// Reap sessions idle longer than `timeout`. Returns how many were closed.
    pub fn reap_idle(&self, timeout: Duration) -> usize {
        let idle: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|s| s.idle_for() > timeout)
            .map(|s| Arc::clone(&s))
            .collect();

        for session in &idle {
            debug!(connection = %session.connection_id, "closing idle session");
            let _ = session.outbound.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "idle timeout".into(),
            })));
            self.sessions.remove(&session.connection_id);
        }
        idle.len()
    }
}

/// Periodically close sessions that have gone silent
pub fn spawn_idle_sweeper(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reaped = registry.reap_idle(timeout);
            if reaped > 0 {
                info!(reaped, "idle sessions closed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(role: PeerRole) -> SessionParams {
        SessionParams {
            role,
            scopes: vec![],
            caps: vec!["canvas".into()],
            commands: vec![],
            client: None,
            user_agent: None,
            presence_key: None,
            client_ip: None,
            auth_method: "token",
            tenant: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_remove() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.insert("conn-1".into(), params(PeerRole::Node), tx);
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.count_role(PeerRole::Node), 1);
        assert_eq!(registry.count_role(PeerRole::Operator), 0);

        let removed = registry.remove("conn-1").unwrap();
        assert_eq!(removed.caps, vec!["canvas"]);
        assert_eq!(registry.count(), 0);
        assert!(registry.get("conn-1").is_none());
    }

    #[tokio::test]
    async fn test_reap_idle_sends_close() {
        let registry = SessionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.insert("conn-1".into(), params(PeerRole::Operator), tx);

        // Nothing is idle yet
        assert_eq!(registry.reap_idle(Duration::from_secs(60)), 0);

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(registry.reap_idle(Duration::from_millis(5)), 1);
        assert_eq!(registry.count(), 0);
        assert!(matches!(rx.recv().await, Some(Message::Close(_))));
    }

    #[tokio::test]
    async fn test_touch_resets_idle_clock() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = registry.insert("conn-1".into(), params(PeerRole::Node), tx);

        tokio::time::sleep(Duration::from_millis(15)).await;
        session.touch();
        assert_eq!(registry.reap_idle(Duration::from_millis(10)), 0);
        assert_eq!(registry.count(), 1);
    }
}
