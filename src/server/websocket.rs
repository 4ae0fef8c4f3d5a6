//! Gateway WebSocket upgrade and connection handling
//!
//! Auth flow:
//! 1. Bearer token from the upgrade request (Authorization header or query)
//! 2. Credentials from the connect frame, which the client must send first
//! 3. Mesh-identity fallback for mesh-resident peers, when enabled
//!
//! The connect frame declares the peer's role, scopes, capability and
//! command sets; the gateway answers with an acceptance frame carrying the
//! connection id, or a rejection with a reason code and closes.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{authorize, AuthOutcome, ConnectAuth, TenantContext};
use crate::auth::tenant::TenantParams;
use crate::server::http::{extract_bearer, request_meta, AppState};
use crate::server::session::{PeerRole, SessionParams};

/// How long the peer has to send its connect frame
const CONNECT_FRAME_TIMEOUT: Duration = Duration::from_secs(10);

/// First frame a peer sends after the upgrade
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectFrame {
    role: PeerRole,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    caps: Vec<String>,
    #[serde(default)]
    commands: Vec<String>,
    #[serde(default)]
    client: Option<Value>,
    #[serde(default)]
    user_agent: Option<String>,
    #[serde(default)]
    presence_key: Option<String>,
    #[serde(default)]
    auth: ConnectFrameAuth,
    #[serde(default)]
    org_id: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    env: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConnectFrameAuth {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Handle a gateway WebSocket upgrade request
pub async fn handle_upgrade(
    state: Arc<AppState>,
    req: Request<Incoming>,
    addr: SocketAddr,
) -> Response<Full<Bytes>> {
    // Browser peers must pass the origin policy before the upgrade
    if let Some(origin) = req.headers().get("origin").and_then(|v| v.to_str().ok()) {
        let host = req
            .headers()
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let decision = state.origin.check(host, Some(origin));
        if !decision.is_allowed() {
            warn!(origin, reason = decision.reason(), "websocket origin denied");
            return Response::builder()
                .status(StatusCode::FORBIDDEN)
                .header("Content-Type", "application/json")
                .body(Full::new(Bytes::from(
                    json!({"error": decision.reason()}).to_string(),
                )))
                .unwrap();
        }
    }

    let bearer = extract_bearer(&req);
    let meta = request_meta(&req, addr);

    match hyper_tungstenite::upgrade(req, None) {
        Ok((response, websocket)) => {
            tokio::spawn(async move {
                match websocket.await {
                    Ok(ws) => run_session(state, ws, meta, bearer).await,
                    Err(e) => error!("websocket upgrade failed: {:?}", e),
                }
            });

            let (parts, _) = response.into_parts();
            Response::from_parts(parts, Full::new(Bytes::new()))
        }
        Err(e) => {
            error!("websocket upgrade error: {:?}", e);
            Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Full::new(Bytes::from(format!(
                    "WebSocket upgrade failed: {}",
                    e
                ))))
                .unwrap()
        }
    }
}

async fn run_session(
    state: Arc<AppState>,
    ws: tokio_tungstenite::WebSocketStream<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>>,
    meta: crate::auth::RequestMeta,
    bearer: Option<String>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    // The peer leads with its connect frame
    let frame = match tokio::time::timeout(CONNECT_FRAME_TIMEOUT, ws_rx.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ConnectFrame>(&text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("invalid connect frame: {}", e);
                reject(&mut ws_tx, "connect_frame_invalid").await;
                return;
            }
        },
        Ok(Some(Ok(_))) => {
            reject(&mut ws_tx, "connect_frame_invalid").await;
            return;
        }
        Ok(_) => return,
        Err(_) => {
            reject(&mut ws_tx, "connect_frame_timeout").await;
            return;
        }
    };

    let connect = ConnectAuth {
        token: bearer.or(frame.auth.token.clone()),
        password: frame.auth.password.clone(),
    };
    let tenant_params = TenantParams {
        org_id: frame.org_id.clone(),
        project_id: frame.project_id.clone(),
        env: frame.env.clone(),
    };

    let outcome = authorize(
        &state.auth,
        &connect,
        &meta,
        &tenant_params,
        state.identity.as_deref(),
        Some(&*state.limiter),
        &state.args.mesh_host_suffix,
    )
    .await;

    let (method, tenant) = match outcome {
        AuthOutcome::Ok { method, tenant, .. } => (method, tenant),
        AuthOutcome::Fail { reason } => {
            info!(reason = %reason, "websocket connect rejected");
            reject(&mut ws_tx, &reason).await;
            return;
        }
    };

    let connection_id = Uuid::new_v4().to_string();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let session = state.sessions.insert(
        connection_id.clone(),
        session_params(&frame, &meta, method, tenant),
        out_tx.clone(),
    );

    info!(
        connection = %connection_id,
        role = ?session.role,
        method,
        caps = session.caps.len(),
        "session connected"
    );

    let accepted = json!({
        "type": "accepted",
        "connectionId": connection_id,
        "method": method,
    });
    if ws_tx
        .send(Message::Text(accepted.to_string().into()))
        .await
        .is_err()
    {
        state.sessions.remove(&connection_id);
        return;
    }

    loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(msg) => {
                    let closing = matches!(msg, Message::Close(_));
                    if ws_tx.send(msg).await.is_err() || closing {
                        break;
                    }
                }
                None => break,
            },
            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Ping(data))) => {
                    session.touch();
                    let _ = out_tx.send(Message::Pong(data));
                }
                Some(Ok(Message::Text(_))) | Some(Ok(Message::Binary(_))) => {
                    // Capability and command dispatch happens device-side;
                    // the gateway only tracks liveness here
                    session.touch();
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection = %connection_id, "websocket read error: {}", e);
                    break;
                }
            },
        }
    }

    state.sessions.remove(&connection_id);
    info!(connection = %connection_id, "session closed");
}

fn session_params(
    frame: &ConnectFrame,
    meta: &crate::auth::RequestMeta,
    method: &'static str,
    tenant: Option<TenantContext>,
) -> SessionParams {
    SessionParams {
        role: frame.role,
        scopes: frame.scopes.clone(),
        caps: frame.caps.clone(),
        commands: frame.commands.clone(),
        client: frame.client.clone(),
        user_agent: frame.user_agent.clone(),
        presence_key: frame.presence_key.clone(),
        client_ip: meta.peer_ip,
        auth_method: method,
        tenant,
    }
}

async fn reject<S>(ws_tx: &mut S, reason: &str)
where
    S: SinkExt<Message> + Unpin,
{
    let body = json!({"type": "rejected", "reason": reason}).to_string();
    let _ = ws_tx.send(Message::Text(body.into())).await;
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::Policy,
            reason: reason.to_string().into(),
        })))
        .await;
}
