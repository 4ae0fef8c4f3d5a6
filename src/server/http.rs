//! HTTP server and request router
//!
//! Uses hyper http1 with TokioIo for async handling. Dispatch is by
//! `(method, pathname)`; middleware order on protected routes is method
//! check, bearer extraction, authorization, capped body read, handler.

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::agent::{AgentEngine, EventBus};
use crate::auth::tenant::TenantParams;
use crate::auth::{
    authorize, AuthOutcome, ConnectAuth, IdentityProviderClient, RateLimiter, RequestMeta,
    ResolvedAuth,
};
use crate::billing::{BillingGate, CommerceClient, UsageReporter};
use crate::config::Args;
use crate::origin::OriginPolicy;
use crate::routes;
use crate::server::session::{spawn_idle_sweeper, SessionRegistry};
use crate::server::websocket;
use crate::types::{GatewayError, Result};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// How often the idle sweeper wakes
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub auth: ResolvedAuth,
    pub origin: Arc<OriginPolicy>,
    /// Present iff an identity provider is configured
    pub identity: Option<Arc<IdentityProviderClient>>,
    pub gate: BillingGate,
    pub usage: Arc<UsageReporter>,
    pub bus: Arc<EventBus>,
    pub engine: Arc<dyn AgentEngine>,
    pub sessions: Arc<SessionRegistry>,
    pub limiter: Arc<RateLimiter>,
    /// Agent ids a model string may select
    pub known_agents: Vec<String>,
}

impl AppState {
    /// Assemble state from validated args and already-resolved secrets.
    ///
    /// `iam_client_secret` and `commerce_service_token` must be cleartext;
    /// reference strings never reach request handling.
    pub fn new(
        args: Args,
        auth: ResolvedAuth,
        iam_client_secret: Option<String>,
        commerce_service_token: Option<String>,
        engine: Arc<dyn AgentEngine>,
    ) -> Self {
        let origin = Arc::new(OriginPolicy::new(&args.allowed_origin_list()));

        let identity = match (&args.iam_issuer, &args.iam_client_id) {
            (Some(issuer), Some(client_id)) => Some(Arc::new(IdentityProviderClient::new(
                issuer.clone(),
                client_id.clone(),
                iam_client_secret,
                args.iam_audience.clone(),
            ))),
            _ => None,
        };

        let commerce = Arc::new(CommerceClient::from_args(
            &args,
            commerce_service_token.clone(),
        ));
        let billing_enabled = identity.is_some() && commerce.is_configured();
        let gate = BillingGate::new(commerce, billing_enabled);

        let usage = if args.commerce_api_url.is_some() {
            Arc::new(UsageReporter::new(
                args.commerce_api_url.clone(),
                commerce_service_token,
            ))
        } else {
            Arc::new(UsageReporter::disabled())
        };

        let limiter = Arc::new(RateLimiter::from_args(&args));
        let known_agents = args.known_agent_list();

        Self {
            args,
            auth,
            origin,
            identity,
            gate,
            usage,
            bus: Arc::new(EventBus::new()),
            engine,
            sessions: Arc::new(SessionRegistry::new()),
            limiter,
            known_agents,
        }
    }
}

/// Bind and serve until the process exits
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen)
        .await
        .map_err(GatewayError::Bind)?;

    info!(
        "gatehouse listening on {} (auth mode: {})",
        state.args.listen, state.auth.mode
    );
    if state.args.dev_mode {
        warn!("Development mode enabled - auth requirements relaxed");
    }

    spawn_idle_sweeper(
        Arc::clone(&state.sessions),
        SWEEP_INTERVAL,
        Duration::from_secs(state.args.idle_timeout_secs),
    );

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    info!("[{}] {} {}", addr, method, path);

    // Identity-provider proxy routes consume the request
    if path.starts_with("/auth") {
        if let Some(response) = routes::handle_auth_request(req, Arc::clone(&state)).await {
            return Ok(response);
        }
        return Ok(to_boxed(not_found_response(&path)));
    }

    let response = match (method, path.as_str()) {
        (Method::OPTIONS, _) => preflight_response(&state, &req),

        (Method::GET, "/health") | (Method::GET, "/healthz") => {
            to_boxed(routes::health_check(Arc::clone(&state)))
        }

        (Method::GET, "/version") => to_boxed(routes::version_info()),

        (Method::POST, "/v1/chat/completions") => {
            return Ok(handle_chat(state, addr, req).await);
        }
        (_, "/v1/chat/completions") => method_not_allowed(&["POST"]),

        // Gateway WebSocket endpoint
        (Method::GET, p) if p == state.args.ws_path => {
            if hyper_tungstenite::is_upgrade_request(&req) {
                to_boxed(websocket::handle_upgrade(state, req, addr).await)
            } else {
                to_boxed(bad_request_response("WebSocket upgrade required"))
            }
        }

        _ => to_boxed(not_found_response(&path)),
    };

    Ok(response)
}

/// Authorize and dispatch a chat-completions request
async fn handle_chat(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Response<BoxBody> {
    let bearer = extract_bearer(&req);
    let meta = request_meta(&req, addr);
    let tenant_params = tenant_params_from_query(&req);
    let connect = ConnectAuth {
        token: bearer.clone(),
        password: None,
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

    let (identity, tenant) = match outcome {
        AuthOutcome::Ok {
            identity, tenant, ..
        } => (identity, tenant),
        AuthOutcome::Fail { reason } => {
            return json_response(
                StatusCode::UNAUTHORIZED,
                &json!({"error": {"reason": reason}}),
            );
        }
    };

    let body = match read_body(req.into_body(), state.args.max_body_bytes).await {
        Ok(body) => body,
        Err(GatewayError::PayloadTooLarge { limit }) => {
            return json_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &json!({"error": {
                    "message": format!("request body exceeds {} bytes", limit),
                    "type": "invalid_request_error",
                }}),
            );
        }
        Err(e) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &json!({"error": {"message": e.to_string(), "type": "invalid_request_error"}}),
            );
        }
    };

    routes::handle_chat_completions(state, body, identity, tenant, bearer).await
}

/// Read a request body enforcing the configured byte cap
pub async fn read_body(body: Incoming, limit: usize) -> Result<Bytes> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() => {
            Err(GatewayError::PayloadTooLarge { limit })
        }
        Err(e) => Err(GatewayError::internal(format!("body read: {}", e))),
    }
}

/// Bearer credentials from the Authorization header or query string
pub fn extract_bearer<B>(req: &Request<B>) -> Option<String> {
    if let Some(header) = req.headers().get("authorization") {
        if let Ok(value) = header.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer ")) {
                let token = token.trim();
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }

    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "token" || key == "access_token")
        .map(|(_, value)| value.into_owned())
        .filter(|v| !v.is_empty())
}

/// Request metadata consumed by the mesh-identity check
pub fn request_meta<B>(req: &Request<B>, addr: SocketAddr) -> RequestMeta {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    RequestMeta {
        peer_ip: Some(addr.ip()),
        host: header("host"),
        forwarded_for: header("x-forwarded-for"),
        forwarded_host: header("x-forwarded-host"),
        mesh_login: header("tailscale-user-login"),
    }
}

/// Explicit tenant selection via query parameters
fn tenant_params_from_query<B>(req: &Request<B>) -> TenantParams {
    let Some(query) = req.uri().query() else {
        return TenantParams::default();
    };
    let mut params = TenantParams::default();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "org" => params.org_id = Some(value.into_owned()),
            "project" => params.project_id = Some(value.into_owned()),
            "env" => params.env = Some(value.into_owned()),
            _ => {}
        }
    }
    params
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

/// Convert a Full<Bytes> body to BoxBody
pub fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

/// JSON response with the given status
pub fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<BoxBody> {
    to_boxed(
        Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap(),
    )
}

/// CORS preflight answered from the origin policy
pub fn preflight_response<B>(state: &AppState, req: &Request<B>) -> Response<BoxBody> {
    let origin = req
        .headers()
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let host = req
        .headers()
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let mut builder = Response::builder().status(StatusCode::NO_CONTENT);
    if let Some(ref origin) = origin {
        if state.origin.check(host, Some(origin)).is_allowed() {
            builder = builder
                .header("Access-Control-Allow-Origin", origin.as_str())
                .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
                .header("Access-Control-Allow-Headers", "Authorization, Content-Type")
                .header("Access-Control-Max-Age", "600")
                .header("Vary", "Origin");
        }
    }

    to_boxed(builder.body(Full::new(Bytes::new())).unwrap())
}

fn method_not_allowed(allowed: &[&str]) -> Response<BoxBody> {
    to_boxed(
        Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .header("Allow", allowed.join(", "))
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(
                json!({"error": "method not allowed"}).to_string(),
            )))
            .unwrap(),
    )
}

/// Not found response
fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    let body = json!({
        "error": "Not Found",
        "path": path,
    });
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

/// Bad request response
fn bad_request_response(message: &str) -> Response<Full<Bytes>> {
    let body = json!({
        "error": "Bad Request",
        "message": message,
    });
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

#[cfg(test)]
impl AppState {
    /// State with a scripted engine, no identity provider, and billing in
    /// personal mode; fields are public so tests can swap parts
    pub fn for_tests_inner(engine: Arc<dyn AgentEngine>) -> AppState {
        use clap::Parser;

        let args = Args::parse_from(["gatehouse", "--auth-token", "secret-A"]);
        let auth = ResolvedAuth {
            mode: crate::auth::AuthMode::Token,
            token: Some("secret-A".to_string()),
            password: None,
            allow_mesh_identity: false,
        };
        AppState::new(args, auth, None, None, engine)
    }

    pub fn for_tests(engine: Arc<dyn AgentEngine>) -> Arc<AppState> {
        Arc::new(Self::for_tests_inner(engine))
    }
}
