//! Identity-provider OAuth proxy routes
//!
//! The gateway is a confidential OAuth client: these endpoints proxy the
//! login redirect, code exchange, refresh, and userinfo flows so the client
//! secret never leaves the server.
//!
//! - GET  /auth/login    - 302 redirect to the provider's authorization page
//! - GET  /auth/callback - exchange an authorization code for a token bundle
//! - POST /auth/refresh  - exchange a refresh token for a fresh bundle
//! - POST /auth/logout   - acknowledge logout (tokens are not revocable)
//! - GET  /auth/userinfo - proxy the provider's userinfo endpoint

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::auth::identity::{IdentityProviderClient, ProviderResponse};
use crate::server::http::{extract_bearer, json_response, preflight_response, BoxBody};
use crate::server::AppState;
use crate::types::GatewayError;

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

/// Dispatch `/auth/*` requests. Returns `None` for other paths.
pub async fn handle_auth_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Option<Response<BoxBody>> {
    let path = req.uri().path();
    if !path.starts_with("/auth") {
        return None;
    }

    if req.method() == Method::OPTIONS {
        return Some(preflight_response(&state, &req));
    }

    let path = path.split('?').next().unwrap_or(path).to_string();

    let Some(provider) = state.identity.clone() else {
        return Some(json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &json!({"error": "identity provider not configured"}),
        ));
    };

    let response = match (req.method().clone(), path.as_str()) {
        (Method::GET, "/auth/login") => handle_login(req, &provider).await,
        (Method::GET, "/auth/callback") => handle_callback(req, &provider).await,
        (Method::POST, "/auth/refresh") => handle_refresh(req, &provider, &state).await,
        (Method::POST, "/auth/logout") => {
            json_response(StatusCode::OK, &json!({"ok": true}))
        }
        (Method::GET, "/auth/userinfo") => handle_userinfo(req, &provider).await,

        (
            _,
            "/auth/login" | "/auth/callback" | "/auth/refresh" | "/auth/logout"
            | "/auth/userinfo",
        ) => json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            &json!({"error": "method not allowed"}),
        ),

        _ => json_response(
            StatusCode::NOT_FOUND,
            &json!({"error": "auth endpoint not found"}),
        ),
    };

    Some(response)
}

fn query_params(req: &Request<Incoming>) -> HashMap<String, String> {
    req.uri()
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

async fn handle_login(
    req: Request<Incoming>,
    provider: &IdentityProviderClient,
) -> Response<BoxBody> {
    let params = query_params(&req);
    let Some(redirect_uri) = params.get("redirect_uri") else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &json!({"error": "redirect_uri is required"}),
        );
    };

    match provider
        .authorize_url(
            redirect_uri,
            params.get("state").map(String::as_str),
            params.get("scope").map(String::as_str),
            params.get("code_challenge").map(String::as_str),
            params.get("code_challenge_method").map(String::as_str),
        )
        .await
    {
        Ok(location) => {
            debug!("redirecting login to identity provider");
            Response::builder()
                .status(StatusCode::FOUND)
                .header("Location", location)
                .body(empty_body())
                .unwrap()
        }
        Err(e) => provider_error(e),
    }
}

async fn handle_callback(
    req: Request<Incoming>,
    provider: &IdentityProviderClient,
) -> Response<BoxBody> {
    let params = query_params(&req);
    let (Some(code), Some(redirect_uri)) = (params.get("code"), params.get("redirect_uri")) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &json!({"error": "code and redirect_uri are required"}),
        );
    };

    match provider
        .exchange_code(
            code,
            redirect_uri,
            params.get("code_verifier").map(String::as_str),
        )
        .await
    {
        Ok(bundle) => forward_provider(bundle),
        Err(e) => provider_error(e),
    }
}

async fn handle_refresh(
    req: Request<Incoming>,
    provider: &IdentityProviderClient,
    state: &AppState,
) -> Response<BoxBody> {
    let body = match read_capped(req, state.args.max_body_bytes).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    let request: RefreshRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &json!({"error": format!("invalid body: {}", e)}),
            )
        }
    };

    match provider.refresh(&request.refresh_token).await {
        Ok(bundle) => forward_provider(bundle),
        Err(e) => provider_error(e),
    }
}

async fn handle_userinfo(
    req: Request<Incoming>,
    provider: &IdentityProviderClient,
) -> Response<BoxBody> {
    let Some(bearer) = extract_bearer(&req) else {
        return json_response(
            StatusCode::UNAUTHORIZED,
            &json!({"error": "bearer token required"}),
        );
    };

    match provider.userinfo(&bearer).await {
        Ok(info) => forward_provider(info),
        Err(e) => provider_error(e),
    }
}

async fn read_capped(
    req: Request<Incoming>,
    limit: usize,
) -> Result<Bytes, Response<BoxBody>> {
    match http_body_util::Limited::new(req.into_body(), limit)
        .collect()
        .await
    {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() => {
            Err(json_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &json!({"error": format!("request body exceeds {} bytes", limit)}),
            ))
        }
        Err(e) => Err(json_response(
            StatusCode::BAD_REQUEST,
            &json!({"error": format!("failed to read request body: {}", e)}),
        )),
    }
}

/// Forward the provider's status and body verbatim
fn forward_provider(response: ProviderResponse) -> Response<BoxBody> {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &response.body)
}

fn provider_error(e: GatewayError) -> Response<BoxBody> {
    warn!("identity provider call failed: {}", e);
    json_response(
        StatusCode::BAD_GATEWAY,
        &json!({"error": "identity provider unavailable"}),
    )
}

fn empty_body() -> BoxBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}
