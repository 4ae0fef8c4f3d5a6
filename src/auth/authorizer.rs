//! Per-connection authorization
//!
//! One decision tree covers every configured auth mode. The optional rate
//! limiter is consulted before any credential comparison; a success resets
//! the caller's window.

use std::net::IpAddr;
use tracing::debug;

use super::identity::{IdentityClaims, IdentityProviderClient};
use super::rate_limit::RateLimiter;
use super::tenant::{self, TenantParams};
use super::{AuthMode, ResolvedAuth, TenantContext};
use crate::types::GatewayError;

/// Credentials presented by the connecting peer
#[derive(Debug, Clone, Default)]
pub struct ConnectAuth {
    /// Bearer token (header or query or connect frame)
    pub token: Option<String>,
    /// Password from the connect frame
    pub password: Option<String>,
}

/// Request metadata the mesh-identity check needs
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub peer_ip: Option<IpAddr>,
    pub host: Option<String>,
    pub forwarded_for: Option<String>,
    pub forwarded_host: Option<String>,
    /// Login header injected by the mesh proxy
    pub mesh_login: Option<String>,
}

/// Authorization decision
#[derive(Debug)]
pub enum AuthOutcome {
    Ok {
        /// External method name; mesh identity keeps its legacy name
        method: &'static str,
        identity: Option<IdentityClaims>,
        tenant: Option<TenantContext>,
    },
    Fail {
        reason: String,
    },
}

impl AuthOutcome {
    fn fail(reason: impl Into<String>) -> Self {
        AuthOutcome::Fail {
            reason: reason.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, AuthOutcome::Ok { .. })
    }
}

/// Authorize one connection or request.
pub async fn authorize(
    auth: &ResolvedAuth,
    connect: &ConnectAuth,
    meta: &RequestMeta,
    tenant_params: &TenantParams,
    validator: Option<&IdentityProviderClient>,
    limiter: Option<&RateLimiter>,
    mesh_host_suffix: &str,
) -> AuthOutcome {
    if let (Some(limiter), Some(ip)) = (limiter, meta.peer_ip) {
        if let Some(seconds) = limiter.check(ip).await {
            debug!(%ip, seconds, "auth rate limited");
            return AuthOutcome::fail("rate_limited");
        }
    }

    let outcome = decide(auth, connect, meta, tenant_params, validator, mesh_host_suffix).await;

    if let (Some(limiter), Some(ip)) = (limiter, meta.peer_ip) {
        match &outcome {
            AuthOutcome::Ok { .. } => limiter.reset(ip).await,
            AuthOutcome::Fail { .. } => limiter.record_failure(ip).await,
        }
    }

    outcome
}

async fn decide(
    auth: &ResolvedAuth,
    connect: &ConnectAuth,
    meta: &RequestMeta,
    tenant_params: &TenantParams,
    validator: Option<&IdentityProviderClient>,
    mesh_host_suffix: &str,
) -> AuthOutcome {
    match auth.mode {
        AuthMode::Token => {
            let Some(ref expected) = auth.token else {
                return AuthOutcome::fail("token_missing_config");
            };
            match connect.token.as_deref() {
                None => mesh_fallback(auth, meta, tenant_params, mesh_host_suffix)
                    .unwrap_or_else(|| AuthOutcome::fail("token_missing")),
                Some(supplied) if supplied == expected.as_str() => AuthOutcome::Ok {
                    method: "token",
                    identity: None,
                    tenant: None,
                },
                Some(_) => AuthOutcome::fail("token_mismatch"),
            }
        }

        AuthMode::Password => {
            let Some(ref expected) = auth.password else {
                return AuthOutcome::fail("password_missing_config");
            };
            match connect.password.as_deref() {
                None => mesh_fallback(auth, meta, tenant_params, mesh_host_suffix)
                    .unwrap_or_else(|| AuthOutcome::fail("password_missing")),
                Some(supplied) if supplied == expected.as_str() => AuthOutcome::Ok {
                    method: "password",
                    identity: None,
                    tenant: None,
                },
                Some(_) => AuthOutcome::fail("password_mismatch"),
            }
        }

        AuthMode::Identity => {
            let Some(validator) = validator else {
                return AuthOutcome::fail("token_missing_config");
            };
            let Some(ref bearer) = connect.token else {
                return mesh_fallback(auth, meta, tenant_params, mesh_host_suffix)
                    .unwrap_or_else(|| AuthOutcome::fail("token_missing"));
            };

            let identity = match validator.validate(bearer).await {
                Ok(identity) => identity,
                Err(failure) => return AuthOutcome::fail(failure.as_str()),
            };
            with_tenant("identity", identity, tenant_params)
        }

        AuthMode::Mesh => mesh_fallback(auth, meta, tenant_params, mesh_host_suffix)
            .unwrap_or_else(|| AuthOutcome::fail("mesh_identity_required")),
    }
}

/// Accept the mesh-supplied login as identity when the peer is mesh-resident.
///
/// Returns `None` when the fallback does not apply so the caller can report
/// the mode-specific failure instead.
fn mesh_fallback(
    auth: &ResolvedAuth,
    meta: &RequestMeta,
    tenant_params: &TenantParams,
    mesh_host_suffix: &str,
) -> Option<AuthOutcome> {
    if !auth.allow_mesh_identity || !is_mesh_resident(meta, mesh_host_suffix) {
        return None;
    }
    let login = meta.mesh_login.as_deref()?.trim();
    if login.is_empty() {
        return None;
    }

    let mut raw = serde_json::Map::new();
    raw.insert("login".to_string(), serde_json::Value::String(login.to_string()));
    let identity = IdentityClaims {
        user_id: login.to_string(),
        email: None,
        display_name: None,
        owner: login.to_string(),
        org_ids: vec![login.to_string()],
        roles: vec![],
        current_org_id: None,
        raw,
    };
    // Legacy external name for the mesh method
    Some(with_tenant("tailscale", identity, tenant_params))
}

fn with_tenant(
    method: &'static str,
    identity: IdentityClaims,
    params: &TenantParams,
) -> AuthOutcome {
    let tenant = tenant::resolve_tenant(params, &identity);
    if let Some(ref tenant) = tenant {
        if let Err(GatewayError::Auth { reason }) =
            tenant::validate_tenant_access(tenant, &identity)
        {
            return AuthOutcome::Fail { reason };
        }
    }
    AuthOutcome::Ok {
        method,
        identity: Some(identity),
        tenant,
    }
}

/// A peer counts as mesh-resident when it reaches us over loopback with a
/// mesh-suffixed host, or through a mesh-issued forwarded chain.
fn is_mesh_resident(meta: &RequestMeta, suffix: &str) -> bool {
    let peer_loopback = meta.peer_ip.is_some_and(|ip| ip.is_loopback());
    let host_meshy = host_matches(meta.host.as_deref(), suffix);
    let forwarded_meshy =
        host_matches(meta.forwarded_host.as_deref(), suffix) && meta.forwarded_for.is_some();

    (peer_loopback && host_meshy) || forwarded_meshy
}

fn host_matches(host: Option<&str>, suffix: &str) -> bool {
    let Some(host) = host else { return false };
    let name = host
        .rsplit_once(':')
        .map(|(name, port)| {
            if port.chars().all(|c| c.is_ascii_digit()) {
                name
            } else {
                host
            }
        })
        .unwrap_or(host);
    name.to_ascii_lowercase().ends_with(suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn token_auth(token: &str) -> ResolvedAuth {
        ResolvedAuth {
            mode: AuthMode::Token,
            token: Some(token.to_string()),
            password: None,
            allow_mesh_identity: false,
        }
    }

    fn connect_token(token: &str) -> ConnectAuth {
        ConnectAuth {
            token: Some(token.to_string()),
            password: None,
        }
    }

    async fn run(auth: &ResolvedAuth, connect: &ConnectAuth, meta: &RequestMeta) -> AuthOutcome {
        authorize(
            auth,
            connect,
            meta,
            &TenantParams::default(),
            None,
            None,
            ".ts.net",
        )
        .await
    }

    fn reason(outcome: &AuthOutcome) -> &str {
        match outcome {
            AuthOutcome::Fail { reason } => reason,
            AuthOutcome::Ok { .. } => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_token_mode() {
        let auth = token_auth("secret-A");
        let meta = RequestMeta::default();

        let ok = run(&auth, &connect_token("secret-A"), &meta).await;
        match ok {
            AuthOutcome::Ok { method, .. } => assert_eq!(method, "token"),
            _ => panic!("expected ok"),
        }

        let mismatch = run(&auth, &connect_token("wrong"), &meta).await;
        assert_eq!(reason(&mismatch), "token_mismatch");

        let missing = run(&auth, &ConnectAuth::default(), &meta).await;
        assert_eq!(reason(&missing), "token_missing");

        let unconfigured = ResolvedAuth {
            token: None,
            ..auth
        };
        let fail = run(&unconfigured, &connect_token("secret-A"), &meta).await;
        assert_eq!(reason(&fail), "token_missing_config");
    }

    #[tokio::test]
    async fn test_password_mode() {
        let auth = ResolvedAuth {
            mode: AuthMode::Password,
            token: None,
            password: Some("hunter2".to_string()),
            allow_mesh_identity: false,
        };
        let meta = RequestMeta::default();

        let ok = run(
            &auth,
            &ConnectAuth {
                token: None,
                password: Some("hunter2".to_string()),
            },
            &meta,
        )
        .await;
        assert!(ok.is_ok());

        let mismatch = run(
            &auth,
            &ConnectAuth {
                token: None,
                password: Some("wrong".to_string()),
            },
            &meta,
        )
        .await;
        assert_eq!(reason(&mismatch), "password_mismatch");

        let missing = run(&auth, &ConnectAuth::default(), &meta).await;
        assert_eq!(reason(&missing), "password_missing");
    }

    #[tokio::test]
    async fn test_mesh_fallback_on_missing_token() {
        let auth = ResolvedAuth {
            allow_mesh_identity: true,
            ..token_auth("secret-A")
        };
        let meta = RequestMeta {
            peer_ip: Some("127.0.0.1".parse().unwrap()),
            host: Some("gateway.tail1234.ts.net".to_string()),
            mesh_login: Some("ada@example".to_string()),
            ..Default::default()
        };

        let outcome = run(&auth, &ConnectAuth::default(), &meta).await;
        match outcome {
            AuthOutcome::Ok {
                method,
                identity,
                tenant,
            } => {
                assert_eq!(method, "tailscale");
                assert_eq!(identity.unwrap().user_id, "ada@example");
                assert_eq!(tenant.unwrap().org_id, "ada@example");
            }
            AuthOutcome::Fail { reason } => panic!("expected mesh ok, got {}", reason),
        }
    }

    #[tokio::test]
    async fn test_mesh_requires_residency() {
        let auth = ResolvedAuth {
            allow_mesh_identity: true,
            ..token_auth("secret-A")
        };
        // Public peer with a mesh login header is not mesh-resident
        let meta = RequestMeta {
            peer_ip: Some("203.0.113.9".parse().unwrap()),
            host: Some("gateway.example".to_string()),
            mesh_login: Some("ada@example".to_string()),
            ..Default::default()
        };
        let outcome = run(&auth, &ConnectAuth::default(), &meta).await;
        assert_eq!(reason(&outcome), "token_missing");
    }

    #[tokio::test]
    async fn test_forwarded_mesh_chain() {
        let auth = ResolvedAuth {
            mode: AuthMode::Mesh,
            token: None,
            password: None,
            allow_mesh_identity: true,
        };
        let meta = RequestMeta {
            peer_ip: Some("10.0.0.4".parse().unwrap()),
            host: Some("gateway.internal".to_string()),
            forwarded_for: Some("100.101.102.103".to_string()),
            forwarded_host: Some("gateway.tail1234.ts.net".to_string()),
            mesh_login: Some("ada@example".to_string()),
        };
        let outcome = run(&auth, &ConnectAuth::default(), &meta).await;
        assert!(outcome.is_ok());

        let no_login = RequestMeta {
            mesh_login: None,
            ..meta
        };
        let fail = run(&auth, &ConnectAuth::default(), &no_login).await;
        assert_eq!(reason(&fail), "mesh_identity_required");
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_before_credentials() {
        let auth = token_auth("secret-A");
        let limiter = RateLimiter::new(1, Duration::from_secs(60), Duration::from_secs(60));
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        let meta = RequestMeta {
            peer_ip: Some(ip),
            ..Default::default()
        };

        // One failure locks the window
        let fail = authorize(
            &auth,
            &connect_token("wrong"),
            &meta,
            &TenantParams::default(),
            None,
            Some(&limiter),
            ".ts.net",
        )
        .await;
        assert_eq!(reason(&fail), "token_mismatch");

        // Correct credentials are not even compared while locked out
        let locked = authorize(
            &auth,
            &connect_token("secret-A"),
            &meta,
            &TenantParams::default(),
            None,
            Some(&limiter),
            ".ts.net",
        )
        .await;
        assert_eq!(reason(&locked), "rate_limited");
    }
}
