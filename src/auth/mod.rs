//! Authentication for Gatehouse
//!
//! Provides:
//! - Auth mode resolution (shared token / shared password / identity / mesh)
//! - JWT validation against identity-provider JWKS
//! - Tenant context resolution and membership checks
//! - The per-connection authorizer and its shared rate limiter

pub mod authorizer;
pub mod identity;
pub mod rate_limit;
pub mod tenant;

use clap::ValueEnum;
use std::fmt;

use crate::config::Args;
use crate::secrets::SecretResolver;
use crate::types::Result;

pub use authorizer::{authorize, AuthOutcome, ConnectAuth, RequestMeta};
pub use identity::{IdentityClaims, IdentityFailure, IdentityProviderClient};
pub use rate_limit::RateLimiter;
pub use tenant::{sanitize_slug, TenantContext};

/// Configured connection auth mode
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMode {
    /// Shared bearer token comparison
    Token,
    /// Shared password comparison
    Password,
    /// Identity-provider-issued JWTs
    Identity,
    /// Mesh-network identity headers only
    Mesh,
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthMode::Token => "token",
            AuthMode::Password => "password",
            AuthMode::Identity => "identity",
            AuthMode::Mesh => "mesh",
        };
        f.write_str(s)
    }
}

/// Auth configuration with every secret dereferenced exactly once.
///
/// This record is the sole source consulted at request time; the original
/// reference strings never reach the authorizer.
#[derive(Debug, Clone)]
pub struct ResolvedAuth {
    pub mode: AuthMode,
    pub token: Option<String>,
    pub password: Option<String>,
    pub allow_mesh_identity: bool,
}

/// Dereference the configured auth secrets at startup
pub async fn resolve_auth(args: &Args, secrets: &SecretResolver) -> Result<ResolvedAuth> {
    let token = secrets.resolve_opt(args.auth_token.as_deref()).await?;
    let password = secrets.resolve_opt(args.auth_password.as_deref()).await?;

    Ok(ResolvedAuth {
        mode: args.auth_mode,
        token,
        password,
        allow_mesh_identity: args.allow_mesh_identity || args.auth_mode == AuthMode::Mesh,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[tokio::test]
    async fn test_resolve_auth_passes_literals() {
        let args = Args::parse_from(["gatehouse", "--auth-token", "secret-A"]);
        let secrets = SecretResolver::new(None, None, None);
        let resolved = resolve_auth(&args, &secrets).await.unwrap();
        assert_eq!(resolved.mode, AuthMode::Token);
        assert_eq!(resolved.token.as_deref(), Some("secret-A"));
        assert_eq!(resolved.password, None);
        assert!(!resolved.allow_mesh_identity);
    }

    #[tokio::test]
    async fn test_mesh_mode_implies_mesh_identity() {
        let args = Args::parse_from([
            "gatehouse",
            "--auth-mode",
            "mesh",
            "--allow-mesh-identity",
        ]);
        let secrets = SecretResolver::new(None, None, None);
        let resolved = resolve_auth(&args, &secrets).await.unwrap();
        assert!(resolved.allow_mesh_identity);
    }
}
