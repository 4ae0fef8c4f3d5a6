//! Configuration for Gatehouse
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::auth::AuthMode;
use crate::secrets::KMS_PREFIX;

/// Gatehouse - multi-tenant agent gateway
#[derive(Parser, Debug, Clone)]
#[command(name = "gatehouse")]
#[command(about = "Multi-tenant agent gateway with billing and identity auth")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:18789")]
    pub listen: SocketAddr,

    /// Path that accepts gateway WebSocket upgrades
    #[arg(long, env = "WS_PATH", default_value = "/")]
    pub ws_path: String,

    /// Connection auth mode (token, password, identity, mesh)
    #[arg(long, env = "AUTH_MODE", value_enum, default_value_t = AuthMode::Token)]
    pub auth_mode: AuthMode,

    /// Shared bearer token for token mode (literal or kms:// reference)
    #[arg(long, env = "GATEWAY_TOKEN")]
    pub auth_token: Option<String>,

    /// Shared password for password mode (literal or kms:// reference)
    #[arg(long, env = "GATEWAY_PASSWORD")]
    pub auth_password: Option<String>,

    /// Accept mesh-network identity headers from mesh-resident peers
    #[arg(long, env = "ALLOW_MESH_IDENTITY", default_value = "false")]
    pub allow_mesh_identity: bool,

    /// Host suffix that marks a request as arriving over the mesh
    #[arg(long, env = "MESH_HOST_SUFFIX", default_value = ".ts.net")]
    pub mesh_host_suffix: String,

    /// Comma-separated list of allowed browser origins
    #[arg(long, env = "ALLOWED_ORIGINS")]
    pub allowed_origins: Option<String>,

    /// Maximum accepted HTTP request body in bytes
    #[arg(long, env = "MAX_BODY_BYTES", default_value = "4194304")]
    pub max_body_bytes: usize,

    /// Idle seconds after which a silent WebSocket session is dropped
    #[arg(long, env = "IDLE_TIMEOUT_SECS", default_value = "300")]
    pub idle_timeout_secs: u64,

    /// Enable development mode (relaxes auth requirements)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Display name used in fallback assistant copy
    #[arg(long, env = "BOT_NAME", default_value = "Hanzo Bot")]
    pub bot_name: String,

    /// Agent id used when the requested model matches no known agent
    #[arg(long, env = "DEFAULT_AGENT", default_value = "default")]
    pub default_agent: String,

    /// Comma-separated list of known agent ids
    #[arg(long, env = "AGENTS")]
    pub agents: Option<String>,

    /// Identity provider issuer URL (enables identity mode)
    #[arg(long, env = "IAM_ISSUER")]
    pub iam_issuer: Option<String>,

    /// OAuth client id registered with the identity provider
    #[arg(long, env = "IAM_CLIENT_ID")]
    pub iam_client_id: Option<String>,

    /// OAuth client secret (literal or kms:// reference)
    #[arg(long, env = "IAM_CLIENT_SECRET")]
    pub iam_client_secret: Option<String>,

    /// Expected JWT audience (defaults to the client id)
    #[arg(long, env = "IAM_AUDIENCE")]
    pub iam_audience: Option<String>,

    /// Commerce back end base URL
    #[arg(long, env = "COMMERCE_API_URL")]
    pub commerce_api_url: Option<String>,

    /// Service bearer token for commerce calls (literal or kms:// reference)
    #[arg(long, env = "COMMERCE_SERVICE_TOKEN")]
    pub commerce_service_token: Option<String>,

    /// Basic-auth username for commerce calls (lowest precedence)
    #[arg(long, env = "COMMERCE_BASIC_USER")]
    pub commerce_basic_user: Option<String>,

    /// Basic-auth password for commerce calls
    #[arg(long, env = "COMMERCE_BASIC_PASSWORD")]
    pub commerce_basic_password: Option<String>,

    /// Secret back end base URL (required when any kms:// reference is configured)
    #[arg(long, env = "KMS_URL")]
    pub kms_url: Option<String>,

    /// Machine identity client id for the secret back end
    #[arg(long, env = "KMS_CLIENT_ID")]
    pub kms_client_id: Option<String>,

    /// Machine identity client secret for the secret back end
    #[arg(long, env = "KMS_CLIENT_SECRET")]
    pub kms_client_secret: Option<String>,

    /// Egress tunnel provider (auto, cloudflared, ngrok, localxpose, zrok, none)
    #[arg(long, env = "TUNNEL_PROVIDER", default_value = "none")]
    pub tunnel_provider: String,

    /// Auth token handed to the tunnel provider binary
    #[arg(long, env = "TUNNEL_AUTH_TOKEN")]
    pub tunnel_auth_token: Option<String>,

    /// Custom domain / subdomain for the tunnel
    #[arg(long, env = "TUNNEL_DOMAIN")]
    pub tunnel_domain: Option<String>,

    /// Directory holding tenant-scoped persistent state
    #[arg(long, env = "GATEWAY_STATE_DIR", default_value = ".gatehouse")]
    pub state_dir: PathBuf,

    /// Failed auth attempts per source IP before lockout
    #[arg(long, env = "AUTH_MAX_FAILURES", default_value = "5")]
    pub auth_max_failures: u32,

    /// Window in seconds within which auth failures are counted
    #[arg(long, env = "AUTH_FAILURE_WINDOW_SECS", default_value = "60")]
    pub auth_failure_window_secs: u64,

    /// Lockout duration in seconds after exceeding the failure limit
    #[arg(long, env = "AUTH_LOCKOUT_SECS", default_value = "60")]
    pub auth_lockout_secs: u64,
}

const TUNNEL_PROVIDERS: &[&str] = &["auto", "none", "cloudflared", "ngrok", "localxpose", "zrok"];

impl Args {
    /// Configured allow-list of browser origins
    pub fn allowed_origin_list(&self) -> Vec<String> {
        self.allowed_origins
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Known agent ids for model-string matching
    pub fn known_agent_list(&self) -> Vec<String> {
        self.agents
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Effective JWT audience
    pub fn iam_audience(&self) -> Option<&str> {
        self.iam_audience
            .as_deref()
            .or(self.iam_client_id.as_deref())
    }

    /// Whether identity-provider integration is configured
    pub fn identity_configured(&self) -> bool {
        self.iam_issuer.is_some() && self.iam_client_id.is_some()
    }

    fn uses_kms_reference(&self) -> bool {
        [
            &self.auth_token,
            &self.auth_password,
            &self.iam_client_secret,
            &self.commerce_service_token,
        ]
        .iter()
        .any(|v| v.as_deref().is_some_and(|s| s.starts_with(KMS_PREFIX)))
    }

    /// Validate configuration before startup
    pub fn validate(&self) -> Result<(), String> {
        match self.auth_mode {
            AuthMode::Token => {
                if self.auth_token.is_none() && !self.dev_mode {
                    return Err("GATEWAY_TOKEN is required in token mode".to_string());
                }
            }
            AuthMode::Password => {
                if self.auth_password.is_none() && !self.dev_mode {
                    return Err("GATEWAY_PASSWORD is required in password mode".to_string());
                }
            }
            AuthMode::Identity => {
                if !self.identity_configured() {
                    return Err(
                        "IAM_ISSUER and IAM_CLIENT_ID are required in identity mode".to_string()
                    );
                }
            }
            AuthMode::Mesh => {
                if !self.allow_mesh_identity {
                    return Err(
                        "mesh mode requires ALLOW_MESH_IDENTITY=true".to_string()
                    );
                }
            }
        }

        if self.uses_kms_reference()
            && (self.kms_url.is_none()
                || self.kms_client_id.is_none()
                || self.kms_client_secret.is_none())
        {
            return Err(
                "kms:// references require KMS_URL, KMS_CLIENT_ID and KMS_CLIENT_SECRET"
                    .to_string(),
            );
        }

        if !TUNNEL_PROVIDERS.contains(&self.tunnel_provider.as_str()) {
            return Err(format!(
                "unknown tunnel provider '{}' (expected one of {})",
                self.tunnel_provider,
                TUNNEL_PROVIDERS.join(", ")
            ));
        }

        if self.max_body_bytes == 0 {
            return Err("MAX_BODY_BYTES must be positive".to_string());
        }

        if !self.ws_path.starts_with('/') {
            return Err("WS_PATH must start with '/'".to_string());
        }

        Ok(())
    }
}
