//! Secret reference resolution
//!
//! Configuration values may be literal cleartext or opaque `kms://NAME`
//! references. References are dereferenced against the secret back end using
//! a machine identity; the service access token is cached until shortly
//! before it expires. Resolution happens once at startup and failures are
//! fatal there.

use serde::Deserialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::types::{GatewayError, Result};

/// Prefix marking a value as a secret reference
pub const KMS_PREFIX: &str = "kms://";

/// Renew the cached access token this long before it would expire
const TOKEN_SAFETY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct SecretResponse {
    value: String,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Resolves `kms://` references against the secret back end
pub struct SecretResolver {
    base_url: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl SecretResolver {
    pub fn new(
        base_url: Option<String>,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self {
            base_url,
            client_id,
            client_secret,
            http,
            cached: Mutex::new(None),
        }
    }

    pub fn from_args(args: &crate::config::Args) -> Self {
        Self::new(
            args.kms_url.clone(),
            args.kms_client_id.clone(),
            args.kms_client_secret.clone(),
        )
    }

    /// Resolve a configured value into cleartext.
    ///
    /// Non-reference values pass through untouched. Reference lookups that
    /// fail bubble up so startup can abort.
    pub async fn resolve(&self, value: &str) -> Result<String> {
        let Some(name) = value.strip_prefix(KMS_PREFIX) else {
            return Ok(value.to_string());
        };
        if name.is_empty() {
            return Err(GatewayError::Secret("empty kms:// reference".to_string()));
        }

        let base = self.base_url.as_deref().ok_or_else(|| {
            GatewayError::Secret(format!("kms://{} configured but KMS_URL is not set", name))
        })?;

        let token = self.access_token(base).await?;
        let url = format!("{}/v1/secrets/{}", base.trim_end_matches('/'), name);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| GatewayError::Secret(format!("fetching {}: {}", name, e)))?;

        if !response.status().is_success() {
            return Err(GatewayError::Secret(format!(
                "fetching {}: back end returned {}",
                name,
                response.status()
            )));
        }

        let secret: SecretResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Secret(format!("decoding {}: {}", name, e)))?;

        debug!(secret = %name, "resolved secret reference");
        Ok(secret.value)
    }

    /// Resolve an optional configured value
    pub async fn resolve_opt(&self, value: Option<&str>) -> Result<Option<String>> {
        match value {
            Some(v) => Ok(Some(self.resolve(v).await?)),
            None => Ok(None),
        }
    }

    async fn access_token(&self, base: &str) -> Result<String> {
        {
            let cached = self.cached.lock().expect("secret token lock");
            if let Some(ref entry) = *cached {
                if entry.expires_at > Instant::now() {
                    return Ok(entry.token.clone());
                }
            }
        }

        let (client_id, client_secret) = match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) => (id.clone(), secret.clone()),
            _ => {
                return Err(GatewayError::Secret(
                    "KMS_CLIENT_ID and KMS_CLIENT_SECRET are required for kms:// references"
                        .to_string(),
                ))
            }
        };

        let url = format!("{}/v1/login", base.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "client_id": client_id,
                "client_secret": client_secret,
            }))
            .send()
            .await
            .map_err(|e| GatewayError::Secret(format!("login: {}", e)))?;

        if !response.status().is_success() {
            return Err(GatewayError::Secret(format!(
                "login: back end returned {}",
                response.status()
            )));
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Secret(format!("login: {}", e)))?;

        let ttl = Duration::from_secs(login.expires_in);
        let expires_at = Instant::now() + ttl.saturating_sub(TOKEN_SAFETY_MARGIN);
        let token = login.access_token.clone();
        *self.cached.lock().expect("secret token lock") = Some(CachedToken {
            token: login.access_token,
            expires_at,
        });
        Ok(token)
    }
}
