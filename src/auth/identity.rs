//! Identity-provider JWT validation and OAuth proxying
//!
//! The gateway is a confidential OAuth client: browsers never see the client
//! secret. Token validation runs against the provider's JWKS, fetched from
//! the discovery document and cached; an unknown `kid` triggers a one-shot
//! JWKS refresh before the token is rejected.

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::types::{GatewayError, Result};

/// Why a presented JWT was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityFailure {
    InvalidToken,
    Expired,
    IssuerMismatch,
    AudienceMismatch,
    JwksUnavailable,
    Malformed,
}

impl IdentityFailure {
    /// Machine-readable reason string surfaced to callers
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityFailure::InvalidToken => "invalid_token",
            IdentityFailure::Expired => "expired",
            IdentityFailure::IssuerMismatch => "issuer_mismatch",
            IdentityFailure::AudienceMismatch => "audience_mismatch",
            IdentityFailure::JwksUnavailable => "jwks_unavailable",
            IdentityFailure::Malformed => "malformed",
        }
    }
}

/// Claims projected from a validated token. Immutable after validation.
#[derive(Debug, Clone)]
pub struct IdentityClaims {
    pub user_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    /// The "org/user" namespace component this identity belongs to
    pub owner: String,
    /// Organization ids from group claims, plus the owner
    pub org_ids: Vec<String>,
    pub roles: Vec<String>,
    /// Organization the provider reports as currently selected
    pub current_org_id: Option<String>,
    /// Full claim map for policy code
    pub raw: Map<String, Value>,
}

impl IdentityClaims {
    pub fn is_org_member(&self, org_id: &str) -> bool {
        self.org_ids.iter().any(|o| o == org_id)
    }
}

/// Subset of the OIDC discovery document the gateway consumes
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
}

/// Status and body forwarded verbatim from the identity provider
#[derive(Debug)]
pub struct ProviderResponse {
    pub status: u16,
    pub body: Value,
}

/// Validates tokens and proxies OAuth flows for one identity provider
pub struct IdentityProviderClient {
    issuer: String,
    client_id: String,
    client_secret: Option<String>,
    audience: String,
    http: reqwest::Client,
    discovery: RwLock<Option<DiscoveryDocument>>,
    jwks: RwLock<Option<JwkSet>>,
}

impl IdentityProviderClient {
    /// `client_secret` must already be dereferenced (no `kms://` values here).
    pub fn new(
        issuer: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<String>,
        audience: Option<String>,
    ) -> Self {
        let client_id = client_id.into();
        let audience = audience.unwrap_or_else(|| client_id.clone());
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self {
            issuer: issuer.into().trim_end_matches('/').to_string(),
            client_id,
            client_secret,
            audience,
            http,
            discovery: RwLock::new(None),
            jwks: RwLock::new(None),
        }
    }

    /// Validate a JWT and project its claims
    pub async fn validate(&self, token: &str) -> std::result::Result<IdentityClaims, IdentityFailure> {
        let header = decode_header(token).map_err(|_| IdentityFailure::Malformed)?;

        let key = match self.decoding_key(header.kid.as_deref(), false).await? {
            Some(key) => key,
            None => {
                // Unknown kid: refresh the JWKS once, then give up
                debug!(kid = ?header.kid, "kid miss, refreshing JWKS");
                match self.decoding_key(header.kid.as_deref(), true).await? {
                    Some(key) => key,
                    None => return Err(IdentityFailure::InvalidToken),
                }
            }
        };

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);

        let data = decode::<Value>(token, &key, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => IdentityFailure::Expired,
                ErrorKind::InvalidIssuer => IdentityFailure::IssuerMismatch,
                ErrorKind::InvalidAudience => IdentityFailure::AudienceMismatch,
                ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                    IdentityFailure::Malformed
                }
                _ => IdentityFailure::InvalidToken,
            }
        })?;

        project_claims(data.claims)
    }

    async fn decoding_key(
        &self,
        kid: Option<&str>,
        force_refresh: bool,
    ) -> std::result::Result<Option<DecodingKey>, IdentityFailure> {
        if force_refresh || self.jwks.read().await.is_none() {
            self.refresh_jwks().await?;
        }

        let jwks = self.jwks.read().await;
        let Some(ref set) = *jwks else {
            return Err(IdentityFailure::JwksUnavailable);
        };

        let jwk = match kid {
            Some(kid) => set.find(kid),
            // No kid in the header: usable only when the set is unambiguous
            None if set.keys.len() == 1 => set.keys.first(),
            None => None,
        };

        match jwk {
            Some(jwk) => DecodingKey::from_jwk(jwk)
                .map(Some)
                .map_err(|_| IdentityFailure::InvalidToken),
            None => Ok(None),
        }
    }

    async fn refresh_jwks(&self) -> std::result::Result<(), IdentityFailure> {
        let discovery = self
            .discovery_document()
            .await
            .map_err(|_| IdentityFailure::JwksUnavailable)?;

        let set: JwkSet = self
            .http
            .get(&discovery.jwks_uri)
            .send()
            .await
            .map_err(|e| {
                warn!("JWKS fetch failed: {}", e);
                IdentityFailure::JwksUnavailable
            })?
            .json()
            .await
            .map_err(|e| {
                warn!("JWKS decode failed: {}", e);
                IdentityFailure::JwksUnavailable
            })?;

        *self.jwks.write().await = Some(set);
        Ok(())
    }

    /// Fetch (or return the cached) discovery document
    pub async fn discovery_document(&self) -> Result<DiscoveryDocument> {
        if let Some(ref doc) = *self.discovery.read().await {
            return Ok(doc.clone());
        }

        let url = format!("{}/.well-known/openid-configuration", self.issuer);
        let doc: DiscoveryDocument = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| GatewayError::internal(format!("identity discovery: {}", e)))?
            .json()
            .await
            .map_err(|e| GatewayError::internal(format!("identity discovery: {}", e)))?;

        *self.discovery.write().await = Some(doc.clone());
        Ok(doc)
    }

    /// Build the provider authorization URL for a login redirect
    pub async fn authorize_url(
        &self,
        redirect_uri: &str,
        state: Option<&str>,
        scope: Option<&str>,
        code_challenge: Option<&str>,
        code_challenge_method: Option<&str>,
    ) -> Result<String> {
        let discovery = self.discovery_document().await?;
        let mut url = url::Url::parse(&discovery.authorization_endpoint)
            .map_err(|e| GatewayError::internal(format!("authorization endpoint: {}", e)))?;

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", &self.client_id);
            query.append_pair("redirect_uri", redirect_uri);
            query.append_pair("scope", scope.unwrap_or("openid profile email"));
            if let Some(state) = state {
                query.append_pair("state", state);
            }
            if let Some(challenge) = code_challenge {
                query.append_pair("code_challenge", challenge);
                query.append_pair(
                    "code_challenge_method",
                    code_challenge_method.unwrap_or("S256"),
                );
            }
        }

        Ok(url.to_string())
    }

    /// Exchange an authorization code for a token bundle
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<ProviderResponse> {
        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
            ("client_id", self.client_id.clone()),
        ];
        if let Some(ref secret) = self.client_secret {
            form.push(("client_secret", secret.clone()));
        }
        if let Some(verifier) = code_verifier {
            form.push(("code_verifier", verifier.to_string()));
        }
        self.token_request(form).await
    }

    /// Exchange a refresh token for a fresh bundle
    pub async fn refresh(&self, refresh_token: &str) -> Result<ProviderResponse> {
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", self.client_id.clone()),
        ];
        if let Some(ref secret) = self.client_secret {
            form.push(("client_secret", secret.clone()));
        }
        self.token_request(form).await
    }

    async fn token_request(&self, form: Vec<(&str, String)>) -> Result<ProviderResponse> {
        let discovery = self.discovery_document().await?;
        let response = self
            .http
            .post(&discovery.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| GatewayError::internal(format!("token endpoint: {}", e)))?;

        let status = response.status().as_u16();
        let body = response
            .json()
            .await
            .unwrap_or_else(|_| serde_json::json!({"error": "invalid_provider_response"}));
        Ok(ProviderResponse { status, body })
    }

    /// Proxy a userinfo lookup with the caller's bearer token
    pub async fn userinfo(&self, bearer: &str) -> Result<ProviderResponse> {
        let discovery = self.discovery_document().await?;
        let endpoint = discovery
            .userinfo_endpoint
            .ok_or_else(|| GatewayError::internal("provider has no userinfo endpoint"))?;

        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| GatewayError::internal(format!("userinfo: {}", e)))?;

        let status = response.status().as_u16();
        let body = response
            .json()
            .await
            .unwrap_or_else(|_| serde_json::json!({"error": "invalid_provider_response"}));
        Ok(ProviderResponse { status, body })
    }
}

/// Project a validated claim map into [`IdentityClaims`]
fn project_claims(claims: Value) -> std::result::Result<IdentityClaims, IdentityFailure> {
    let map = match claims {
        Value::Object(map) => map,
        _ => return Err(IdentityFailure::Malformed),
    };

    let user_id = match map.get("sub").and_then(Value::as_str) {
        Some(sub) if !sub.is_empty() => sub.to_string(),
        _ => return Err(IdentityFailure::Malformed),
    };

    let owner = map
        .get("owner")
        .and_then(Value::as_str)
        .unwrap_or(&user_id)
        .to_string();

    let mut org_ids: Vec<String> = map
        .get("groups")
        .and_then(Value::as_array)
        .map(|groups| {
            groups
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();
    if !org_ids.contains(&owner) {
        org_ids.push(owner.clone());
    }

    let roles = map
        .get("roles")
        .and_then(Value::as_array)
        .map(|roles| {
            roles
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();

    Ok(IdentityClaims {
        user_id: user_id.clone(),
        email: map.get("email").and_then(Value::as_str).map(String::from),
        display_name: map.get("name").and_then(Value::as_str).map(String::from),
        owner,
        org_ids,
        roles,
        current_org_id: map
            .get("currentOrgId")
            .and_then(Value::as_str)
            .map(String::from),
        raw: map,
    })
}
