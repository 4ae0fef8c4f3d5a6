//! Commerce back-end client with TTL caches
//!
//! Subscription, plan, and balance lookups are cached for 60 seconds under
//! keys that include the caller's token, so per-viewer permissions cannot
//! leak across callers. A miss issues at most one request per key per
//! process; concurrent callers await the first.

use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::types::{GatewayError, Result};

/// How long cached lookups stay fresh
pub const CACHE_TTL: Duration = Duration::from_secs(60);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Subscription record as the commerce back end reports it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
}

/// Plan record from the commerce back end
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_cents: Option<i64>,
}

/// Combined subscription view used by the gate
#[derive(Debug, Clone, Default)]
pub struct SubscriptionStatus {
    /// True iff the back end reports an `active` or `trialing` subscription
    pub active: bool,
    pub subscription: Option<Subscription>,
    pub plan: Option<Plan>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionEnvelope {
    #[serde(default)]
    subscription: Option<Subscription>,
}

#[derive(Debug, Deserialize)]
struct BalanceEnvelope {
    /// Prepaid balance in integer cents
    balance: i64,
}

struct CacheEntry<T> {
    value: T,
    expires_at: Instant,
}

/// TTL cache with lazy stale-entry deletion on read
pub struct TtlCache<T: Clone> {
    entries: DashMap<String, CacheEntry<T>>,
    ttl: Duration,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let stale = match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if stale {
            self.entries.remove(key);
        }
        None
    }

    pub fn put(&self, key: String, value: T) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Lookup seam the billing gate depends on; lets tests stub commerce
#[async_trait]
pub trait BillingLookup: Send + Sync {
    async fn subscription_status(
        &self,
        org_id: &str,
        token: Option<&str>,
    ) -> Result<SubscriptionStatus>;
    async fn balance(&self, user_id: &str, token: Option<&str>) -> Result<i64>;
}

/// HTTP client for the commerce back end
pub struct CommerceClient {
    base_url: Option<String>,
    service_token: Option<String>,
    basic_user: Option<String>,
    basic_password: Option<String>,
    http: reqwest::Client,
    subscriptions: TtlCache<SubscriptionStatus>,
    plans: TtlCache<Option<Plan>>,
    balances: TtlCache<i64>,
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl CommerceClient {
    pub fn new(
        base_url: Option<String>,
        service_token: Option<String>,
        basic_user: Option<String>,
        basic_password: Option<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
            service_token,
            basic_user,
            basic_password,
            http,
            subscriptions: TtlCache::new(CACHE_TTL),
            plans: TtlCache::new(CACHE_TTL),
            balances: TtlCache::new(CACHE_TTL),
            inflight: DashMap::new(),
        }
    }

    pub fn from_args(args: &crate::config::Args, service_token: Option<String>) -> Self {
        Self::new(
            args.commerce_api_url.clone(),
            service_token,
            args.commerce_basic_user.clone(),
            args.commerce_basic_password.clone(),
        )
    }

    pub fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }

    /// Authorization header value. Precedence: caller bearer, then the
    /// process service token, then basic credentials.
    fn authorization(&self, caller_token: Option<&str>) -> Option<String> {
        if let Some(token) = caller_token {
            return Some(format!("Bearer {}", token));
        }
        if let Some(ref token) = self.service_token {
            return Some(format!("Bearer {}", token));
        }
        if let (Some(ref user), Some(ref password)) = (&self.basic_user, &self.basic_password) {
            let raw = format!("{}:{}", user, password);
            let encoded = base64::engine::general_purpose::STANDARD.encode(raw);
            return Some(format!("Basic {}", encoded));
        }
        None
    }

    fn base_url(&self) -> Result<&str> {
        self.base_url
            .as_deref()
            .ok_or_else(|| GatewayError::internal("commerce back end not configured"))
    }

    async fn get_json(&self, url: &str, token: Option<&str>) -> Result<reqwest::Response> {
        let mut request = self.http.get(url);
        if let Some(header) = self.authorization(token) {
            request = request.header("Authorization", header);
        }
        request
            .send()
            .await
            .map_err(|e| GatewayError::internal(format!("commerce request: {}", e)))
    }

    /// Serialize cache misses for one key; concurrent callers await the first
    async fn key_guard(&self, key: &str) -> Arc<Mutex<()>> {
        self.inflight
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Fetch a plan. A 404 is cached as `None` to prevent stampedes.
    pub async fn plan(&self, plan_id: &str, token: Option<&str>) -> Result<Option<Plan>> {
        let key = format!("{}:{}", plan_id, token.unwrap_or(""));
        if let Some(plan) = self.plans.get(&key) {
            return Ok(plan);
        }

        let guard = self.key_guard(&key).await;
        let _locked = guard.lock().await;
        if let Some(plan) = self.plans.get(&key) {
            return Ok(plan);
        }

        let url = format!("{}/v1/plans/{}", self.base_url()?, plan_id);
        let response = self.get_json(&url, token).await?;
        let plan = match response.status().as_u16() {
            404 => None,
            status if (200..300).contains(&status) => Some(
                response
                    .json::<Plan>()
                    .await
                    .map_err(|e| GatewayError::internal(format!("commerce plan: {}", e)))?,
            ),
            status => {
                return Err(GatewayError::internal(format!(
                    "commerce plan lookup returned {}",
                    status
                )))
            }
        };

        self.plans.put(key.clone(), plan.clone());
        self.inflight.remove(&key);
        Ok(plan)
    }

    async fn fetch_subscription_status(
        &self,
        org_id: &str,
        token: Option<&str>,
    ) -> Result<SubscriptionStatus> {
        let url = format!("{}/v1/subscriptions?org_id={}", self.base_url()?, org_id);
        let response = self.get_json(&url, token).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::internal(format!(
                "commerce subscription lookup returned {}",
                status
            )));
        }

        let envelope: SubscriptionEnvelope = response
            .json()
            .await
            .map_err(|e| GatewayError::internal(format!("commerce subscription: {}", e)))?;

        let active = envelope
            .subscription
            .as_ref()
            .map(|s| matches!(s.status.as_str(), "active" | "trialing"))
            .unwrap_or(false);

        let plan = match envelope.subscription.as_ref().and_then(|s| s.plan_id.as_deref()) {
            Some(plan_id) => self.plan(plan_id, token).await?,
            None => None,
        };

        Ok(SubscriptionStatus {
            active,
            subscription: envelope.subscription,
            plan,
        })
    }
}

#[async_trait]
impl BillingLookup for CommerceClient {
    async fn subscription_status(
        &self,
        org_id: &str,
        token: Option<&str>,
    ) -> Result<SubscriptionStatus> {
        let key = format!("{}:{}", org_id, token.unwrap_or(""));
        if let Some(status) = self.subscriptions.get(&key) {
            return Ok(status);
        }

        let guard = self.key_guard(&key).await;
        let _locked = guard.lock().await;
        if let Some(status) = self.subscriptions.get(&key) {
            return Ok(status);
        }

        let status = self.fetch_subscription_status(org_id, token).await?;
        debug!(org_id, active = status.active, "subscription status fetched");
        self.subscriptions.put(key.clone(), status.clone());
        self.inflight.remove(&key);
        Ok(status)
    }

    async fn balance(&self, user_id: &str, token: Option<&str>) -> Result<i64> {
        let key = format!("{}:{}", user_id, token.unwrap_or(""));
        if let Some(balance) = self.balances.get(&key) {
            return Ok(balance);
        }

        let guard = self.key_guard(&key).await;
        let _locked = guard.lock().await;
        if let Some(balance) = self.balances.get(&key) {
            return Ok(balance);
        }

        let url = format!("{}/v1/balances/{}", self.base_url()?, user_id);
        let response = self.get_json(&url, token).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::internal(format!(
                "commerce balance lookup returned {}",
                status
            )));
        }

        let envelope: BalanceEnvelope = response
            .json()
            .await
            .map_err(|e| GatewayError::internal(format!("commerce balance: {}", e)))?;

        self.balances.put(key.clone(), envelope.balance);
        self.inflight.remove(&key);
        Ok(envelope.balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_cache_round_trip() {
        let cache: TtlCache<i64> = TtlCache::new(Duration::from_secs(60));
        assert_eq!(cache.get("user-1:"), None);
        cache.put("user-1:".to_string(), 1200);
        assert_eq!(cache.get("user-1:"), Some(1200));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_ttl_cache_expires_lazily() {
        let cache: TtlCache<i64> = TtlCache::new(Duration::from_millis(10));
        cache.put("k".to_string(), 7);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("k"), None);
        // The stale entry was deleted on read
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_keys_include_token() {
        let cache: TtlCache<i64> = TtlCache::new(Duration::from_secs(60));
        cache.put("user-1:token-a".to_string(), 100);
        assert_eq!(cache.get("user-1:token-b"), None);
    }

    #[test]
    fn test_authorization_precedence() {
        let full = CommerceClient::new(
            Some("https://commerce.example".into()),
            Some("svc-token".into()),
            Some("user".into()),
            Some("pass".into()),
        );
        assert_eq!(
            full.authorization(Some("caller")),
            Some("Bearer caller".to_string())
        );
        assert_eq!(
            full.authorization(None),
            Some("Bearer svc-token".to_string())
        );

        let basic_only = CommerceClient::new(
            Some("https://commerce.example".into()),
            None,
            Some("user".into()),
            Some("pass".into()),
        );
        let header = basic_only.authorization(None).unwrap();
        assert!(header.starts_with("Basic "));

        let bare = CommerceClient::new(Some("https://commerce.example".into()), None, None, None);
        assert_eq!(bare.authorization(None), None);
    }

    #[test]
    fn test_unconfigured_client() {
        let client = CommerceClient::new(None, None, None, None);
        assert!(!client.is_configured());
        assert!(client.base_url().is_err());
    }
}
