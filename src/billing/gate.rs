//! Per-request billing admission
//!
//! Prepaid balance is the primary gate; an active subscription admits a
//! caller whose balance is exhausted. Commerce failures deny: when the
//! primary gate is a prepaid balance the gate fails closed.

use std::sync::Arc;
use tracing::warn;

use super::client::BillingLookup;
use crate::auth::TenantContext;

/// Copy shown when the balance and subscription both deny
const INSUFFICIENT_FUNDS: &str = "Insufficient funds — add credits to continue.";
/// Copy shown when commerce cannot be reached
const BILLING_UNAVAILABLE: &str = "Billing service unavailable — please try again";

/// Admission decision for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allowed,
    Denied {
        reason: String,
        /// Subscription state that produced the denial, when known
        status: Option<String>,
    },
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allowed)
    }
}

/// Billing gate bound to a commerce lookup
pub struct BillingGate {
    commerce: Arc<dyn BillingLookup>,
    /// Identity-provider billing integration configured; without it every
    /// request is personal mode and admitted
    iam_enabled: bool,
}

impl BillingGate {
    pub fn new(commerce: Arc<dyn BillingLookup>, iam_enabled: bool) -> Self {
        Self {
            commerce,
            iam_enabled,
        }
    }

    /// Decide admission for a request.
    ///
    /// Personal mode (no billing integration or no tenant) is always
    /// admitted. Otherwise: positive balance admits, then an active
    /// subscription, then deny. Commerce errors fail closed.
    pub async fn check(&self, tenant: Option<&TenantContext>, token: Option<&str>) -> GateDecision {
        let Some(tenant) = tenant else {
            return GateDecision::Allowed;
        };
        if !self.iam_enabled {
            return GateDecision::Allowed;
        }

        match self.evaluate(tenant, token).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(org = %tenant.org_id, error = %e, "billing check failed, denying");
                GateDecision::Denied {
                    reason: BILLING_UNAVAILABLE.to_string(),
                    status: None,
                }
            }
        }
    }

    async fn evaluate(
        &self,
        tenant: &TenantContext,
        token: Option<&str>,
    ) -> crate::types::Result<GateDecision> {
        let balance = self.commerce.balance(&tenant.user_id, token).await?;
        if balance > 0 {
            return Ok(GateDecision::Allowed);
        }

        let subscription = self
            .commerce
            .subscription_status(&tenant.org_id, token)
            .await?;
        if subscription.active {
            return Ok(GateDecision::Allowed);
        }

        Ok(GateDecision::Denied {
            reason: format!(
                "{} Balance: ${:.2}",
                INSUFFICIENT_FUNDS,
                balance.max(0) as f64 / 100.0
            ),
            status: subscription.subscription.map(|s| s.status),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::client::{Subscription, SubscriptionStatus};
    use crate::types::{GatewayError, Result};
    use async_trait::async_trait;

    struct StubCommerce {
        balance: Result<i64>,
        subscription: Result<SubscriptionStatus>,
    }

    #[async_trait]
    impl BillingLookup for StubCommerce {
        async fn subscription_status(
            &self,
            _org_id: &str,
            _token: Option<&str>,
        ) -> Result<SubscriptionStatus> {
            match &self.subscription {
                Ok(s) => Ok(s.clone()),
                Err(_) => Err(GatewayError::internal("commerce down")),
            }
        }

        async fn balance(&self, _user_id: &str, _token: Option<&str>) -> Result<i64> {
            match &self.balance {
                Ok(b) => Ok(*b),
                Err(_) => Err(GatewayError::internal("commerce down")),
            }
        }
    }

    fn tenant() -> TenantContext {
        TenantContext {
            org_id: "acme".into(),
            project_id: None,
            user_id: "user-1".into(),
            user_name: None,
            env: None,
        }
    }

    fn inactive_subscription() -> SubscriptionStatus {
        SubscriptionStatus {
            active: false,
            subscription: Some(Subscription {
                id: "sub-1".into(),
                status: "canceled".into(),
                plan_id: None,
            }),
            plan: None,
        }
    }

    fn gate(balance: Result<i64>, subscription: Result<SubscriptionStatus>) -> BillingGate {
        BillingGate::new(
            Arc::new(StubCommerce {
                balance,
                subscription,
            }),
            true,
        )
    }

    #[tokio::test]
    async fn test_personal_mode_allowed() {
        let gate = gate(Ok(0), Ok(SubscriptionStatus::default()));
        assert!(gate.check(None, None).await.is_allowed());

        let disabled = BillingGate::new(
            Arc::new(StubCommerce {
                balance: Ok(0),
                subscription: Ok(SubscriptionStatus::default()),
            }),
            false,
        );
        assert!(disabled.check(Some(&tenant()), None).await.is_allowed());
    }

    #[tokio::test]
    async fn test_positive_balance_allows() {
        let gate = gate(Ok(1), Ok(SubscriptionStatus::default()));
        assert!(gate.check(Some(&tenant()), None).await.is_allowed());
    }

    #[tokio::test]
    async fn test_active_subscription_allows_at_zero_balance() {
        let gate = gate(
            Ok(0),
            Ok(SubscriptionStatus {
                active: true,
                subscription: None,
                plan: None,
            }),
        );
        assert!(gate.check(Some(&tenant()), None).await.is_allowed());
    }

    #[tokio::test]
    async fn test_denied_message_includes_balance() {
        let gate = gate(Ok(0), Ok(inactive_subscription()));
        match gate.check(Some(&tenant()), None).await {
            GateDecision::Denied { reason, status } => {
                assert!(reason.contains("Insufficient funds"));
                assert!(reason.ends_with("Balance: $0.00"));
                assert_eq!(status.as_deref(), Some("canceled"));
            }
            GateDecision::Allowed => panic!("expected denial"),
        }
    }

    #[tokio::test]
    async fn test_denied_message_formats_cents() {
        // Negative balances render as $0.00; the commerce back end owes nothing
        let gate = gate(Ok(-250), Ok(inactive_subscription()));
        match gate.check(Some(&tenant()), None).await {
            GateDecision::Denied { reason, .. } => assert!(reason.ends_with("Balance: $0.00")),
            GateDecision::Allowed => panic!("expected denial"),
        }
    }

    #[tokio::test]
    async fn test_fails_closed_on_commerce_error() {
        let gate = gate(
            Err(GatewayError::internal("timeout")),
            Ok(SubscriptionStatus::default()),
        );
        match gate.check(Some(&tenant()), None).await {
            GateDecision::Denied { reason, .. } => {
                assert_eq!(reason, "Billing service unavailable — please try again")
            }
            GateDecision::Allowed => panic!("expected fail-closed denial"),
        }
    }

    #[tokio::test]
    async fn test_fails_closed_on_subscription_error() {
        let gate = gate(Ok(0), Err(GatewayError::internal("timeout")));
        assert!(!gate.check(Some(&tenant()), None).await.is_allowed());
    }
}
