//! Billing: commerce lookups, the admission gate, and usage reporting
//!
//! Lookups are TTL-cached and single-flighted; the gate combines prepaid
//! balance and subscription signals and fails closed when the commerce back
//! end is unreachable. Usage reporting is best-effort by design.

pub mod client;
pub mod gate;
pub mod usage;

pub use client::{BillingLookup, CommerceClient, Plan, Subscription, SubscriptionStatus};
pub use gate::{BillingGate, GateDecision};
pub use usage::{UsageRecord, UsageReporter};
