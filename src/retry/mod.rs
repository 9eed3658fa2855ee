//! Unary retry: eligibility and backoff policies plus the Tower layer that
//! drives them
//!
//! Exports
//! - Policies
//!   - `EligibilityStrategy<T>`: may this failure be replayed against `T`?
//!   - `BackoffStrategy<T>`: how long to wait before attempt `n + 1`, or stop
//!   - Built-ins: `DefaultEligibilityStrategy`, `SubscriptionEligibilityStrategy`,
//!     `NeverRetry`, `FixedDelay`, `ExponentialBackoff`
//! - Layers
//!   - `RetryLayer` / `Retry<S>`: loops attempts through the inner service
//!
//! Policies are pure and hold no per-call state; attempt counters live in the
//! retry loop (unary) or the subscription pump (streaming).
//!
//! Composition
//! - `ServiceBuilder::new().layer(RetryLayer::new(eligibility, backoff)).service(transport)`

pub mod backoff;
pub mod eligibility;
pub mod layer;

pub use backoff::{BackoffStrategy, ExponentialBackoff, FixedDelay};
pub use eligibility::{
    DefaultEligibilityStrategy, EligibilityStrategy, NeverRetry, SubscriptionEligibilityStrategy,
};
pub use layer::{decide, Retry, RetryAttempt, RetryDecision, RetryLayer, StopReason};
