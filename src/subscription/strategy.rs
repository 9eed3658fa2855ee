//! Resubscribe policy: eligibility and backoff for the subscription domain

use std::sync::Arc;
use std::time::Duration;

use tonic::Status;

use crate::retry::{
    BackoffStrategy, EligibilityStrategy, FixedDelay, RetryDecision, StopReason,
    SubscriptionEligibilityStrategy,
};
use crate::transport::SubscribeRequest;

/// Delay between resubscribe attempts when nothing else is configured.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Pairs a subscription eligibility strategy with a backoff strategy.
///
/// `attempt` counts consecutive failures since the stream last produced an
/// event, so a capped backoff gives up on a topic that never comes back while
/// a healthy one that drops now and then keeps resubscribing.
#[derive(Clone)]
pub struct SubscriptionRetryStrategy {
    eligibility: Arc<dyn EligibilityStrategy<SubscribeRequest>>,
    backoff: Arc<dyn BackoffStrategy<SubscribeRequest>>,
}

impl SubscriptionRetryStrategy {
    pub fn new<E, B>(eligibility: E, backoff: B) -> Self
    where
        E: EligibilityStrategy<SubscribeRequest>,
        B: BackoffStrategy<SubscribeRequest>,
    {
        Self {
            eligibility: Arc::new(eligibility),
            backoff: Arc::new(backoff),
        }
    }

    pub fn from_shared(
        eligibility: Arc<dyn EligibilityStrategy<SubscribeRequest>>,
        backoff: Arc<dyn BackoffStrategy<SubscribeRequest>>,
    ) -> Self {
        Self {
            eligibility,
            backoff,
        }
    }

    pub fn decide(&self, status: &Status, request: &SubscribeRequest, attempt: u32) -> RetryDecision {
        if !self.eligibility.is_eligible(status, request) {
            return RetryDecision::Stop(StopReason::NotEligible);
        }
        match self.backoff.next_delay(status, request, attempt) {
            Some(delay) => RetryDecision::RetryAfter(delay),
            None => RetryDecision::Stop(StopReason::Exhausted),
        }
    }
}

impl Default for SubscriptionRetryStrategy {
    fn default() -> Self {
        Self::new(
            SubscriptionEligibilityStrategy,
            FixedDelay::unbounded(DEFAULT_RECONNECT_DELAY),
        )
    }
}

impl std::fmt::Debug for SubscriptionRetryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRetryStrategy").finish_non_exhaustive()
    }
}
