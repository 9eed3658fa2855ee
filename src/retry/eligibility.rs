//! Retry eligibility policies

use tonic::{Code, Status};

use crate::request::UnaryRequest;
use crate::transport::SubscribeRequest;

/// Decides whether a failed attempt against `T` may be replayed.
///
/// Implementations are total and side-effect free: "not eligible" is a
/// `false`, never an error.
pub trait EligibilityStrategy<T: ?Sized>: Send + Sync + 'static {
    fn is_eligible(&self, status: &Status, target: &T) -> bool;
}

impl<T, F> EligibilityStrategy<T> for F
where
    T: ?Sized,
    F: Fn(&Status, &T) -> bool + Send + Sync + 'static,
{
    fn is_eligible(&self, status: &Status, target: &T) -> bool {
        (self)(status, target)
    }
}

/// Unary policy: the transport code must be on the transient allow-list and
/// the operation must be safe to replay blindly. Both are required.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEligibilityStrategy;

impl DefaultEligibilityStrategy {
    pub const RETRYABLE_CODES: &'static [Code] = &[Code::Internal, Code::Unavailable];
}

impl EligibilityStrategy<UnaryRequest> for DefaultEligibilityStrategy {
    fn is_eligible(&self, status: &Status, request: &UnaryRequest) -> bool {
        Self::RETRYABLE_CODES.contains(&status.code()) && request.operation.is_idempotent()
    }
}

/// Subscription policy: resubscribe after transport-level breakage only.
/// Missing topics, auth failures and cancellation end the subscription.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriptionEligibilityStrategy;

impl SubscriptionEligibilityStrategy {
    pub const RESUBSCRIBE_CODES: &'static [Code] =
        &[Code::Internal, Code::Unavailable, Code::Unknown];
}

impl EligibilityStrategy<SubscribeRequest> for SubscriptionEligibilityStrategy {
    fn is_eligible(&self, status: &Status, _request: &SubscribeRequest) -> bool {
        Self::RESUBSCRIBE_CODES.contains(&status.code())
    }
}

/// Never replays anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetry;

impl<T: ?Sized> EligibilityStrategy<T> for NeverRetry {
    fn is_eligible(&self, _status: &Status, _target: &T) -> bool {
        false
    }
}
