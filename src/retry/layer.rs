//! Retry middleware
//!
//! One logical call moves through
//! `Attempting -> AwaitingResult -> Deciding -> (Delaying -> Attempting)* -> Done`.
//! Attempts are strictly sequential. The caller only ever sees the outcome of
//! the last attempt.
//!
//! Headers listed in `CallOptions::send_once_keys` ride on the first attempt
//! only; replays go out without them.
//!
//! Deadline handling: the request's deadline is set once for the logical call.
//! Every attempt runs under that same deadline, and a delay that would end past
//! it stops the loop, so the deadline bounds the sum of all attempts.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout_at, Instant};
use tonic::Status;
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, warn};

use crate::config::duration_millis;
use crate::error::ClientError;
use crate::request::UnaryRequest;
use crate::retry::backoff::BackoffStrategy;
use crate::retry::eligibility::EligibilityStrategy;

/// What the loop knows after an attempt failed.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// 1-based attempt number
    pub number: u32,
    pub last_status: Status,
    /// Wait before the next attempt; `None` when the loop stopped here.
    pub delay: Option<Duration>,
}

impl RetryAttempt {
    fn new(number: u32, error: &ClientError, decision: RetryDecision) -> Option<Self> {
        let ClientError::Service(status) = error else {
            return None;
        };
        let delay = match decision {
            RetryDecision::RetryAfter(delay) => Some(delay),
            RetryDecision::Stop(_) => None,
        };
        Some(Self {
            number,
            last_status: status.clone(),
            delay,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The failure did not come from the service (client-local or internal).
    NotRetryable,
    /// Eligibility strategy refused.
    NotEligible,
    /// Backoff strategy returned `None`.
    Exhausted,
    /// The next attempt could not start before the deadline.
    DeadlineReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Stop(StopReason),
}

/// Pure decision step of the retry loop.
pub fn decide(
    eligibility: &dyn EligibilityStrategy<UnaryRequest>,
    backoff: &dyn BackoffStrategy<UnaryRequest>,
    error: &ClientError,
    request: &UnaryRequest,
    attempt: u32,
    now: Instant,
) -> RetryDecision {
    let ClientError::Service(status) = error else {
        return RetryDecision::Stop(StopReason::NotRetryable);
    };
    if !eligibility.is_eligible(status, request) {
        return RetryDecision::Stop(StopReason::NotEligible);
    }
    let Some(delay) = backoff.next_delay(status, request, attempt) else {
        return RetryDecision::Stop(StopReason::Exhausted);
    };
    if let Some(deadline) = request.options.deadline {
        if now + delay >= deadline {
            return RetryDecision::Stop(StopReason::DeadlineReached);
        }
    }
    RetryDecision::RetryAfter(delay)
}

#[derive(Clone)]
pub struct RetryLayer {
    eligibility: Arc<dyn EligibilityStrategy<UnaryRequest>>,
    backoff: Arc<dyn BackoffStrategy<UnaryRequest>>,
}

impl RetryLayer {
    pub fn new<E, B>(eligibility: E, backoff: B) -> Self
    where
        E: EligibilityStrategy<UnaryRequest>,
        B: BackoffStrategy<UnaryRequest>,
    {
        Self {
            eligibility: Arc::new(eligibility),
            backoff: Arc::new(backoff),
        }
    }

    pub fn from_shared(
        eligibility: Arc<dyn EligibilityStrategy<UnaryRequest>>,
        backoff: Arc<dyn BackoffStrategy<UnaryRequest>>,
    ) -> Self {
        Self {
            eligibility,
            backoff,
        }
    }
}

impl std::fmt::Debug for RetryLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryLayer").finish_non_exhaustive()
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = Retry<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Retry {
            inner,
            eligibility: self.eligibility.clone(),
            backoff: self.backoff.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Retry<S> {
    inner: S,
    eligibility: Arc<dyn EligibilityStrategy<UnaryRequest>>,
    backoff: Arc<dyn BackoffStrategy<UnaryRequest>>,
}

impl<S> Service<UnaryRequest> for Retry<S>
where
    S: Service<UnaryRequest, Error = ClientError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = ClientError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: UnaryRequest) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let eligibility = self.eligibility.clone();
        let backoff = self.backoff.clone();
        Box::pin(async move {
            let mut number: u32 = 1;
            let mut last: Option<RetryAttempt> = None;
            loop {
                let err = match attempt(&mut inner, req.clone(), number).await {
                    Ok(resp) => {
                        if number > 1 {
                            debug!(operation = %req.operation, attempts = number, "call succeeded after retry");
                        }
                        return Ok(resp);
                    }
                    Err(ClientError::DeadlineExceeded { attempts, .. }) => {
                        ClientError::deadline_exceeded(attempts, last.take().map(|r| r.last_status))
                    }
                    Err(err) => err,
                };
                let decision = decide(
                    eligibility.as_ref(),
                    backoff.as_ref(),
                    &err,
                    &req,
                    number,
                    Instant::now(),
                );
                let record = RetryAttempt::new(number, &err, decision);
                match (decision, record) {
                    (RetryDecision::RetryAfter(delay), Some(record)) => {
                        warn!(
                            operation = %req.operation,
                            cache = %req.cache_name,
                            attempt = record.number,
                            code = ?record.last_status.code(),
                            delay_ms = duration_millis(delay),
                            "attempt failed, retrying"
                        );
                        sleep(delay).await;
                        last = Some(record);
                        number += 1;
                        if number == 2 {
                            req.options.strip_send_once();
                        }
                    }
                    (decision, _) => {
                        debug!(
                            operation = %req.operation,
                            attempts = number,
                            ?decision,
                            error = %err,
                            "giving up"
                        );
                        return Err(err);
                    }
                }
            }
        })
    }
}

async fn attempt<S>(inner: &mut S, req: UnaryRequest, number: u32) -> Result<S::Response, ClientError>
where
    S: Service<UnaryRequest, Error = ClientError>,
{
    let deadline = req.options.deadline;
    let svc = inner.ready().await?;
    let fut = svc.call(req);
    match deadline {
        Some(deadline) => match timeout_at(deadline, fut).await {
            Ok(res) => res,
            Err(_elapsed) => Err(ClientError::deadline_exceeded(number, None)),
        },
        None => fut.await,
    }
}
