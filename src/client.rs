//! Composition root: unary calls and topic subscriptions behind one handle
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use tower_cache::{CacheClient, ClientConfig, Operation, UnaryRequest, UnaryResponse, ClientError};
//! # async fn demo(stream: Arc<dyn tower_cache::StreamTransport>) -> tower_cache::Result<()> {
//! let transport = tower::service_fn(|req: UnaryRequest| async move {
//!     Ok::<_, ClientError>(UnaryResponse::new(req.payload))
//! });
//! let client = CacheClient::builder(ClientConfig::default()).build(transport, stream)?;
//! let resp = client
//!     .execute(UnaryRequest::new("my-cache", Operation::Get, "key"))
//!     .await?;
//! # let _ = resp;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;

use tokio::time::timeout_at;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tower::{Service, ServiceExt};
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::headers::{HeaderLayer, DEFAULT_RUNTIME_VERSION};
use crate::limiter::AdmissionLimiter;
use crate::pipeline::{Middleware, Pipeline, UnarySvc};
use crate::request::{UnaryRequest, UnaryResponse};
use crate::retry::{
    BackoffStrategy, DefaultEligibilityStrategy, EligibilityStrategy, ExponentialBackoff,
    FixedDelay, RetryLayer, SubscriptionEligibilityStrategy,
};
use crate::subscription::{Subscription, SubscriptionRetryStrategy};
use crate::transport::{StreamTransport, SubscribeRequest};

/// Cheap to clone; clones share the admission pool and the connection's
/// send-once header state.
#[derive(Clone)]
pub struct CacheClient {
    config: Arc<ClientConfig>,
    unary: UnarySvc,
    limiter: Arc<AdmissionLimiter>,
    headers: HeaderLayer,
    stream: Arc<dyn StreamTransport>,
    subscription_strategy: SubscriptionRetryStrategy,
    stage_names: Arc<[String]>,
}

impl CacheClient {
    pub fn builder(config: ClientConfig) -> CacheClientBuilder {
        CacheClientBuilder::new(config)
    }

    /// Run one unary call through admission, headers and retry.
    ///
    /// A request without a deadline gets the configured default. The deadline
    /// also bounds the wait for an admission ticket.
    pub fn execute(&self, mut request: UnaryRequest) -> impl Future<Output = Result<UnaryResponse>> + Send + 'static {
        if request.options.deadline.is_none() {
            if let Some(timeout) = self.config.default_deadline() {
                request.options.deadline = Some(tokio::time::Instant::now() + timeout);
            }
        }
        let deadline = request.options.deadline;
        let call = self.unary.clone().oneshot(request);
        async move {
            match deadline {
                Some(deadline) => match timeout_at(deadline, call).await {
                    Ok(res) => res,
                    Err(_elapsed) => Err(ClientError::deadline_exceeded(0, None)),
                },
                None => call.await,
            }
        }
    }

    /// Subscribe to `topic` in `cache`. Dropping the subscription stops it.
    pub fn subscribe(&self, cache_name: impl Into<String>, topic: impl Into<String>) -> Result<Subscription> {
        self.subscribe_with_cancellation(cache_name, topic, CancellationToken::new())
    }

    /// Like [`subscribe`](Self::subscribe), also stopped when `cancel` fires.
    pub fn subscribe_with_cancellation(
        &self,
        cache_name: impl Into<String>,
        topic: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<Subscription> {
        let request = SubscribeRequest::new(cache_name, topic);
        if request.cache_name.is_empty() || request.topic.is_empty() {
            return Err(Status::invalid_argument("cache name and topic must be non-empty").into());
        }
        let subscription = Subscription::start(
            self.stream.clone(),
            request,
            self.subscription_strategy.clone(),
            self.config.subscription.queue_capacity,
            cancel.child_token(),
        )?;
        debug!(subscription_id = subscription.id(), "subscription started");
        Ok(subscription)
    }

    pub fn limiter(&self) -> &Arc<AdmissionLimiter> {
        &self.limiter
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Pipeline stages from outermost to innermost.
    pub fn stage_names(&self) -> &[String] {
        &self.stage_names
    }

    /// Whether the send-once headers have gone out on this connection.
    pub fn sent_connection_headers(&self) -> bool {
        self.headers.sent()
    }
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient")
            .field("stages", &self.stage_names)
            .field("outstanding", &self.limiter.outstanding())
            .finish_non_exhaustive()
    }
}

pub struct CacheClientBuilder {
    config: ClientConfig,
    runtime_version: String,
    eligibility: Arc<dyn EligibilityStrategy<UnaryRequest>>,
    backoff: Option<Arc<dyn BackoffStrategy<UnaryRequest>>>,
    subscription_eligibility: Arc<dyn EligibilityStrategy<SubscribeRequest>>,
    subscription_backoff: Option<Arc<dyn BackoffStrategy<SubscribeRequest>>>,
    extra_stages: Vec<Arc<dyn Middleware>>,
}

impl CacheClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            runtime_version: DEFAULT_RUNTIME_VERSION.to_string(),
            eligibility: Arc::new(DefaultEligibilityStrategy),
            backoff: None,
            subscription_eligibility: Arc::new(SubscriptionEligibilityStrategy),
            subscription_backoff: None,
            extra_stages: Vec::new(),
        }
    }

    /// Unary retry eligibility. Defaults to [`DefaultEligibilityStrategy`].
    pub fn eligibility<E: EligibilityStrategy<UnaryRequest>>(mut self, eligibility: E) -> Self {
        self.eligibility = Arc::new(eligibility);
        self
    }

    /// Unary backoff. Defaults to one derived from `config.retry`.
    pub fn backoff<B: BackoffStrategy<UnaryRequest>>(mut self, backoff: B) -> Self {
        self.backoff = Some(Arc::new(backoff));
        self
    }

    pub fn subscription_eligibility<E: EligibilityStrategy<SubscribeRequest>>(mut self, eligibility: E) -> Self {
        self.subscription_eligibility = Arc::new(eligibility);
        self
    }

    pub fn subscription_backoff<B: BackoffStrategy<SubscribeRequest>>(mut self, backoff: B) -> Self {
        self.subscription_backoff = Some(Arc::new(backoff));
        self
    }

    pub fn runtime_version(mut self, version: impl Into<String>) -> Self {
        self.runtime_version = version.into();
        self
    }

    /// Extra stage placed inside retry, so it runs once per attempt.
    pub fn stage<M: Middleware + 'static>(mut self, stage: M) -> Self {
        self.extra_stages.push(Arc::new(stage));
        self
    }

    pub fn build<T>(self, unary: T, stream: Arc<dyn StreamTransport>) -> Result<CacheClient>
    where
        T: Service<UnaryRequest, Response = UnaryResponse, Error = ClientError> + Clone + Send + 'static,
        T::Future: Send + 'static,
    {
        self.config.validate()?;

        let limiter = Arc::new(AdmissionLimiter::new(self.config.max_concurrent_requests)?);
        let headers = HeaderLayer::new(&self.config.agent, &self.runtime_version)?;
        let backoff = self
            .backoff
            .unwrap_or_else(|| unary_backoff_from(&self.config));
        let retry = RetryLayer::from_shared(self.eligibility, backoff);

        let pipeline = self
            .extra_stages
            .into_iter()
            .fold(Pipeline::standard(limiter.clone(), headers.clone(), retry), |p, s| p.stage_arc(s));
        let stage_names: Arc<[String]> = pipeline
            .stage_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let unary = pipeline.service(unary);

        let subscription_backoff = self.subscription_backoff.unwrap_or_else(|| {
            Arc::new(FixedDelay {
                delay: self.config.subscription.reconnect_delay(),
                max_attempts: self.config.subscription.max_reconnect_attempts,
            })
        });
        let subscription_strategy =
            SubscriptionRetryStrategy::from_shared(self.subscription_eligibility, subscription_backoff);

        debug!(stages = ?stage_names, capacity = limiter.capacity(), "cache client built");
        Ok(CacheClient {
            config: Arc::new(self.config),
            unary,
            limiter,
            headers,
            stream,
            subscription_strategy,
            stage_names,
        })
    }
}

/// Fixed delay when the multiplier is 1, exponential otherwise.
fn unary_backoff_from(config: &ClientConfig) -> Arc<dyn BackoffStrategy<UnaryRequest>> {
    let retry = &config.retry;
    if retry.backoff_multiplier <= 1.0 {
        Arc::new(FixedDelay::new(retry.base_delay(), retry.max_attempts))
    } else {
        Arc::new(ExponentialBackoff::new(
            retry.base_delay(),
            retry.backoff_multiplier,
            retry.max_delay(),
            retry.max_attempts,
        ))
    }
}
