//! # tower-cache
//!
//! Tower-based resilience core for a cache / pub-sub client. The wire layer is
//! supplied by the caller; this crate wraps it with:
//!
//! - **Admission control**: a FIFO-fair cap on in-flight unary calls
//! - **Header injection**: connection headers sent once, routing headers on every attempt
//! - **Retry**: pluggable eligibility and backoff under one cumulative deadline
//! - **Subscriptions**: self-healing topic streams with heartbeats, discontinuity
//!   markers and resubscribe-from-last-sequence
//!
//! Unary stages are ordinary tower layers composed by a [`Pipeline`] in the
//! fixed order admission, headers, retry, transport.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tower_cache::{
//!     CacheClient, ClientConfig, ClientError, Operation, StreamTransport, SubscriptionItem,
//!     UnaryRequest, UnaryResponse,
//! };
//!
//! # async fn example(streams: Arc<dyn StreamTransport>) -> tower_cache::Result<()> {
//! let unary = tower::service_fn(|req: UnaryRequest| async move {
//!     // hand `req` to the wire layer here
//!     Ok::<_, ClientError>(UnaryResponse::new(req.payload))
//! });
//!
//! let client = CacheClient::builder(ClientConfig::default()).build(unary, streams)?;
//!
//! client
//!     .execute(UnaryRequest::new("my-cache", Operation::Set, "value"))
//!     .await?;
//!
//! let mut sub = client.subscribe("my-cache", "prices")?;
//! while let Some(item) = sub.next_event().await {
//!     match item {
//!         SubscriptionItem::Message { value, .. } => println!("{:?}", value.as_text()),
//!         SubscriptionItem::Error(err) => return Err(err),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod headers;
pub mod limiter;
pub mod pipeline;
pub mod request;
pub mod retry;
pub mod subscription;
pub mod transport;

// Public re-exports for convenience
pub use client::{CacheClient, CacheClientBuilder};
pub use config::{ClientConfig, ConfigBuilder, RetryConfig, SubscriptionConfig};
pub use error::{ClientError, ErrorKind, Result};
pub use headers::HeaderLayer;
pub use limiter::{AdmissionLayer, AdmissionLimiter, AdmissionTicket};
pub use pipeline::{LayerStage, Middleware, Pipeline, UnarySvc};
pub use request::{CallOptions, Operation, UnaryRequest, UnaryResponse};
pub use retry::{
    BackoffStrategy, DefaultEligibilityStrategy, EligibilityStrategy, ExponentialBackoff,
    FixedDelay, NeverRetry, RetryLayer, SubscriptionEligibilityStrategy,
};
pub use subscription::{
    Subscription, SubscriptionItem, SubscriptionRetryStrategy, SubscriptionState,
    SubscriptionStats,
};
pub use transport::{EventStream, StreamEvent, StreamTransport, SubscribeRequest, TopicValue};

// Re-export the token subscriptions are cancelled with
pub use tokio_util::sync::CancellationToken;

// Re-export Tower traits that users need
pub use tower::{Layer, Service, ServiceExt};
