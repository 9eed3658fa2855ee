//! Header injection stage
//!
//! Two kinds of metadata ride on unary calls:
//! - send-once headers (`agent`, `runtime-version`) go out with the first call
//!   made through a given [`HeaderLayer`], which stands for one logical
//!   connection
//! - every-attempt headers (the `cache` routing header) go out on every call
//!
//! Keys the caller already set are never overwritten. Send-once keys that this
//! stage inserts are recorded in `CallOptions::send_once_keys` so a retry stage
//! further in replays the call without them.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tonic::metadata::{Ascii, MetadataValue};
use tonic::Status;
use tower::{Layer, Service};
use tracing::trace;

use crate::error::ClientError;
use crate::request::UnaryRequest;

pub const AGENT_HEADER: &str = "agent";
pub const RUNTIME_VERSION_HEADER: &str = "runtime-version";
pub const CACHE_HEADER: &str = "cache";

/// Runtime identifier sent in the `runtime-version` header by default.
pub const DEFAULT_RUNTIME_VERSION: &str = concat!("rust/", env!("CARGO_PKG_RUST_VERSION"));

#[derive(Debug)]
struct HeaderState {
    send_once: Vec<(&'static str, MetadataValue<Ascii>)>,
    sent: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct HeaderLayer {
    state: Arc<HeaderState>,
}

impl HeaderLayer {
    /// Build the stage for one connection. Fails if a value is not valid
    /// header text.
    pub fn new(agent: &str, runtime_version: &str) -> Result<Self, ClientError> {
        Ok(Self {
            state: Arc::new(HeaderState {
                send_once: vec![
                    (AGENT_HEADER, parse_value(AGENT_HEADER, agent)?),
                    (RUNTIME_VERSION_HEADER, parse_value(RUNTIME_VERSION_HEADER, runtime_version)?),
                ],
                sent: AtomicBool::new(false),
            }),
        })
    }

    /// Whether the send-once headers have already gone out.
    pub fn sent(&self) -> bool {
        self.state.sent.load(Ordering::Acquire)
    }
}

fn parse_value(key: &str, value: &str) -> Result<MetadataValue<Ascii>, ClientError> {
    value
        .parse()
        .map_err(|_| ClientError::config(format!("invalid value for `{key}` header: {value:?}")))
}

impl<S> Layer<S> for HeaderLayer {
    type Service = Headers<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Headers {
            inner,
            state: self.state.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Headers<S> {
    inner: S,
    state: Arc<HeaderState>,
}

impl HeaderState {
    fn apply(&self, req: &mut UnaryRequest) -> Result<(), ClientError> {
        // Validate before flipping the flag so a rejected call does not use up
        // the send-once headers.
        let cache: MetadataValue<Ascii> = req.cache_name.parse().map_err(|_| {
            ClientError::from(Status::invalid_argument(format!(
                "cache name {:?} is not valid header text",
                req.cache_name
            )))
        })?;

        if self
            .sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            for (key, value) in &self.send_once {
                if !req.options.headers.contains_key(*key) {
                    req.options.headers.insert(*key, value.clone());
                    req.options.send_once_keys.push(*key);
                }
            }
            trace!(cache = %req.cache_name, "attached send-once headers");
        }

        if !req.options.headers.contains_key(CACHE_HEADER) {
            req.options.headers.insert(CACHE_HEADER, cache);
        }
        Ok(())
    }
}

impl<S> Service<UnaryRequest> for Headers<S>
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
        if let Err(err) = self.state.apply(&mut req) {
            return Box::pin(async move { Err(err) });
        }
        let fut = self.inner.call(req);
        Box::pin(fut)
    }
}
