//! Ordered middleware pipeline for unary calls
//!
//! Stages are declared outermost first and folded right-to-left once, when the
//! service is built: `Pipeline::new().stage(a).stage(b).service(t)` yields
//! `a(b(t))`. The standard client order is admission limiter, then header
//! injection, then retry, then the transport.

use std::sync::Arc;

use tower::util::BoxCloneService;
use tower::{Layer, Service};

use crate::error::ClientError;
use crate::headers::HeaderLayer;
use crate::limiter::{AdmissionLayer, AdmissionLimiter};
use crate::request::{UnaryRequest, UnaryResponse};
use crate::retry::RetryLayer;

/// Type-erased unary service every stage consumes and produces.
pub type UnarySvc = BoxCloneService<UnaryRequest, UnaryResponse, ClientError>;

/// One pipeline stage.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;
    fn wrap(&self, inner: UnarySvc) -> UnarySvc;
}

impl Middleware for AdmissionLayer {
    fn name(&self) -> &str {
        "admission"
    }

    fn wrap(&self, inner: UnarySvc) -> UnarySvc {
        BoxCloneService::new(self.layer(inner))
    }
}

impl Middleware for HeaderLayer {
    fn name(&self) -> &str {
        "headers"
    }

    fn wrap(&self, inner: UnarySvc) -> UnarySvc {
        BoxCloneService::new(self.layer(inner))
    }
}

impl Middleware for RetryLayer {
    fn name(&self) -> &str {
        "retry"
    }

    fn wrap(&self, inner: UnarySvc) -> UnarySvc {
        BoxCloneService::new(self.layer(inner))
    }
}

/// Adapts any tower `Layer` over [`UnarySvc`] into a named stage.
#[derive(Debug, Clone)]
pub struct LayerStage<L> {
    name: String,
    layer: L,
}

impl<L> LayerStage<L> {
    pub fn new(name: impl Into<String>, layer: L) -> Self {
        Self {
            name: name.into(),
            layer,
        }
    }
}

impl<L> Middleware for LayerStage<L>
where
    L: Layer<UnarySvc> + Send + Sync,
    L::Service: Service<UnaryRequest, Response = UnaryResponse, Error = ClientError>
        + Clone
        + Send
        + 'static,
    <L::Service as Service<UnaryRequest>>::Future: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn wrap(&self, inner: UnarySvc) -> UnarySvc {
        BoxCloneService::new(self.layer.layer(inner))
    }
}

#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical client order: admission, headers, retry.
    pub fn standard(limiter: Arc<AdmissionLimiter>, headers: HeaderLayer, retry: RetryLayer) -> Self {
        Self::new()
            .stage(AdmissionLayer::new(limiter))
            .stage(headers)
            .stage(retry)
    }

    /// Append a stage inside every stage declared so far.
    pub fn stage<M: Middleware + 'static>(self, stage: M) -> Self {
        self.stage_arc(Arc::new(stage))
    }

    pub fn stage_arc(mut self, stage: Arc<dyn Middleware>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Stage names from outermost to innermost.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Compose the stages around `transport`.
    pub fn service<T>(&self, transport: T) -> UnarySvc
    where
        T: Service<UnaryRequest, Response = UnaryResponse, Error = ClientError> + Clone + Send + 'static,
        T::Future: Send + 'static,
    {
        let base = BoxCloneService::new(transport);
        self.stages
            .iter()
            .rev()
            .fold(base, |inner, stage| stage.wrap(inner))
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}
