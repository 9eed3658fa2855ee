//! Admission control: a fair cap on concurrent in-flight unary calls
//!
//! What this module provides
//! - `AdmissionLimiter`: a FIFO-fair pool of N tickets
//! - `AdmissionTicket`: RAII guard that hands its ticket back on drop
//! - `AdmissionLayer`: Tower middleware that holds a ticket for the lifetime of
//!   the wrapped call
//!
//! Implementation strategy
//! - A bounded `mpsc` channel of capacity N is pre-filled with N tokens.
//!   Acquiring dequeues a token, releasing enqueues one with `try_send`.
//! - The receiver sits behind a `tokio::sync::Mutex`, whose lock queue is FIFO,
//!   so waiters are served in arrival order and nobody spins.
//! - Because the channel can never hold more than N tokens, a release that finds
//!   it full is a double release and is reported instead of absorbed.
//! - An atomic counter mirrors the outstanding count for diagnostics only.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tower::{Layer, Service};
use tracing::{error, trace};

use crate::error::{ClientError, Result};

#[derive(Debug)]
pub struct AdmissionLimiter {
    capacity: usize,
    tokens_tx: mpsc::Sender<()>,
    tokens_rx: Mutex<mpsc::Receiver<()>>,
    outstanding: AtomicUsize,
}

impl AdmissionLimiter {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(ClientError::config(
                "admission limiter capacity must be at least 1",
            ));
        }
        let (tokens_tx, tokens_rx) = mpsc::channel(capacity);
        for _ in 0..capacity {
            tokens_tx
                .try_send(())
                .map_err(|_| ClientError::internal("failed to seed admission tickets"))?;
        }
        Ok(Self {
            capacity,
            tokens_tx,
            tokens_rx: Mutex::new(tokens_rx),
            outstanding: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for a free ticket. Waiters are admitted in arrival order.
    ///
    /// Cancel safe: dropping the future before it resolves takes no ticket.
    pub async fn acquire(self: &Arc<Self>) -> Result<AdmissionTicket> {
        self.acquire_raw().await?;
        Ok(AdmissionTicket {
            limiter: Some(Arc::clone(self)),
        })
    }

    /// Take a ticket without a guard. Pair with exactly one [`release`](Self::release).
    pub async fn acquire_raw(&self) -> Result<()> {
        let mut rx = self.tokens_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| ClientError::internal("admission ticket pool closed"))?;
        drop(rx);
        let now = self.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(outstanding = now, capacity = self.capacity, "admission ticket acquired");
        Ok(())
    }

    /// Return a ticket to the pool.
    ///
    /// Releasing more tickets than were acquired is a logic error and yields
    /// `ClientError::Internal`; the pool is left untouched.
    pub fn release(&self) -> Result<()> {
        match self.tokens_tx.try_send(()) {
            Ok(()) => {
                let prev = self
                    .outstanding
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        Some(n.saturating_sub(1))
                    })
                    .unwrap_or(0);
                trace!(outstanding = prev.saturating_sub(1), "admission ticket released");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(())) => {
                error!(capacity = self.capacity, "admission ticket released more times than acquired");
                Err(ClientError::internal(
                    "admission ticket released more times than acquired",
                ))
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                Err(ClientError::internal("admission ticket pool closed"))
            }
        }
    }

    /// Approximate number of free tickets. Diagnostics only.
    pub fn available(&self) -> usize {
        self.capacity
            .saturating_sub(self.outstanding.load(Ordering::Acquire))
    }

    /// Approximate number of tickets currently held. Diagnostics only.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

/// A held admission ticket. Dropping it returns the ticket to the pool.
#[derive(Debug)]
#[must_use = "the ticket is released as soon as it is dropped"]
pub struct AdmissionTicket {
    limiter: Option<Arc<AdmissionLimiter>>,
}

impl AdmissionTicket {
    /// Release explicitly and observe the outcome.
    pub fn release(mut self) -> Result<()> {
        match self.limiter.take() {
            Some(limiter) => limiter.release(),
            None => Ok(()),
        }
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        if let Some(limiter) = self.limiter.take() {
            // The error is already logged by `release`.
            let _ = limiter.release();
        }
    }
}

/// Layer that gates the wrapped service behind an [`AdmissionLimiter`].
#[derive(Debug, Clone)]
pub struct AdmissionLayer {
    limiter: Arc<AdmissionLimiter>,
}

impl AdmissionLayer {
    pub fn new(limiter: Arc<AdmissionLimiter>) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &Arc<AdmissionLimiter> {
        &self.limiter
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = Admission<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Admission {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Admission<S> {
    inner: S,
    limiter: Arc<AdmissionLimiter>,
}

impl<S, Req> Service<Req> for Admission<S>
where
    Req: Send + 'static,
    S: Service<Req, Error = ClientError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = ClientError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // Take the service that was driven to readiness and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let limiter = self.limiter.clone();
        Box::pin(async move {
            let _ticket = limiter.acquire().await?;
            inner.call(req).await
        })
    }
}
