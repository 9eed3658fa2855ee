//! Subscription pump: the resilience state machine behind a [`Subscription`]
//!
//! ```text
//! Connecting -> Streaming -> ReconnectDeciding -> Reconnecting -> Streaming
//!                                        \-> Terminated (error)
//! any state -> Terminated (cancelled, no error event)
//! ```
//!
//! The pump owns the underlying stream and is the only writer to the consumer
//! channel, so events from two stream generations can never interleave.
//!
//! [`Subscription`]: super::Subscription

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, trace, warn};

use super::strategy::SubscriptionRetryStrategy;
use super::{SubscriptionItem, SubscriptionStats};
use crate::config::duration_millis;
use crate::retry::RetryDecision;
use crate::transport::{EventStream, StreamEvent, StreamTransport, SubscribeRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Connecting,
    Streaming,
    ReconnectDeciding,
    Reconnecting,
    Terminated,
}

enum Step {
    Connect,
    Stream(EventStream),
    Decide(Status),
    Wait(Duration),
    Stop,
}

pub(crate) struct Pump {
    transport: Arc<dyn StreamTransport>,
    request: SubscribeRequest,
    strategy: SubscriptionRetryStrategy,
    tx: mpsc::Sender<SubscriptionItem>,
    cancel: CancellationToken,
    stats: Arc<Mutex<SubscriptionStats>>,
    last_delivered: Option<u64>,
    gap_pending: bool,
    failures: u32,
}

impl Pump {
    pub(crate) fn new(
        transport: Arc<dyn StreamTransport>,
        request: SubscribeRequest,
        strategy: SubscriptionRetryStrategy,
        tx: mpsc::Sender<SubscriptionItem>,
        cancel: CancellationToken,
        stats: Arc<Mutex<SubscriptionStats>>,
    ) -> Self {
        Self {
            transport,
            request,
            strategy,
            tx,
            cancel,
            stats,
            last_delivered: None,
            gap_pending: false,
            failures: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut step = Step::Connect;
        loop {
            step = match step {
                Step::Connect => self.connect().await,
                Step::Stream(stream) => self.stream(stream).await,
                Step::Decide(status) => self.decide(status).await,
                Step::Wait(delay) => self.wait(delay).await,
                Step::Stop => break,
            };
        }
        self.set_state(SubscriptionState::Terminated);
        debug!(cancelled = self.cancel.is_cancelled(), "subscription pump stopped");
    }

    fn set_state(&self, state: SubscriptionState) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.state = state;
        }
    }

    /// Same identity as the original request, resuming after the last
    /// delivered message.
    fn resume_request(&self) -> SubscribeRequest {
        let mut request = self.request.clone();
        if let Some(last) = self.last_delivered {
            request.resume_at_sequence = Some(last + 1);
        }
        request
    }

    async fn connect(&mut self) -> Step {
        let request = self.resume_request();
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Step::Stop,
            res = self.transport.open_stream(&request) => res,
        };
        match opened {
            Ok(stream) => {
                let generation = match self.stats.lock() {
                    Ok(mut stats) => {
                        stats.generation += 1;
                        if stats.generation > 1 {
                            stats.reconnects += 1;
                        }
                        stats.state = SubscriptionState::Streaming;
                        stats.generation
                    }
                    Err(_) => 0,
                };
                if generation > 1 {
                    info!(generation, resume_at = ?request.resume_at_sequence, "resubscribed");
                }
                if self.last_delivered.is_some() {
                    self.gap_pending = true;
                }
                Step::Stream(stream)
            }
            Err(status) => Step::Decide(status),
        }
    }

    async fn stream(&mut self, mut stream: EventStream) -> Step {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Step::Stop,
                next = stream.next() => next,
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(status)) => return Step::Decide(status),
                None => return Step::Decide(Status::unavailable("subscription stream closed")),
            };

            match event {
                StreamEvent::Item {
                    sequence_number,
                    value,
                } => {
                    if let Some(last) = self.last_delivered {
                        if sequence_number <= last {
                            trace!(sequence_number, last, "dropping already delivered message");
                            continue;
                        }
                        if std::mem::take(&mut self.gap_pending) {
                            let marker = SubscriptionItem::Discontinuity {
                                last_sequence: last,
                                new_sequence: sequence_number,
                            };
                            if !self.deliver(marker).await {
                                return Step::Stop;
                            }
                        }
                    }
                    let item = SubscriptionItem::Message {
                        sequence_number,
                        value,
                    };
                    if !self.deliver(item).await {
                        return Step::Stop;
                    }
                    self.last_delivered = Some(sequence_number);
                    // only fresh data proves the stream recovered
                    self.failures = 0;
                    if let Ok(mut stats) = self.stats.lock() {
                        stats.last_sequence = Some(sequence_number);
                    }
                }
                StreamEvent::Heartbeat => {
                    if !self.deliver(SubscriptionItem::Heartbeat).await {
                        return Step::Stop;
                    }
                }
                StreamEvent::Discontinuity {
                    last_sequence,
                    new_sequence,
                } => {
                    // The server's own marker covers the gap.
                    self.gap_pending = false;
                    let marker = SubscriptionItem::Discontinuity {
                        last_sequence,
                        new_sequence,
                    };
                    if !self.deliver(marker).await {
                        return Step::Stop;
                    }
                }
                StreamEvent::Terminal(status) => {
                    warn!(code = ?status.code(), message = status.message(), "subscription ended by service");
                    self.deliver(SubscriptionItem::Error(status.into())).await;
                    return Step::Stop;
                }
            }
        }
    }

    async fn decide(&mut self, status: Status) -> Step {
        self.set_state(SubscriptionState::ReconnectDeciding);
        if self.cancel.is_cancelled() {
            return Step::Stop;
        }
        self.failures = self.failures.saturating_add(1);
        match self.strategy.decide(&status, &self.request, self.failures) {
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    code = ?status.code(),
                    attempt = self.failures,
                    delay_ms = duration_millis(delay),
                    "subscription interrupted, resubscribing"
                );
                Step::Wait(delay)
            }
            RetryDecision::Stop(reason) => {
                warn!(code = ?status.code(), ?reason, attempts = self.failures, "subscription terminated");
                self.deliver(SubscriptionItem::Error(status.into())).await;
                Step::Stop
            }
        }
    }

    async fn wait(&mut self, delay: Duration) -> Step {
        self.set_state(SubscriptionState::Reconnecting);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Step::Stop,
            _ = sleep(delay) => Step::Connect,
        }
    }

    /// Hand one item to the consumer. `false` means stop: cancelled or the
    /// consumer went away.
    async fn deliver(&self, item: SubscriptionItem) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }
}
