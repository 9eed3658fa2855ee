//! Self-healing topic subscriptions
//!
//! A [`Subscription`] is a pull-based, cancellable stream of
//! [`SubscriptionItem`]s. Behind it a pump task drives the underlying
//! transport stream, resubscribes after transient breaks and forwards events
//! through a bounded channel, so a slow consumer back-pressures the pump
//! instead of growing a buffer.
//!
//! Guarantees to the consumer:
//! - messages arrive in source order, each sequence number at most once
//! - after a resubscribe that follows delivered messages, exactly one
//!   `Discontinuity` precedes the next message (the server's own marker counts)
//! - an ineligible or exhausted failure ends the stream with one `Error` item
//! - cancellation ends the stream with no further items
//!
//! Every subscription has its own pump, channel and counters.

mod state;
mod strategy;

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

use crate::error::{ClientError, Result};
use crate::transport::{StreamTransport, SubscribeRequest, TopicValue};

pub use state::SubscriptionState;
pub use strategy::{SubscriptionRetryStrategy, DEFAULT_RECONNECT_DELAY};

/// Event surfaced to the consumer.
#[derive(Debug, Clone)]
pub enum SubscriptionItem {
    Message {
        sequence_number: u64,
        value: TopicValue,
    },
    /// Liveness signal, informational only.
    Heartbeat,
    /// Messages between the two sequence numbers may have been missed.
    Discontinuity {
        last_sequence: u64,
        new_sequence: u64,
    },
    /// Terminal failure. Always the last item.
    Error(ClientError),
}

impl SubscriptionItem {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Point-in-time view of a subscription's pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub state: SubscriptionState,
    /// Number of underlying streams opened so far.
    pub generation: u64,
    pub reconnects: u64,
    pub last_sequence: Option<u64>,
}

impl Default for SubscriptionStats {
    fn default() -> Self {
        Self {
            state: SubscriptionState::Connecting,
            generation: 0,
            reconnects: 0,
            last_sequence: None,
        }
    }
}

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

pub struct Subscription {
    id: u64,
    request: SubscribeRequest,
    rx: ReceiverStream<SubscriptionItem>,
    cancel: CancellationToken,
    stats: Arc<Mutex<SubscriptionStats>>,
}

impl Subscription {
    /// Spawn the pump on the current tokio runtime and return the consumer
    /// end. Cancelling `cancel` (or dropping the subscription) stops it.
    pub fn start(
        transport: Arc<dyn StreamTransport>,
        request: SubscribeRequest,
        strategy: SubscriptionRetryStrategy,
        queue_capacity: usize,
        cancel: CancellationToken,
    ) -> Result<Self> {
        if queue_capacity == 0 {
            return Err(ClientError::config("subscription queue capacity must be at least 1"));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| ClientError::internal("subscriptions need a running tokio runtime"))?;

        let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(queue_capacity);
        let stats = Arc::new(Mutex::new(SubscriptionStats::default()));
        let span = info_span!(
            "subscription",
            subscription_id = id,
            cache = %request.cache_name,
            topic = %request.topic,
        );
        let pump = state::Pump::new(
            transport,
            request.clone(),
            strategy,
            tx,
            cancel.clone(),
            stats.clone(),
        );
        runtime.spawn(pump.run().instrument(span));

        Ok(Self {
            id,
            request,
            rx: ReceiverStream::new(rx),
            cancel,
            stats,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request(&self) -> &SubscribeRequest {
        &self.request
    }

    /// Next item, or `None` once the subscription has ended or was cancelled.
    pub async fn next_event(&mut self) -> Option<SubscriptionItem> {
        futures::StreamExt::next(self).await
    }

    /// Stop the subscription. Items not yet pulled are discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }
}

impl Stream for Subscription {
    type Item = SubscriptionItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            self.rx.close();
            return Poll::Ready(None);
        }
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("cache", &self.request.cache_name)
            .field("topic", &self.request.topic)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{FixedDelay, SubscriptionEligibilityStrategy};
    use crate::transport::{EventStream, StreamEvent};
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tonic::{Code, Status};

    type Script = std::result::Result<Vec<std::result::Result<StreamEvent, Status>>, Status>;

    /// Plays one script per `open_stream` call. A scripted stream stays open
    /// after its events; once the scripts run out, opened streams are silent.
    #[derive(Default)]
    struct Scripted {
        scripts: Mutex<VecDeque<Script>>,
        opened: Mutex<Vec<SubscribeRequest>>,
    }

    impl Scripted {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                opened: Mutex::new(Vec::new()),
            })
        }

        fn opens(&self) -> Vec<SubscribeRequest> {
            self.opened.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StreamTransport for Scripted {
        async fn open_stream(&self, request: &SubscribeRequest) -> std::result::Result<EventStream, Status> {
            self.opened.lock().unwrap().push(request.clone());
            let next = self.scripts.lock().unwrap().pop_front();
            match next {
                Some(Ok(events)) => Ok(futures::stream::iter(events)
                    .chain(futures::stream::pending())
                    .boxed()),
                Some(Err(status)) => Err(status),
                None => Ok(futures::stream::pending::<std::result::Result<StreamEvent, Status>>().boxed()),
            }
        }
    }

    fn msg(n: u64) -> std::result::Result<StreamEvent, Status> {
        Ok(StreamEvent::Item {
            sequence_number: n,
            value: TopicValue::text(format!("m{n}")),
        })
    }

    fn start(transport: Arc<Scripted>) -> Subscription {
        let strategy = SubscriptionRetryStrategy::new(
            SubscriptionEligibilityStrategy,
            FixedDelay::unbounded(Duration::from_millis(10)),
        );
        Subscription::start(
            transport,
            SubscribeRequest::new("cache", "topic"),
            strategy,
            16,
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_resumes_after_last_delivered() {
        let transport = Scripted::new(vec![
            Ok(vec![msg(1), msg(2), Err(Status::unavailable("reset"))]),
            // server replays 2, which must not be delivered twice
            Ok(vec![msg(2), msg(3)]),
        ]);
        let mut sub = start(transport.clone());

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(sub.next_event().await.unwrap());
        }
        assert!(matches!(seen[0], SubscriptionItem::Message { sequence_number: 1, .. }));
        assert!(matches!(seen[1], SubscriptionItem::Message { sequence_number: 2, .. }));
        assert!(matches!(
            seen[2],
            SubscriptionItem::Discontinuity { last_sequence: 2, new_sequence: 3 }
        ));
        assert!(matches!(seen[3], SubscriptionItem::Message { sequence_number: 3, .. }));

        let opens = transport.opens();
        assert_eq!(opens.len(), 2);
        assert_eq!(opens[0].resume_at_sequence, None);
        assert_eq!(opens[1].resume_at_sequence, Some(3));

        let stats = sub.stats();
        assert_eq!(stats.generation, 2);
        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.last_sequence, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn server_discontinuity_replaces_synthesized_one() {
        let transport = Scripted::new(vec![
            Ok(vec![msg(1), Err(Status::internal("broken"))]),
            Ok(vec![
                Ok(StreamEvent::Heartbeat),
                Ok(StreamEvent::Discontinuity {
                    last_sequence: 1,
                    new_sequence: 7,
                }),
                msg(7),
            ]),
        ]);
        let mut sub = start(transport);

        assert!(matches!(sub.next_event().await, Some(SubscriptionItem::Message { sequence_number: 1, .. })));
        assert!(matches!(sub.next_event().await, Some(SubscriptionItem::Heartbeat)));
        assert!(matches!(
            sub.next_event().await,
            Some(SubscriptionItem::Discontinuity { last_sequence: 1, new_sequence: 7 })
        ));
        assert!(matches!(sub.next_event().await, Some(SubscriptionItem::Message { sequence_number: 7, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_event_is_never_resubscribed() {
        let transport = Scripted::new(vec![Ok(vec![
            msg(1),
            Ok(StreamEvent::Terminal(Status::not_found("topic deleted"))),
        ])]);
        let mut sub = start(transport.clone());

        assert!(matches!(sub.next_event().await, Some(SubscriptionItem::Message { .. })));
        match sub.next_event().await {
            Some(SubscriptionItem::Error(err)) => {
                assert_eq!(err.status().unwrap().code(), Code::NotFound)
            }
            other => panic!("expected terminal error, got {other:?}"),
        }
        assert!(sub.next_event().await.is_none());
        assert_eq!(transport.opens().len(), 1);
        assert_eq!(sub.stats().state, SubscriptionState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_goes_through_the_strategy() {
        let transport = Scripted::new(vec![
            Err(Status::unavailable("no route")),
            Ok(vec![msg(1)]),
        ]);
        let mut sub = start(transport.clone());
        // nothing delivered before the break, so no marker
        assert!(matches!(sub.next_event().await, Some(SubscriptionItem::Message { sequence_number: 1, .. })));
        assert_eq!(transport.opens().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn capped_strategy_gives_up_with_last_status() {
        let transport = Scripted::new(vec![
            Err(Status::unavailable("one")),
            Err(Status::unavailable("two")),
            Err(Status::unavailable("three")),
        ]);
        let strategy = SubscriptionRetryStrategy::new(
            SubscriptionEligibilityStrategy,
            FixedDelay::new(Duration::from_millis(10), 3),
        );
        let mut sub = Subscription::start(
            transport.clone(),
            SubscribeRequest::new("cache", "topic"),
            strategy,
            4,
            CancellationToken::new(),
        )
        .unwrap();

        match sub.next_event().await {
            Some(SubscriptionItem::Error(err)) => assert_eq!(err.status().unwrap().message(), "three"),
            other => panic!("expected terminal error, got {other:?}"),
        }
        assert!(sub.next_event().await.is_none());
        assert_eq!(transport.opens().len(), 3);
    }

    /// Ends its first stream without a terminal event, then serves `2`.
    struct ClosesOnce {
        opens: Mutex<u32>,
    }

    #[async_trait]
    impl StreamTransport for ClosesOnce {
        async fn open_stream(&self, _request: &SubscribeRequest) -> std::result::Result<EventStream, Status> {
            let n = {
                let mut opens = self.opens.lock().unwrap();
                *opens += 1;
                *opens
            };
            if n == 1 {
                Ok(futures::stream::iter(vec![msg(1)]).boxed())
            } else {
                Ok(futures::stream::iter(vec![msg(2)])
                    .chain(futures::stream::pending())
                    .boxed())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn closed_stream_is_resubscribed() {
        let transport = Arc::new(ClosesOnce { opens: Mutex::new(0) });
        let mut sub = Subscription::start(
            transport.clone(),
            SubscribeRequest::new("cache", "topic"),
            SubscriptionRetryStrategy::default(),
            4,
            CancellationToken::new(),
        )
        .unwrap();
        assert!(matches!(sub.next_event().await, Some(SubscriptionItem::Message { sequence_number: 1, .. })));
        assert!(matches!(sub.next_event().await, Some(SubscriptionItem::Discontinuity { .. })));
        assert!(matches!(sub.next_event().await, Some(SubscriptionItem::Message { sequence_number: 2, .. })));
        assert_eq!(*transport.opens.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_ends_stream_without_error() {
        let transport = Scripted::new(vec![Ok(vec![msg(1)])]);
        let mut sub = start(transport);
        assert!(sub.next_event().await.is_some());
        sub.cancel();
        assert!(sub.next_event().await.is_none());
        assert!(sub.is_cancelled());
    }

    #[tokio::test]
    async fn zero_queue_capacity_is_rejected() {
        let err = Subscription::start(
            Scripted::new(vec![]),
            SubscribeRequest::new("cache", "topic"),
            SubscriptionRetryStrategy::default(),
            0,
            CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }
}
