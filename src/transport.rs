//! Transport seams consumed by the core
//!
//! The wire layer is supplied by the caller:
//! - unary calls: any cloneable `tower::Service<UnaryRequest, Response = UnaryResponse, Error = ClientError>`
//! - subscriptions: a [`StreamTransport`] that opens one event stream per call
//!
//! Stream items are `Result<StreamEvent, Status>`. An `Err` item is a transport
//! failure; the stream ending without a terminal event is "transport closed".
//! Both go through the subscription reconnect decision.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tonic::Status;

use crate::error::ClientError;

/// Identity of a topic subscription plus the resume hint used on reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub cache_name: String,
    pub topic: String,
    /// First sequence number the consumer has not seen yet, if any.
    pub resume_at_sequence: Option<u64>,
}

impl SubscribeRequest {
    pub fn new(cache_name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            topic: topic.into(),
            resume_at_sequence: None,
        }
    }
}

/// Payload of a topic message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicValue {
    Text(String),
    Binary(Bytes),
}

impl TopicValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn binary(value: impl Into<Bytes>) -> Self {
        Self::Binary(value.into())
    }

    /// The text payload, or an error naming the actual variant.
    pub fn as_text(&self) -> Result<&str, ClientError> {
        match self {
            Self::Text(s) => Ok(s),
            Self::Binary(_) => Err(ClientError::TypeMismatch {
                expected: "text",
                actual: "binary",
            }),
        }
    }

    /// The binary payload, or an error naming the actual variant.
    pub fn as_binary(&self) -> Result<&Bytes, ClientError> {
        match self {
            Self::Binary(b) => Ok(b),
            Self::Text(_) => Err(ClientError::TypeMismatch {
                expected: "binary",
                actual: "text",
            }),
        }
    }

    /// Raw bytes regardless of variant.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b.as_ref(),
        }
    }
}

/// Event as delivered by the underlying stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Item {
        sequence_number: u64,
        value: TopicValue,
    },
    Heartbeat,
    Discontinuity {
        last_sequence: u64,
        new_sequence: u64,
    },
    /// The service ended the subscription on purpose; never resubscribed.
    Terminal(Status),
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, Status>> + Send>>;

/// Opens underlying subscription streams.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    async fn open_stream(&self, request: &SubscribeRequest) -> Result<EventStream, Status>;
}
