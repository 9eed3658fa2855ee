//! Request envelope flowing through the unary pipeline
//!
//! The operation payload is opaque bytes produced by the (external) wire
//! layer; the core only needs to know which operation it is, which cache it
//! targets, and the mutable per-call options stages are allowed to touch.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tonic::metadata::MetadataMap;

/// Cache operation carried by a unary request.
///
/// Only the identity matters to the core: retry eligibility depends on
/// whether a blind replay of the operation can change its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Set,
    Delete,
    Increment,
    SetIfNotExists,
    UpdateTtl,
    ItemGetTtl,
    KeyExists,
    DictionaryFetch,
    DictionaryGetField,
    DictionarySetField,
    DictionaryRemoveField,
    DictionaryIncrement,
    ListFetch,
    ListLength,
    ListPushBack,
    ListPushFront,
    ListPopBack,
    ListPopFront,
    ListRemoveValue,
    SetFetch,
    SetAddElement,
    SetRemoveElement,
    SortedSetFetch,
    SortedSetPutElement,
    SortedSetIncrementScore,
    Publish,
    Ping,
}

impl Operation {
    /// Whether replaying this operation after an ambiguous failure is safe:
    /// reads, and writes whose only effect is an overwrite.
    pub fn is_idempotent(self) -> bool {
        match self {
            Self::Get
            | Self::Set
            | Self::Delete
            | Self::ItemGetTtl
            | Self::KeyExists
            | Self::DictionaryFetch
            | Self::DictionaryGetField
            | Self::DictionarySetField
            | Self::DictionaryRemoveField
            | Self::ListFetch
            | Self::ListLength
            | Self::ListRemoveValue
            | Self::SetFetch
            | Self::SetAddElement
            | Self::SetRemoveElement
            | Self::SortedSetFetch
            | Self::SortedSetPutElement
            | Self::Ping => true,
            Self::Increment
            | Self::SetIfNotExists
            | Self::UpdateTtl
            | Self::DictionaryIncrement
            | Self::ListPushBack
            | Self::ListPushFront
            | Self::ListPopBack
            | Self::ListPopFront
            | Self::SortedSetIncrementScore
            | Self::Publish => false,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Delete => "delete",
            Self::Increment => "increment",
            Self::SetIfNotExists => "set_if_not_exists",
            Self::UpdateTtl => "update_ttl",
            Self::ItemGetTtl => "item_get_ttl",
            Self::KeyExists => "key_exists",
            Self::DictionaryFetch => "dictionary_fetch",
            Self::DictionaryGetField => "dictionary_get_field",
            Self::DictionarySetField => "dictionary_set_field",
            Self::DictionaryRemoveField => "dictionary_remove_field",
            Self::DictionaryIncrement => "dictionary_increment",
            Self::ListFetch => "list_fetch",
            Self::ListLength => "list_length",
            Self::ListPushBack => "list_push_back",
            Self::ListPushFront => "list_push_front",
            Self::ListPopBack => "list_pop_back",
            Self::ListPopFront => "list_pop_front",
            Self::ListRemoveValue => "list_remove_value",
            Self::SetFetch => "set_fetch",
            Self::SetAddElement => "set_add_element",
            Self::SetRemoveElement => "set_remove_element",
            Self::SortedSetFetch => "sorted_set_fetch",
            Self::SortedSetPutElement => "sorted_set_put_element",
            Self::SortedSetIncrementScore => "sorted_set_increment_score",
            Self::Publish => "publish",
            Self::Ping => "ping",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Mutable per-call options. Stages may add headers; the deadline is set once
/// for the whole logical call and inherited by every attempt.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub deadline: Option<Instant>,
    pub headers: MetadataMap,
    /// Keys in `headers` that belong to the first attempt only. A retrying
    /// stage strips them before replaying the request.
    pub send_once_keys: Vec<&'static str>,
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            ..Default::default()
        }
    }

    /// Drop the first-attempt-only headers, for use on replays.
    pub fn strip_send_once(&mut self) {
        for key in self.send_once_keys.drain(..) {
            self.headers.remove(key);
        }
    }
}

/// A single unary request as seen by the middleware pipeline.
#[derive(Debug, Clone)]
pub struct UnaryRequest {
    pub cache_name: String,
    pub operation: Operation,
    pub payload: Bytes,
    pub options: CallOptions,
}

impl UnaryRequest {
    pub fn new(cache_name: impl Into<String>, operation: Operation, payload: impl Into<Bytes>) -> Self {
        Self {
            cache_name: cache_name.into(),
            operation,
            payload: payload.into(),
            options: CallOptions::default(),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.options.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.deadline = Some(Instant::now() + timeout);
        self
    }
}

/// Settled response of a unary call. Headers and trailers only exist once the
/// call has resolved, so they cannot be read early.
#[derive(Debug, Clone, Default)]
pub struct UnaryResponse {
    pub payload: Bytes,
    pub headers: MetadataMap,
    pub trailers: MetadataMap,
}

impl UnaryResponse {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }
}
