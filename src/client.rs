//! Extension-point surface of the outbox messaging client.
//!
//! The instrumented library persists outbound messages to an outbox table
//! before sending them over a STOMP connection, and hands inbound deliveries
//! to a user callback that later settles them with an ack or nack. This
//! module models the slice of that client the instrumentation needs: the
//! message shapes ([`OutboxRecord`], [`Delivery`], [`Headers`]) and the
//! interceptor registry the client consults around each call site.
//!
//! The client routes every persist/send/delivery/ack/nack through the
//! dispatch helpers below. With no interceptor registered they delegate
//! straight to the supplied closure, so un-instrumented behavior is exactly
//! the original behavior.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use thiserror::Error;

/// Correlation id header written by the outbox client.
pub const CORRELATION_ID_HEADER: &str = "dop-correlation-id";
/// Correlation id header used when [`CORRELATION_ID_HEADER`] is absent.
pub const FALLBACK_CORRELATION_ID_HEADER: &str = "correlation-id";
/// Header carrying the broker destination a delivery arrived on.
pub const DESTINATION_HEADER: &str = "destination";
/// Header carrying the original exchange/routing-key the message was
/// published with.
pub const MSG_DESTINATION_HEADER: &str = "dop-msg-destination";

/// A single message-header value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeaderValue {
    /// A plain string value.
    Str(String),
    /// A multi-valued header.
    List(Vec<String>),
}

impl HeaderValue {
    /// Returns the value as a string slice, taking the first entry of a
    /// multi-valued header.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(value) => Some(value),
            HeaderValue::List(values) => values.first().map(String::as_str),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(values: Vec<String>) -> Self {
        HeaderValue::List(values)
    }
}

/// Message headers: a mapping from string keys to string or list-of-string
/// values.
///
/// Headers carry both business metadata (destination, correlation id) and
/// the injected trace-propagation fields, so wrapped operations may mutate
/// them in place.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, HeaderValue>);

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Headers::default()
    }

    /// Inserts a header, replacing any previous value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Returns the value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.0.get(key)
    }

    /// Returns the value for `key` as a string slice, taking the first entry
    /// of a multi-valued header.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(HeaderValue::as_str)
    }

    /// Returns true if `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterates over the header keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Iterates over key/value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no headers are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An outbound message about to be written to the outbox table.
#[derive(Clone, Debug)]
pub struct OutboxRecord {
    /// Raw destination the message will be published to, e.g.
    /// `/exchange/orders/created`.
    pub destination: String,
    /// JSON message body.
    pub body: Value,
    /// Headers that will be durably stored with the record.
    pub headers: Headers,
}

impl OutboxRecord {
    /// Creates a record with empty headers.
    pub fn new(destination: impl Into<String>, body: Value) -> Self {
        OutboxRecord {
            destination: destination.into(),
            body,
            headers: Headers::new(),
        }
    }
}

/// An inbound message handed to the subscription callback.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Headers as received from the broker, including the
    /// [`DESTINATION_HEADER`] and any propagation fields.
    pub headers: Headers,
    /// JSON message body.
    pub body: Value,
}

impl Delivery {
    /// Creates a delivery.
    pub fn new(headers: Headers, body: Value) -> Self {
        Delivery { headers, body }
    }
}

/// Errors surfaced by the messaging client's own operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The user's delivery callback failed.
    #[error("delivery callback failed: {0}")]
    Callback(String),
    /// A broker operation (persist, send, ack, nack) failed.
    #[error("broker operation failed: {0}")]
    Broker(String),
}

/// Continuation for a wrapped persist operation.
pub type PersistNext<'a> = &'a mut dyn FnMut(&mut OutboxRecord) -> Result<(), ClientError>;
/// Continuation for a wrapped send operation.
pub type SendNext<'a> =
    &'a mut dyn FnMut(&str, &Value, &mut Headers) -> Result<(), ClientError>;
/// Continuation for a wrapped delivery callback.
pub type DeliveryNext<'a> = &'a mut dyn FnMut(&mut Delivery) -> Result<(), ClientError>;
/// Continuation for a wrapped ack or nack.
pub type SettleNext<'a> = &'a mut dyn FnMut() -> Result<(), ClientError>;

/// Decorates the publisher-side call sites of the client.
///
/// Implementations must invoke `next` exactly once on every path and return
/// its result unchanged.
pub trait PublishInterceptor: Send + Sync {
    /// Wraps the outbox write of `record`.
    fn around_persist(
        &self,
        record: &mut OutboxRecord,
        next: PersistNext<'_>,
    ) -> Result<(), ClientError>;

    /// Wraps the send of a message to the broker.
    fn around_send(
        &self,
        destination: &str,
        body: &Value,
        headers: &mut Headers,
        next: SendNext<'_>,
    ) -> Result<(), ClientError>;
}

/// Decorates the consumer-side call sites of the client.
///
/// The client guarantees that `around_delivery` and the matching
/// `around_ack`/`around_nack` run sequentially on the same thread; two
/// unsettled deliveries are never interleaved on one thread.
pub trait ConsumeInterceptor: Send + Sync {
    /// Wraps the invocation of the user's delivery callback.
    fn around_delivery(
        &self,
        delivery: &mut Delivery,
        next: DeliveryNext<'_>,
    ) -> Result<(), ClientError>;

    /// Wraps a positive acknowledgement.
    fn around_ack(&self, next: SettleNext<'_>) -> Result<(), ClientError>;

    /// Wraps a negative acknowledgement.
    fn around_nack(&self, next: SettleNext<'_>) -> Result<(), ClientError>;
}

static PUBLISH_INTERCEPTOR: RwLock<Option<Arc<dyn PublishInterceptor>>> = RwLock::new(None);
static CONSUME_INTERCEPTOR: RwLock<Option<Arc<dyn ConsumeInterceptor>>> = RwLock::new(None);

/// Registers or clears the publisher-side interceptor.
pub fn set_publish_interceptor(interceptor: Option<Arc<dyn PublishInterceptor>>) {
    *PUBLISH_INTERCEPTOR
        .write()
        .expect("publish interceptor lock poisoned") = interceptor;
}

/// Returns the registered publisher-side interceptor, if any.
pub fn publish_interceptor() -> Option<Arc<dyn PublishInterceptor>> {
    PUBLISH_INTERCEPTOR
        .read()
        .expect("publish interceptor lock poisoned")
        .clone()
}

/// Registers or clears the consumer-side interceptor.
pub fn set_consume_interceptor(interceptor: Option<Arc<dyn ConsumeInterceptor>>) {
    *CONSUME_INTERCEPTOR
        .write()
        .expect("consume interceptor lock poisoned") = interceptor;
}

/// Returns the registered consumer-side interceptor, if any.
pub fn consume_interceptor() -> Option<Arc<dyn ConsumeInterceptor>> {
    CONSUME_INTERCEPTOR
        .read()
        .expect("consume interceptor lock poisoned")
        .clone()
}

/// Persists `record` to the outbox, routing through the registered
/// interceptor when one is present.
pub fn persist<F>(record: &mut OutboxRecord, mut next: F) -> Result<(), ClientError>
where
    F: FnMut(&mut OutboxRecord) -> Result<(), ClientError>,
{
    match publish_interceptor() {
        Some(interceptor) => interceptor.around_persist(record, &mut next),
        None => next(record),
    }
}

/// Sends a message to the broker, routing through the registered interceptor
/// when one is present.
pub fn send<F>(
    destination: &str,
    body: &Value,
    headers: &mut Headers,
    mut next: F,
) -> Result<(), ClientError>
where
    F: FnMut(&str, &Value, &mut Headers) -> Result<(), ClientError>,
{
    match publish_interceptor() {
        Some(interceptor) => interceptor.around_send(destination, body, headers, &mut next),
        None => next(destination, body, headers),
    }
}

/// Hands `delivery` to the subscription callback, routing through the
/// registered interceptor when one is present.
pub fn dispatch_delivery<F>(delivery: &mut Delivery, mut next: F) -> Result<(), ClientError>
where
    F: FnMut(&mut Delivery) -> Result<(), ClientError>,
{
    match consume_interceptor() {
        Some(interceptor) => interceptor.around_delivery(delivery, &mut next),
        None => next(delivery),
    }
}

/// Positively acknowledges the delivery last handed to this thread.
pub fn ack<F>(mut next: F) -> Result<(), ClientError>
where
    F: FnMut() -> Result<(), ClientError>,
{
    match consume_interceptor() {
        Some(interceptor) => interceptor.around_ack(&mut next),
        None => next(),
    }
}

/// Negatively acknowledges the delivery last handed to this thread.
pub fn nack<F>(mut next: F) -> Result<(), ClientError>
where
    F: FnMut() -> Result<(), ClientError>,
{
    match consume_interceptor() {
        Some(interceptor) => interceptor.around_nack(&mut next),
        None => next(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_value_as_str_takes_first_list_entry() {
        let value = HeaderValue::from(vec!["first".to_owned(), "second".to_owned()]);
        assert_eq!(value.as_str(), Some("first"));
        assert_eq!(HeaderValue::List(Vec::new()).as_str(), None);
    }

    #[test]
    fn headers_insert_and_lookup() {
        let mut headers = Headers::new();
        assert!(headers.is_empty());

        headers.insert("destination", "/queue/q");
        headers.insert("x-retries", "3".to_owned());

        assert_eq!(headers.get_str("destination"), Some("/queue/q"));
        assert_eq!(headers.get("missing"), None);
        assert!(headers.contains_key("x-retries"));
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.keys().count(), 2);
    }

    #[test]
    fn insert_replaces_existing_value() {
        let mut headers = Headers::new();
        headers.insert("k", "a");
        headers.insert("k", "b");
        assert_eq!(headers.get_str("k"), Some("b"));
        assert_eq!(headers.len(), 1);
    }
}
