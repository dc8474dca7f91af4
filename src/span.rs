//! Span construction and messaging-attribute enrichment.
//!
//! Attribute keys follow the OpenTelemetry messaging semantic conventions;
//! they are part of the observable contract of this crate, consumers of the
//! tracing backend match on them.

use opentelemetry::global::{BoxedSpan, BoxedTracer};
use opentelemetry::trace::{Span, SpanKind, Tracer};
use opentelemetry::{Context, KeyValue};
use opentelemetry_semantic_conventions::attribute::{
    MESSAGING_DESTINATION_NAME, MESSAGING_MESSAGE_BODY_SIZE, MESSAGING_MESSAGE_CONVERSATION_ID,
    MESSAGING_OPERATION_NAME, MESSAGING_SYSTEM, NETWORK_PEER_ADDRESS, NETWORK_PEER_PORT,
};
use serde_json::Value;

use crate::client::{Headers, CORRELATION_ID_HEADER, FALLBACK_CORRELATION_ID_HEADER};
use crate::instrumentor::BrokerConfig;

/// The messaging operation a span records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessagingOperation {
    /// A message was received by a consumer.
    Receive,
    /// A message was published to the broker.
    Publish,
    /// A delivery was positively acknowledged.
    Ack,
    /// A delivery was negatively acknowledged.
    Nack,
}

impl MessagingOperation {
    /// The semantic-convention operation name.
    pub const fn as_str(self) -> &'static str {
        match self {
            MessagingOperation::Receive => "receive",
            MessagingOperation::Publish => "publish",
            MessagingOperation::Ack => "ack",
            MessagingOperation::Nack => "nack",
        }
    }
}

fn conversation_id(headers: &Headers) -> Option<&str> {
    headers
        .get_str(CORRELATION_ID_HEADER)
        .or_else(|| headers.get_str(FALLBACK_CORRELATION_ID_HEADER))
}

/// Sets the broker host attributes shared by every messaging span.
pub(crate) fn enrich_span_with_host_data(span: &mut BoxedSpan, broker: &BrokerConfig) {
    span.set_attribute(KeyValue::new(NETWORK_PEER_ADDRESS, broker.host.clone()));
    span.set_attribute(KeyValue::new(NETWORK_PEER_PORT, i64::from(broker.port)));
    span.set_attribute(KeyValue::new(MESSAGING_SYSTEM, broker.system.clone()));
}

/// Sets the full messaging attribute set on `span`.
///
/// Tolerates any input; attribute writes on a non-recording span are no-ops,
/// callers check [`Span::is_recording`] first only to skip the wasted work.
pub(crate) fn enrich_span(
    span: &mut BoxedSpan,
    operation: Option<MessagingOperation>,
    destination: &str,
    headers: &Headers,
    body: &Value,
    broker: &BrokerConfig,
) {
    span.set_attribute(KeyValue::new(MESSAGING_DESTINATION_NAME, destination.to_owned()));
    if let Some(conversation_id) = conversation_id(headers) {
        span.set_attribute(KeyValue::new(
            MESSAGING_MESSAGE_CONVERSATION_ID,
            conversation_id.to_owned(),
        ));
    }
    if let Ok(payload) = serde_json::to_string(body) {
        span.set_attribute(KeyValue::new(MESSAGING_MESSAGE_BODY_SIZE, payload.len() as i64));
    }
    if let Some(operation) = operation {
        span.set_attribute(KeyValue::new(MESSAGING_OPERATION_NAME, operation.as_str()));
    }
    enrich_span_with_host_data(span, broker);
}

/// Starts an enriched span. The caller owns the span's lifecycle; it is
/// returned un-ended.
#[allow(clippy::too_many_arguments)]
pub(crate) fn get_span(
    tracer: &BoxedTracer,
    destination: &str,
    span_kind: SpanKind,
    headers: &Headers,
    body: &Value,
    span_name: String,
    operation: Option<MessagingOperation>,
    broker: &BrokerConfig,
    parent_cx: &Context,
) -> BoxedSpan {
    let builder = tracer.span_builder(span_name).with_kind(span_kind);
    let mut span = tracer.build_with_context(builder, parent_cx);
    if span.is_recording() {
        enrich_span(&mut span, operation, destination, headers, body, broker);
    }
    span
}

/// Starts an enriched ack/nack span. Payload size is never set, the body is
/// not available at settle time.
pub(crate) fn get_ack_nack_span(
    tracer: &BoxedTracer,
    span_kind: SpanKind,
    span_name: String,
    destination: &str,
    operation: MessagingOperation,
    headers: &Headers,
    broker: &BrokerConfig,
    parent_cx: &Context,
) -> BoxedSpan {
    let builder = tracer.span_builder(span_name).with_kind(span_kind);
    let mut span = tracer.build_with_context(builder, parent_cx);
    if span.is_recording() {
        span.set_attribute(KeyValue::new(MESSAGING_OPERATION_NAME, operation.as_str()));
        span.set_attribute(KeyValue::new(MESSAGING_DESTINATION_NAME, destination.to_owned()));
        if let Some(conversation_id) = conversation_id(headers) {
            span.set_attribute(KeyValue::new(
                MESSAGING_MESSAGE_CONVERSATION_ID,
                conversation_id.to_owned(),
            ));
        }
        enrich_span_with_host_data(&mut span, broker);
    }
    span
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_names() {
        assert_eq!(MessagingOperation::Receive.as_str(), "receive");
        assert_eq!(MessagingOperation::Publish.as_str(), "publish");
        assert_eq!(MessagingOperation::Ack.as_str(), "ack");
        assert_eq!(MessagingOperation::Nack.as_str(), "nack");
    }

    #[test]
    fn conversation_id_prefers_dop_header() {
        let mut headers = Headers::new();
        headers.insert(FALLBACK_CORRELATION_ID_HEADER, "fallback");
        assert_eq!(conversation_id(&headers), Some("fallback"));

        headers.insert(CORRELATION_ID_HEADER, "preferred");
        assert_eq!(conversation_id(&headers), Some("preferred"));
    }

    #[test]
    fn conversation_id_absent() {
        assert_eq!(conversation_id(&Headers::new()), None);
    }
}
