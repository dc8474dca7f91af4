//! Producer-side instrumentation.
//!
//! Wraps the two publisher phases of the outbox client: the transactional
//! outbox write and the later send to the broker. Both get a `PRODUCER`
//! span; the persist phase injects the propagation headers before the
//! record is durably stored, so the stored header set already carries the
//! trace context.
//!
//! Instrumentation here is fail-open: nothing in this module may prevent
//! the wrapped operation from running, and every internal failure ends at a
//! warning log.

use std::sync::Arc;

use opentelemetry::trace::{SpanKind, Status, TraceContextExt};
use opentelemetry::{global, otel_warn, Context};
use serde_json::Value;

use crate::client::{
    ClientError, Headers, OutboxRecord, PersistNext, PublishInterceptor, SendNext,
};
use crate::formatters::format_publisher_destination;
use crate::instrumentor::InstrumentationState;
use crate::propagation::HeaderInjector;
use crate::span::{get_span, MessagingOperation};

pub(crate) struct TracingPublishInterceptor {
    state: Arc<InstrumentationState>,
}

impl TracingPublishInterceptor {
    pub(crate) fn new(state: Arc<InstrumentationState>) -> Self {
        TracingPublishInterceptor { state }
    }

    fn inject(&self, cx: &Context, headers: &mut Headers) {
        if cx.span().is_recording() {
            global::get_text_map_propagator(|propagator| {
                propagator.inject_context(cx, &mut HeaderInjector(headers))
            });
        }
    }

    fn run_hook(&self, cx: &Context, body: &Value, headers: &Headers) {
        if let Some(hook) = &self.state.publisher_hook {
            if let Err(err) = hook(&cx.span(), body, headers) {
                otel_warn!(
                    name: "PublishInterceptor.HookFailed",
                    reason = format!("{err}")
                );
            }
        }
    }

    fn finish(&self, cx: &Context, result: &Result<(), ClientError>) {
        if let Err(err) = result {
            cx.span().set_status(Status::error(err.to_string()));
        }
        cx.span().end();
    }
}

impl PublishInterceptor for TracingPublishInterceptor {
    fn around_persist(
        &self,
        record: &mut OutboxRecord,
        next: PersistNext<'_>,
    ) -> Result<(), ClientError> {
        let parent_cx = Context::current();
        let span = get_span(
            &self.state.tracer,
            &record.destination,
            SpanKind::Producer,
            &record.headers,
            &record.body,
            format!("save published {}", record.destination),
            None,
            &self.state.broker,
            &parent_cx,
        );
        let cx = parent_cx.with_span(span);

        let guard = cx.clone().attach();
        self.inject(&cx, &mut record.headers);
        self.run_hook(&cx, &record.body, &record.headers);
        let result = next(record);
        drop(guard);

        self.finish(&cx, &result);
        result
    }

    fn around_send(
        &self,
        destination: &str,
        body: &Value,
        headers: &mut Headers,
        next: SendNext<'_>,
    ) -> Result<(), ClientError> {
        let producer_destination = format_publisher_destination(destination);
        let parent_cx = Context::current();
        let span = get_span(
            &self.state.tracer,
            &producer_destination,
            SpanKind::Producer,
            headers,
            body,
            format!("send {producer_destination}"),
            Some(MessagingOperation::Publish),
            &self.state.broker,
            &parent_cx,
        );
        let cx = parent_cx.with_span(span);

        let guard = cx.clone().attach();
        self.inject(&cx, headers);
        self.run_hook(&cx, body, headers);
        let result = next(destination, body, headers);
        drop(guard);

        self.finish(&cx, &result);
        result
    }
}
