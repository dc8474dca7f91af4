//! OpenTelemetry instrumentation for outbox-pattern messaging clients that
//! publish and consume through a STOMP broker connection.
//!
//! Publish and consume operations become observable without application code
//! changes: the library's extension points are wrapped so that every outbox
//! write and broker send gets a `PRODUCER` span, every delivery gets a
//! `CONSUMER` span whose parent trace is extracted from the message headers,
//! and the later ack or nack closes that span with the settlement outcome.
//! Trace context is injected into the message headers before the record is
//! durably stored, so the producer and consumer ends of a message share one
//! trace.
//!
//! Instrumentation is strictly fail-open: a failure inside this crate is
//! logged and the wrapped messaging operation proceeds untraced. Tracing can
//! never break message delivery, acknowledgement or publishing.
//!
//! # Quick start
//!
//! ```no_run
//! use opentelemetry::global;
//! use opentelemetry_outbox_pattern::{
//!     BrokerConfig, InstrumentConfig, OutboxPatternInstrumentor,
//! };
//! use opentelemetry_sdk::propagation::TraceContextPropagator;
//! use opentelemetry_sdk::trace::SdkTracerProvider;
//!
//! global::set_text_map_propagator(TraceContextPropagator::new());
//! let provider = SdkTracerProvider::builder().build();
//!
//! OutboxPatternInstrumentor::new()
//!     .instrument(
//!         &provider,
//!         InstrumentConfig::new(BrokerConfig::new("rabbitmq", 61613)),
//!     )
//!     .expect("instrumentation can only be applied once");
//! ```
//!
//! # Settlement bridging
//!
//! Receive and ack/nack are independent entry points in the underlying
//! client; the acknowledge decision happens outside the receive call stack.
//! The crate bridges them with a per-thread slot holding the processing span
//! of the most recently delivered message, which is valid because the client
//! settles each delivery on its receiving thread before delivering the next
//! one there. Two unsettled deliveries on a single thread are not supported:
//! the second overwrites the first's slot, the first processing span ends
//! unsettled, and a later ack closes only the second span.

#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(
    docsrs,
    feature(doc_cfg, doc_auto_cfg),
    deny(rustdoc::broken_intra_doc_links)
)]

pub mod client;
mod consumer;
mod error;
pub mod formatters;
mod instrumentor;
mod pool;
pub mod propagation;
mod publisher;
mod span;

pub use error::Error;
pub use instrumentor::{
    BrokerConfig, HookError, InstrumentConfig, OutboxPatternInstrumentor, SpanHook,
    OTEL_OUTBOX_PATTERN_INSTRUMENT,
};
pub use pool::{TaskError, TaskHandle, TracedThreadPool};
pub use span::MessagingOperation;
