//! Top-level enable/disable switch for the instrumentation.

use std::env;
use std::fmt;
use std::sync::Arc;

use opentelemetry::global::{BoxedTracer, ObjectSafeTracer};
use opentelemetry::trace::{SpanRef, Tracer, TracerProvider};
use opentelemetry::{otel_debug, InstrumentationScope};
use serde_json::Value;

use crate::client;
use crate::client::Headers;
use crate::consumer::TracingConsumeInterceptor;
use crate::error::Error;
use crate::publisher::TracingPublishInterceptor;

/// Environment variable that disables the instrumentation when set to
/// `false`, `0` or `no` (ASCII case insensitive).
pub const OTEL_OUTBOX_PATTERN_INSTRUMENT: &str = "OTEL_OUTBOX_PATTERN_INSTRUMENT";

/// Error type returned by enrichment hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A user-supplied enrichment hook, invoked with the active span, the
/// message body and its headers.
///
/// A hook returning `Err` is logged at warning level and otherwise ignored:
/// it never changes span status and never blocks the wrapped operation.
pub type SpanHook =
    Arc<dyn Fn(&SpanRef<'_>, &Value, &Headers) -> Result<(), HookError> + Send + Sync>;

/// Connection target and system name of the broker, recorded on every span.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) system: String,
}

impl BrokerConfig {
    /// Creates a config for a broker reachable at `host:port`, with the
    /// messaging system name defaulted to `rabbitmq`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        BrokerConfig {
            host: host.into(),
            port,
            system: "rabbitmq".to_owned(),
        }
    }

    /// Overrides the `messaging.system` attribute value.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }
}

/// Configuration handed to [`OutboxPatternInstrumentor::instrument`].
pub struct InstrumentConfig {
    pub(crate) broker: BrokerConfig,
    pub(crate) publisher_hook: Option<SpanHook>,
    pub(crate) consumer_hook: Option<SpanHook>,
}

impl InstrumentConfig {
    /// Creates a config with no hooks.
    pub fn new(broker: BrokerConfig) -> Self {
        InstrumentConfig {
            broker,
            publisher_hook: None,
            consumer_hook: None,
        }
    }

    /// Sets a hook invoked on every producer span.
    pub fn with_publisher_hook(mut self, hook: SpanHook) -> Self {
        self.publisher_hook = Some(hook);
        self
    }

    /// Sets a hook invoked on every consumer processing span.
    pub fn with_consumer_hook(mut self, hook: SpanHook) -> Self {
        self.consumer_hook = Some(hook);
        self
    }
}

impl fmt::Debug for InstrumentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentConfig")
            .field("broker", &self.broker)
            .field("publisher_hook", &self.publisher_hook.is_some())
            .field("consumer_hook", &self.consumer_hook.is_some())
            .finish()
    }
}

/// Shared state wired into both interceptors while instrumented.
pub(crate) struct InstrumentationState {
    pub(crate) tracer: BoxedTracer,
    pub(crate) broker: BrokerConfig,
    pub(crate) publisher_hook: Option<SpanHook>,
    pub(crate) consumer_hook: Option<SpanHook>,
}

/// Wires tracing interceptors onto the messaging client's extension points.
///
/// The process is either *uninstrumented* (registry slots empty, client
/// behavior unchanged) or *instrumented* (tracing interceptors registered).
/// [`instrument`](Self::instrument) moves to the latter,
/// [`uninstrument`](Self::uninstrument) restores the former and may be
/// called any number of times.
#[derive(Debug, Default)]
pub struct OutboxPatternInstrumentor {
    _private: (),
}

impl OutboxPatternInstrumentor {
    /// Creates the instrumentor.
    pub fn new() -> Self {
        OutboxPatternInstrumentor { _private: () }
    }

    /// Obtains a tracer from `provider` and registers the publisher and
    /// consumer interceptors.
    ///
    /// No-op when disabled through [`OTEL_OUTBOX_PATTERN_INSTRUMENT`].
    /// Returns [`Error::AlreadyInstrumented`] when interceptors are already
    /// registered.
    pub fn instrument<P>(&self, provider: &P, config: InstrumentConfig) -> Result<(), Error>
    where
        P: TracerProvider,
        P::Tracer: Send + Sync + 'static,
        <P::Tracer as Tracer>::Span: Send + Sync + 'static,
    {
        if instrument_disabled() {
            otel_debug!(name: "OutboxPatternInstrumentor.DisabledByEnvironment");
            return Ok(());
        }
        if client::publish_interceptor().is_some() || client::consume_interceptor().is_some() {
            return Err(Error::AlreadyInstrumented);
        }

        let scope = InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
            .with_version(env!("CARGO_PKG_VERSION"))
            .build();
        let tracer: Box<dyn ObjectSafeTracer + Send + Sync> =
            Box::new(provider.tracer_with_scope(scope));
        let state = Arc::new(InstrumentationState {
            tracer: BoxedTracer::new(tracer),
            broker: config.broker,
            publisher_hook: config.publisher_hook,
            consumer_hook: config.consumer_hook,
        });

        client::set_publish_interceptor(Some(Arc::new(TracingPublishInterceptor::new(
            state.clone(),
        ))));
        client::set_consume_interceptor(Some(Arc::new(TracingConsumeInterceptor::new(state))));
        Ok(())
    }

    /// Clears both extension points, restoring un-instrumented behavior.
    /// Idempotent.
    pub fn uninstrument(&self) {
        client::set_publish_interceptor(None);
        client::set_consume_interceptor(None);
    }
}

fn instrument_disabled() -> bool {
    env::var(OTEL_OUTBOX_PATTERN_INSTRUMENT)
        .map(|value| {
            let value = value.trim();
            value.eq_ignore_ascii_case("false")
                || value == "0"
                || value.eq_ignore_ascii_case("no")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_flag_parsing() {
        temp_env::with_var(OTEL_OUTBOX_PATTERN_INSTRUMENT, None::<&str>, || {
            assert!(!instrument_disabled());
        });
        for value in ["false", "FALSE", "0", "no", " false "] {
            temp_env::with_var(OTEL_OUTBOX_PATTERN_INSTRUMENT, Some(value), || {
                assert!(instrument_disabled(), "{value:?} should disable");
            });
        }
        for value in ["true", "1", "yes", ""] {
            temp_env::with_var(OTEL_OUTBOX_PATTERN_INSTRUMENT, Some(value), || {
                assert!(!instrument_disabled(), "{value:?} should not disable");
            });
        }
    }

    #[test]
    fn broker_config_defaults_to_rabbitmq() {
        let broker = BrokerConfig::new("rabbitmq", 61613);
        assert_eq!(broker.system, "rabbitmq");
        let broker = broker.with_system("activemq");
        assert_eq!(broker.system, "activemq");
    }
}
