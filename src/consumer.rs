//! Consumer-side instrumentation.
//!
//! The receive and settle phases of a delivery are separate entry points:
//! the client invokes the delivery callback, the callback (or the client on
//! its behalf) later acks or nacks, possibly well outside the receive call
//! stack. The bridge between the two is a thread-local slot holding the
//! processing span of the message most recently delivered on this thread.
//! That is sound because the client settles a delivery on the thread that
//! received it, and never interleaves two unsettled deliveries on one
//! thread; a new delivery simply overwrites the slot.

use std::cell::RefCell;
use std::sync::Arc;

use opentelemetry::trace::{Span, SpanKind, Status, TraceContextExt};
use opentelemetry::{global, otel_warn, Context};

use crate::client::{ClientError, ConsumeInterceptor, Delivery, DeliveryNext, Headers, SettleNext};
use crate::error::Error;
use crate::formatters::format_consumer_destination;
use crate::instrumentor::InstrumentationState;
use crate::propagation::HeaderExtractor;
use crate::span::{get_ack_nack_span, get_span, MessagingOperation};

thread_local! {
    static PENDING_CONSUMER_SPAN: RefCell<Option<PendingConsumerSpan>> =
        const { RefCell::new(None) };
}

/// Per-thread association between a delivered message's processing span and
/// the ack/nack that settles it.
#[derive(Clone)]
struct PendingConsumerSpan {
    /// Context carrying the un-ended `process` span.
    cx: Context,
    headers: Headers,
    destination: String,
}

#[derive(Clone, Copy)]
enum Settlement {
    Ack,
    Nack,
}

impl Settlement {
    fn operation(self) -> MessagingOperation {
        match self {
            Settlement::Ack => MessagingOperation::Ack,
            Settlement::Nack => MessagingOperation::Nack,
        }
    }

    fn event_name(self) -> &'static str {
        match self {
            Settlement::Ack => "message.ack",
            Settlement::Nack => "message.nack",
        }
    }

    fn status(self) -> Status {
        match self {
            Settlement::Ack => Status::Ok,
            Settlement::Nack => Status::error("message was negatively acknowledged"),
        }
    }
}

pub(crate) struct TracingConsumeInterceptor {
    state: Arc<InstrumentationState>,
}

impl TracingConsumeInterceptor {
    pub(crate) fn new(state: Arc<InstrumentationState>) -> Self {
        TracingConsumeInterceptor { state }
    }

    /// Extracts the remote context, starts the `process` span and parks it
    /// in the thread-local slot.
    fn start_processing(&self, delivery: &Delivery) -> Result<Context, Error> {
        let destination = format_consumer_destination(&delivery.headers)?;
        let parent_cx = global::get_text_map_propagator(|propagator| {
            propagator.extract(&HeaderExtractor(&delivery.headers))
        });
        let span = get_span(
            &self.state.tracer,
            &destination,
            SpanKind::Consumer,
            &delivery.headers,
            &delivery.body,
            format!("process {destination}"),
            Some(MessagingOperation::Receive),
            &self.state.broker,
            &parent_cx,
        );
        let cx = parent_cx.with_span(span);

        PENDING_CONSUMER_SPAN.with(|slot| {
            *slot.borrow_mut() = Some(PendingConsumerSpan {
                cx: cx.clone(),
                headers: delivery.headers.clone(),
                destination,
            });
        });
        Ok(cx)
    }

    /// Closes the pending processing span with the settlement outcome and
    /// emits the matching ack/nack span.
    fn settle(&self, settlement: Settlement) {
        let pending = PENDING_CONSUMER_SPAN.with(|slot| slot.borrow().clone());
        let Some(pending) = pending else {
            otel_warn!(
                name: "ConsumeInterceptor.SettleWithoutDelivery",
                operation = settlement.operation().as_str()
            );
            return;
        };

        let _guard = pending.cx.clone().attach();
        let mut span = get_ack_nack_span(
            &self.state.tracer,
            SpanKind::Consumer,
            format!(
                "{} {}",
                settlement.operation().as_str(),
                pending.destination
            ),
            &pending.destination,
            settlement.operation(),
            &pending.headers,
            &self.state.broker,
            &pending.cx,
        );
        span.add_event(settlement.event_name(), Vec::new());
        span.set_status(settlement.status());
        span.end();

        let process_span = pending.cx.span();
        process_span.add_event(settlement.event_name(), Vec::new());
        process_span.set_status(settlement.status());
        process_span.end();
    }
}

impl ConsumeInterceptor for TracingConsumeInterceptor {
    fn around_delivery(
        &self,
        delivery: &mut Delivery,
        next: DeliveryNext<'_>,
    ) -> Result<(), ClientError> {
        let cx = match self.start_processing(delivery) {
            Ok(cx) => cx,
            Err(err) => {
                otel_warn!(
                    name: "ConsumeInterceptor.DeliverySetupFailed",
                    reason = format!("{err}")
                );
                // The message still has to reach the application, untraced.
                return next(delivery);
            }
        };

        let guard = cx.clone().attach();
        if let Some(hook) = &self.state.consumer_hook {
            if let Err(err) = hook(&cx.span(), &delivery.body, &delivery.headers) {
                otel_warn!(
                    name: "ConsumeInterceptor.HookFailed",
                    reason = format!("{err}")
                );
            }
        }
        let result = next(delivery);
        drop(guard);
        result
    }

    fn around_ack(&self, next: SettleNext<'_>) -> Result<(), ClientError> {
        self.settle(Settlement::Ack);
        next()
    }

    fn around_nack(&self, next: SettleNext<'_>) -> Result<(), ClientError> {
        self.settle(Settlement::Nack);
        next()
    }
}
