//! Glue between the codec's [`TraceContext`] and the OpenTelemetry tracer.
//!
//! The bridge never holds thread-local "current span" state across an `.await`. The active
//! span travels as an explicit [`opentelemetry::Context`] value, and its lifetime is bounded
//! by a [`SpanGuard`]. Where code further down reads the current context, the future is
//! wrapped so that context is attached again on every poll.

use std::borrow::Cow;

use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{
    SpanContext, SpanId, Status, TraceContextExt as _, TraceFlags, TraceId, TraceState,
};
use opentelemetry::Context;

use crate::codec::TraceContext;

/// Instrumentation scope name used for the bridge's own spans.
pub const TRACER_NAME: &str = "mqtt-trace-bridge";

/// Name of the span opened around inbound handling.
pub const RECEIVE_SPAN_NAME: &str = "receive-mqtt";

/// Name of the span opened around an outbound publish.
pub const SEND_SPAN_NAME: &str = "send-mqtt";

pub(crate) const MESSAGING_SYSTEM: &str = "messaging.system";
pub(crate) const MESSAGING_DESTINATION: &str = "messaging.destination.name";
pub(crate) const MESSAGING_SYSTEM_MQTT: &str = "mqtt";

/// The tracer from the globally installed provider.
///
/// Until [`crate::telemetry::init`] installs an SDK provider this is a no-op tracer, which
/// still propagates whatever remote context it is handed.
pub fn global_tracer() -> BoxedTracer {
    global::tracer(TRACER_NAME)
}

/// Converts a decoded token into a remote OpenTelemetry span context.
///
/// Returns `None` when either identifier is not valid hex or is all zeros, since
/// OpenTelemetry cannot parent a span on such a context.
pub fn remote_span_context(context: &TraceContext) -> Option<SpanContext> {
    let trace_id = TraceId::from_hex(context.trace_id()).ok()?;
    let span_id = SpanId::from_hex(context.span_id()).ok()?;
    let flags = if context.sampled() {
        TraceFlags::SAMPLED
    } else {
        TraceFlags::default()
    };

    let span_context = SpanContext::new(trace_id, span_id, flags, true, TraceState::default());
    span_context.is_valid().then_some(span_context)
}

/// A fresh context whose parent is the remote span described by `context`.
pub fn remote_parent(context: &TraceContext) -> Option<Context> {
    remote_span_context(context)
        .map(|span_context| Context::new().with_remote_span_context(span_context))
}

/// The codec view of an OpenTelemetry span context.
pub fn trace_context_of(span_context: &SpanContext) -> TraceContext {
    TraceContext::from_fields(
        span_context.trace_id().to_string(),
        span_context.span_id().to_string(),
        span_context.is_sampled(),
    )
}

/// Owns a context holding a started span and ends that span when dropped.
///
/// Every exit path out of the scope holding the guard ends the span, including `?`
/// returns, handler errors and unwinding.
#[derive(Debug)]
pub struct SpanGuard {
    cx: Context,
}

impl SpanGuard {
    /// Takes ownership of the span active in `cx`.
    pub fn new(cx: Context) -> Self {
        Self { cx }
    }

    /// The context with the guarded span active, to pass down the call chain.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    /// The guarded span's own identifiers.
    pub fn trace_context(&self) -> TraceContext {
        trace_context_of(self.cx.span().span_context())
    }

    /// Marks the guarded span as failed.
    pub fn set_error(&self, description: impl Into<Cow<'static, str>>) {
        self.cx.span().set_status(Status::error(description));
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.cx.span().end();
    }
}
