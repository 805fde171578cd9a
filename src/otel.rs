// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels in AMQP message headers: the publisher injects the current
//! context, the delivery loop extracts it and starts a consumer span per message.

use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global::{self, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, TraceContextExt, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Name of the tracer used for consumer spans
pub(crate) const CONSUMER_TRACER: &str = "amqp consumer";

/// Adapter exposing AMQP headers to the OpenTelemetry propagators.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Headers carrying the current trace context.
pub(crate) fn inject_current() -> FieldTable {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(
            &Context::current(),
            &mut RabbitMQTracePropagator::new(&mut headers),
        )
    });

    FieldTable::from(headers)
}

/// Extracts the publisher's context from `props` and attaches a new consumer span to it.
pub(crate) fn consumer_context(
    props: &BasicProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> Context {
    let mut headers = props.headers().clone().unwrap_or_default().inner().clone();

    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    ctx.with_span(span)
}
