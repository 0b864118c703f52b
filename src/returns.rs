// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Returned-Message Handling
//!
//! This module provides the capture and redistribution of messages the
//! broker hands back as undeliverable. A return arrives on the broker's own
//! execution context, outside any caller-initiated call stack, so the
//! listener invoked with it reconstructs a fresh message, stamps it with
//! the return metadata and fans it out to the configured downstream
//! processors. Nothing raised during that redispatch may cross back into
//! the broker's context.
//!
//! Two listener variants exist: a logging one, used process-wide when no
//! dispatcher is configured, and a dispatching one, created per event by
//! the [`ReturnHandler`] stage and installed on the event's message for the
//! publish step to register with the channel.

use crate::{
    connector::Connector,
    errors::AmqpError,
    event::{ExchangePattern, Flow, PipelineEvent},
    handler::MessageProcessor,
    message::{
        Message, AMQP_RETURN_EXCHANGE, AMQP_RETURN_REPLY_CODE, AMQP_RETURN_REPLY_TEXT,
        AMQP_RETURN_ROUTING_KEY,
    },
    otel,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use lapin::{
    message::BasicReturnMessage,
    types::{AMQPValue, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use std::{
    borrow::Cow,
    collections::BTreeMap,
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, OnceLock,
    },
};
use tracing::{debug, error, warn};

/// One broker notification that a published message could not be routed.
///
/// Built inside the broker callback from the raw notification data and
/// converted immediately into a fresh pipeline message; not retained
/// beyond that conversion.
#[derive(Clone, Debug)]
pub struct ReturnEnvelope {
    /// AMQP code providing information about why the message was undeliverable
    pub reply_code: u16,

    /// Text providing information about why the message was undeliverable
    pub reply_text: String,

    /// The name of the exchange the message was originally published to
    pub exchange: String,

    /// The routing key specified when the message was published
    pub routing_key: String,

    /// The property bag of the bounced publish
    pub properties: BasicProperties,

    /// The content body of the bounced publish
    pub body: Vec<u8>,
}

impl From<BasicReturnMessage> for ReturnEnvelope {
    fn from(returned: BasicReturnMessage) -> Self {
        ReturnEnvelope {
            reply_code: returned.reply_code,
            reply_text: returned.reply_text.to_string(),
            exchange: returned.delivery.exchange.to_string(),
            routing_key: returned.delivery.routing_key.to_string(),
            properties: returned.delivery.properties,
            body: returned.delivery.data,
        }
    }
}

impl fmt::Display for ReturnEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "returned message with code: {}, reason: {}, exchange: {}, routing key: {}, body: {} bytes",
            self.reply_code,
            self.reply_text,
            self.exchange,
            self.routing_key,
            self.body.len()
        )
    }
}

/// Receiver of broker return notifications.
///
/// `handle_return` is invoked from the broker's execution context; it must
/// return normally no matter what happens while handling the notification.
#[async_trait]
pub trait ReturnListener: Send + Sync {
    async fn handle_return(&self, envelope: ReturnEnvelope);
}

/// Listener that only counts and logs returned messages.
///
/// Safe under concurrent invocation from multiple broker callback contexts;
/// the hit counter is its only state.
pub struct LoggingReturnListener {
    hits: AtomicUsize,
}

impl LoggingReturnListener {
    pub fn new() -> LoggingReturnListener {
        LoggingReturnListener {
            hits: AtomicUsize::new(0),
        }
    }

    /// Returns how many return notifications this listener has received.
    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }
}

impl Default for LoggingReturnListener {
    fn default() -> Self {
        LoggingReturnListener::new()
    }
}

#[async_trait]
impl ReturnListener for LoggingReturnListener {
    async fn handle_return(&self, envelope: ReturnEnvelope) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        warn!("{}", envelope);
    }
}

/// Returns the process-wide logging listener, used whenever a publish path
/// has no dispatching listener configured.
pub fn default_return_listener() -> Arc<LoggingReturnListener> {
    static DEFAULT: OnceLock<Arc<LoggingReturnListener>> = OnceLock::new();
    DEFAULT
        .get_or_init(|| Arc::new(LoggingReturnListener::new()))
        .clone()
}

/// Listener redistributing returned messages to downstream processors.
///
/// Bound at construction to the flow owning the event it was created for,
/// the shared connector configuration and the ordered processor list. Each
/// instance owns its bindings; listeners for different events share no
/// mutable state and tolerate concurrent invocation.
pub struct DispatchingReturnListener {
    flow: Arc<Flow>,
    connector: Arc<Connector>,
    processors: Vec<Arc<dyn MessageProcessor>>,
}

impl DispatchingReturnListener {
    /// Creates a listener bound to a flow, a connector and the processors
    /// that will receive reconstructed returned messages.
    ///
    /// All three bindings are required up front; a listener never exists
    /// half-initialized.
    pub fn new(
        flow: Arc<Flow>,
        connector: Arc<Connector>,
        processors: Vec<Arc<dyn MessageProcessor>>,
    ) -> DispatchingReturnListener {
        DispatchingReturnListener {
            flow,
            connector,
            processors,
        }
    }

    async fn dispatch(&self, ctx: &Context, message: &Message) -> Result<(), AmqpError> {
        for processor in &self.processors {
            let mut event = PipelineEvent::new(
                message.clone(),
                ExchangePattern::OneWay,
                self.flow.clone(),
            );
            event.apply_transformers(self.connector.receive_transformers())?;
            processor.process(ctx, &mut event).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ReturnListener for DispatchingReturnListener {
    async fn handle_return(&self, envelope: ReturnEnvelope) {
        let tracer = global::tracer("amqp return");
        let (ctx, mut span) = otel::new_span(&envelope.properties, &tracer, "amqp return");

        let mut return_context = BTreeMap::new();
        return_context.insert(
            ShortString::from(AMQP_RETURN_REPLY_CODE),
            AMQPValue::LongUInt(u32::from(envelope.reply_code)),
        );
        return_context.insert(
            ShortString::from(AMQP_RETURN_REPLY_TEXT),
            AMQPValue::LongString(envelope.reply_text.clone().into()),
        );
        return_context.insert(
            ShortString::from(AMQP_RETURN_EXCHANGE),
            AMQPValue::LongString(envelope.exchange.clone().into()),
        );
        return_context.insert(
            ShortString::from(AMQP_RETURN_ROUTING_KEY),
            AMQPValue::LongString(envelope.routing_key.clone().into()),
        );

        // The returned publish never was a delivery: no tag, no channel.
        let mut message = self
            .connector
            .message_factory()
            .create(envelope.properties.clone(), envelope.body.clone());
        message.merge_inbound(return_context);

        // Nothing may escape past this point into the broker's context.
        let result = AssertUnwindSafe(self.dispatch(&ctx, &message))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => span.set_status(Status::Ok),
            Ok(Err(err)) => {
                error!(
                    error = err.to_string(),
                    "{}, impossible to dispatch the following message to the configured processors: {}",
                    envelope, message
                );
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("failure to dispatch returned message"),
                });
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|reason| (*reason).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                let err = AmqpError::ReturnDispatch(reason);

                error!(
                    error = err.to_string(),
                    "{}, impossible to dispatch the following message to the configured processors: {}",
                    envelope, message
                );
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("panic while dispatching returned message"),
                });
            }
        }
    }
}

/// Intercepting stage installing a fresh dispatching listener on every
/// event that passes through.
///
/// The stage performs no I/O; the publish step retrieves the installed
/// listener from the message's invocation scope and registers it with the
/// channel before each publish that could be returned.
pub struct ReturnHandler {
    connector: Arc<Connector>,
    processors: Vec<Arc<dyn MessageProcessor>>,
    next: Option<Arc<dyn MessageProcessor>>,
}

impl ReturnHandler {
    /// Creates a stage with no downstream processors and no next stage.
    pub fn new(connector: Arc<Connector>) -> ReturnHandler {
        ReturnHandler {
            connector,
            processors: vec![],
            next: None,
        }
    }

    /// Appends a processor to the list receiving returned messages.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn processor(mut self, processor: Arc<dyn MessageProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    /// Sets the stage events are forwarded to after the listener is
    /// installed.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn next(mut self, next: Arc<dyn MessageProcessor>) -> Self {
        self.next = Some(next);
        self
    }
}

#[async_trait]
impl MessageProcessor for ReturnHandler {
    async fn process(&self, ctx: &Context, event: &mut PipelineEvent) -> Result<(), AmqpError> {
        if self.connector.is_stopping() {
            debug!("connector stopping, no return listener installed");
        } else {
            let Some(flow) = event.flow() else {
                return Err(AmqpError::InvalidContext(
                    "missing owning flow, impossible to create a return listener".to_owned(),
                ));
            };

            let listener = DispatchingReturnListener::new(
                flow.clone(),
                self.connector.clone(),
                self.processors.clone(),
            );
            event.message_mut().set_return_listener(Arc::new(listener));
        }

        match &self.next {
            Some(next) => next.process(ctx, event).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Transformer;
    use crate::message::MessageFactory;
    use std::sync::Mutex;

    struct Seen {
        payload: Vec<u8>,
        reply_code: Option<AMQPValue>,
        reply_text: Option<AMQPValue>,
        exchange: Option<AMQPValue>,
        routing_key: Option<AMQPValue>,
        delivery_tag: Option<u64>,
        pattern: ExchangePattern,
        flow: Option<String>,
        listener_installed: bool,
    }

    struct RecordingProcessor {
        label: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
        seen: Arc<Mutex<Vec<Seen>>>,
    }

    impl RecordingProcessor {
        fn new(label: &'static str, order: Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
            Arc::new(RecordingProcessor {
                label,
                order,
                seen: Arc::new(Mutex::new(vec![])),
            })
        }
    }

    #[async_trait]
    impl MessageProcessor for RecordingProcessor {
        async fn process(
            &self,
            _ctx: &Context,
            event: &mut PipelineEvent,
        ) -> Result<(), AmqpError> {
            self.order.lock().unwrap().push(self.label);
            let message = event.message();
            self.seen.lock().unwrap().push(Seen {
                payload: message.payload().to_vec(),
                reply_code: message.inbound(AMQP_RETURN_REPLY_CODE).cloned(),
                reply_text: message.inbound(AMQP_RETURN_REPLY_TEXT).cloned(),
                exchange: message.inbound(AMQP_RETURN_EXCHANGE).cloned(),
                routing_key: message.inbound(AMQP_RETURN_ROUTING_KEY).cloned(),
                delivery_tag: message.delivery_tag(),
                pattern: event.pattern(),
                flow: event.flow().map(|flow| flow.name().to_owned()),
                listener_installed: message.return_listener().is_some(),
            });
            Ok(())
        }
    }

    struct FailingProcessor;

    #[async_trait]
    impl MessageProcessor for FailingProcessor {
        async fn process(
            &self,
            _ctx: &Context,
            _event: &mut PipelineEvent,
        ) -> Result<(), AmqpError> {
            Err(AmqpError::ProcessorError("downstream broke".to_owned()))
        }
    }

    struct PanickingProcessor;

    #[async_trait]
    impl MessageProcessor for PanickingProcessor {
        async fn process(
            &self,
            _ctx: &Context,
            _event: &mut PipelineEvent,
        ) -> Result<(), AmqpError> {
            panic!("downstream exploded");
        }
    }

    fn envelope() -> ReturnEnvelope {
        ReturnEnvelope {
            reply_code: 312,
            reply_text: "NO_ROUTE".to_owned(),
            exchange: "orders".to_owned(),
            routing_key: "orders.eu".to_owned(),
            properties: BasicProperties::default(),
            body: b"payload".to_vec(),
        }
    }

    fn listener(
        connector: Arc<Connector>,
        processors: Vec<Arc<dyn MessageProcessor>>,
    ) -> DispatchingReturnListener {
        DispatchingReturnListener::new(Flow::new("orders"), connector, processors)
    }

    #[tokio::test]
    async fn logging_listener_counts_every_notification() {
        let logging = LoggingReturnListener::new();

        logging.handle_return(envelope()).await;
        logging.handle_return(envelope()).await;
        logging
            .handle_return(ReturnEnvelope {
                reply_code: 0,
                reply_text: String::new(),
                exchange: String::new(),
                routing_key: String::new(),
                properties: BasicProperties::default(),
                body: vec![],
            })
            .await;

        assert_eq!(logging.hit_count(), 3);
    }

    #[test]
    fn default_listener_is_process_wide() {
        assert!(Arc::ptr_eq(
            &default_return_listener(),
            &default_return_listener()
        ));
    }

    #[tokio::test]
    async fn dispatch_attaches_return_metadata_and_no_delivery_context() {
        let order = Arc::new(Mutex::new(vec![]));
        let processor = RecordingProcessor::new("only", order);
        let baseline = default_return_listener().hit_count();

        listener(Arc::new(Connector::new()), vec![processor.clone()])
            .handle_return(envelope())
            .await;

        let seen = processor.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload, b"payload");
        assert_eq!(seen[0].reply_code, Some(AMQPValue::LongUInt(312)));
        assert_eq!(
            seen[0].reply_text,
            Some(AMQPValue::LongString("NO_ROUTE".to_owned().into()))
        );
        assert_eq!(
            seen[0].exchange,
            Some(AMQPValue::LongString("orders".to_owned().into()))
        );
        assert_eq!(
            seen[0].routing_key,
            Some(AMQPValue::LongString("orders.eu".to_owned().into()))
        );
        assert_eq!(seen[0].delivery_tag, None);
        assert_eq!(seen[0].pattern, ExchangePattern::OneWay);
        assert_eq!(seen[0].flow.as_deref(), Some("orders"));

        // A dispatching listener never touches the process-wide counter.
        assert_eq!(default_return_listener().hit_count(), baseline);
    }

    #[tokio::test]
    async fn dispatch_invokes_every_processor_in_order() {
        let order = Arc::new(Mutex::new(vec![]));
        let first = RecordingProcessor::new("first", order.clone());
        let second = RecordingProcessor::new("second", order.clone());

        listener(
            Arc::new(Connector::new()),
            vec![first.clone(), second.clone()],
        )
        .handle_return(envelope())
        .await;

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(first.seen.lock().unwrap().len(), 1);
        assert_eq!(second.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transformers_apply_once_per_dispatched_copy() {
        struct Suffix;

        impl Transformer for Suffix {
            fn transform(&self, message: &mut Message) -> Result<(), AmqpError> {
                let mut payload = message.payload().to_vec();
                payload.extend_from_slice(b"-t");
                message.set_payload(payload);
                Ok(())
            }
        }

        let connector = Arc::new(Connector::new().receive_transformer(Arc::new(Suffix)));
        let order = Arc::new(Mutex::new(vec![]));
        let first = RecordingProcessor::new("first", order.clone());
        let second = RecordingProcessor::new("second", order);

        listener(connector, vec![first.clone(), second.clone()])
            .handle_return(envelope())
            .await;

        assert_eq!(first.seen.lock().unwrap()[0].payload, b"payload-t");
        assert_eq!(second.seen.lock().unwrap()[0].payload, b"payload-t");
    }

    #[tokio::test]
    async fn processor_failure_never_escapes_the_callback() {
        let order = Arc::new(Mutex::new(vec![]));
        let after = RecordingProcessor::new("after", order.clone());

        listener(
            Arc::new(Connector::new()),
            vec![Arc::new(FailingProcessor), after.clone()],
        )
        .handle_return(envelope())
        .await;

        // The failure aborts the fan-out and is swallowed.
        assert!(order.lock().unwrap().is_empty());
        assert!(after.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn processor_panic_never_escapes_the_callback() {
        listener(Arc::new(Connector::new()), vec![Arc::new(PanickingProcessor)])
            .handle_return(envelope())
            .await;
    }

    #[tokio::test]
    async fn handler_installs_a_listener_and_forwards() {
        let order = Arc::new(Mutex::new(vec![]));
        let next = RecordingProcessor::new("next", order.clone());
        let handler = ReturnHandler::new(Arc::new(Connector::new())).next(next.clone());

        let message = MessageFactory::default().create(BasicProperties::default(), vec![]);
        let mut event = PipelineEvent::new(message, ExchangePattern::OneWay, Flow::new("orders"));

        handler
            .process(&Context::current(), &mut event)
            .await
            .unwrap();

        assert!(event.message().return_listener().is_some());
        assert_eq!(*order.lock().unwrap(), vec!["next"]);
        assert!(next.seen.lock().unwrap()[0].listener_installed);
    }

    #[tokio::test]
    async fn handler_fails_fast_without_an_owning_flow() {
        let order = Arc::new(Mutex::new(vec![]));
        let next = RecordingProcessor::new("next", order.clone());
        let handler = ReturnHandler::new(Arc::new(Connector::new())).next(next);

        let message = MessageFactory::default().create(BasicProperties::default(), vec![]);
        let mut event = PipelineEvent::detached(message, ExchangePattern::OneWay);

        let result = handler.process(&Context::current(), &mut event).await;

        assert!(matches!(result, Err(AmqpError::InvalidContext(_))));
        assert!(order.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn handler_skips_installation_once_stopping() {
        let connector = Arc::new(Connector::new());
        connector.shutdown();

        let order = Arc::new(Mutex::new(vec![]));
        let next = RecordingProcessor::new("next", order.clone());
        let handler = ReturnHandler::new(connector).next(next);

        let message = MessageFactory::default().create(BasicProperties::default(), vec![]);
        let mut event = PipelineEvent::new(message, ExchangePattern::OneWay, Flow::new("orders"));

        handler
            .process(&Context::current(), &mut event)
            .await
            .unwrap();

        assert!(event.message().return_listener().is_none());
        assert_eq!(*order.lock().unwrap(), vec!["next"]);
    }
}
