// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pipeline Events
//!
//! This module provides the per-message unit of pipeline execution: a
//! message together with its exchange pattern and the identity of the flow
//! that owns its processing. Events are built by the inbound path for
//! deliveries and by the return dispatch path for reconstructed returned
//! messages.

use crate::{errors::AmqpError, handler::Transformer, message::Message};
use std::sync::Arc;

/// How a reply is expected for an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangePattern {
    /// Fire-and-forget; no reply is expected
    #[default]
    OneWay,
    /// A reply is expected on the same event
    RequestResponse,
}

/// The identity of the flow owning an event's processing.
///
/// Listener instances hold the flow of the event they were created for, so
/// events built later for returned messages stay correlated with the flow
/// that published them.
#[derive(Debug)]
pub struct Flow {
    name: String,
}

impl Flow {
    /// Creates a shared flow identity with the given name.
    pub fn new(name: &str) -> Arc<Flow> {
        Arc::new(Flow {
            name: name.to_owned(),
        })
    }

    /// Returns the flow name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One message travelling through the pipeline.
pub struct PipelineEvent {
    message: Message,
    pattern: ExchangePattern,
    flow: Option<Arc<Flow>>,
}

impl PipelineEvent {
    /// Creates an event owned by a flow.
    ///
    /// # Parameters
    /// * `message` - The message the event carries
    /// * `pattern` - The exchange pattern of the event
    /// * `flow` - The flow owning the event's processing
    pub fn new(message: Message, pattern: ExchangePattern, flow: Arc<Flow>) -> PipelineEvent {
        PipelineEvent {
            message,
            pattern,
            flow: Some(flow),
        }
    }

    /// Creates an event not yet bound to any flow.
    ///
    /// Detached events cannot have a return listener installed; stages that
    /// need an owning flow fail on them.
    pub fn detached(message: Message, pattern: ExchangePattern) -> PipelineEvent {
        PipelineEvent {
            message,
            pattern,
            flow: None,
        }
    }

    /// Returns the message carried by the event.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Returns the message carried by the event, mutably.
    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    /// Returns the exchange pattern of the event.
    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    /// Returns the flow owning the event, if any.
    pub fn flow(&self) -> Option<&Arc<Flow>> {
        self.flow.as_ref()
    }

    /// Applies a transformation chain to the message payload, in chain
    /// order, stopping at the first failure.
    pub fn apply_transformers(
        &mut self,
        chain: &[Arc<dyn Transformer>],
    ) -> Result<(), AmqpError> {
        for transformer in chain {
            transformer.transform(&mut self.message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageFactory;
    use lapin::BasicProperties;

    struct Append(&'static str);

    impl Transformer for Append {
        fn transform(&self, message: &mut Message) -> Result<(), AmqpError> {
            let mut payload = message.payload().to_vec();
            payload.extend_from_slice(self.0.as_bytes());
            message.set_payload(payload);
            Ok(())
        }
    }

    struct Fail;

    impl Transformer for Fail {
        fn transform(&self, _message: &mut Message) -> Result<(), AmqpError> {
            Err(AmqpError::TransformerError("broken".to_owned()))
        }
    }

    fn event() -> PipelineEvent {
        let message = MessageFactory::default().create(BasicProperties::default(), b"x".to_vec());
        PipelineEvent::new(message, ExchangePattern::OneWay, Flow::new("orders"))
    }

    #[test]
    fn transformers_run_in_chain_order() {
        let chain: Vec<Arc<dyn Transformer>> = vec![Arc::new(Append("-a")), Arc::new(Append("-b"))];
        let mut event = event();

        event.apply_transformers(&chain).unwrap();

        assert_eq!(event.message().payload(), b"x-a-b");
    }

    #[test]
    fn chain_stops_at_the_first_failure() {
        let chain: Vec<Arc<dyn Transformer>> =
            vec![Arc::new(Append("-a")), Arc::new(Fail), Arc::new(Append("-b"))];
        let mut event = event();

        let result = event.apply_transformers(&chain);

        assert!(matches!(result, Err(AmqpError::TransformerError(_))));
        assert_eq!(event.message().payload(), b"x-a");
    }

    #[test]
    fn detached_events_have_no_flow() {
        let message = MessageFactory::default().create(BasicProperties::default(), vec![]);
        let event = PipelineEvent::detached(message, ExchangePattern::OneWay);

        assert!(event.flow().is_none());
        assert_eq!(event.pattern(), ExchangePattern::OneWay);
    }
}
