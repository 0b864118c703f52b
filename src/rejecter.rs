// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Rejection
//!
//! This module provides the manual negative acknowledgment of an inbound
//! delivery, allowing fine control of message disposition from inside a
//! flow. Rejection looks for the delivery tag in the message's inbound
//! scope and the delivering channel in its session scope. A missing tag is
//! a recoverable no-op; a tag without a resolvable channel means channel
//! affinity was lost and is surfaced as an error.

use crate::{
    errors::AmqpError,
    event::PipelineEvent,
    handler::MessageProcessor,
    message::{Message, AMQP_DELIVERY_TAG},
};
use async_trait::async_trait;
use opentelemetry::Context;
use tracing::{debug, warn};

/// Rejects the delivery that produced the given message.
///
/// # Parameters
/// * `message` - The message to reject; expected to carry a delivery tag
///   and a channel handle
/// * `requeue` - Whether the broker should requeue the delivery
///
/// # Returns
/// Ok(()) when the delivery was rejected or the message carries no
/// delivery tag; `MissingChannel` when a tag is present without a channel;
/// `RejectTransport` when the transport call fails
///
/// Rejecting the same delivery tag twice is not deduplicated here; the
/// broker may report an error on the second call and it is surfaced as is.
pub async fn reject(message: &Message, requeue: bool) -> Result<(), AmqpError> {
    let Some(delivery_tag) = message.delivery_tag() else {
        warn!(
            "missing `{}` inbound property, impossible to reject message: {}",
            AMQP_DELIVERY_TAG, message
        );
        return Ok(());
    };

    let Some(channel) = message.channel() else {
        return Err(AmqpError::MissingChannel(message.to_string()));
    };

    if let Err(err) = channel.reject(delivery_tag, requeue).await {
        return Err(AmqpError::RejectTransport {
            delivery_tag,
            channel: channel.id(),
            source: err,
        });
    }

    debug!(
        delivery_tag,
        channel = channel.id(),
        "manually rejected message"
    );

    Ok(())
}

/// Pipeline stage rejecting every message that passes through it.
///
/// Stateless and reentrant; safe to share across events.
pub struct MessageRejecter {
    requeue: bool,
}

impl MessageRejecter {
    /// Creates a rejecter that does not ask the broker to requeue.
    pub fn new() -> MessageRejecter {
        MessageRejecter { requeue: false }
    }

    /// Asks the broker to requeue rejected deliveries.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn requeue(mut self) -> Self {
        self.requeue = true;
        self
    }
}

impl Default for MessageRejecter {
    fn default() -> Self {
        MessageRejecter::new()
    }
}

#[async_trait]
impl MessageProcessor for MessageRejecter {
    async fn process(&self, _ctx: &Context, event: &mut PipelineEvent) -> Result<(), AmqpError> {
        reject(event.message(), self.requeue).await
    }
}
