// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Context
//!
//! This module provides the immutable pairing of a broker channel and the
//! delivery tag that channel assigned to one specific delivery. Delivery
//! tags are scoped to the lifetime of their channel; a tag only has meaning
//! together with the channel that issued it.

use crate::{
    channel::BrokerChannel,
    message::{Message, AMQP_DELIVERY_TAG},
};
use lapin::types::AMQPValue;
use std::sync::Arc;

/// The delivery identity of one inbound message.
///
/// Created by the inbound-delivery path when a message arrives, carried as
/// read-only metadata and discarded once the message is acknowledged or
/// rejected. Never reuse a delivery tag against a different channel;
/// acknowledgment state is channel-scoped.
#[derive(Clone)]
pub struct DeliveryContext {
    channel: Arc<dyn BrokerChannel>,
    delivery_tag: u64,
}

impl DeliveryContext {
    /// Creates a new delivery context for a delivery on the given channel.
    pub fn new(channel: Arc<dyn BrokerChannel>, delivery_tag: u64) -> DeliveryContext {
        DeliveryContext {
            channel,
            delivery_tag,
        }
    }

    /// Returns the channel that issued the delivery.
    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    /// Returns the broker-assigned delivery tag.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Installs this delivery identity on a message: the delivery tag in
    /// the inbound scope and the channel handle in the session scope.
    pub fn attach_to(&self, message: &mut Message) {
        message.set_inbound(
            AMQP_DELIVERY_TAG,
            AMQPValue::LongLongInt(self.delivery_tag as i64),
        );
        message.set_channel(self.channel.clone());
    }
}
