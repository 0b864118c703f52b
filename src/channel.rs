// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Channel Capability
//!
//! This module provides the capability this layer needs from a broker
//! channel: issuing a negative acknowledgment for a delivery and holding a
//! return listener for publishes that may bounce. Channels are owned by the
//! connection-management layer; this layer only ever borrows a handle to
//! issue these two calls.
//!
//! `AmqpChannel` adapts a lapin channel to the capability. Returned
//! messages surface from lapin through publisher-confirm resolution, so the
//! publish path hands each resolved confirmation to the adapter, which
//! forwards any bounced message to the registered listener.

use crate::returns::{default_return_listener, ReturnEnvelope, ReturnListener};
use async_trait::async_trait;
use lapin::{options::BasicRejectOptions, publisher_confirm::Confirmation, Channel};
use std::{
    io,
    sync::{Arc, Mutex},
};
use tracing::{debug, warn};

/// The channel operations this layer relies on.
///
/// Delivery tags are scoped to one channel; implementations must route the
/// reject to the same channel that issued the tag. Concurrent rejects for
/// distinct deliveries are allowed; serializing calls on one channel is the
/// implementation's concern.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Returns the channel id, used to correlate diagnostics.
    fn id(&self) -> u16;

    /// Issues a negative acknowledgment for the given delivery tag,
    /// optionally asking the broker to requeue the delivery.
    ///
    /// # Returns
    /// Ok(()) once the broker accepted the command, or the transport
    /// failure that prevented it
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), io::Error>;

    /// Installs the listener that receives messages the broker returns as
    /// undeliverable. Replaces any previously registered listener.
    fn register_return_listener(&self, listener: Arc<dyn ReturnListener>);
}

/// Lapin-backed implementation of the channel capability.
pub struct AmqpChannel {
    channel: Arc<Channel>,
    listener: Mutex<Option<Arc<dyn ReturnListener>>>,
}

impl AmqpChannel {
    /// Wraps a lapin channel.
    ///
    /// # Parameters
    /// * `channel` - A channel to the RabbitMQ server
    ///
    /// # Returns
    /// An Arc-wrapped AmqpChannel instance for thread-safe sharing
    pub fn new(channel: Arc<Channel>) -> Arc<AmqpChannel> {
        Arc::new(AmqpChannel {
            channel,
            listener: Mutex::new(None),
        })
    }

    /// Forwards a resolved publisher confirmation to the registered return
    /// listener.
    ///
    /// The publish path calls this with every confirmation it resolves.
    /// Confirmations that carry no returned message are ignored. The
    /// listener runs on a spawned task so slow downstream handling cannot
    /// stall the confirm-draining path; when no listener was registered the
    /// process-wide logging listener takes the message.
    pub fn handle_confirmation(&self, confirmation: Confirmation) {
        let returned = match confirmation {
            Confirmation::Ack(Some(returned)) | Confirmation::Nack(Some(returned)) => returned,
            _ => return,
        };

        let listener: Arc<dyn ReturnListener> = match self.listener.lock().unwrap().clone() {
            Some(listener) => listener,
            None => {
                warn!(
                    channel = self.channel.id(),
                    "message returned without a registered listener, falling back to logging"
                );
                default_return_listener()
            }
        };

        let envelope = ReturnEnvelope::from(*returned);
        tokio::spawn(async move {
            listener.handle_return(envelope).await;
        });
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), io::Error> {
        debug!(delivery_tag, requeue, "rejecting delivery");
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(io::Error::other)
    }

    fn register_return_listener(&self, listener: Arc<dyn ReturnListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }
}
