// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Abstraction
//!
//! This module provides the message carried through the pipeline, with its
//! payload, its protocol property bag and its typed property scopes. Scalar
//! correlation metadata lives in the inbound and outbound scopes as AMQP
//! field values; the channel handle that delivered the message lives in the
//! session scope and the return listener installed for a publish lives in
//! the invocation scope.
//!
//! The well-known property keys defined here are part of the connector's
//! correlation contract and must not change.

use crate::{channel::BrokerChannel, errors::AmqpError, returns::ReturnListener};
use lapin::{
    types::{AMQPValue, ShortString},
    BasicProperties,
};
use serde::de::DeserializeOwned;
use std::{collections::BTreeMap, fmt, sync::Arc};
use tracing::error;
use uuid::Uuid;

/// Constant for the inbound property holding the broker-assigned delivery tag
pub const AMQP_DELIVERY_TAG: &str = "delivery-tag";
/// Constant for the session property holding the channel that delivered the message
pub const AMQP_CHANNEL: &str = "channel";
/// Constant for the inbound property holding the reply code of a returned message
pub const AMQP_RETURN_REPLY_CODE: &str = "return-reply-code";
/// Constant for the inbound property holding the reply text of a returned message
pub const AMQP_RETURN_REPLY_TEXT: &str = "return-reply-text";
/// Constant for the inbound property holding the exchange of a returned message
pub const AMQP_RETURN_EXCHANGE: &str = "return-exchange";
/// Constant for the inbound property holding the routing key of a returned message
pub const AMQP_RETURN_ROUTING_KEY: &str = "return-routing-key";
/// Constant for the invocation property holding the installed return listener
pub const AMQP_RETURN_LISTENER: &str = "return-listener";

/// Default text encoding applied by the message factory
pub const DEFAULT_ENCODING: &str = "UTF-8";

/// A message flowing through the pipeline.
///
/// A message owns its payload bytes, the opaque AMQP property bag it was
/// delivered (or returned) with, and four property scopes:
///
/// * `inbound` - scalar metadata set by the inbound path, read-only for
///   downstream stages (delivery tag, return metadata);
/// * `outbound` - scalar metadata for the outbound path;
/// * `session` - the borrowed channel handle, under [`AMQP_CHANNEL`];
/// * `invocation` - the return listener installed for the current publish,
///   under [`AMQP_RETURN_LISTENER`].
///
/// Cloning a message produces a thread-safe copy: the payload and scalar
/// scopes are deep-copied while the channel and listener handles are shared.
#[derive(Clone)]
pub struct Message {
    payload: Vec<u8>,
    encoding: String,
    properties: BasicProperties,
    inbound: BTreeMap<ShortString, AMQPValue>,
    outbound: BTreeMap<ShortString, AMQPValue>,
    return_listener: Option<Arc<dyn ReturnListener>>,
    channel: Option<Arc<dyn BrokerChannel>>,
}

impl Message {
    /// Returns the payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Replaces the payload bytes.
    ///
    /// Used by transformers to rewrite the payload representation in place.
    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    /// Deserializes the payload as JSON into the requested type.
    ///
    /// # Returns
    /// The parsed value, or `AmqpError::ParsePayloadError` when the payload
    /// is not valid JSON for the type
    pub fn payload_as<T>(&self) -> Result<T, AmqpError>
    where
        T: DeserializeOwned,
    {
        match serde_json::from_slice(&self.payload) {
            Ok(parsed) => Ok(parsed),
            Err(err) => {
                error!(error = err.to_string(), "failure to parse payload");
                Err(AmqpError::ParsePayloadError)
            }
        }
    }

    /// Returns the text encoding of the payload.
    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    /// Returns the AMQP property bag the message was delivered with.
    pub fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    /// Gets a scalar property from the inbound scope.
    pub fn inbound(&self, key: &str) -> Option<&AMQPValue> {
        self.inbound.get(key)
    }

    /// Sets a scalar property in the inbound scope.
    ///
    /// The inbound scope belongs to the inbound-delivery path; downstream
    /// stages treat it as read-only.
    pub fn set_inbound(&mut self, key: &str, value: AMQPValue) {
        self.inbound.insert(ShortString::from(key), value);
    }

    /// Merges a map of scalar properties into the inbound scope.
    pub fn merge_inbound(&mut self, properties: BTreeMap<ShortString, AMQPValue>) {
        self.inbound.extend(properties);
    }

    /// Gets a scalar property from the outbound scope.
    pub fn outbound(&self, key: &str) -> Option<&AMQPValue> {
        self.outbound.get(key)
    }

    /// Sets a scalar property in the outbound scope.
    pub fn set_outbound(&mut self, key: &str, value: AMQPValue) {
        self.outbound.insert(ShortString::from(key), value);
    }

    /// Returns the broker-assigned delivery tag, read from the
    /// [`AMQP_DELIVERY_TAG`] inbound property.
    ///
    /// A message that was never delivered by the broker (a reconstructed
    /// returned message, a synthetic test message) has no delivery tag.
    pub fn delivery_tag(&self) -> Option<u64> {
        self.inbound
            .get(AMQP_DELIVERY_TAG)?
            .as_long_long_int()
            .map(|tag| tag as u64)
    }

    /// Returns the channel that delivered the message, held in the session
    /// scope under [`AMQP_CHANNEL`].
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.channel.clone()
    }

    /// Stores the delivering channel in the session scope.
    pub fn set_channel(&mut self, channel: Arc<dyn BrokerChannel>) {
        self.channel = Some(channel);
    }

    /// Returns the return listener installed for the current publish, held
    /// in the invocation scope under [`AMQP_RETURN_LISTENER`].
    pub fn return_listener(&self) -> Option<Arc<dyn ReturnListener>> {
        self.return_listener.clone()
    }

    /// Installs a return listener in the invocation scope.
    ///
    /// The slot is single-assignment by convention; writing twice is
    /// last-write-wins since only one publish with return handling is
    /// expected per event.
    pub fn set_return_listener(&mut self, listener: Arc<dyn ReturnListener>) {
        self.return_listener = Some(listener);
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let id = self
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str())
            .unwrap_or("none");

        match self.delivery_tag() {
            Some(tag) => write!(
                f,
                "message id: {}, delivery tag: {}, payload: {} bytes",
                id,
                tag,
                self.payload.len()
            ),
            None => write!(
                f,
                "message id: {}, delivery tag: none, payload: {} bytes",
                id,
                self.payload.len()
            ),
        }
    }
}

/// Factory building pipeline messages out of raw broker data.
///
/// The factory is the single construction facility for messages: it applies
/// the connector's default encoding and stamps a message id when the
/// property bag carries none, so every message in the pipeline is
/// identifiable in diagnostics.
#[derive(Clone)]
pub struct MessageFactory {
    default_encoding: String,
}

impl MessageFactory {
    /// Creates a new factory with the given default text encoding.
    pub fn new(default_encoding: &str) -> MessageFactory {
        MessageFactory {
            default_encoding: default_encoding.to_owned(),
        }
    }

    /// Builds a message from a protocol property bag and a payload.
    ///
    /// The message starts with empty property scopes: no delivery tag, no
    /// channel, no listener. Correlation metadata is attached afterwards by
    /// the inbound path or the return dispatch path.
    ///
    /// # Parameters
    /// * `properties` - The AMQP property bag received from the broker
    /// * `body` - The payload bytes
    ///
    /// # Returns
    /// A new message carrying the factory's default encoding
    pub fn create(&self, properties: BasicProperties, body: Vec<u8>) -> Message {
        let properties = if properties.message_id().is_none() {
            properties.with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        } else {
            properties
        };

        Message {
            payload: body,
            encoding: self.default_encoding.clone(),
            properties,
            inbound: BTreeMap::default(),
            outbound: BTreeMap::default(),
            return_listener: None,
            channel: None,
        }
    }
}

impl Default for MessageFactory {
    fn default() -> Self {
        MessageFactory::new(DEFAULT_ENCODING)
    }
}
