// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Disposition Layer
//!
//! This module provides the error types for message disposition and
//! returned-message handling. The `AmqpError` enum covers the failure
//! scenarios of rejecting a delivery, installing a return listener and
//! dispatching a returned message to downstream processors.

use thiserror::Error;

/// Represents errors that can occur while disposing of messages or
/// redistributing returned ones.
///
/// Errors raised by a caller-initiated operation (rejecting a message,
/// installing a return listener) are surfaced to that caller. Errors
/// raised while dispatching a broker-returned message have no caller
/// left to report to and are only ever logged.
#[derive(Error, Debug)]
pub enum AmqpError {
    /// A delivery tag is present but no channel could be resolved for the message
    #[error("no channel session property found, impossible to reject message: {0}")]
    MissingChannel(String),

    /// The transport reported a failure while rejecting a delivery
    #[error("failure to reject message with delivery tag `{delivery_tag}` on channel `{channel}`")]
    RejectTransport {
        delivery_tag: u64,
        channel: u16,
        #[source]
        source: std::io::Error,
    },

    /// A return listener could not be installed on the current event
    #[error("invalid event: {0}")]
    InvalidContext(String),

    /// A returned message could not be redispatched; never surfaced past the broker callback
    #[error("failure to dispatch returned message: {0}")]
    ReturnDispatch(String),

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// A downstream processor failed to handle a message
    #[error("failure to process message: {0}")]
    ProcessorError(String),

    /// A transformer in the receive chain failed
    #[error("failure to transform message: {0}")]
    TransformerError(String),
}
