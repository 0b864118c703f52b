// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connector Configuration
//!
//! This module provides the configuration shared by the disposition and
//! return-handling stages: the message construction facility, the receive
//! transformation chain applied to reconstructed messages, and the stopping
//! flag consulted before installing new return listeners.

use crate::{
    handler::Transformer,
    message::{MessageFactory, DEFAULT_ENCODING},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Shared connector configuration.
///
/// Built once, shared read-only across every stage and listener instance.
/// Only the stopping flag mutates after construction.
pub struct Connector {
    factory: MessageFactory,
    receive_transformers: Vec<Arc<dyn Transformer>>,
    stopping: AtomicBool,
}

impl Connector {
    /// Creates a connector with the default text encoding and an empty
    /// receive transformation chain.
    pub fn new() -> Connector {
        Connector {
            factory: MessageFactory::new(DEFAULT_ENCODING),
            receive_transformers: vec![],
            stopping: AtomicBool::new(false),
        }
    }

    /// Sets the default text encoding applied by the message factory.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_encoding(mut self, encoding: &str) -> Self {
        self.factory = MessageFactory::new(encoding);
        self
    }

    /// Appends a transformer to the receive transformation chain.
    ///
    /// The chain is applied in registration order to every reconstructed
    /// returned message.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn receive_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.receive_transformers.push(transformer);
        self
    }

    /// Returns the message construction facility.
    pub fn message_factory(&self) -> &MessageFactory {
        &self.factory
    }

    /// Returns the receive transformation chain.
    pub fn receive_transformers(&self) -> &[Arc<dyn Transformer>] {
        &self.receive_transformers
    }

    /// Initiates shutdown: no new return listeners are installed after
    /// this call. In-flight return dispatches run to completion.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Returns whether shutdown has been initiated.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

impl Default for Connector {
    fn default() -> Self {
        Connector::new()
    }
}
