// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pipeline Seams
//!
//! This module provides the two extension points of the pipeline: the
//! processor a stage hands events to, and the transformer the receive chain
//! applies to message payloads.

use crate::{errors::AmqpError, event::PipelineEvent, message::Message};
use async_trait::async_trait;
use opentelemetry::Context;

/// A pipeline stage processing one event at a time.
///
/// Processors are shared across events and invoked concurrently; they hold
/// no per-event state. A processor failure aborts the handling of the
/// current event only.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Processes one event within the given trace context.
    async fn process(&self, ctx: &Context, event: &mut PipelineEvent) -> Result<(), AmqpError>;
}

/// One element of a transformation chain, rewriting a message payload in
/// place.
pub trait Transformer: Send + Sync {
    fn transform(&self, message: &mut Message) -> Result<(), AmqpError>;
}
