//! Rate limiter contract.
//!
//! The scheduler never talks to the execution engine directly. It asks
//! the rate limiter for fresh payloads, checks whether the model has a
//! free execution slot, and hands finished payloads over for execution.
//! The limiter owns slot accounting and instance placement; this crate
//! only consumes the contract.

use std::sync::Arc;

use microbatch_core::ScheduleError;

use crate::payload::Payload;

/// What the engine should do with a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadOperation {
    /// Run inference over the payload's requests
    InferRun,
}

/// One loaded copy of a model that payloads can be bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInstance {
    /// Model name
    pub model: String,
    /// Instance index within the model
    pub index: u32,
}

impl ModelInstance {
    pub fn new(model: impl Into<String>, index: u32) -> Self {
        Self { model: model.into(), index }
    }
}

/// Execution-slot broker between schedulers and the engine
pub trait RateLimiter: Send + Sync {
    /// Hand out a fresh payload, optionally bound to a model instance
    fn get_payload(
        &self,
        operation: PayloadOperation,
        instance: Option<Arc<ModelInstance>>,
    ) -> Arc<Payload>;

    /// Submit a payload for execution
    fn enqueue_payload(&self, model: &str, payload: Arc<Payload>) -> Result<(), ScheduleError>;

    /// Whether the model currently has a free execution slot
    fn payload_slot_available(&self, model: &str) -> bool;
}
