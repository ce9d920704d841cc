//! Core data model for the microbatch scheduler.
//!
//! This crate holds everything the scheduler runtime batches over:
//! requests and their tensor descriptors, responses and flags, per-level
//! queue policies, the multi-level priority queue with its batching
//! cursor, and the shared error type. It has no background tasks of its
//! own; the runtime lives in the `microbatch` crate.

pub mod error;
pub mod policy;
pub mod queue;
pub mod request;
pub mod response;

pub use error::{EnqueueError, ScheduleError};
pub use policy::{QueuePolicy, TimeoutAction};
pub use queue::PriorityQueue;
pub use request::{DataType, InferenceRequest, ResponseDelegator, Tensor};
pub use response::{InferenceResponse, ResponseEnvelope, ResponseFlags};
