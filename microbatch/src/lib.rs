//! Dynamic batching for rate-limited inference engines.
//!
//! A per-model scheduling component that accepts a stream of inference
//! requests from many producers and emits *payloads* (batches of one or
//! more requests) to a downstream execution engine, trading a bounded
//! amount of queueing delay for larger, more efficient batches.
//!
//! # Features
//!
//! - **Priority queueing**: multi-level FIFO with per-level timeout
//!   policies (reject or delay) and capacity bounds
//! - **Batch shaping**: preferred batch sizes, a hard maximum, a queue
//!   delay bound, equal-shape constraints and custom include hooks
//! - **Response caching**: optional hash-based cache consulted before
//!   queueing, with insert-on-miss on the response path
//! - **Ordered delivery**: optional in-order response emission per
//!   priority level
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use microbatch::{DynamicBatchScheduler, SchedulerConfig, SchedulerOptions};
//! use microbatch_core::{InferenceRequest, Tensor, DataType};
//!
//! let scheduler = DynamicBatchScheduler::start(SchedulerOptions {
//!     model: "resnet50".to_string(),
//!     instance: None,
//!     config: SchedulerConfig::high_throughput(),
//!     rate_limiter: my_rate_limiter,
//!     cache: None,
//!     custom_batcher: None,
//! })?;
//!
//! let (request, mut responses) = InferenceRequest::new(
//!     "resnet50",
//!     vec![Tensor::new("x", DataType::F32, vec![3, 224, 224])],
//! );
//! scheduler.enqueue(request)?;
//! let envelope = responses.recv().await.unwrap();
//! ```

pub mod cache;
pub mod config;
pub mod finalize;
pub mod hooks;
pub mod limiter;
pub mod metrics;
pub mod payload;
pub mod scheduler;

pub use cache::{CacheError, LruResponseCache, ResponseCache};
pub use config::{ConfigError, SchedulerConfig};
pub use finalize::OrderedFinalizer;
pub use hooks::{CustomBatcher, HookError};
pub use limiter::{ModelInstance, PayloadOperation, RateLimiter};
pub use metrics::{BatcherMetrics, MetricsSnapshot};
pub use payload::{Payload, PayloadInner, PayloadState, RequiredEqualInputs};
pub use scheduler::{DynamicBatchScheduler, SchedulerOptions, DELAY_SCHEDULER_ENV};
