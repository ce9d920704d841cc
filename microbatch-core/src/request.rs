//! Inference requests and their tensor descriptors.
//!
//! A request owns its input tensors and a response channel. Responses are
//! normally sent straight down the channel; a scheduler that needs to
//! intercept them (response caching, ordered delivery) installs a
//! *delegator* closure which takes over emission for the rest of the
//! request's life.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::response::{InferenceResponse, ResponseEnvelope, ResponseFlags};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    U8,
    I32,
    I64,
    F16,
    F32,
    F64,
}

/// An input or output tensor: a descriptor plus (optionally) its bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    /// Tensor name, unique within a request
    pub name: String,
    /// Element type
    pub dtype: DataType,
    /// Shape; -1 is not permitted here, requests carry concrete shapes
    pub dims: Vec<i64>,
    /// Raw element data; may be empty when only the shape matters
    pub data: Bytes,
}

impl Tensor {
    /// Create a tensor descriptor with no data
    pub fn new(name: impl Into<String>, dtype: DataType, dims: Vec<i64>) -> Self {
        Self { name: name.into(), dtype, dims, data: Bytes::new() }
    }

    /// Attach raw element data
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }
}

/// Closure that takes over response emission for a request
pub type ResponseDelegator = Box<dyn Fn(InferenceResponse, ResponseFlags) + Send + Sync>;

/// A single inference request flowing through the scheduler
pub struct InferenceRequest {
    /// Target model name
    pub model: String,

    /// Priority level; lower values are served first
    pub priority: u32,

    /// Number of batch slots this request occupies; 0 counts as 1
    pub batch_size: u32,

    /// Input tensors
    pub inputs: Vec<Tensor>,

    /// Per-request queue timeout, honored when the level's policy allows
    /// overrides
    pub timeout: Option<Duration>,

    id: u64,
    cache_key: Option<u64>,
    deadline: Option<Instant>,
    queue_start: Option<Instant>,
    batcher_start: Option<Instant>,
    cache_lookup_start: Option<Instant>,
    cache_lookup_end: Option<Instant>,
    response_tx: UnboundedSender<ResponseEnvelope>,
    delegator: Option<ResponseDelegator>,
}

impl InferenceRequest {
    /// Create a new request and the receiver its responses arrive on
    pub fn new(
        model: impl Into<String>,
        inputs: Vec<Tensor>,
    ) -> (Self, UnboundedReceiver<ResponseEnvelope>) {
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let request = Self {
            model: model.into(),
            priority: 0,
            batch_size: 1,
            inputs,
            timeout: None,
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            cache_key: None,
            deadline: None,
            queue_start: None,
            batcher_start: None,
            cache_lookup_start: None,
            cache_lookup_end: None,
            response_tx,
            delegator: None,
        };
        (request, response_rx)
    }

    /// Set the priority level
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the batch slot count
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set a per-request queue timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Unique request id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Batch slots this request occupies; never 0
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1) as usize
    }

    /// Precomputed cache key, if any
    pub fn cache_key(&self) -> Option<u64> {
        self.cache_key
    }

    /// Record the cache key so it is not recomputed downstream
    pub fn set_cache_key(&mut self, key: u64) {
        self.cache_key = Some(key);
    }

    /// Absolute queue deadline, stamped at admission
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Stamp the absolute queue deadline
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// When the request first entered a scheduler queue
    pub fn queue_start(&self) -> Option<Instant> {
        self.queue_start
    }

    /// Capture the queue-start timestamp
    pub fn capture_queue_start(&mut self) {
        self.queue_start = Some(Instant::now());
    }

    /// When the request entered the current batcher. Unlike the
    /// queue-start timestamp this may be overwritten: an outer batcher's
    /// value is no longer needed once the request reaches this one.
    pub fn batcher_start(&self) -> Option<Instant> {
        self.batcher_start
    }

    /// Capture the batcher-start timestamp
    pub fn capture_batcher_start(&mut self) {
        self.batcher_start = Some(Instant::now());
    }

    /// Capture the start of a cache lookup
    pub fn capture_cache_lookup_start(&mut self) {
        self.cache_lookup_start = Some(Instant::now());
    }

    /// Capture the end of a cache lookup
    pub fn capture_cache_lookup_end(&mut self) {
        self.cache_lookup_end = Some(Instant::now());
    }

    /// How long the cache lookup took, when both ends were captured
    pub fn cache_lookup_duration(&self) -> Option<Duration> {
        match (self.cache_lookup_start, self.cache_lookup_end) {
            (Some(start), Some(end)) => Some(end.saturating_duration_since(start)),
            _ => None,
        }
    }

    /// A sender for this request's response channel
    pub fn response_sender(&self) -> UnboundedSender<ResponseEnvelope> {
        self.response_tx.clone()
    }

    /// Install a delegator that takes over response emission
    pub fn set_delegator(&mut self, delegator: ResponseDelegator) {
        self.delegator = Some(delegator);
    }

    /// Whether a delegator has been installed
    pub fn has_delegator(&self) -> bool {
        self.delegator.is_some()
    }

    /// Emit a response for this request, through the delegator when one
    /// is installed
    pub fn respond(&self, response: InferenceResponse, flags: ResponseFlags) {
        match &self.delegator {
            Some(delegator) => delegator(response, flags),
            None => {
                if self.response_tx.send(ResponseEnvelope { response, flags }).is_err() {
                    tracing::warn!(request_id = self.id, "response receiver dropped");
                }
            }
        }
    }

    /// Emit a FINAL error response for this request
    pub fn respond_error(&self, message: impl Into<String>) {
        let response = InferenceResponse::error(self.id, self.model.clone(), message);
        self.respond(response, ResponseFlags::FINAL);
    }
}

impl fmt::Debug for InferenceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceRequest")
            .field("id", &self.id)
            .field("model", &self.model)
            .field("priority", &self.priority)
            .field("batch_size", &self.batch_size)
            .field("inputs", &self.inputs.len())
            .field("deadline", &self.deadline)
            .field("delegated", &self.delegator.is_some())
            .finish()
    }
}
