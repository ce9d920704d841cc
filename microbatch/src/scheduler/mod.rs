//! The dynamic batch scheduler.
//!
//! One scheduler serves one model. Producers call [`DynamicBatchScheduler::enqueue`];
//! a dedicated batcher thread trades a bounded amount of queueing delay
//! for larger batches and hands finished payloads to the rate limiter.
//!
//! ```text
//! Producers ──enqueue──▶ ┌───────────────┐
//!                        │ PriorityQueue │ ◀── per-level timeout policies
//!                        └───────┬───────┘
//!                                │ cursor walk (GetDynamicBatch)
//!                        ┌───────▼───────┐
//!                        │ batcher thread│ ◀── slot availability, delay bound
//!                        └───────┬───────┘
//!                                │ payload (READY)
//!                        ┌───────▼───────┐
//!                        │  RateLimiter  │ ──▶ execution engine
//!                        └───────────────┘
//! ```
//!
//! Responses travel back through per-request channels. With
//! `preserve_ordering` they are routed through the [`OrderedFinalizer`]
//! so emission order matches enqueue order; with caching enabled each
//! computed response is inserted into the cache on its way out.

mod assemble;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use microbatch_core::{
    EnqueueError, InferenceRequest, PriorityQueue, ResponseEnvelope, ResponseFlags, ScheduleError,
};

use crate::cache::{CacheError, ResponseCache};
use crate::config::SchedulerConfig;
use crate::finalize::OrderedFinalizer;
use crate::hooks::CustomBatcher;
use crate::limiter::{ModelInstance, PayloadOperation, RateLimiter};
use crate::metrics::BatcherMetrics;
use crate::payload::{Payload, PayloadInner, PayloadState};

/// Delays batcher startup until the queue holds this many requests.
/// Testing only.
pub const DELAY_SCHEDULER_ENV: &str = "MICROBATCH_DELAY_SCHEDULER";

/// Everything needed to start a scheduler
pub struct SchedulerOptions {
    /// Model this scheduler serves
    pub model: String,
    /// Model instance new payloads are bound to
    pub instance: Option<Arc<ModelInstance>>,
    /// Batching configuration
    pub config: SchedulerConfig,
    /// Slot broker and payload sink
    pub rate_limiter: Arc<dyn RateLimiter>,
    /// Response cache; consulted only when the config also enables it
    pub cache: Option<Arc<dyn ResponseCache>>,
    /// Model-supplied batch composition veto
    pub custom_batcher: Option<Arc<dyn CustomBatcher>>,
}

/// State guarded by the scheduler mutex
struct Shared {
    queue: PriorityQueue,
    /// Batch slots selected by the cursor but not yet dequeued
    pending_batch_size: usize,
    /// Batch slots across everything queued (pending included)
    queued_batch_size: usize,
    /// Wake threshold hint for `enqueue`
    next_preferred_batch_size: usize,
    /// The current payload must not grow further
    payload_saturated: bool,
    curr_payload: Arc<Payload>,
}

struct SchedulerInner {
    model: String,
    instance: Option<Arc<ModelInstance>>,
    config: SchedulerConfig,
    max_preferred_batch_size: usize,
    rate_limiter: Arc<dyn RateLimiter>,
    cache: Option<Arc<dyn ResponseCache>>,
    custom_batcher: Option<Arc<dyn CustomBatcher>>,
    finalizer: Arc<OrderedFinalizer>,
    metrics: Arc<BatcherMetrics>,
    shared: Mutex<Shared>,
    cv: Condvar,
    exit: AtomicBool,
    stopped: AtomicBool,
}

/// Per-model scheduler that batches requests for a rate-limited engine
pub struct DynamicBatchScheduler {
    inner: Arc<SchedulerInner>,
    batcher: Option<JoinHandle<()>>,
}

impl DynamicBatchScheduler {
    /// Build the scheduler and, when dynamic batching is enabled, start
    /// its batcher thread. Fails on a configuration that could never
    /// behave as asked.
    pub fn start(options: SchedulerOptions) -> Result<Self, ScheduleError> {
        options
            .config
            .validate()
            .map_err(|e| ScheduleError::InvalidConfig(e.to_string()))?;
        let config = options.config.normalized();
        let cache = if config.response_cache { options.cache } else { None };
        let max_preferred_batch_size = config.max_preferred_batch_size();
        let queue = PriorityQueue::new(
            config.default_queue_policy.clone(),
            config.priority_levels,
            &config.queue_policy_map,
        );

        let inner = Arc::new(SchedulerInner {
            model: options.model,
            instance: options.instance,
            max_preferred_batch_size,
            rate_limiter: options.rate_limiter,
            cache,
            custom_batcher: options.custom_batcher,
            finalizer: Arc::new(OrderedFinalizer::new()),
            metrics: Arc::new(BatcherMetrics::new()),
            shared: Mutex::new(Shared {
                queue,
                pending_batch_size: 0,
                queued_batch_size: 0,
                next_preferred_batch_size: 0,
                payload_saturated: false,
                curr_payload: Arc::new(Payload::new(PayloadOperation::InferRun, None)),
            }),
            cv: Condvar::new(),
            exit: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            config,
        });

        let batcher = if inner.config.dynamic_batching {
            {
                let mut shared = inner.shared.lock();
                inner.new_payload(&mut shared);
            }
            let worker = inner.clone();
            let handle = thread::Builder::new()
                .name(format!("microbatch-{}", inner.model))
                .spawn(move || worker.batcher_loop())
                .map_err(|e| ScheduleError::internal(format!("failed to spawn batcher thread: {e}")))?;
            Some(handle)
        } else {
            None
        };

        Ok(Self { inner, batcher })
    }

    /// Submit a request for scheduling.
    ///
    /// Cache hits are answered immediately. Otherwise the request is
    /// queued for the batcher (or, with dynamic batching off, shipped in
    /// its own payload). Admission failures hand the request back in the
    /// error.
    pub fn enqueue(&self, request: InferenceRequest) -> Result<(), EnqueueError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(EnqueueError::new(
                ScheduleError::unavailable("scheduler has stopped accepting requests"),
                request,
            ));
        }
        self.inner.enqueue(request)
    }

    /// Stop accepting new requests. Queued and in-flight work still
    /// completes.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
    }

    /// Scheduler metrics
    pub fn metrics(&self) -> Arc<BatcherMetrics> {
        self.inner.metrics.clone()
    }

    /// Model this scheduler serves
    pub fn model(&self) -> &str {
        &self.inner.model
    }
}

impl Drop for DynamicBatchScheduler {
    /// Signal the batcher thread to exit and wait for it. In-flight
    /// payloads complete normally through the rate limiter.
    fn drop(&mut self) {
        self.inner.exit.store(true, Ordering::Release);
        // Taking the scheduler mutex pairs the exit flag with the condvar
        // so the batcher cannot re-enter a wait after missing the notify.
        drop(self.inner.shared.lock());
        self.inner.cv.notify_one();
        if let Some(handle) = self.batcher.take() {
            if handle.join().is_err() {
                tracing::error!(model = %self.inner.model, "batcher thread panicked");
            }
        }
    }
}

impl SchedulerInner {
    fn enqueue(&self, mut request: InferenceRequest) -> Result<(), EnqueueError> {
        self.metrics.record_received();

        if request.queue_start().is_none() {
            request.capture_queue_start();
            tracing::trace!(
                request_id = request.id(),
                model = %self.model,
                "request entered scheduler queue"
            );
        }
        // May overwrite an outer batcher's value; that value is no longer
        // needed once the request reaches this scheduler.
        request.capture_batcher_start();

        if let Some(cached) = self.cache_lookup(&mut request) {
            if self.config.preserve_ordering {
                self.delegate_response(&mut request);
            }
            self.metrics.record_cache_hit();
            tracing::debug!(
                request_id = request.id(),
                model = %self.model,
                "serving response from cache"
            );
            request.respond(cached, ResponseFlags::FINAL);
            return Ok(());
        }

        if !self.config.dynamic_batching {
            if self.config.preserve_ordering || self.cache.is_some() {
                self.delegate_response(&mut request);
            }
            let slots = request.effective_batch_size();
            let payload = self.rate_limiter.get_payload(PayloadOperation::InferRun, None);
            {
                let mut exec = payload.exec();
                exec.add_request(request);
                exec.set_state(PayloadState::Ready);
            }
            self.metrics.record_batch(slots);
            return self
                .rate_limiter
                .enqueue_payload(&self.model, payload)
                .map_err(EnqueueError::lost);
        }

        let priority = request.priority;
        let batch_size = request.effective_batch_size();
        let wake_batcher = {
            let mut shared = self.shared.lock();
            if let Err(err) = shared.queue.enqueue(priority, request) {
                if matches!(err.reason, ScheduleError::QueueFull { .. }) {
                    self.metrics.record_rejected();
                }
                return Err(err);
            }
            shared.queued_batch_size += batch_size;
            self.metrics.record_queued();

            // Wake the batcher only when it could actually fire. Without
            // shape enforcement the queued total must also have reached
            // the next preferred size, unless the current payload is done
            // growing anyway.
            let mut wake = self.rate_limiter.payload_slot_available(&self.model);
            if self.config.enforce_equal_shape_tensors.is_empty() {
                let payload = shared.curr_payload.clone();
                let exec = payload.exec();
                wake &= shared.payload_saturated
                    || exec.state().is_stale()
                    || shared.queued_batch_size >= shared.next_preferred_batch_size;
            }
            wake
        };

        if wake_batcher {
            self.cv.notify_one();
        }
        Ok(())
    }

    /// Look the request up in the response cache, hashing it first when
    /// no key was precomputed. Cache failures are logged, never fatal.
    fn cache_lookup(&self, request: &mut InferenceRequest) -> Option<microbatch_core::InferenceResponse> {
        let cache = self.cache.as_ref()?;

        let key = match request.cache_key() {
            Some(key) => key,
            None => match cache.hash(request) {
                Ok(key) => {
                    request.set_cache_key(key);
                    key
                }
                Err(err) => {
                    tracing::error!(
                        request_id = request.id(),
                        error = %err,
                        "failed to hash request for cache lookup"
                    );
                    return None;
                }
            },
        };

        request.capture_cache_lookup_start();
        let result = cache.lookup(key);
        request.capture_cache_lookup_end();

        match result {
            Ok(response) => Some(response),
            Err(CacheError::NotFound) => None,
            Err(err) => {
                tracing::error!(key, error = %err, "response cache lookup failed");
                None
            }
        }
    }

    /// Install the response delegator: insert-on-miss cache plumbing and,
    /// under `preserve_ordering`, routing through a reserved completion
    /// slot.
    fn delegate_response(&self, request: &mut InferenceRequest) {
        let slot = self.config.preserve_ordering.then(|| self.finalizer.reserve());
        let finalizer = self.finalizer.clone();
        let cache = self.cache.clone();
        let key = request.cache_key();
        let lookup_duration = request.cache_lookup_duration();
        let metrics = self.metrics.clone();
        let sender = request.response_sender();

        request.set_delegator(Box::new(move |response, flags| {
            if let Some(cache) = &cache {
                match key {
                    Some(key) if !response.is_error() => {
                        let insert_start = Instant::now();
                        match cache.insert(key, &response) {
                            Ok(()) => {
                                let miss_time =
                                    lookup_duration.unwrap_or_default() + insert_start.elapsed();
                                metrics.record_cache_miss(miss_time);
                            }
                            // Another thread inserted this key first.
                            Err(CacheError::AlreadyExists) => {}
                            Err(err) => {
                                metrics.record_cache_miss(
                                    lookup_duration.unwrap_or_default() + insert_start.elapsed(),
                                );
                                tracing::error!(
                                    key,
                                    error = %err,
                                    "failed to insert response into cache"
                                );
                            }
                        }
                    }
                    Some(_) => {}
                    None => {
                        tracing::error!("request cache key was not set correctly");
                    }
                }
            }

            match slot {
                Some(ticket) => finalizer.push(ticket, sender.clone(), response, flags),
                None => {
                    if sender.send(ResponseEnvelope { response, flags }).is_err() {
                        tracing::warn!("response receiver dropped");
                    }
                }
            }
        }));
    }

    /// Acquire a fresh payload bound to this scheduler's instance and
    /// rebuild the custom-batching accumulator.
    fn new_payload(&self, shared: &mut Shared) {
        shared.curr_payload = self
            .rate_limiter
            .get_payload(PayloadOperation::InferRun, self.instance.clone());
        shared.payload_saturated = false;
        if let Some(custom) = &self.custom_batcher {
            shared.curr_payload.exec().set_user_state(custom.init());
        }
    }

    /// Tear down the payload's custom-batching accumulator
    fn custom_batch_fini(&self, exec: &mut PayloadInner) {
        if let Some(custom) = &self.custom_batcher {
            if let Some(state) = exec.take_user_state() {
                custom.finalize(state);
            }
        }
    }
}
