//! The batcher thread.
//!
//! One thread per scheduler, started only when dynamic batching is
//! enabled. Each iteration: replace a saturated or stale payload, wait
//! for an execution slot, assemble a batch (or compute how long to wait
//! for a better one), move the chosen prefix of the queue into the
//! payload, and hand READY payloads to the rate limiter. Lock order is
//! always scheduler mutex → payload exec mutex.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use microbatch_core::InferenceRequest;

use crate::payload::{Payload, PayloadState};

use super::{SchedulerInner, DELAY_SCHEDULER_ENV};

const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(500);
const DELAY_MODE_WAIT: Duration = Duration::from_millis(10);

impl SchedulerInner {
    pub(super) fn batcher_loop(self: Arc<Self>) {
        self.apply_nice();

        // For debugging/testing, delay batching until the queue contains
        // the requested number of entries.
        let mut delay_cnt: usize = std::env::var(DELAY_SCHEDULER_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if delay_cnt > 0 {
            tracing::info!(
                model = %self.model,
                delay_cnt,
                "delaying batcher thread until queue reaches threshold"
            );
        }

        while !self.exit.load(Ordering::Acquire) {
            let mut rejected: Vec<InferenceRequest> = Vec::new();
            let mut wait: Option<Duration> = None;
            let mut dispatch: Option<Arc<Payload>> = None;

            {
                let mut shared = self.shared.lock();

                {
                    let payload = shared.curr_payload.clone();
                    let exec = payload.exec();
                    if shared.payload_saturated || exec.state().is_stale() {
                        drop(exec);
                        self.new_payload(&mut shared);
                        shared.next_preferred_batch_size = 0;
                    }
                }

                if delay_cnt > 0 {
                    wait = Some(DELAY_MODE_WAIT);
                    if shared.queue.len() >= delay_cnt {
                        delay_cnt = 0;
                    }
                    tracing::trace!(
                        model = %self.model,
                        delay_cnt,
                        queued = shared.queue.len(),
                        "batcher start delayed"
                    );
                } else if shared.queue.is_empty() {
                    wait = Some(DEFAULT_IDLE_WAIT);
                } else {
                    if shared.payload_saturated {
                        continue;
                    }

                    // Wait for an execution slot; the payload callback and
                    // enqueue notify this condvar.
                    while !self.rate_limiter.payload_slot_available(&self.model) {
                        if self.exit.load(Ordering::Acquire) {
                            return;
                        }
                        self.cv.wait(&mut shared);
                    }

                    let payload = shared.curr_payload.clone();
                    let mut exec = payload.exec();
                    if exec.state().is_stale() {
                        continue;
                    }

                    wait = self.assemble_batch(&mut shared, &mut exec);
                    rejected = shared.queue.release_rejected_requests();

                    let pending_count = shared.queue.pending_batch_count();
                    if wait.is_none() && pending_count > 0 {
                        exec.reserve_requests(pending_count);
                        for _ in 0..pending_count {
                            match shared.queue.dequeue() {
                                Ok(mut request) => {
                                    let wait_time = request
                                        .queue_start()
                                        .map(|start| start.elapsed())
                                        .unwrap_or_default();
                                    self.metrics.record_dequeued(wait_time);
                                    if self.config.preserve_ordering || self.cache.is_some() {
                                        self.delegate_response(&mut request);
                                    }
                                    exec.add_request(request);
                                }
                                Err(err) => {
                                    // The queue is out of step with the
                                    // pending batch count. Ship whatever
                                    // was extracted and start over.
                                    tracing::error!(
                                        model = %self.model,
                                        error = %err,
                                        "failed to retrieve request from scheduler queue"
                                    );
                                    shared.queue.reset_cursor();
                                    shared.queued_batch_size = 0;
                                    shared.pending_batch_size = 0;
                                    break;
                                }
                            }
                        }

                        if exec.state() == PayloadState::Uninitialized {
                            exec.set_state(PayloadState::Ready);
                            dispatch = Some(payload.clone());
                        }

                        shared.queued_batch_size =
                            shared.queued_batch_size.saturating_sub(shared.pending_batch_size);
                        shared.pending_batch_size = 0;
                    }
                }

                // Nothing to fire: sleep until notified or the computed
                // timeout elapses, then revisit the pending batch.
                if let Some(timeout) = wait {
                    self.cv.wait_for(&mut shared, timeout);
                }
            }

            if let Some(payload) = dispatch {
                let weak = Arc::downgrade(&self);
                payload.set_callback(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.cv.notify_one();
                    }
                });
                let batch_slots = {
                    let mut exec = payload.exec();
                    self.custom_batch_fini(&mut exec);
                    exec.batch_size()
                };
                self.metrics.record_batch(batch_slots);
                tracing::debug!(
                    model = %self.model,
                    payload_id = payload.id(),
                    batch_slots,
                    "dispatching payload"
                );
                if let Err(err) = self.rate_limiter.enqueue_payload(&self.model, payload) {
                    tracing::error!(
                        model = %self.model,
                        error = %err,
                        "failed to enqueue payload for execution"
                    );
                }
            }

            for request in rejected {
                self.metrics.record_timeout();
                tracing::debug!(
                    request_id = request.id(),
                    model = %self.model,
                    "rejecting timed out request"
                );
                request.respond_error("request timeout expired");
            }
        }

        tracing::debug!(model = %self.model, "batcher thread stopping");
    }

    #[cfg(target_os = "linux")]
    fn apply_nice(&self) {
        let tid = unsafe { libc::syscall(libc::SYS_gettid) };
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, self.config.nice) };
        if rc == 0 {
            tracing::debug!(model = %self.model, nice = self.config.nice, "batcher thread started");
        } else {
            tracing::debug!(
                model = %self.model,
                requested_nice = self.config.nice,
                "batcher thread started at default nice"
            );
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_nice(&self) {
        tracing::debug!(model = %self.model, "batcher thread started");
    }
}
