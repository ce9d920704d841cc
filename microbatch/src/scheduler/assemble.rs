//! Batch assembly: decide how much to fire and when.

use std::time::{Duration, Instant};

use microbatch_core::InferenceRequest;

use crate::payload::PayloadInner;

use super::{Shared, SchedulerInner};

impl SchedulerInner {
    /// Walk the queue cursor to size up the next batch and decide between
    /// firing it now (`None`) or waiting (`Some(timeout)`).
    ///
    /// Preconditions: the scheduler mutex and the current payload's exec
    /// mutex are held, the queue is non-empty and the payload is not
    /// stale.
    ///
    /// The walk favors the largest preferred batch size that fits. While
    /// walking it marks the last position where the accumulated batch hit
    /// a preferred size; if the oldest pending request is still within
    /// the delay bound, the marked prefix is fired. Once the bound is
    /// exceeded whatever has accumulated fires, preferred or not.
    pub(super) fn assemble_batch(
        &self,
        shared: &mut Shared,
        exec: &mut PayloadInner,
    ) -> Option<Duration> {
        let mut send_now = false;

        // A fresh or invalidated cursor means the previous selection is
        // void: re-walk the queue from the start and rebuild the custom
        // batching accumulator.
        if !shared.queue.is_cursor_valid() {
            shared.queue.reset_cursor();
            shared.pending_batch_size = 0;
            if let Some(custom) = &self.custom_batcher {
                self.custom_batch_fini(exec);
                exec.set_user_state(custom.init());
            }
        }

        let mut best_preferred_batch_size = 0;
        shared.queued_batch_size = shared
            .queued_batch_size
            .saturating_sub(shared.queue.apply_policy_at_cursor());

        // Request inputs only need examining when batches must agree on
        // shapes or on which optional inputs are present.
        let check_input =
            !self.config.enforce_equal_shape_tensors.is_empty() || self.config.has_optional_inputs;
        let payload_batch_size = exec.batch_size();

        while !shared.queue.cursor_end() {
            let Some(batch_size) = shared
                .queue
                .request_at_cursor()
                .map(InferenceRequest::effective_batch_size)
            else {
                break;
            };

            if payload_batch_size + shared.queue.pending_batch_count() == 0 {
                // This request starts a new batch; its inputs define the
                // shape every later request must match.
                if check_input {
                    let initialized = {
                        let request = shared.queue.request_at_cursor();
                        request.map(|request| {
                            exec.required_equal_inputs_mut().initialize(
                                request,
                                &self.config.enforce_equal_shape_tensors,
                                self.config.has_optional_inputs,
                            )
                        })
                    };
                    match initialized {
                        Some(Ok(())) => {}
                        Some(Err(err)) => {
                            tracing::debug!(
                                model = %self.model,
                                error = %err,
                                "failed to capture batch input signature"
                            );
                            send_now = true;
                            break;
                        }
                        None => break,
                    }
                }
            } else {
                // Growing past every preferred size: remember the batch
                // as it stands, keep walking to see if the delay bound
                // lets us wait for more.
                if payload_batch_size + shared.pending_batch_size + batch_size
                    > self.max_preferred_batch_size
                    && best_preferred_batch_size == 0
                {
                    best_preferred_batch_size = shared.pending_batch_size;
                    shared.queue.mark_cursor();
                    shared.payload_saturated = true;
                }
                if payload_batch_size + shared.pending_batch_size + batch_size
                    > self.config.max_batch_size
                {
                    send_now = true;
                    break;
                }
                // A request whose inputs disagree with the pending batch
                // ends it; the request stays queued for the next payload.
                if check_input {
                    let equal = shared
                        .queue
                        .request_at_cursor()
                        .is_some_and(|request| {
                            exec.required_equal_inputs_mut().has_equal_inputs(request)
                        });
                    if !equal {
                        exec.mark_saturated();
                        send_now = true;
                        break;
                    }
                }
            }

            if self.custom_batcher.is_some() && !self.custom_batch_include(shared, exec) {
                exec.mark_saturated();
                send_now = true;
                break;
            }

            shared.pending_batch_size += batch_size;
            shared.queue.advance_cursor();
            shared.queued_batch_size = shared
                .queued_batch_size
                .saturating_sub(shared.queue.apply_policy_at_cursor());

            if self
                .config
                .preferred_batch_sizes
                .contains(&(shared.pending_batch_size + payload_batch_size))
            {
                best_preferred_batch_size = shared.pending_batch_size;
                shared.queue.mark_cursor();
            }
        }

        let now = Instant::now();
        let max_delay = self.config.max_queue_delay;
        let delay = shared
            .queue
            .oldest_enqueue_time()
            .map(|oldest| now.saturating_duration_since(oldest));
        let delay_is_exceeded = !max_delay.is_zero() && delay.map_or(true, |d| d >= max_delay);

        // A preferred batch within the delay bound wins outright.
        if best_preferred_batch_size != 0 && !delay_is_exceeded {
            if max_delay.is_zero() {
                shared.payload_saturated = true;
            }
            shared.pending_batch_size = best_preferred_batch_size;
            shared.queue.set_cursor_to_mark();
            return None;
        }

        // Every queued request expired under a REJECT policy.
        if shared.queue.pending_batch_count() == 0 {
            return None;
        }

        // The batch cannot grow any further: fire what is pending.
        if send_now
            || payload_batch_size + shared.pending_batch_size >= self.max_preferred_batch_size
        {
            shared.payload_saturated = true;
            return None;
        }

        if delay_is_exceeded || max_delay.is_zero() {
            return None;
        }

        // Tell enqueue how much more work makes waking the batcher
        // worthwhile: the smallest preferred size beyond the current
        // total, wrapping to the smallest configured size.
        let total = shared.pending_batch_size + payload_batch_size;
        let next_preferred = self
            .config
            .preferred_batch_sizes
            .range(total + 1..)
            .next()
            .copied()
            .or_else(|| self.config.preferred_batch_sizes.iter().next().copied())
            .unwrap_or(0);
        shared.next_preferred_batch_size = next_preferred.saturating_sub(payload_batch_size);

        // A partially filled payload that is not at a preferred size yet
        // should pick up the pending batch rather than strand it behind a
        // wait; the instance then executes the largest batch available.
        if !shared.payload_saturated
            && payload_batch_size != 0
            && !self.config.preferred_batch_sizes.contains(&payload_batch_size)
        {
            return None;
        }

        let mut wait = max_delay.saturating_sub(delay.unwrap_or_default());
        // Waking at the closest request deadline resets the pending batch
        // as soon as it is invalidated.
        if let Some(deadline) = shared.queue.closest_timeout() {
            if now <= deadline {
                wait = wait.min(deadline.saturating_duration_since(now));
            } else {
                wait = Duration::from_micros(1);
            }
        }
        Some(wait)
    }

    /// Ask the custom batcher about the request at the cursor. Hook
    /// errors and a missing accumulator are logged and count as "do not
    /// include".
    fn custom_batch_include(&self, shared: &Shared, exec: &mut PayloadInner) -> bool {
        let Some(custom) = &self.custom_batcher else {
            return true;
        };
        let Some(request) = shared.queue.request_at_cursor() else {
            return false;
        };
        match exec.user_state_mut() {
            Some(state) => match custom.include(request, state) {
                Ok(include) => include,
                Err(err) => {
                    tracing::error!(
                        model = %self.model,
                        request_id = request.id(),
                        error = %err,
                        "custom batching include hook failed"
                    );
                    false
                }
            },
            None => {
                tracing::error!(
                    model = %self.model,
                    "custom batching accumulator missing on current payload"
                );
                false
            }
        }
    }
}
