//! Shared test harness: an in-memory rate limiter plus a hand-driven
//! execution engine.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use microbatch::{Payload, PayloadOperation, PayloadState, RateLimiter};
use microbatch_core::{InferenceResponse, ResponseFlags, ScheduleError};

/// Rate limiter with a fixed slot budget whose dispatched payloads are
/// executed explicitly by the test body.
pub struct MockEngine {
    slots: Mutex<usize>,
    dispatched: Mutex<VecDeque<Arc<Payload>>>,
    dispatched_cv: Condvar,
}

impl MockEngine {
    pub fn new(slots: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(slots),
            dispatched: Mutex::new(VecDeque::new()),
            dispatched_cv: Condvar::new(),
        })
    }

    /// Wait for the scheduler to dispatch the next payload
    pub fn next_payload(&self, timeout: Duration) -> Option<Arc<Payload>> {
        let deadline = Instant::now() + timeout;
        let mut dispatched = self.dispatched.lock();
        loop {
            if let Some(payload) = dispatched.pop_front() {
                return Some(payload);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.dispatched_cv.wait_for(&mut dispatched, deadline - now);
        }
    }

    /// Number of payloads dispatched so far and not yet taken
    pub fn dispatched_len(&self) -> usize {
        self.dispatched.lock().len()
    }

    /// Execute a payload: answer every request with a successful FINAL
    /// response, then release the slot.
    pub fn run_payload(&self, payload: &Arc<Payload>) {
        payload.set_state(PayloadState::Executing);
        let requests = payload.exec().take_requests();
        for request in &requests {
            request.respond(
                InferenceResponse::new(request.id(), request.model.clone(), vec![]),
                ResponseFlags::FINAL,
            );
        }
        self.release(payload);
    }

    /// Return the payload's slot and mark it released
    pub fn release(&self, payload: &Arc<Payload>) {
        *self.slots.lock() += 1;
        payload.set_state(PayloadState::Released);
    }
}

impl RateLimiter for MockEngine {
    fn get_payload(
        &self,
        operation: PayloadOperation,
        instance: Option<Arc<microbatch::ModelInstance>>,
    ) -> Arc<Payload> {
        Arc::new(Payload::new(operation, instance))
    }

    fn enqueue_payload(&self, _model: &str, payload: Arc<Payload>) -> Result<(), ScheduleError> {
        {
            let mut slots = self.slots.lock();
            *slots = slots.saturating_sub(1);
        }
        self.dispatched.lock().push_back(payload);
        self.dispatched_cv.notify_all();
        Ok(())
    }

    fn payload_slot_available(&self, _model: &str) -> bool {
        *self.slots.lock() > 0
    }
}
