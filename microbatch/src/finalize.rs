//! In-order response finalization.
//!
//! When `preserve_ordering` is on, every request gets a completion slot
//! reserved at batch-assembly time, fixing the emission order before the
//! engine runs anything. Slots are filled asynchronously by the engine's
//! response delegates and drained strictly from the front: a slot leaves
//! the queue only once a response carrying the FINAL flag has been seen
//! for it. A slot that has produced only non-final (streaming) responses
//! is cleared and stays at the front until its final response arrives,
//! which also holds back every younger slot.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use microbatch_core::{InferenceResponse, ResponseEnvelope, ResponseFlags};

type SlotEntry = (InferenceResponse, ResponseFlags, UnboundedSender<ResponseEnvelope>);

#[derive(Default)]
struct SlotQueue {
    /// Ticket number of the front slot
    base: u64,
    slots: VecDeque<Vec<SlotEntry>>,
}

/// Ordered completion queue: reserve early, fill late, drain in order
#[derive(Default)]
pub struct OrderedFinalizer {
    slots: Mutex<SlotQueue>,
    /// Serializes emission so concurrent delegates cannot interleave
    emit: Mutex<()>,
}

impl OrderedFinalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next completion slot, fixing this request's place in
    /// the emission order. Returns the slot's ticket.
    pub fn reserve(&self) -> u64 {
        let mut queue = self.slots.lock();
        queue.slots.push_back(Vec::new());
        queue.base + queue.slots.len() as u64 - 1
    }

    /// Add a response to its reserved slot and drain whatever became
    /// emittable
    pub fn push(
        &self,
        ticket: u64,
        sender: UnboundedSender<ResponseEnvelope>,
        response: InferenceResponse,
        flags: ResponseFlags,
    ) {
        {
            let mut queue = self.slots.lock();
            let index = ticket.checked_sub(queue.base).map(|i| i as usize);
            match index.and_then(|i| queue.slots.get_mut(i)) {
                Some(slot) => slot.push((response, flags, sender)),
                None => {
                    // The contract says FINAL is the last response for a
                    // request; a response after its slot was popped falls
                    // back to direct emission.
                    tracing::warn!(ticket, "response for an already finalized slot");
                    let _ = sender.send(ResponseEnvelope { response, flags });
                    return;
                }
            }
        }
        self.finalize();
    }

    /// Drain filled slots from the front, in reservation order
    pub fn finalize(&self) {
        let _emit = self.emit.lock();

        let mut ready: Vec<SlotEntry> = Vec::new();
        {
            let mut queue = self.slots.lock();
            while let Some(front) = queue.slots.front_mut() {
                if front.is_empty() {
                    break;
                }
                let entries = std::mem::take(front);
                let complete = entries.iter().any(|(_, flags, _)| flags.is_final());
                ready.extend(entries);
                if complete {
                    queue.slots.pop_front();
                    queue.base += 1;
                } else {
                    break;
                }
            }
        }

        for (response, flags, sender) in ready {
            let request_id = response.request_id;
            if sender.send(ResponseEnvelope { response, flags }).is_err() {
                tracing::warn!(request_id, "response receiver dropped");
            }
        }
    }

    /// Slots still waiting on their final response
    pub fn pending_slots(&self) -> usize {
        self.slots.lock().slots.len()
    }
}
