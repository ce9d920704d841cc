//! Multi-level priority queue with policy-driven timeouts and a batching
//! cursor.
//!
//! Requests are kept in strict FIFO order within a priority level; lower
//! levels are always served first. Each level carries a [`QueuePolicy`]
//! that decides what happens to requests that outlive their deadline:
//! `Reject` moves them to a per-level rejected bucket (drained by the
//! scheduler, which answers them with a timeout error), `Delay` parks
//! them behind the level's live queue where they no longer force a
//! batch to fire but can still join one.
//!
//! The *cursor* walks the queue without dequeuing so the batch assembler
//! can measure a would-be batch before committing to it. While walking it
//! accumulates the pending-batch request count, the oldest enqueue
//! timestamp (live requests only) and the closest deadline. Any queue
//! mutation that can touch the selected prefix (enqueue, dequeue)
//! invalidates the cursor; policy transfers happen at or beyond the
//! cursor and keep it valid.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;

use crate::error::{EnqueueError, ScheduleError};
use crate::policy::{QueuePolicy, TimeoutAction};
use crate::request::InferenceRequest;

/// One priority level: live queue, delayed requests, rejected bucket
#[derive(Debug, Default)]
struct PolicyQueue {
    policy: QueuePolicy,
    queue: VecDeque<InferenceRequest>,
    delayed: VecDeque<InferenceRequest>,
    rejected: VecDeque<InferenceRequest>,
}

impl PolicyQueue {
    fn new(policy: QueuePolicy) -> Self {
        Self { policy, ..Default::default() }
    }

    /// Requests visible to the cursor (live then delayed)
    fn live_len(&self) -> usize {
        self.queue.len() + self.delayed.len()
    }

    /// Request at `offset` in the cursor's view of this level
    fn at(&self, offset: usize) -> Option<&InferenceRequest> {
        if offset < self.queue.len() {
            self.queue.get(offset)
        } else {
            self.delayed.get(offset - self.queue.len())
        }
    }
}

/// Cursor state: a position plus the pending-batch accounting gathered on
/// the way there
#[derive(Debug, Clone, Default)]
struct Cursor {
    valid: bool,
    level: Option<u32>,
    offset: usize,
    pending_count: usize,
    oldest_enqueue: Option<Instant>,
    closest_deadline: Option<Instant>,
}

/// Priority queue over all configured levels
#[derive(Debug)]
pub struct PriorityQueue {
    priority_levels: u32,
    queues: BTreeMap<u32, PolicyQueue>,
    cursor: Cursor,
    mark: Cursor,
}

impl PriorityQueue {
    /// Create a queue with `priority_levels` levels (0 means a single
    /// implicit level that every priority maps to). Levels take their
    /// policy from `policy_map`, falling back to `default_policy`.
    pub fn new(
        default_policy: QueuePolicy,
        priority_levels: u32,
        policy_map: &HashMap<u32, QueuePolicy>,
    ) -> Self {
        let mut queues = BTreeMap::new();
        if priority_levels == 0 {
            queues.insert(0, PolicyQueue::new(default_policy));
        } else {
            for level in 0..priority_levels {
                let policy = policy_map.get(&level).cloned().unwrap_or_else(|| default_policy.clone());
                queues.insert(level, PolicyQueue::new(policy));
            }
        }
        Self { priority_levels, queues, cursor: Cursor::default(), mark: Cursor::default() }
    }

    /// Admit a request at the tail of its priority level.
    ///
    /// Fails with `InvalidPriority` when levels are configured and the
    /// priority is out of range, or `QueueFull` when a bounded level under
    /// a `Reject` policy is at capacity. Invalidates the cursor.
    pub fn enqueue(
        &mut self,
        priority: u32,
        mut request: InferenceRequest,
    ) -> Result<(), EnqueueError> {
        let level = if self.priority_levels == 0 { 0 } else { priority };
        if self.priority_levels != 0 && priority >= self.priority_levels {
            return Err(EnqueueError::new(
                ScheduleError::InvalidPriority { priority, levels: self.priority_levels },
                request,
            ));
        }
        let Some(pq) = self.queues.get_mut(&level) else {
            return Err(EnqueueError::new(
                ScheduleError::internal(format!("priority level {level} missing")),
                request,
            ));
        };

        if pq.policy.max_queue_size > 0
            && pq.policy.timeout_action == TimeoutAction::Reject
            && pq.live_len() >= pq.policy.max_queue_size
        {
            return Err(EnqueueError::new(
                ScheduleError::QueueFull { priority: level, max: pq.policy.max_queue_size },
                request,
            ));
        }

        let deadline = pq.policy.effective_deadline(&request, Instant::now());
        request.set_deadline(deadline);
        pq.queue.push_back(request);
        self.cursor.valid = false;
        Ok(())
    }

    /// Remove the head of the highest non-empty priority level.
    /// Invalidates the cursor.
    pub fn dequeue(&mut self) -> Result<InferenceRequest, ScheduleError> {
        for pq in self.queues.values_mut() {
            if let Some(request) = pq.queue.pop_front().or_else(|| pq.delayed.pop_front()) {
                self.cursor.valid = false;
                return Ok(request);
            }
        }
        Err(ScheduleError::Empty)
    }

    /// Total requests pending across all levels (excluding rejected)
    pub fn len(&self) -> usize {
        self.queues.values().map(PolicyQueue::live_len).sum()
    }

    /// Whether no requests are pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Place the cursor at the head of the highest non-empty level
    pub fn reset_cursor(&mut self) {
        self.cursor = Cursor {
            valid: true,
            level: self.first_live_level_from(0),
            offset: 0,
            pending_count: 0,
            oldest_enqueue: None,
            closest_deadline: None,
        };
        self.mark = self.cursor.clone();
    }

    /// Whether the cursor survived all mutations since the last reset
    pub fn is_cursor_valid(&self) -> bool {
        self.cursor.valid
    }

    /// Whether the cursor has walked past the last pending request
    pub fn cursor_end(&self) -> bool {
        self.cursor.level.is_none()
    }

    /// Peek at the request under the cursor
    pub fn request_at_cursor(&self) -> Option<&InferenceRequest> {
        let level = self.cursor.level?;
        self.queues.get(&level)?.at(self.cursor.offset)
    }

    /// Step the cursor past the current request, folding it into the
    /// pending-batch accounting
    pub fn advance_cursor(&mut self) {
        let Some(level) = self.cursor.level else { return };
        let Some(pq) = self.queues.get(&level) else {
            self.cursor.level = None;
            return;
        };
        if let Some(request) = pq.at(self.cursor.offset) {
            // Delayed requests joined the batch but must not force a
            // delay-based fire, so they are left out of the age tracking.
            if self.cursor.offset < pq.queue.len() {
                self.cursor.oldest_enqueue = min_instant(self.cursor.oldest_enqueue, request.queue_start());
            }
            self.cursor.closest_deadline = min_instant(self.cursor.closest_deadline, request.deadline());
            self.cursor.pending_count += 1;
            self.cursor.offset += 1;
        }
        self.normalize_cursor();
    }

    /// Save the cursor position as the best batch found so far
    pub fn mark_cursor(&mut self) {
        self.mark = self.cursor.clone();
    }

    /// Roll the cursor back to the saved mark
    pub fn set_cursor_to_mark(&mut self) {
        self.cursor = self.mark.clone();
    }

    /// Requests between each level's head and the cursor
    pub fn pending_batch_count(&self) -> usize {
        if self.cursor.valid {
            self.cursor.pending_count
        } else {
            0
        }
    }

    /// Earliest queue-start timestamp in the pending batch, delayed
    /// requests excluded
    pub fn oldest_enqueue_time(&self) -> Option<Instant> {
        self.cursor.oldest_enqueue
    }

    /// Earliest absolute deadline in the pending batch
    pub fn closest_timeout(&self) -> Option<Instant> {
        self.cursor.closest_deadline
    }

    /// Apply each level's timeout policy to requests at and beyond the
    /// cursor, stopping at the first one still within its deadline.
    ///
    /// Returns the summed batch size of requests moved to the rejected
    /// bucket by this call, so the caller can shrink its queued total.
    pub fn apply_policy_at_cursor(&mut self) -> usize {
        if !self.cursor.valid {
            return 0;
        }
        let mut rejected_size = 0;
        loop {
            let Some(level) = self.cursor.level else { break };
            let Some(pq) = self.queues.get_mut(&level) else { break };

            let now = Instant::now();
            while self.cursor.offset < pq.queue.len() {
                let expired = pq.queue[self.cursor.offset].deadline().is_some_and(|d| now > d);
                if !expired {
                    break;
                }
                let Some(mut request) = pq.queue.remove(self.cursor.offset) else { break };
                match pq.policy.timeout_action {
                    TimeoutAction::Reject => {
                        tracing::debug!(
                            request_id = request.id(),
                            level,
                            "queue deadline exceeded, rejecting request"
                        );
                        rejected_size += request.effective_batch_size();
                        pq.rejected.push_back(request);
                    }
                    TimeoutAction::Delay => {
                        tracing::debug!(
                            request_id = request.id(),
                            level,
                            "queue deadline exceeded, delaying request"
                        );
                        request.set_deadline(None);
                        pq.delayed.push_back(request);
                    }
                }
            }

            if self.cursor.offset < pq.live_len() {
                break;
            }
            self.cursor.level = match level.checked_add(1) {
                Some(next) => self.first_live_level_from(next),
                None => None,
            };
            self.cursor.offset = 0;
            if self.cursor.level.is_none() {
                break;
            }
        }
        rejected_size
    }

    /// Hand every rejected request to the caller, highest priority first
    pub fn release_rejected_requests(&mut self) -> Vec<InferenceRequest> {
        let mut released = Vec::new();
        for pq in self.queues.values_mut() {
            released.extend(pq.rejected.drain(..));
        }
        released
    }

    fn first_live_level_from(&self, level: u32) -> Option<u32> {
        self.queues
            .range(level..)
            .find(|(_, pq)| pq.live_len() > 0)
            .map(|(&level, _)| level)
    }

    fn normalize_cursor(&mut self) {
        while let Some(level) = self.cursor.level {
            let live = self.queues.get(&level).map_or(0, PolicyQueue::live_len);
            if self.cursor.offset < live {
                return;
            }
            self.cursor.level = match level.checked_add(1) {
                Some(next) => self.first_live_level_from(next),
                None => None,
            };
            self.cursor.offset = 0;
        }
    }
}

fn min_instant(current: Option<Instant>, candidate: Option<Instant>) -> Option<Instant> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(model: &str) -> InferenceRequest {
        let (mut req, _rx) = InferenceRequest::new(model, vec![]);
        req.capture_queue_start();
        req
    }

    fn single_level() -> PriorityQueue {
        PriorityQueue::new(QueuePolicy::default(), 0, &HashMap::new())
    }

    #[test]
    fn test_fifo_within_level() {
        let mut queue = single_level();
        let (a, b) = (request("a"), request("b"));
        let (id_a, id_b) = (a.id(), b.id());

        queue.enqueue(0, a).unwrap();
        queue.enqueue(0, b).unwrap();

        assert_eq!(queue.dequeue().unwrap().id(), id_a);
        assert_eq!(queue.dequeue().unwrap().id(), id_b);
        assert!(matches!(queue.dequeue(), Err(ScheduleError::Empty)));
    }

    #[test]
    fn test_priority_order_across_levels() {
        let mut queue = PriorityQueue::new(QueuePolicy::default(), 3, &HashMap::new());
        let low = request("low");
        let high = request("high");
        let high_id = high.id();

        queue.enqueue(2, low).unwrap();
        queue.enqueue(0, high).unwrap();

        assert_eq!(queue.dequeue().unwrap().id(), high_id);
    }

    #[test]
    fn test_unknown_priority_rejected() {
        let mut queue = PriorityQueue::new(QueuePolicy::default(), 2, &HashMap::new());
        let err = queue.enqueue(5, request("m")).unwrap_err();
        assert!(matches!(err.reason, ScheduleError::InvalidPriority { priority: 5, levels: 2 }));
    }

    #[test]
    fn test_any_priority_without_levels() {
        let mut queue = single_level();
        queue.enqueue(17, request("m")).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_capacity_enforced_under_reject() {
        let policy = QueuePolicy { max_queue_size: 1, ..Default::default() };
        let mut queue = PriorityQueue::new(policy, 0, &HashMap::new());

        queue.enqueue(0, request("m")).unwrap();
        let err = queue.enqueue(0, request("m")).unwrap_err();
        assert!(matches!(err.reason, ScheduleError::QueueFull { max: 1, .. }));
    }

    #[test]
    fn test_capacity_ignored_under_delay() {
        let policy = QueuePolicy {
            timeout_action: TimeoutAction::Delay,
            max_queue_size: 1,
            ..Default::default()
        };
        let mut queue = PriorityQueue::new(policy, 0, &HashMap::new());

        queue.enqueue(0, request("m")).unwrap();
        queue.enqueue(0, request("m")).unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_cursor_walk_accounting() {
        let mut queue = single_level();
        let first = request("m");
        let first_start = first.queue_start();
        queue.enqueue(0, first).unwrap();
        queue.enqueue(0, request("m").with_batch_size(3)).unwrap();
        let third = request("m");
        let third_id = third.id();
        queue.enqueue(0, third).unwrap();

        queue.reset_cursor();
        assert!(queue.is_cursor_valid());
        assert_eq!(queue.pending_batch_count(), 0);

        queue.advance_cursor();
        queue.advance_cursor();
        assert_eq!(queue.pending_batch_count(), 2);
        assert_eq!(queue.oldest_enqueue_time(), first_start);
        assert_eq!(queue.request_at_cursor().unwrap().id(), third_id);
        assert!(!queue.cursor_end());

        queue.advance_cursor();
        assert!(queue.cursor_end());
        assert!(queue.request_at_cursor().is_none());
    }

    #[test]
    fn test_cursor_crosses_levels_in_priority_order() {
        let mut queue = PriorityQueue::new(QueuePolicy::default(), 2, &HashMap::new());
        let lower = request("m");
        let lower_id = lower.id();
        let upper = request("m");
        let upper_id = upper.id();

        queue.enqueue(1, lower).unwrap();
        queue.enqueue(0, upper).unwrap();

        queue.reset_cursor();
        assert_eq!(queue.request_at_cursor().unwrap().id(), upper_id);
        queue.advance_cursor();
        assert_eq!(queue.request_at_cursor().unwrap().id(), lower_id);
    }

    #[test]
    fn test_mutations_invalidate_cursor() {
        let mut queue = single_level();
        queue.enqueue(0, request("m")).unwrap();

        queue.reset_cursor();
        assert!(queue.is_cursor_valid());
        queue.enqueue(0, request("m")).unwrap();
        assert!(!queue.is_cursor_valid());

        queue.reset_cursor();
        queue.dequeue().unwrap();
        assert!(!queue.is_cursor_valid());
    }

    #[test]
    fn test_mark_and_restore() {
        let mut queue = single_level();
        for _ in 0..4 {
            queue.enqueue(0, request("m")).unwrap();
        }

        queue.reset_cursor();
        queue.advance_cursor();
        queue.advance_cursor();
        queue.mark_cursor();
        queue.advance_cursor();
        queue.advance_cursor();
        assert_eq!(queue.pending_batch_count(), 4);

        queue.set_cursor_to_mark();
        assert_eq!(queue.pending_batch_count(), 2);
    }

    #[test]
    fn test_apply_policy_rejects_expired() {
        let policy = QueuePolicy {
            default_timeout: Some(Duration::from_millis(1)),
            ..Default::default()
        };
        let mut queue = PriorityQueue::new(policy, 0, &HashMap::new());
        queue.enqueue(0, request("m").with_batch_size(2)).unwrap();
        queue.enqueue(0, request("m")).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        queue.reset_cursor();
        let rejected_size = queue.apply_policy_at_cursor();

        assert_eq!(rejected_size, 3);
        assert!(queue.is_empty());
        assert!(queue.cursor_end());
        assert_eq!(queue.release_rejected_requests().len(), 2);
    }

    #[test]
    fn test_apply_policy_stops_at_live_request() {
        let policy = QueuePolicy {
            default_timeout: Some(Duration::from_millis(1)),
            ..Default::default()
        };
        let mut queue = PriorityQueue::new(policy, 0, &HashMap::new());
        queue.enqueue(0, request("m")).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let live = request("m");
        let live_id = live.id();
        queue.enqueue(0, live).unwrap();

        queue.reset_cursor();
        let rejected_size = queue.apply_policy_at_cursor();

        assert_eq!(rejected_size, 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.request_at_cursor().unwrap().id(), live_id);
    }

    #[test]
    fn test_delay_policy_parks_requests() {
        let policy = QueuePolicy {
            timeout_action: TimeoutAction::Delay,
            default_timeout: Some(Duration::from_millis(1)),
            ..Default::default()
        };
        let mut queue = PriorityQueue::new(policy, 0, &HashMap::new());
        let stale = request("m");
        let stale_id = stale.id();
        queue.enqueue(0, stale).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let fresh = request("m");
        let fresh_id = fresh.id();
        let fresh_start = fresh.queue_start();
        queue.enqueue(0, fresh).unwrap();

        queue.reset_cursor();
        assert_eq!(queue.apply_policy_at_cursor(), 0);
        assert_eq!(queue.len(), 2);

        // The delayed request is visited after the live one and no longer
        // counts toward the pending batch age.
        assert_eq!(queue.request_at_cursor().unwrap().id(), fresh_id);
        queue.advance_cursor();
        assert_eq!(queue.request_at_cursor().unwrap().id(), stale_id);
        queue.advance_cursor();
        assert_eq!(queue.pending_batch_count(), 2);
        assert_eq!(queue.oldest_enqueue_time(), fresh_start);
    }

    #[test]
    fn test_closest_timeout_tracking() {
        let policy = QueuePolicy {
            default_timeout: Some(Duration::from_secs(60)),
            allow_timeout_override: true,
            ..Default::default()
        };
        let mut queue = PriorityQueue::new(policy, 0, &HashMap::new());
        queue.enqueue(0, request("m")).unwrap();
        queue.enqueue(0, request("m").with_timeout(Duration::from_secs(1))).unwrap();

        queue.reset_cursor();
        queue.advance_cursor();
        let after_first = queue.closest_timeout().unwrap();
        queue.advance_cursor();
        let after_second = queue.closest_timeout().unwrap();

        assert!(after_second < after_first);
    }
}
