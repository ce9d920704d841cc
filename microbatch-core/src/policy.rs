//! Per-priority-level queue policies.

use std::time::{Duration, Instant};

use crate::request::InferenceRequest;

/// What happens to a request that outlives its queue deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutAction {
    /// Remove the request and answer it with a timeout error
    #[default]
    Reject,
    /// Keep the request queued but stop letting its age force a batch to
    /// fire; it is served whenever a batch reaches it
    Delay,
}

/// Admission and timeout policy for one priority level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePolicy {
    /// Action taken when a request exceeds its deadline
    pub timeout_action: TimeoutAction,

    /// Deadline applied to requests that do not carry their own; `None`
    /// disables the timeout
    pub default_timeout: Option<Duration>,

    /// Whether a request-supplied timeout replaces the default
    pub allow_timeout_override: bool,

    /// Maximum requests queued at this level; 0 means unbounded. Enforced
    /// only under [`TimeoutAction::Reject`].
    pub max_queue_size: usize,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            timeout_action: TimeoutAction::Reject,
            default_timeout: None,
            allow_timeout_override: false,
            max_queue_size: 0,
        }
    }
}

impl QueuePolicy {
    /// Compute the absolute deadline for a request admitted at `now`
    pub fn effective_deadline(&self, request: &InferenceRequest, now: Instant) -> Option<Instant> {
        let timeout = if self.allow_timeout_override && request.timeout.is_some() {
            request.timeout
        } else {
            self.default_timeout
        };
        timeout.map(|t| now + t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_timeout_by_default() {
        let policy = QueuePolicy::default();
        let (req, _rx) = InferenceRequest::new("m", vec![]);
        assert!(policy.effective_deadline(&req, Instant::now()).is_none());
    }

    #[test]
    fn test_default_timeout_applies() {
        let policy = QueuePolicy {
            default_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let (req, _rx) = InferenceRequest::new("m", vec![]);
        let now = Instant::now();
        assert_eq!(policy.effective_deadline(&req, now), Some(now + Duration::from_millis(50)));
    }

    #[test]
    fn test_override_requires_permission() {
        let (req, _rx) = InferenceRequest::new("m", vec![]);
        let req = req.with_timeout(Duration::from_millis(5));
        let now = Instant::now();

        let strict = QueuePolicy {
            default_timeout: Some(Duration::from_millis(50)),
            allow_timeout_override: false,
            ..Default::default()
        };
        assert_eq!(strict.effective_deadline(&req, now), Some(now + Duration::from_millis(50)));

        let permissive = QueuePolicy { allow_timeout_override: true, ..strict };
        assert_eq!(
            permissive.effective_deadline(&req, now),
            Some(now + Duration::from_millis(5))
        );
    }
}
