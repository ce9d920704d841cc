//! Custom batching hooks.
//!
//! Models can veto the scheduler's batch composition through three
//! callbacks: `init` builds an opaque accumulator when a payload is
//! created, `include` is asked about every candidate request while the
//! batch is assembled, and `finalize` tears the accumulator down when the
//! payload is handed to the engine. All three run under the payload's
//! exec mutex and must not call back into the scheduler.

use std::any::Any;

use microbatch_core::InferenceRequest;

/// Error type surfaced by hook implementations
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Model-supplied veto over batch composition
pub trait CustomBatcher: Send + Sync {
    /// Build the accumulator a fresh payload carries
    fn init(&self) -> Box<dyn Any + Send>;

    /// Decide whether `request` may join the payload's batch. An error is
    /// logged by the scheduler and treated as "do not include".
    fn include(
        &self,
        request: &InferenceRequest,
        state: &mut (dyn Any + Send),
    ) -> Result<bool, HookError>;

    /// Tear down the accumulator when the payload ships
    fn finalize(&self, state: Box<dyn Any + Send>);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Admits requests until their summed batch size reaches a budget.
    struct BudgetBatcher {
        budget: usize,
    }

    impl CustomBatcher for BudgetBatcher {
        fn init(&self) -> Box<dyn Any + Send> {
            Box::new(0usize)
        }

        fn include(
            &self,
            request: &InferenceRequest,
            state: &mut (dyn Any + Send),
        ) -> Result<bool, HookError> {
            let used = state.downcast_mut::<usize>().ok_or("accumulator type mismatch")?;
            if *used + request.effective_batch_size() > self.budget {
                return Ok(false);
            }
            *used += request.effective_batch_size();
            Ok(true)
        }

        fn finalize(&self, _state: Box<dyn Any + Send>) {}
    }

    #[test]
    fn test_budget_batcher_vetoes_over_budget() {
        let batcher = BudgetBatcher { budget: 3 };
        let mut state = batcher.init();

        let (small, _rx1) = InferenceRequest::new("m", vec![]);
        let small = small.with_batch_size(2);
        let (large, _rx2) = InferenceRequest::new("m", vec![]);
        let large = large.with_batch_size(2);

        assert!(batcher.include(&small, state.as_mut()).unwrap());
        assert!(!batcher.include(&large, state.as_mut()).unwrap());
        batcher.finalize(state);
    }
}
