//! Configuration for the dynamic batch scheduler.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use thiserror::Error;

use microbatch_core::QueuePolicy;

/// Construction-time configuration mistakes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A preferred batch size of 0 can never be reached
    #[error("preferred batch size must be positive")]
    PreferredSizeZero,

    /// A preferred batch size beyond the hard maximum can never fire
    #[error("preferred batch size {size} exceeds max batch size {max}")]
    PreferredSizeExceedsMax { size: usize, max: usize },

    /// The policy map names a priority level that does not exist
    #[error("queue policy for unknown priority level {level} ({levels} levels configured)")]
    UnknownPolicyLevel { level: u32, levels: u32 },
}

/// Construction-time configuration for one scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Whether requests are batched at all. When off, every request ships
    /// in its own payload.
    pub dynamic_batching: bool,

    /// Hard upper bound on a payload's batch size
    pub max_batch_size: usize,

    /// Batch sizes the model executes efficiently at; the batcher targets
    /// the largest one that fits
    pub preferred_batch_sizes: BTreeSet<usize>,

    /// Longest a request may wait while the batcher tries to reach a
    /// preferred size; `Duration::ZERO` disables the delay bound
    pub max_queue_delay: Duration,

    /// Emit responses in enqueue order within each priority level
    pub preserve_ordering: bool,

    /// Consult the response cache on enqueue and insert computed
    /// responses. Effective only when a cache is also supplied.
    pub response_cache: bool,

    /// Inputs whose shape must match across a batch. A `true` value
    /// additionally requires the input to be present in every request.
    pub enforce_equal_shape_tensors: HashMap<String, bool>,

    /// Whether the model declares optional inputs; batches then also pin
    /// the exact set of input names
    pub has_optional_inputs: bool,

    /// Number of priority levels; 0 disables priorities
    pub priority_levels: u32,

    /// Policy for levels without an entry in `queue_policy_map`
    pub default_queue_policy: QueuePolicy,

    /// Per-level policy overrides
    pub queue_policy_map: HashMap<u32, QueuePolicy>,

    /// Niceness hint for the batcher thread
    pub nice: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dynamic_batching: true,
            max_batch_size: 8,
            preferred_batch_sizes: BTreeSet::new(),
            max_queue_delay: Duration::ZERO,
            preserve_ordering: false,
            response_cache: false,
            enforce_equal_shape_tensors: HashMap::new(),
            has_optional_inputs: false,
            priority_levels: 0,
            default_queue_policy: QueuePolicy::default(),
            queue_policy_map: HashMap::new(),
            nice: 0,
        }
    }
}

impl SchedulerConfig {
    /// Config optimized for low latency: small batches, no delay bound
    pub fn low_latency() -> Self {
        Self { max_batch_size: 4, ..Default::default() }
    }

    /// Config optimized for throughput: large preferred batches with a
    /// short accumulation window
    pub fn high_throughput() -> Self {
        Self {
            max_batch_size: 32,
            preferred_batch_sizes: BTreeSet::from([8, 16, 32]),
            max_queue_delay: Duration::from_millis(2),
            ..Default::default()
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("MICROBATCH_MAX_BATCH_SIZE") {
            if let Ok(n) = val.parse() {
                config.max_batch_size = n;
            }
        }

        if let Ok(val) = std::env::var("MICROBATCH_MAX_QUEUE_DELAY_US") {
            if let Ok(n) = val.parse() {
                config.max_queue_delay = Duration::from_micros(n);
            }
        }

        if let Ok(val) = std::env::var("MICROBATCH_PREFERRED_BATCH_SIZES") {
            config.preferred_batch_sizes =
                val.split(',').filter_map(|s| s.trim().parse().ok()).collect();
        }

        if let Ok(val) = std::env::var("MICROBATCH_PRESERVE_ORDERING") {
            config.preserve_ordering = val == "1" || val.eq_ignore_ascii_case("true");
        }

        config
    }

    /// Largest preferred batch size, or 0 when none are configured
    pub fn max_preferred_batch_size(&self) -> usize {
        self.preferred_batch_sizes.iter().next_back().copied().unwrap_or(0)
    }

    /// Reject configurations that could never behave as asked: preferred
    /// batch sizes that are zero or beyond the (clamped) maximum, and
    /// policy-map entries for priority levels that do not exist.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max = self.max_batch_size.max(1);
        for &size in &self.preferred_batch_sizes {
            if size == 0 {
                return Err(ConfigError::PreferredSizeZero);
            }
            if size > max {
                return Err(ConfigError::PreferredSizeExceedsMax { size, max });
            }
        }
        if self.priority_levels > 0 {
            for &level in self.queue_policy_map.keys() {
                if level >= self.priority_levels {
                    return Err(ConfigError::UnknownPolicyLevel {
                        level,
                        levels: self.priority_levels,
                    });
                }
            }
        }
        Ok(())
    }

    /// Clamp and reconcile the configuration: the batch size bound is at
    /// least 1 and preferred sizes beyond it are dropped
    pub fn normalized(mut self) -> Self {
        self.max_batch_size = self.max_batch_size.max(1);
        let dropped: Vec<usize> = self
            .preferred_batch_sizes
            .iter()
            .copied()
            .filter(|&size| size == 0 || size > self.max_batch_size)
            .collect();
        for size in dropped {
            tracing::warn!(
                size,
                max_batch_size = self.max_batch_size,
                "dropping unusable preferred batch size"
            );
            self.preferred_batch_sizes.remove(&size);
        }
        self
    }
}
