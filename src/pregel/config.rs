//! Job configuration
//!
//! Every field has a default, so a config file only needs the values it
//! changes. Durations are written in humantime form (`"60s"`, `"250ms"`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{PregelError, PregelResult};

/// Default barrier wait per superstep
pub const BARRIER_TIMEOUT_DEFAULT: Duration = Duration::from_secs(60);

/// Default wait for workers to register, load or recover
pub const REGISTRATION_TIMEOUT_DEFAULT: Duration = Duration::from_secs(30);

/// Default messages per transport batch
pub const MAX_BATCH_MESSAGES_DEFAULT: usize = 10_000;

/// Default number of committed checkpoints kept
pub const CHECKPOINT_RETAIN_DEFAULT: usize = 2;

/// Default consecutive checkpoint failures tolerated before the job aborts
pub const CHECKPOINT_FAILURES_MAX_DEFAULT: u32 = 3;

/// Retry with exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// No retries at all
    pub fn none() -> Self {
        Self::new(0)
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Delay before retry number `attempt` (1-based); zero for attempt 0
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_backoff.as_millis() as f64 * factor).min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// When and how checkpoints are taken
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointPolicy {
    /// Checkpoint every `interval` supersteps, starting at superstep 0.
    /// `None` disables checkpointing.
    pub interval: Option<u64>,
    /// Committed checkpoints kept after garbage collection (at least 1)
    pub retain: usize,
    /// Consecutive failed checkpoints after which the job aborts
    pub max_consecutive_failures: u32,
    /// Delete checkpoints an earlier job left in the storage instead of
    /// refusing to start
    pub overwrite_existing: bool,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            interval: None,
            retain: CHECKPOINT_RETAIN_DEFAULT,
            max_consecutive_failures: CHECKPOINT_FAILURES_MAX_DEFAULT,
            overwrite_existing: false,
        }
    }
}

impl CheckpointPolicy {
    pub fn every(interval: u64) -> Self {
        Self {
            interval: Some(interval),
            ..Default::default()
        }
    }

    pub fn with_overwrite_existing(mut self, overwrite: bool) -> Self {
        self.overwrite_existing = overwrite;
        self
    }

    /// Whether superstep `superstep` starts with a checkpoint
    pub fn is_due(&self, superstep: u64) -> bool {
        match self.interval {
            Some(k) if k > 0 => superstep % k == 0,
            _ => false,
        }
    }
}

/// Which halted vertices are scheduled in the next superstep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationPolicy {
    /// Only incoming messages wake a halted vertex
    #[default]
    MessagesOnly,
    /// Incoming messages or a change to the vertex's edges
    MessagesOrMutations,
}

/// Configuration for one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PregelConfig {
    /// Workers launched at job start
    pub num_workers: usize,
    /// Compute tasks run concurrently by one worker
    pub compute_threads: usize,
    /// Partitions for the job; `None` means `num_workers * compute_threads`
    pub partition_count: Option<u32>,
    /// Hard cap on supersteps
    pub max_supersteps: Option<u64>,
    #[serde(with = "humantime_serde")]
    pub barrier_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub registration_timeout: Duration,
    pub max_batch_messages: usize,
    pub checkpoint: CheckpointPolicy,
    /// Bounds checkpoint rollbacks for the whole job
    pub recovery: RetryPolicy,
    /// Redelivery of one batch before the target counts as failed
    pub transport_retry: RetryPolicy,
    /// Launch a replacement worker when one fails
    pub respawn_failed_workers: bool,
    pub activation: ActivationPolicy,
    /// Messages or edges addressed to a missing vertex create it
    pub create_missing_vertices: bool,
}

impl Default for PregelConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            compute_threads: num_cpus::get(),
            partition_count: None,
            max_supersteps: None,
            barrier_timeout: BARRIER_TIMEOUT_DEFAULT,
            registration_timeout: REGISTRATION_TIMEOUT_DEFAULT,
            max_batch_messages: MAX_BATCH_MESSAGES_DEFAULT,
            checkpoint: CheckpointPolicy::default(),
            recovery: RetryPolicy::default(),
            transport_retry: RetryPolicy::new(2).with_backoff(Duration::from_millis(10), Duration::from_millis(200)),
            respawn_failed_workers: true,
            activation: ActivationPolicy::default(),
            create_missing_vertices: true,
        }
    }
}

impl PregelConfig {
    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_compute_threads(mut self, threads: usize) -> Self {
        self.compute_threads = threads;
        self
    }

    pub fn with_partition_count(mut self, count: u32) -> Self {
        self.partition_count = Some(count);
        self
    }

    pub fn with_max_supersteps(mut self, max: u64) -> Self {
        self.max_supersteps = Some(max);
        self
    }

    pub fn with_barrier_timeout(mut self, timeout: Duration) -> Self {
        self.barrier_timeout = timeout;
        self
    }

    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    pub fn with_max_batch_messages(mut self, max: usize) -> Self {
        self.max_batch_messages = max;
        self
    }

    pub fn with_checkpoint(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint = policy;
        self
    }

    pub fn with_recovery(mut self, policy: RetryPolicy) -> Self {
        self.recovery = policy;
        self
    }

    pub fn with_transport_retry(mut self, policy: RetryPolicy) -> Self {
        self.transport_retry = policy;
        self
    }

    pub fn with_respawn(mut self, respawn: bool) -> Self {
        self.respawn_failed_workers = respawn;
        self
    }

    pub fn with_activation(mut self, policy: ActivationPolicy) -> Self {
        self.activation = policy;
        self
    }

    pub fn with_create_missing_vertices(mut self, create: bool) -> Self {
        self.create_missing_vertices = create;
        self
    }

    /// Partition count the job runs with
    pub fn effective_partition_count(&self) -> u32 {
        self.partition_count.unwrap_or_else(|| {
            let derived = self.num_workers.max(1).saturating_mul(self.compute_threads.max(1));
            u32::try_from(derived).unwrap_or(u32::MAX)
        })
    }

    /// Reject configurations the engine cannot run
    pub fn validate(&self) -> PregelResult<()> {
        if self.num_workers == 0 {
            return Err(PregelError::config("num_workers must be >= 1"));
        }
        if self.compute_threads == 0 {
            return Err(PregelError::config("compute_threads must be >= 1"));
        }
        if self.partition_count == Some(0) {
            return Err(PregelError::config("partition_count must be >= 1"));
        }
        if self.max_batch_messages == 0 {
            return Err(PregelError::config("max_batch_messages must be >= 1"));
        }
        if self.barrier_timeout.is_zero() {
            return Err(PregelError::config("barrier_timeout must be positive"));
        }
        if self.registration_timeout.is_zero() {
            return Err(PregelError::config("registration_timeout must be positive"));
        }
        if self.checkpoint.interval == Some(0) {
            return Err(PregelError::config("checkpoint.interval must be >= 1"));
        }
        if self.checkpoint.retain == 0 {
            return Err(PregelError::config("checkpoint.retain must be >= 1"));
        }
        if self.checkpoint.max_consecutive_failures == 0 {
            return Err(PregelError::config("checkpoint.max_consecutive_failures must be >= 1"));
        }
        Ok(())
    }

    /// Small timeouts and fast retries for tests
    pub fn for_testing() -> Self {
        Self {
            compute_threads: 2,
            barrier_timeout: Duration::from_secs(5),
            registration_timeout: Duration::from_secs(5),
            recovery: RetryPolicy::new(3).with_backoff(Duration::from_millis(1), Duration::from_millis(10)),
            transport_retry: RetryPolicy::new(2).with_backoff(Duration::from_millis(1), Duration::from_millis(5)),
            ..Default::default()
        }
    }
}
