// Centralized constants for the buildforge engine to avoid magic numbers

/// Default bound of the per-builder submission queue
pub const DEFAULT_QUEUE_SIZE: usize = 32;

/// How long a finished task stays queryable before eviction (5 minutes)
pub const DEFAULT_KEEP_RESULT_SECS: u64 = 300;

/// Longest a task may wait in the queue before it is cancelled (5 minutes)
pub const DEFAULT_MAX_QUEUE_TIME_SECS: u64 = 300;

/// Interval between expired-task sweeps inside a builder
pub const TASK_SWEEP_INTERVAL_SECS: u64 = 60;

/// Bounded wait for live tasks to drain during a builder shutdown
pub const DEFAULT_SHUTDOWN_WAIT_SECS: u64 = 10;

/// Builder event broadcast channel capacity
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Number of days an untouched sources cache survives before eviction
pub const DEFAULT_SOURCES_RETENTION_DAYS: u64 = 7;

/// Interval between sources cache eviction sweeps (10 minutes)
pub const SOURCES_SWEEP_INTERVAL_SECS: u64 = 600;

/// Interval between cross-builder cleaner sweeps (2 minutes)
pub const CLEANER_INTERVAL_SECS: u64 = 120;

/// Bounded wait for build output pumps to drain after the process exits
pub const OUTPUT_DRAIN_SECS: u64 = 5;
