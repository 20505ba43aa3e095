use serde::{Deserialize, Serialize};

/// Top-level engine configuration loaded from `orchestrator.toml`.
///
/// This is the engine-wide tuning surface; it is distinct from a
/// `WorkflowDefinition`'s per-workflow `settings` block (§3), which travels
/// with the workflow document itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OrchestratorConfig {
    pub execution: ExecutionConfig,
    pub retry: RetryConfig,
    pub template: TemplateConfig,
}

/// Execution-wide defaults consumed by the parallel stage executor and the
/// stage executor when a stage does not override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExecutionConfig {
    /// Default per-task timeout in seconds (spec §4.5: default 5 minutes).
    pub default_timeout_seconds: u64,
    /// Default bounded worker pool size. `0` means derive from CPU count
    /// (2x logical CPUs, per spec §4.5).
    pub max_parallelism: usize,
    /// Default per-stage retry ceiling when a stage does not set
    /// `retryLimit`.
    pub default_retry_limit: u32,
    /// Engine close grace period, in seconds, before forced shutdown.
    pub shutdown_grace_seconds: u64,
    /// Additional seconds allowed after the grace period before giving up.
    pub shutdown_force_seconds: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 300,
            max_parallelism: 0,
            default_retry_limit: 1,
            shutdown_grace_seconds: 30,
            shutdown_force_seconds: 10,
        }
    }
}

/// Default retry-policy parameters, used unless a stage supplies its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    pub kind: RetryKind,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_duration_ms: u64,
    pub jitter_enabled: bool,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            kind: RetryKind::ExponentialBackoff,
            initial_delay_ms: 200,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_duration_ms: 120_000,
            jitter_enabled: true,
            jitter_factor: 0.2,
        }
    }
}

/// Selects which built-in retry policy the engine builds from `RetryConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryKind {
    NoRetry,
    FixedDelay,
    ExponentialBackoff,
}

/// Template engine compile-cache configuration (spec §4.1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TemplateConfig {
    /// Bounded LRU capacity. `0` disables the cache (compile on every
    /// render); stats then report `enabled=false`.
    pub max_entries: usize,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self { max_entries: 256 }
    }
}
