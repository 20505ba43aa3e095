use thiserror::Error;

/// Top-level error type for the orchestration kernel.
///
/// Variants map one-to-one onto the error taxonomy of the execution model:
/// each kind carries its own disposition (fatal at load, fatal at plan
/// build, retryable, ...). Per-stage runtime outcomes during wave
/// execution are reported as `StageResult`, not `OrcError`; this type
/// covers definition/plan-level failures and propagates `?`-style through
/// the loading and validation paths.
#[derive(Debug, Error)]
pub enum OrcError {
    /// Workflow definition failed structural or business-rule validation.
    #[error("schema error: {0}")]
    Schema(String),

    /// Dependency graph contains a cycle.
    #[error("circular dependency detected: {cycle}")]
    CircularDependency { cycle: String },

    /// A `dependsOn` entry names a stage that was never declared.
    #[error("stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },

    /// The wave/layer accounting failed an internal invariant.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// Agent invocation returned failure or raised an error.
    #[error("agent invocation failed: {0}")]
    AgentInvocation(String),

    /// A validator rejected a stage's output.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A stage exceeded its allotted timeout.
    #[error("stage '{stage}' timed out after {elapsed_ms}ms")]
    Timeout { stage: String, elapsed_ms: u64 },

    /// A human reviewer rejected the stage output.
    #[error("approval rejected: {0}")]
    ApprovalRejected(String),

    /// The approval gate was not answered within its timeout.
    #[error("approval timed out after {0}ms")]
    ApprovalTimeout(u64),

    /// Cancellation or interruption was observed mid-operation.
    #[error("interrupted")]
    Interrupted,

    /// An operation was attempted on a closed engine.
    #[error("engine closed")]
    EngineClosed,

    /// Wraps `std::io::Error`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OrcError>;
