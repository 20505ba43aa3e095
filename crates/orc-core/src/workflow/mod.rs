//! Declarative multi-agent workflow execution: definition model, DAG
//! planning, bounded parallel wave execution, per-stage retry/approval, and
//! the engine that ties them together.

pub mod engine;
pub mod model;
pub mod parallel;
pub mod plan;
pub mod result;
pub mod stage;

pub use engine::WorkflowEngine;
pub use model::{
    AgentCatalog, AgentDefinition, AgentType, ApprovalConfig, ErrorStrategy, FailurePolicy,
    IterationConfig, IterationKind, PromptTemplate, Settings, WorkflowDefinition, WorkflowStage,
};
pub use parallel::{ParallelConfig, StageTask};
pub use plan::{ExecutionPlan, ExecutionWave};
pub use result::{IterationResult, StageResult, WorkflowResult};
pub use stage::{AgentRegistry, StageExecutor, Validator, ValidationOutcome};
