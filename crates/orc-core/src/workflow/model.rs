//! Workflow definition data model (spec §3, §6 "Definition document schema").
//!
//! These types deserialize directly from the YAML document described in
//! spec §6: top-level `workflow{}`, `settings{}`, `variables{}`, `stages[]`,
//! plus the sibling `agents{}` / `prompt_templates{}` documents. Field names
//! use the document's own `snake_case` keys rather than the `camelCase`
//! names spec §3 uses in prose.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Root value of a workflow definition document (spec §3 `WorkflowDefinition`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub variables: Map<String, Value>,
    pub stages: Vec<WorkflowStage>,
}

fn default_version() -> String {
    "1".to_string()
}

impl WorkflowDefinition {
    /// Structural invariants from spec §3 that schema deserialization alone
    /// does not enforce: non-empty `name`, at least one stage, at least one
    /// agent per stage, and "if `approval.perItem` then `iteration.parallel`
    /// must be false". Collects every violation rather than stopping at the
    /// first, matching how `orc validate` reports errors.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("workflow name must not be empty".to_string());
        }
        if self.stages.is_empty() {
            errors.push("workflow declares no stages".to_string());
        }

        for stage in &self.stages {
            if stage.agents.is_empty() {
                errors.push(format!("stage '{}' declares no agents", stage.name));
            }
            let per_item = stage.approval.as_ref().is_some_and(|a| a.per_item);
            let iteration_parallel = stage.iteration.as_ref().is_some_and(|i| i.parallel);
            if per_item && iteration_parallel {
                errors.push(format!(
                    "stage '{}': approval.per_item requires iteration.parallel = false",
                    stage.name
                ));
            }
        }

        errors
    }
}

/// `settings{output_dir, max_retries, timeout, target_words_per_chapter,
/// max_words_per_chapter}` (spec §6). `output_dir` is a template substituted
/// with `${timestamp}` / `${workflow}` before any file is written (spec §6
/// "Output-path template").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub output_dir: String,
    pub max_retries: u32,
    pub timeout: u64,
    pub target_words_per_chapter: Option<u32>,
    pub max_words_per_chapter: Option<u32>,
    /// Whether a stage failure allows the engine to keep running independent
    /// stages in the same wave rather than stopping after it (spec §4.7,
    /// §9 Open Question 2). Defaults to `StopOnFailure` per the resolution
    /// recorded in DESIGN.md.
    pub failure_policy: FailurePolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_dir: "./output/${workflow}-${timestamp}".to_string(),
            max_retries: 1,
            timeout: 300,
            target_words_per_chapter: None,
            max_words_per_chapter: None,
            failure_policy: FailurePolicy::StopOnFailure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    StopOnFailure,
    ContinueOnFailure,
}

/// One node of the workflow DAG (spec §3 `WorkflowStage`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStage {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Ordered `role -> agentId`. The first entry is the primary agent; an
    /// entry keyed `"reviewer"` is the optional reviewer (spec §3).
    /// Represented as a `Vec` rather than a map to preserve declaration
    /// order, since "first entry is primary" is load-bearing.
    pub agents: Vec<(String, String)>,
    #[serde(default)]
    pub approval: Option<ApprovalConfig>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub retry_limit: Option<u32>,
    #[serde(default)]
    pub iteration: Option<IterationConfig>,
    /// Marks this stage itself as parallel-eligible for
    /// `ExecutionWave::has_parallel` bookkeeping (spec §3).
    #[serde(default)]
    pub parallel: bool,
}

impl WorkflowStage {
    /// The first declared agent: the primary per spec §3.
    pub fn primary_agent(&self) -> Option<&str> {
        self.agents.first().map(|(_, id)| id.as_str())
    }

    /// The agent keyed `"reviewer"`, if any.
    pub fn reviewer_agent(&self) -> Option<&str> {
        self.agents
            .iter()
            .find(|(role, _)| role == "reviewer")
            .map(|(_, id)| id.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub per_item: bool,
    /// Duration suffixed `s`/`m`/`h`, e.g. `"30s"`, `"5m"`, `"1h"`.
    #[serde(default = "default_approval_timeout")]
    pub timeout: String,
    #[serde(default)]
    pub auto_approve: bool,
}

fn default_approval_timeout() -> String {
    "5m".to_string()
}

/// Parse a duration suffixed `s`/`m`/`h` (spec §4.6 "Approval").
pub fn parse_suffixed_duration(raw: &str) -> Option<std::time::Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    let n: u64 = digits.parse().ok()?;
    match unit {
        "s" => Some(std::time::Duration::from_secs(n)),
        "m" => Some(std::time::Duration::from_secs(n * 60)),
        "h" => Some(std::time::Duration::from_secs(n * 3600)),
        _ => None,
    }
}

/// `agents{id -> {...}}` sibling document (spec §3 `AgentDefinition`, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    #[serde(default)]
    pub role: String,
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt_template: Option<String>,
    #[serde(default)]
    pub context_window: Option<u64>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Llm,
    Tool,
}

/// Provider kinds a `type: tool` agent may declare (spec §3 "tool agents
/// require a recognized provider kind").
const RECOGNIZED_TOOL_PROVIDERS: &[&str] = &["shell", "http", "filesystem"];

impl AgentDefinition {
    /// Spec §3 invariant: `type=llm` requires `promptTemplateId`; `type=tool`
    /// requires a recognized provider kind.
    pub fn validate(&self) -> Result<(), String> {
        match self.agent_type {
            AgentType::Llm if self.prompt_template.is_none() => Err(format!(
                "agent '{}': type=llm requires prompt_template",
                self.id
            )),
            AgentType::Tool if !RECOGNIZED_TOOL_PROVIDERS.contains(&self.provider.as_str()) => {
                Err(format!(
                    "agent '{}': unrecognized tool provider '{}'",
                    self.id, self.provider
                ))
            }
            _ => Ok(()),
        }
    }
}

/// `prompt_templates{id -> {...}}` sibling document (spec §3 `PromptTemplate`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptTemplate {
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub assistant: Option<String>,
}

impl PromptTemplate {
    pub fn is_valid(&self) -> bool {
        self.system.is_some() || self.user.is_some() || self.assistant.is_some()
    }
}

/// Everything the stage/workflow documents need bundled together for a run:
/// the agent catalogue and its prompt templates. Kept as a thin bag rather
/// than merged into `WorkflowDefinition`, mirroring spec §6's separate
/// `agents{}` / `prompt_templates{}` top-level documents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentCatalog {
    #[serde(default)]
    pub agents: HashMap<String, AgentDefinition>,
    #[serde(default)]
    pub prompt_templates: HashMap<String, PromptTemplate>,
}

impl AgentCatalog {
    pub fn get(&self, id: &str) -> Option<&AgentDefinition> {
        self.agents.get(id)
    }

    pub fn template_for(&self, agent: &AgentDefinition) -> Option<&PromptTemplate> {
        agent
            .prompt_template
            .as_deref()
            .and_then(|id| self.prompt_templates.get(id))
    }

    /// Validate every agent's own invariants (see [`AgentDefinition::validate`]).
    pub fn validate(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.agents.keys().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| self.agents[id].validate().err())
            .collect()
    }
}

/// Per-stage iteration configuration (spec §3 `IterationConfig`, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationConfig {
    #[serde(rename = "type")]
    pub kind: IterationKind,
    pub variable: String,
    /// `dataDriven`: dotted path into the runtime namespace.
    #[serde(default)]
    pub source: Option<String>,
    /// `countBased`: integer literal or `${...}` variable reference.
    #[serde(default)]
    pub count: Option<String>,
    #[serde(default = "default_start")]
    pub start: String,
    /// `conditional`: truthy path/expression evaluated each round.
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub update_variables: HashMap<String, String>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default)]
    pub iteration_timeout: Option<u64>,
}

fn default_start() -> String {
    "0".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

fn default_retry_count() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IterationKind {
    DataDriven,
    CountBased,
    Conditional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    #[default]
    FailFast,
    Continue,
    Retry,
}
