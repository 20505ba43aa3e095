//! Per-stage executor (spec §4.6): prompt preparation, agent invocation,
//! validation/retry loop, approval gate, and iterative-stage semantics.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::collaborators::{ApprovalDecision, ApprovalRequest, BoxedAgentInvoker, BoxedApprovalHandler};
use crate::retry::{RetryContext, RetryPolicy};
use crate::template::TemplateEngine;

use super::model::{
    parse_suffixed_duration, AgentCatalog, AgentDefinition, ApprovalConfig, ErrorStrategy,
    IterationConfig, IterationKind, WorkflowDefinition, WorkflowStage,
};
use super::result::{IterationResult, StageResult};

/// Registry of constructed agent invokers, shared across the engine
/// instance and keyed by agent id (spec §4.6 "Agent caching").
pub type AgentRegistry = HashMap<String, Arc<dyn BoxedAgentInvoker>>;

/// Outcome of a validator pass (spec GLOSSARY "Validator").
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub message: String,
}

/// Pure function `StageResult -> {valid | invalid, message}`.
pub type Validator = Arc<dyn Fn(&StageResult) -> ValidationOutcome + Send + Sync>;

/// Everything a [`StageExecutor`] needs to run one stage, bundled so the
/// call sites in the engine stay small.
pub struct StageExecutor<'a> {
    pub catalog: &'a AgentCatalog,
    pub invokers: &'a AgentRegistry,
    pub templates: &'a TemplateEngine,
    pub approval: Option<&'a Arc<dyn BoxedApprovalHandler>>,
    pub validator: Option<&'a Validator>,
}

impl<'a> StageExecutor<'a> {
    /// Execute one stage to completion, including its retry loop and (if
    /// configured) iteration and approval (spec §4.6).
    pub async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        stage: &WorkflowStage,
        inputs: &[String],
        completed: &BTreeMap<String, StageResult>,
        retry_policy: &dyn RetryPolicy,
    ) -> StageResult {
        let max_retries = stage.retry_limit.unwrap_or(workflow.settings.max_retries).max(1);

        let mut result = if let Some(iteration) = &stage.iteration {
            self.execute_iterative(workflow, stage, iteration, inputs, completed, retry_policy)
                .await
        } else {
            self.execute_simple(workflow, stage, inputs, completed, max_retries, retry_policy, None)
                .await
        };

        if result.success && stage.approval.as_ref().is_some_and(|a| a.required) {
            self.gate_approval(workflow, stage, &mut result).await;
        }

        result
    }

    /// Spec §4.6 per-stage retry loop, parameterized over an optional
    /// iteration-local scope override (used by [`Self::execute_iterative`]).
    async fn execute_simple(
        &self,
        workflow: &WorkflowDefinition,
        stage: &WorkflowStage,
        inputs: &[String],
        completed: &BTreeMap<String, StageResult>,
        max_retries: u32,
        retry_policy: &dyn RetryPolicy,
        extra_scope: Option<&Value>,
    ) -> StageResult {
        let Some(agent_id) = stage.primary_agent() else {
            return fail_result(stage, "stage declares no agent".to_string());
        };
        let Some(agent) = self.catalog.get(agent_id) else {
            return fail_result(stage, format!("unknown agent '{agent_id}'"));
        };
        let Some(invoker) = self.invokers.get(agent_id) else {
            return fail_result(stage, format!("no invoker registered for agent '{agent_id}'"));
        };

        let retry_ctx = RetryContext::new();
        let mut last_warning: Option<String> = None;

        for attempt in 1..=max_retries {
            let scope = build_scope(workflow, stage, inputs, completed, extra_scope);
            let prompt = prepare_prompt(agent, self.catalog, self.templates, &scope);
            let started = Instant::now();

            let response = invoker.invoke_boxed(&prompt, &json!({"attempt": attempt})).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            if !response.ok {
                let message = response
                    .error_kind
                    .unwrap_or_else(|| "agent invocation failed".to_string());
                retry_ctx.record_failure(message.clone());
                if attempt == max_retries || !retry_policy.is_retryable(&message) {
                    return fail_result(
                        stage,
                        format!("stage '{}' failed after {attempt} attempts: {message}", stage.name),
                    );
                }
                tokio::time::sleep(retry_policy.retry_delay(&retry_ctx)).await;
                continue;
            }

            retry_ctx.record_success();
            let review_output = self.invoke_reviewer(stage, &response.output).await;

            let mut stage_result = StageResult {
                stage_name: stage.name.clone(),
                output: response.output,
                success: true,
                error: last_warning.take(),
                attempt,
                execution_time_ms: elapsed_ms,
                agent_used: agent_id.to_string(),
                review_output,
                approval_granted: None,
                iterations: None,
                cancelled: false,
                timed_out: false,
            };

            if let Some(validator) = self.validator {
                let outcome = validator(&stage_result);
                if !outcome.valid {
                    if attempt < max_retries {
                        debug!(stage = %stage.name, attempt, message = %outcome.message, "validator rejected output, retrying");
                        last_warning = Some(outcome.message);
                        continue;
                    }
                    // Final attempt: accept with a warning rather than fail
                    // the stage (spec §4.6, preserved per DESIGN.md Open
                    // Question 1).
                    warn!(stage = %stage.name, message = %outcome.message, "accepting output despite validator rejection on final attempt");
                    stage_result.error = Some(format!("accepted with warning: {}", outcome.message));
                }
            }

            return stage_result;
        }

        fail_result(stage, format!("stage '{}' failed after {max_retries} attempts", stage.name))
    }

    async fn invoke_reviewer(&self, stage: &WorkflowStage, primary_output: &str) -> Option<String> {
        let reviewer_id = stage.reviewer_agent()?;
        let invoker = self.invokers.get(reviewer_id)?;
        let prompt = format!(
            "Review the following output for stage '{}':\n\n{primary_output}",
            stage.name
        );
        let response = invoker.invoke_boxed(&prompt, &json!({})).await;
        if response.ok {
            Some(response.output)
        } else {
            warn!(stage = %stage.name, reviewer = reviewer_id, "reviewer invocation failed");
            None
        }
    }

    async fn gate_approval(&self, workflow: &WorkflowDefinition, stage: &WorkflowStage, result: &mut StageResult) {
        let approval = stage.approval.as_ref().expect("checked by caller");
        if approval.auto_approve {
            result.approval_granted = Some(true);
            return;
        }
        let Some(handler) = self.approval else {
            result.approval_granted = Some(true);
            return;
        };

        let timeout = parse_suffixed_duration(&approval.timeout).unwrap_or(Duration::from_secs(300));

        let request = ApprovalRequest {
            workflow_name: workflow.name.clone(),
            stage_name: stage.name.clone(),
            description: stage.description.clone(),
            agent_output: result.output.clone(),
            review_output: result.review_output.clone(),
        };

        match handler.request_approval_boxed(&request, timeout).await {
            ApprovalDecision::Approved => {
                result.approval_granted = Some(true);
            }
            ApprovalDecision::Rejected { feedback } => {
                result.approval_granted = Some(false);
                result.success = false;
                result.error = Some(match feedback {
                    Some(f) => format!("rejected by reviewer: {f}"),
                    None => "rejected by reviewer".to_string(),
                });
            }
            ApprovalDecision::TimedOut => {
                result.approval_granted = Some(false);
                result.success = false;
                result.error = Some("approval timed out".to_string());
            }
        }
    }

    async fn execute_iterative(
        &self,
        workflow: &WorkflowDefinition,
        stage: &WorkflowStage,
        iteration: &IterationConfig,
        inputs: &[String],
        completed: &BTreeMap<String, StageResult>,
        retry_policy: &dyn RetryPolicy,
    ) -> StageResult {
        if iteration.kind == IterationKind::Conditional {
            return self
                .execute_conditional(workflow, stage, iteration, inputs, completed, retry_policy)
                .await;
        }

        let items = match resolve_iteration_items(iteration, completed, workflow) {
            Ok(items) => items,
            Err(message) => return fail_result(stage, message),
        };

        let max_retries = stage.retry_limit.unwrap_or(workflow.settings.max_retries).max(1);
        let per_item_timeout = iteration.iteration_timeout.map(Duration::from_secs);
        let run_one = |index: usize, item: Value| {
            let bound = json!({ iteration.variable.clone(): item.clone() });
            async move {
                let started = Instant::now();
                let attempts = if iteration.error_strategy == ErrorStrategy::Retry {
                    iteration.retry_count.max(1)
                } else {
                    max_retries
                };
                let body = self.execute_simple(workflow, stage, inputs, completed, attempts, retry_policy, Some(&bound));
                let result = match per_item_timeout {
                    Some(timeout) => match tokio::time::timeout(timeout, body).await {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(stage = %stage.name, index, timeout_secs = timeout.as_secs(), "iteration timed out");
                            fail_result(stage, format!("iteration {index} timed out after {}s", timeout.as_secs()))
                        }
                    },
                    None => body.await,
                };
                IterationResult {
                    index,
                    item,
                    output: result.output,
                    success: result.success,
                    error: result.error,
                    execution_time_ms: started.elapsed().as_millis() as u64,
                }
            }
        };

        let can_parallelize = iteration.parallel
            && !stage.approval.as_ref().is_some_and(|a| a.per_item);

        let mut iteration_results: Vec<IterationResult> = Vec::with_capacity(items.len());

        if can_parallelize {
            let mut remaining: Vec<(usize, Value)> = items.into_iter().enumerate().collect();
            'batches: while !remaining.is_empty() {
                let batch: Vec<_> = remaining.drain(..remaining.len().min(iteration.max_concurrent)).collect();
                let futures = batch.into_iter().map(|(index, item)| run_one(index, item));
                let batch_results = futures::future::join_all(futures).await;
                for res in batch_results {
                    let should_abort = !res.success && iteration.error_strategy == ErrorStrategy::FailFast;
                    iteration_results.push(res);
                    if should_abort {
                        remaining.clear();
                        break 'batches;
                    }
                }
            }
        } else {
            for (index, item) in items.into_iter().enumerate() {
                let res = run_one(index, item).await;
                let abort = !res.success && iteration.error_strategy == ErrorStrategy::FailFast;
                iteration_results.push(res);
                if abort {
                    break;
                }
            }
        }

        iteration_results.sort_by_key(|r| r.index);
        aggregate_iteration_results(stage, iteration, iteration_results)
    }

    /// `conditional` iteration (spec §4.6): loop while `condition` resolves
    /// truthy and the round count is below `maxIterations`; after each body,
    /// apply `updateVariables` (each value a substitution template
    /// evaluated against the accumulated scope) before re-checking the
    /// condition. Always sequential — conditions depend on state mutated
    /// round to round, so there is nothing to parallelize.
    #[allow(clippy::too_many_arguments)]
    async fn execute_conditional(
        &self,
        workflow: &WorkflowDefinition,
        stage: &WorkflowStage,
        iteration: &IterationConfig,
        inputs: &[String],
        completed: &BTreeMap<String, StageResult>,
        retry_policy: &dyn RetryPolicy,
    ) -> StageResult {
        let Some(max_iterations) = iteration.max_iterations.filter(|&m| m >= 1) else {
            return fail_result(stage, "conditional iteration requires maxIterations >= 1".to_string());
        };
        let Some(condition_path) = iteration.condition.as_deref() else {
            return fail_result(stage, "conditional iteration requires a condition".to_string());
        };

        let max_retries = stage.retry_limit.unwrap_or(workflow.settings.max_retries).max(1);
        let mut updates = Map::new();
        let mut iteration_results = Vec::new();
        let mut index: u32 = 0;

        loop {
            let scope = conditional_scope(completed, workflow, &updates);
            let condition_true = crate::vars::resolve_dotted(&scope, condition_path)
                .map(crate::template::truthy)
                .unwrap_or(false);
            if !condition_true || index >= max_iterations {
                break;
            }

            let mut extra = scope.clone();
            if let Value::Object(map) = &mut extra {
                map.insert(iteration.variable.clone(), json!(index));
            }

            let started = Instant::now();
            let result = self
                .execute_simple(workflow, stage, inputs, completed, max_retries, retry_policy, Some(&extra))
                .await;
            let failed = !result.success;
            iteration_results.push(IterationResult {
                index: index as usize,
                item: json!(index),
                output: result.output,
                success: result.success,
                error: result.error,
                execution_time_ms: started.elapsed().as_millis() as u64,
            });

            for (key, template) in &iteration.update_variables {
                let round_scope = conditional_scope(completed, workflow, &updates);
                let mut ns = crate::vars::Namespace::new();
                ns.push_layer(round_scope);
                let rendered = crate::vars::substitute(template, &ns);
                updates.insert(key.clone(), Value::String(rendered));
            }

            index += 1;
            if failed && iteration.error_strategy == ErrorStrategy::FailFast {
                break;
            }
        }

        aggregate_iteration_results(stage, iteration, iteration_results)
    }
}

/// Scope used to evaluate a conditional iteration's `condition` and
/// `updateVariables` templates: the runtime namespace (workflow variables +
/// completed stage outputs) with the accumulated `updateVariables` results
/// from prior rounds layered on top.
fn conditional_scope(
    completed: &BTreeMap<String, StageResult>,
    workflow: &WorkflowDefinition,
    updates: &Map<String, Value>,
) -> Value {
    let mut scope = namespace_as_value(completed, workflow);
    if let Value::Object(map) = &mut scope {
        for (k, v) in updates {
            map.insert(k.clone(), v.clone());
        }
    }
    scope
}

/// Aggregate per-iteration results into one `StageResult` (spec §4.6:
/// "concatenate per-iteration outputs in index order"), shared by both the
/// data-driven/count-based batch path and the conditional loop.
fn aggregate_iteration_results(
    stage: &WorkflowStage,
    iteration: &IterationConfig,
    iteration_results: Vec<IterationResult>,
) -> StageResult {
    let success = iteration_results.iter().all(|r| r.success)
        || iteration.error_strategy == ErrorStrategy::Continue;
    let output = iteration_results
        .iter()
        .map(|r| r.output.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let total_time = iteration_results.iter().map(|r| r.execution_time_ms).sum();
    let agent_used = stage.primary_agent().unwrap_or_default().to_string();

    StageResult {
        stage_name: stage.name.clone(),
        output,
        success,
        error: if success {
            None
        } else {
            Some(format!(
                "{} iteration(s) failed",
                iteration_results.iter().filter(|r| !r.success).count()
            ))
        },
        attempt: 1,
        execution_time_ms: total_time,
        agent_used,
        review_output: None,
        approval_granted: None,
        iterations: Some(iteration_results),
        cancelled: false,
        timed_out: false,
    }
}

fn fail_result(stage: &WorkflowStage, message: String) -> StageResult {
    StageResult {
        stage_name: stage.name.clone(),
        output: String::new(),
        success: false,
        error: Some(message),
        attempt: 1,
        execution_time_ms: 0,
        agent_used: stage.primary_agent().unwrap_or_default().to_string(),
        review_output: None,
        approval_granted: None,
        iterations: None,
        cancelled: false,
        timed_out: false,
    }
}

/// Resolve the fixed item list for the two non-conditional iteration kinds.
/// `conditional` iteration has no static item list — it is handled entirely
/// by `execute_conditional`, which re-evaluates its stopping condition each
/// round instead of resolving items up front.
fn resolve_iteration_items(
    iteration: &IterationConfig,
    completed: &BTreeMap<String, StageResult>,
    workflow: &WorkflowDefinition,
) -> Result<Vec<Value>, String> {
    match iteration.kind {
        IterationKind::DataDriven => {
            let source = iteration
                .source
                .as_deref()
                .ok_or_else(|| "dataDriven iteration requires a source".to_string())?;
            let namespace_value = namespace_as_value(completed, workflow);
            match crate::vars::resolve_dotted(&namespace_value, source) {
                Some(Value::Array(items)) => Ok(items.clone()),
                Some(scalar) => Ok(vec![scalar.clone()]),
                None => Ok(Vec::new()),
            }
        }
        IterationKind::CountBased => {
            let start: i64 = iteration.start.parse().unwrap_or(0);
            let count: i64 = iteration
                .count
                .as_deref()
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| "countBased iteration requires a numeric count".to_string())?;
            Ok((start..start + count).map(|n| json!(n)).collect())
        }
        IterationKind::Conditional => {
            unreachable!("execute_iterative dispatches Conditional to execute_conditional")
        }
    }
}

fn namespace_as_value(completed: &BTreeMap<String, StageResult>, workflow: &WorkflowDefinition) -> Value {
    let mut map = Map::new();
    map.insert("variables".to_string(), Value::Object(workflow.variables.clone()));
    for (name, result) in completed {
        map.insert(
            name.clone(),
            json!({"output": result.output, "review": result.review_output}),
        );
    }
    Value::Object(map)
}

/// Build the flat scope used for `{{...}}` template rendering (spec §4.6
/// "Prompt preparation"): workflow variables, positional inputs bound by
/// convention (`inputs[0] -> topic`, `inputs[1] -> author`, ...), a
/// `settings` snapshot, and the runtime namespace of completed stages.
/// `extra_scope` layers iteration-local bindings on top, taking priority.
fn build_scope(
    workflow: &WorkflowDefinition,
    stage: &WorkflowStage,
    inputs: &[String],
    completed: &BTreeMap<String, StageResult>,
    extra_scope: Option<&Value>,
) -> Value {
    let mut map = Map::new();

    map.insert(
        "settings".to_string(),
        serde_json::to_value(&workflow.settings).unwrap_or(Value::Null),
    );

    for (k, v) in &workflow.variables {
        map.insert(k.clone(), v.clone());
    }

    for (i, value) in inputs.iter().enumerate() {
        let key = match i {
            0 => "topic".to_string(),
            1 => "author".to_string(),
            n => format!("input{n}"),
        };
        map.insert(key, Value::String(value.clone()));
    }

    for (name, result) in completed {
        map.insert(
            name.clone(),
            json!({"output": result.output, "review": result.review_output}),
        );
    }

    if stage.name.contains("final-review") || stage.name.contains("book-review") {
        map.insert("content_to_review".to_string(), Value::String(synthesize_review_content(completed)));
    }

    if let Some(Value::Object(extra)) = extra_scope {
        for (k, v) in extra {
            map.insert(k.clone(), v.clone());
        }
    }

    Value::Object(map)
}

/// Canonical order for the synthesized review content (spec §4.6): title,
/// then toc, then every stage whose name starts with `chapter-` (sorted by
/// name, since `completed` is a `BTreeMap`).
fn synthesize_review_content(completed: &BTreeMap<String, StageResult>) -> String {
    let mut parts = Vec::new();
    if let Some(title) = completed.get("title") {
        parts.push(title.output.clone());
    }
    if let Some(toc) = completed.get("toc") {
        parts.push(toc.output.clone());
    }
    for (name, result) in completed {
        if name.starts_with("chapter-") {
            parts.push(result.output.clone());
        }
    }
    parts.join("\n\n")
}

/// Render an agent's prompt template (system/user/assistant) against the
/// scope and concatenate the non-empty sections. Tool agents (no prompt
/// template) get a plain JSON rendering of their parameters.
fn prepare_prompt(agent: &AgentDefinition, catalog: &AgentCatalog, templates: &TemplateEngine, scope: &Value) -> String {
    let Some(template) = catalog.template_for(agent) else {
        return serde_json::to_string(&agent.parameters).unwrap_or_default();
    };

    let mut sections = Vec::new();
    if let Some(system) = &template.system {
        if let Ok(rendered) = templates.render_string(system, scope) {
            if !rendered.is_empty() {
                sections.push(format!("[system]\n{rendered}"));
            }
        }
    }
    if let Some(user) = &template.user {
        if let Ok(rendered) = templates.render_string(user, scope) {
            if !rendered.is_empty() {
                sections.push(format!("[user]\n{rendered}"));
            }
        }
    }
    if let Some(assistant) = &template.assistant {
        if let Ok(rendered) = templates.render_string(assistant, scope) {
            if !rendered.is_empty() {
                sections.push(format!("[assistant]\n{rendered}"));
            }
        }
    }
    sections.join("\n\n")
}
