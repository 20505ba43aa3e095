//! Workflow engine: loads a definition, builds its execution plan, and
//! drives wave-by-wave execution, publishing each wave's stage results into
//! the runtime namespace before the next wave starts.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use crate::collaborators::BoxedApprovalHandler;
use crate::config::{OrchestratorConfig, RetryKind};
use crate::error::OrcError;
use crate::retry::{ExponentialBackoff, FixedDelay, NoRetry, RetryPolicy};
use crate::template::TemplateEngine;

use super::model::{AgentCatalog, FailurePolicy, WorkflowDefinition, WorkflowStage};
use super::parallel::{execute_wave, ParallelConfig, StageTask};
use super::plan::ExecutionPlan;
use super::result::{StageResult, WorkflowResult};
use super::stage::{AgentRegistry, StageExecutor, Validator};

/// Drives workflow runs against a shared agent registry and engine
/// configuration.
pub struct WorkflowEngine {
    config: OrchestratorConfig,
    templates: Arc<TemplateEngine>,
    catalog: Arc<AgentCatalog>,
    invokers: Arc<AgentRegistry>,
    approval: Option<Arc<dyn BoxedApprovalHandler>>,
    validator: Option<Validator>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    active_runs: AtomicU32,
    drained: Notify,
    closed: AtomicBool,
}

impl WorkflowEngine {
    pub fn new(
        config: OrchestratorConfig,
        catalog: AgentCatalog,
        invokers: AgentRegistry,
        approval: Option<Arc<dyn BoxedApprovalHandler>>,
        validator: Option<Validator>,
    ) -> Self {
        let templates = Arc::new(TemplateEngine::new(config.template.max_entries));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            config,
            templates,
            catalog: Arc::new(catalog),
            invokers: Arc::new(invokers),
            approval,
            validator,
            cancel_tx,
            cancel_rx,
            active_runs: AtomicU32::new(0),
            drained: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether the engine still accepts new runs.
    pub fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Execute a workflow definition to completion: build the execution
    /// plan, run each wave through the bounded parallel executor, publish
    /// completed stage results to the namespace shared by later waves, and
    /// apply the workflow's failure policy between waves.
    pub async fn run(&self, workflow: &WorkflowDefinition, inputs: &[String]) -> WorkflowResult {
        let start_time = Utc::now();

        if !self.is_ready() {
            return WorkflowResult {
                workflow_name: workflow.name.clone(),
                start_time,
                end_time: Utc::now(),
                success: false,
                error: Some(OrcError::EngineClosed.to_string()),
                stage_results: BTreeMap::new(),
            };
        }

        self.active_runs.fetch_add(1, Ordering::SeqCst);
        let result = self.run_inner(workflow, inputs, start_time).await;
        if self.active_runs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
        result
    }

    async fn run_inner(
        &self,
        workflow: &WorkflowDefinition,
        inputs: &[String],
        start_time: chrono::DateTime<Utc>,
    ) -> WorkflowResult {
        let structural_errors = workflow.validate();
        if !structural_errors.is_empty() {
            return WorkflowResult {
                workflow_name: workflow.name.clone(),
                start_time,
                end_time: Utc::now(),
                success: false,
                error: Some(structural_errors.join("; ")),
                stage_results: BTreeMap::new(),
            };
        }

        let plan = match ExecutionPlan::build(&workflow.stages) {
            Ok(plan) => plan,
            Err(err) => {
                return WorkflowResult {
                    workflow_name: workflow.name.clone(),
                    start_time,
                    end_time: Utc::now(),
                    success: false,
                    error: Some(err.to_string()),
                    stage_results: BTreeMap::new(),
                }
            }
        };

        let output_dir = crate::vars::resolve_output_dir(&workflow.settings.output_dir, &workflow.name, start_time);

        info!(
            workflow = %workflow.name,
            waves = plan.wave_count(),
            max_parallelism = plan.max_parallelism(),
            output_dir = %output_dir,
            "starting workflow run"
        );

        let parallel_config = ParallelConfig::new(
            self.config.execution.max_parallelism,
            Duration::from_secs(self.config.execution.default_timeout_seconds),
        );

        let mut completed: BTreeMap<String, StageResult> = BTreeMap::new();
        let mut failure: Option<String> = None;

        for wave in plan.waves() {
            if *self.cancel_rx.borrow() {
                failure = Some(OrcError::Interrupted.to_string());
                break;
            }

            let task = self.build_stage_task(workflow, inputs, &completed);
            let default_timeout = Duration::from_secs(workflow.settings.timeout);
            let stop_on_failure = workflow.settings.failure_policy == FailurePolicy::StopOnFailure;

            // A timeout is unconditionally wave-fatal (spec §4.5); an
            // ordinary stage failure only cancels siblings when the
            // workflow's failure policy would stop the run anyway. Under
            // `ContinueOnFailure` independent siblings are left to finish.
            let wave_results = execute_wave(
                &parallel_config,
                &wave.stage_names,
                |_name| default_timeout,
                task,
                move |r| r.timed_out || (!r.success && stop_on_failure),
            )
            .await;

            let wave_failed = wave_results.values().any(|r| !r.success);
            for (name, result) in wave_results {
                if !result.success {
                    failure.get_or_insert_with(|| {
                        WorkflowResult::failure_summary(
                            &name,
                            result.error.as_deref().unwrap_or("unknown error"),
                        )
                    });
                }
                completed.insert(name, result);
            }

            if wave_failed && workflow.settings.failure_policy == FailurePolicy::StopOnFailure {
                break;
            }
        }

        let success = failure.is_none();
        if !success {
            warn!(workflow = %workflow.name, error = ?failure, "workflow run ended with failure");
        }

        WorkflowResult {
            workflow_name: workflow.name.clone(),
            start_time,
            end_time: Utc::now(),
            success,
            error: failure,
            stage_results: completed,
        }
    }

    fn build_stage_task(
        &self,
        workflow: &WorkflowDefinition,
        inputs: &[String],
        completed: &BTreeMap<String, StageResult>,
    ) -> StageTask {
        let workflow = workflow.clone();
        let inputs = inputs.to_vec();
        let completed = completed.clone();
        let catalog = self.catalog.clone();
        let invokers = self.invokers.clone();
        let templates = self.templates.clone();
        let approval = self.approval.clone();
        let validator = self.validator.clone();
        let retry_config = self.config.clone();

        Arc::new(move |stage_name: String| {
            let workflow = workflow.clone();
            let inputs = inputs.clone();
            let completed = completed.clone();
            let catalog = catalog.clone();
            let invokers = invokers.clone();
            let templates = templates.clone();
            let approval = approval.clone();
            let validator = validator.clone();
            let retry_policy = build_retry_policy(&retry_config);

            Box::pin(async move {
                let Some(stage) = find_stage(&workflow, &stage_name) else {
                    return missing_stage_result(&stage_name);
                };

                let executor = StageExecutor {
                    catalog: &catalog,
                    invokers: &invokers,
                    templates: &templates,
                    approval: approval.as_ref(),
                    validator: validator.as_ref(),
                };

                executor
                    .execute(&workflow, stage, &inputs, &completed, retry_policy.as_ref())
                    .await
            })
        })
    }

    /// Begin a graceful shutdown: stop accepting new runs immediately, then
    /// wait up to `shutdown_grace_seconds` for in-flight runs to finish
    /// naturally before signalling cooperative cancellation and waiting up
    /// to `shutdown_force_seconds` more.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        if self.active_runs.load(Ordering::SeqCst) == 0 {
            return;
        }

        let grace = Duration::from_secs(self.config.execution.shutdown_grace_seconds);
        if tokio::time::timeout(grace, self.drained.notified()).await.is_ok() {
            return;
        }

        warn!("shutdown grace period elapsed, signalling cancellation to in-flight stages");
        let _ = self.cancel_tx.send(true);

        let force = Duration::from_secs(self.config.execution.shutdown_force_seconds);
        if tokio::time::timeout(force, self.drained.notified()).await.is_err() {
            warn!("forced shutdown window elapsed with runs still active");
        }
    }
}

fn find_stage<'a>(workflow: &'a WorkflowDefinition, name: &str) -> Option<&'a WorkflowStage> {
    workflow.stages.iter().find(|s| s.name == name)
}

fn missing_stage_result(stage_name: &str) -> StageResult {
    StageResult {
        stage_name: stage_name.to_string(),
        output: String::new(),
        success: false,
        error: Some(format!("unknown stage '{stage_name}'")),
        attempt: 0,
        execution_time_ms: 0,
        agent_used: String::new(),
        review_output: None,
        approval_granted: None,
        iterations: None,
        cancelled: false,
        timed_out: false,
    }
}

fn build_retry_policy(config: &OrchestratorConfig) -> Box<dyn RetryPolicy> {
    let r = &config.retry;
    match r.kind {
        RetryKind::NoRetry => Box::new(NoRetry),
        RetryKind::FixedDelay => Box::new(FixedDelay::new(
            config.execution.default_retry_limit.max(1),
            Duration::from_millis(r.initial_delay_ms),
            Duration::from_millis(r.max_duration_ms),
        )),
        RetryKind::ExponentialBackoff => Box::new(ExponentialBackoff::new(
            Duration::from_millis(r.initial_delay_ms),
            Duration::from_millis(r.max_delay_ms),
            r.multiplier,
            Duration::from_millis(r.max_duration_ms),
            r.jitter_enabled,
            r.jitter_factor,
        )),
    }
}
