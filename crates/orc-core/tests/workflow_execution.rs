use std::collections::HashMap;
use std::sync::Arc;

use orc_core::collaborators::{AutoApprover, SimulatedInvoker};
use orc_core::config::OrchestratorConfig;
use orc_core::workflow::{
    AgentCatalog, AgentDefinition, AgentType, ApprovalConfig, FailurePolicy, PromptTemplate,
    Settings, WorkflowDefinition, WorkflowEngine, WorkflowStage,
};

fn catalog(agents: &[&str]) -> AgentCatalog {
    let mut catalog = AgentCatalog::default();
    for id in agents {
        catalog.agents.insert(
            id.to_string(),
            AgentDefinition {
                id: id.to_string(),
                agent_type: AgentType::Llm,
                role: "writer".to_string(),
                provider: "anthropic".to_string(),
                model: None,
                prompt_template: Some("tpl".to_string()),
                context_window: None,
                parameters: Default::default(),
            },
        );
    }
    catalog.prompt_templates.insert(
        "tpl".to_string(),
        PromptTemplate {
            system: None,
            user: Some("Write about {{topic}}".to_string()),
            assistant: None,
        },
    );
    catalog
}

fn stage(name: &str, deps: &[&str], agent: &str) -> WorkflowStage {
    WorkflowStage {
        name: name.to_string(),
        description: String::new(),
        depends_on: deps.iter().map(|s| s.to_string()).collect(),
        agents: vec![("writer".to_string(), agent.to_string())],
        approval: None,
        outputs: vec![],
        retry_limit: Some(2),
        iteration: None,
        parallel: false,
    }
}

fn workflow(name: &str, stages: Vec<WorkflowStage>) -> WorkflowDefinition {
    WorkflowDefinition {
        name: name.to_string(),
        description: String::new(),
        version: "1".to_string(),
        settings: Settings::default(),
        variables: Default::default(),
        stages,
    }
}

#[tokio::test]
async fn linear_chain_runs_every_stage_in_dependency_order() {
    let catalog = catalog(&["writer-a"]);
    let mut invokers: HashMap<String, Arc<dyn orc_core::collaborators::BoxedAgentInvoker>> = HashMap::new();
    invokers.insert("writer-a".to_string(), Arc::new(SimulatedInvoker::new("a")));

    let engine = WorkflowEngine::new(OrchestratorConfig::default(), catalog, invokers, None, None);
    let wf = workflow(
        "linear",
        vec![
            stage("outline", &[], "writer-a"),
            stage("draft", &["outline"], "writer-a"),
            stage("final-review", &["draft"], "writer-a"),
        ],
    );

    let result = engine.run(&wf, &["rust".to_string()]).await;
    assert!(result.success);
    assert_eq!(result.stage_results.len(), 3);
    for name in ["outline", "draft", "final-review"] {
        assert!(result.stage_results[name].success, "stage {name} should succeed");
    }
}

#[tokio::test]
async fn diamond_shape_runs_middle_stages_in_the_same_wave() {
    let catalog = catalog(&["writer-a"]);
    let mut invokers: HashMap<String, Arc<dyn orc_core::collaborators::BoxedAgentInvoker>> = HashMap::new();
    invokers.insert("writer-a".to_string(), Arc::new(SimulatedInvoker::new("a")));

    let engine = WorkflowEngine::new(OrchestratorConfig::default(), catalog, invokers, None, None);
    let wf = workflow(
        "diamond",
        vec![
            stage("outline", &[], "writer-a"),
            stage("chapter-1", &["outline"], "writer-a"),
            stage("chapter-2", &["outline"], "writer-a"),
            stage("book-review", &["chapter-1", "chapter-2"], "writer-a"),
        ],
    );

    let result = engine.run(&wf, &[]).await;
    assert!(result.success);
    assert_eq!(result.stage_results.len(), 4);
}

#[tokio::test]
async fn retry_then_succeed_eventually_reports_success() {
    let catalog = catalog(&["flaky"]);
    let mut invokers: HashMap<String, Arc<dyn orc_core::collaborators::BoxedAgentInvoker>> = HashMap::new();
    invokers.insert(
        "flaky".to_string(),
        Arc::new(SimulatedInvoker::failing_then_succeeding(
            "ok",
            2,
            "connection reset",
        )),
    );

    let engine = WorkflowEngine::new(OrchestratorConfig::default(), catalog, invokers, None, None);
    let mut retry_stage = stage("draft", &[], "flaky");
    retry_stage.retry_limit = Some(3);
    let wf = workflow("retryable", vec![retry_stage]);

    let result = engine.run(&wf, &[]).await;
    assert!(result.success);
    assert_eq!(result.stage_results["draft"].output, "OUT-ok");
}

#[tokio::test]
async fn retry_exhaustion_fails_the_stage_and_workflow() {
    let catalog = catalog(&["always-broken"]);
    let mut invokers: HashMap<String, Arc<dyn orc_core::collaborators::BoxedAgentInvoker>> = HashMap::new();
    invokers.insert(
        "always-broken".to_string(),
        Arc::new(SimulatedInvoker::failing_then_succeeding(
            "never",
            99,
            "connection reset",
        )),
    );

    let engine = WorkflowEngine::new(OrchestratorConfig::default(), catalog, invokers, None, None);
    let mut retry_stage = stage("draft", &[], "always-broken");
    retry_stage.retry_limit = Some(2);
    let wf = workflow("exhausted", vec![retry_stage]);

    let result = engine.run(&wf, &[]).await;
    assert!(!result.success);
    assert!(!result.stage_results["draft"].success);
    assert!(result.error.unwrap().contains("draft"));
}

#[tokio::test]
async fn cycle_in_stage_graph_fails_before_any_execution() {
    let catalog = catalog(&["writer-a"]);
    let invokers: HashMap<String, Arc<dyn orc_core::collaborators::BoxedAgentInvoker>> = HashMap::new();

    let engine = WorkflowEngine::new(OrchestratorConfig::default(), catalog, invokers, None, None);
    let wf = workflow(
        "cyclic",
        vec![stage("a", &["b"], "writer-a"), stage("b", &["a"], "writer-a")],
    );

    let result = engine.run(&wf, &[]).await;
    assert!(!result.success);
    assert!(result.stage_results.is_empty());
    assert!(result.error.unwrap().contains("circular dependency"));
}

#[tokio::test]
async fn continue_on_failure_lets_independent_stages_finish() {
    let catalog = catalog(&["writer-a", "always-broken"]);
    let mut invokers: HashMap<String, Arc<dyn orc_core::collaborators::BoxedAgentInvoker>> = HashMap::new();
    invokers.insert("writer-a".to_string(), Arc::new(SimulatedInvoker::new("a")));
    invokers.insert(
        "always-broken".to_string(),
        Arc::new(SimulatedInvoker::failing_then_succeeding(
            "never",
            99,
            "connection reset",
        )),
    );

    let engine = WorkflowEngine::new(OrchestratorConfig::default(), catalog, invokers, None, None);
    let mut settings = Settings::default();
    settings.failure_policy = FailurePolicy::ContinueOnFailure;
    let mut broken_stage = stage("broken", &[], "always-broken");
    broken_stage.retry_limit = Some(1);
    let wf = WorkflowDefinition {
        name: "partial".to_string(),
        description: String::new(),
        version: "1".to_string(),
        settings,
        variables: Default::default(),
        stages: vec![broken_stage, stage("independent", &[], "writer-a")],
    };

    let result = engine.run(&wf, &[]).await;
    assert!(!result.success);
    assert!(!result.stage_results["broken"].success);
    assert!(result.stage_results["independent"].success);
}

#[tokio::test]
async fn required_approval_gate_can_reject_a_successful_stage() {
    let catalog = catalog(&["writer-a"]);
    let mut invokers: HashMap<String, Arc<dyn orc_core::collaborators::BoxedAgentInvoker>> = HashMap::new();
    invokers.insert("writer-a".to_string(), Arc::new(SimulatedInvoker::new("a")));

    let engine = WorkflowEngine::new(
        OrchestratorConfig::default(),
        catalog,
        invokers,
        Some(Arc::new(AutoApprover)),
        None,
    );
    let mut gated = stage("draft", &[], "writer-a");
    gated.approval = Some(ApprovalConfig {
        required: true,
        per_item: false,
        timeout: "30s".to_string(),
        auto_approve: false,
    });
    let wf = workflow("gated", vec![gated]);

    let result = engine.run(&wf, &[]).await;
    assert!(result.success);
    assert_eq!(result.stage_results["draft"].approval_granted, Some(true));
}
