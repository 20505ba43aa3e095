//! External collaborators the kernel consumes but does not implement:
//! the LLM-backed `AgentInvoker` and the human-in-the-loop `ApprovalHandler`.
//! Both are expressed as `Send + Sync` traits returning `impl Future`, so the
//! workflow engine stays generic over its collaborators rather than reaching
//! for a boxed trait object.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::Value;

/// Result of one agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    pub ok: bool,
    pub output: String,
    pub error_kind: Option<String>,
}

impl AgentResponse {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            ok: true,
            output: output.into(),
            error_kind: None,
        }
    }

    pub fn failure(error_kind: impl Into<String>) -> Self {
        Self {
            ok: false,
            output: String::new(),
            error_kind: Some(error_kind.into()),
        }
    }
}

/// Consumes a rendered prompt and returns an output with a success flag.
/// Implementations must honor cancellation by returning within a bounded
/// time after signaled, and must be safe for concurrent invocation.
pub trait AgentInvoker: Send + Sync {
    fn invoke(
        &self,
        prompt: &str,
        metadata: &Value,
    ) -> impl Future<Output = AgentResponse> + Send;
}

/// Object-safe adapter over [`AgentInvoker`]: the workflow engine keeps a
/// registry of differently-typed invokers keyed by agent id, which needs
/// `dyn`-compatibility that `impl Future` return types don't allow.
/// Blanket-implemented for every `AgentInvoker`.
pub trait BoxedAgentInvoker: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        prompt: &'a str,
        metadata: &'a Value,
    ) -> Pin<Box<dyn Future<Output = AgentResponse> + Send + 'a>>;
}

impl<T: AgentInvoker> BoxedAgentInvoker for T {
    fn invoke_boxed<'a>(
        &'a self,
        prompt: &'a str,
        metadata: &'a Value,
    ) -> Pin<Box<dyn Future<Output = AgentResponse> + Send + 'a>> {
        Box::pin(self.invoke(prompt, metadata))
    }
}

/// One pending human (or automated) approval gate.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRequest {
    pub workflow_name: String,
    pub stage_name: String,
    pub description: String,
    pub agent_output: String,
    pub review_output: Option<String>,
}

/// Outcome of an approval gate.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalDecision {
    Approved,
    Rejected { feedback: Option<String> },
    TimedOut,
}

/// External collaborator that gates a stage's success on a human (or
/// automated) decision. May be interactive or automated; `close` releases
/// any held I/O resources.
pub trait ApprovalHandler: Send + Sync {
    fn request_approval(
        &self,
        request: &ApprovalRequest,
        timeout: Duration,
    ) -> impl Future<Output = ApprovalDecision> + Send;

    fn close(&self);
}

/// Object-safe adapter over [`ApprovalHandler`], mirroring
/// [`BoxedAgentInvoker`].
pub trait BoxedApprovalHandler: Send + Sync {
    fn request_approval_boxed<'a>(
        &'a self,
        request: &'a ApprovalRequest,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = ApprovalDecision> + Send + 'a>>;

    fn close(&self);
}

impl<T: ApprovalHandler> BoxedApprovalHandler for T {
    fn request_approval_boxed<'a>(
        &'a self,
        request: &'a ApprovalRequest,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = ApprovalDecision> + Send + 'a>> {
        Box::pin(self.request_approval(request, timeout))
    }

    fn close(&self) {
        ApprovalHandler::close(self)
    }
}

/// Deterministic `AgentInvoker` test double: echoes `"OUT-<label>"` where
/// `label` is supplied at construction, unless a failure schedule is set
/// (fails the first `fail_times` invocations with the given message, then
/// succeeds).
pub struct SimulatedInvoker {
    label: String,
    fail_times: u32,
    failure_message: String,
    attempts: AtomicU32,
}

impl SimulatedInvoker {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            fail_times: 0,
            failure_message: String::new(),
            attempts: AtomicU32::new(0),
        }
    }

    /// Fail the first `fail_times` invocations with `message`, then return
    /// `"OUT-<label>"` on every call after that.
    pub fn failing_then_succeeding(
        label: impl Into<String>,
        fail_times: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            fail_times,
            failure_message: message.into(),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn invocation_count(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl AgentInvoker for SimulatedInvoker {
    async fn invoke(&self, _prompt: &str, _metadata: &Value) -> AgentResponse {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_times {
            AgentResponse::failure(self.failure_message.clone())
        } else {
            AgentResponse::success(format!("OUT-{}", self.label))
        }
    }
}

/// `ApprovalHandler` test double that always approves immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprover;

impl ApprovalHandler for AutoApprover {
    async fn request_approval(
        &self,
        _request: &ApprovalRequest,
        _timeout: Duration,
    ) -> ApprovalDecision {
        ApprovalDecision::Approved
    }

    fn close(&self) {}
}

/// `ApprovalHandler` test double with a fixed decision, for exercising the
/// rejection/timeout paths.
#[derive(Debug, Clone)]
pub struct FixedApprover(pub ApprovalDecision);

impl ApprovalHandler for FixedApprover {
    async fn request_approval(
        &self,
        _request: &ApprovalRequest,
        _timeout: Duration,
    ) -> ApprovalDecision {
        self.0.clone()
    }

    fn close(&self) {}
}
