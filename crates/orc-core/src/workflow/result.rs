//! Result value types (spec §3 `StageResult`/`IterationResult`/
//! `WorkflowResult`, §7).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one iteration of an iterative stage (spec §3 `IterationResult`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    pub index: usize,
    pub item: serde_json::Value,
    pub output: String,
    pub success: bool,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

/// Outcome of one stage run (spec §3 `StageResult`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_name: String,
    pub output: String,
    pub success: bool,
    pub error: Option<String>,
    /// 1-based: the attempt that produced this result.
    pub attempt: u32,
    pub execution_time_ms: u64,
    pub agent_used: String,
    pub review_output: Option<String>,
    pub approval_granted: Option<bool>,
    pub iterations: Option<Vec<IterationResult>>,
    /// Set when cancellation (not failure) is why this stage has no output
    /// (spec §4.5 "their results are reported as cancelled, not success").
    pub cancelled: bool,
    /// Set when this stage itself ran past its timeout, as distinct from an
    /// ordinary agent/validation/approval failure. A timed-out stage is
    /// always wave-fatal (spec §4.5), regardless of `failure_policy`.
    pub timed_out: bool,
}

impl StageResult {
    pub fn cancelled(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            output: String::new(),
            success: false,
            error: Some("cancelled".to_string()),
            attempt: 0,
            execution_time_ms: 0,
            agent_used: String::new(),
            review_output: None,
            approval_granted: None,
            iterations: None,
            cancelled: true,
            timed_out: false,
        }
    }

    pub fn timed_out(stage_name: impl Into<String>, elapsed_ms: u64) -> Self {
        let stage_name = stage_name.into();
        Self {
            error: Some(format!("stage '{stage_name}' timed out after {elapsed_ms}ms")),
            stage_name,
            output: String::new(),
            success: false,
            attempt: 0,
            execution_time_ms: elapsed_ms,
            agent_used: String::new(),
            review_output: None,
            approval_granted: None,
            iterations: None,
            cancelled: false,
            timed_out: true,
        }
    }
}

/// Final outcome of one workflow run (spec §3 `WorkflowResult`). Stage
/// results are kept in a `BTreeMap` so the ordered map spec §3 calls for is
/// deterministic by stage name across (de)serialization; within a wave
/// there is no meaningful insertion order to preserve (spec §4.5: "no
/// ordering between stages in the same wave").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub stage_results: BTreeMap<String, StageResult>,
}

impl WorkflowResult {
    /// Format the single summary string spec §7 requires on user-visible
    /// failure: `"Stage '<name>' failed: <reason>"`.
    pub fn failure_summary(stage_name: &str, reason: &str) -> String {
        format!("Stage '{stage_name}' failed: {reason}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_stage_result_is_not_success() {
        let r = StageResult::cancelled("b");
        assert!(!r.success);
        assert!(r.cancelled);
        assert!(!r.timed_out);
    }

    #[test]
    fn timed_out_stage_result_is_not_cancelled() {
        let r = StageResult::timed_out("b", 5_000);
        assert!(!r.success);
        assert!(r.timed_out);
        assert!(!r.cancelled);
        assert!(r.error.unwrap().contains("timed out after 5000ms"));
    }

    #[test]
    fn failure_summary_matches_spec_format() {
        let s = WorkflowResult::failure_summary("draft", "timed out");
        assert_eq!(s, "Stage 'draft' failed: timed out");
    }
}
