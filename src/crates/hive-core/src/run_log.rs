//! Run logs: the durable record of one execution.

use crate::context::ExecutionStatus;
use crate::error::ErrorEnvelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One candidate considered by a conditional choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOption {
    pub id: String,
    #[serde(default)]
    pub description: String,
}

/// How a decision worked out, filled in after the fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Success,
    Failure,
}

/// A recorded conditional choice: edge selection or router output.
///
/// Append-only within a [`RunLog`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub node_id: String,
    pub intent: String,
    pub options: Vec<DecisionOption>,
    pub chosen_id: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<DecisionOutcome>,
}

impl Decision {
    pub fn new(
        node_id: impl Into<String>,
        intent: impl Into<String>,
        options: Vec<DecisionOption>,
        chosen_id: impl Into<String>,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            node_id: node_id.into(),
            intent: intent.into(),
            options,
            chosen_id: chosen_id.into(),
            reasoning: reasoning.into(),
            outcome: None,
        }
    }
}

/// One node entry during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeVisit {
    pub node_id: String,
    pub visit: u32,
    pub entered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: String,
}

/// Aggregate resource usage for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CostSummary {
    pub llm_calls: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub tool_calls: u32,
}

impl CostSummary {
    pub fn add_llm_call(&mut self, prompt_tokens: u64, completion_tokens: u64) {
        self.llm_calls += 1;
        self.prompt_tokens += prompt_tokens;
        self.completion_tokens += completion_tokens;
    }

    pub fn add_tool_call(&mut self) {
        self.tool_calls += 1;
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// The durable record of one execution, produced by the executor and
/// retained by the stream's recent-run ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: String,
    pub goal_id: String,
    pub graph_id: String,
    pub start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub decisions: Vec<Decision>,
    pub node_visits: Vec<NodeVisit>,
    pub final_output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
    pub cost_summary: CostSummary,
}

impl RunLog {
    pub fn started(
        run_id: impl Into<String>,
        goal_id: impl Into<String>,
        graph_id: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            goal_id: goal_id.into(),
            graph_id: graph_id.into(),
            start: Utc::now(),
            end: None,
            status: ExecutionStatus::Running,
            decisions: Vec::new(),
            node_visits: Vec::new(),
            final_output: Value::Null,
            error: None,
            cost_summary: CostSummary::default(),
        }
    }

    /// Close the log with a terminal (or paused) status.
    pub fn finish(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.end = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cost_summary_accumulates() {
        let mut cost = CostSummary::default();
        cost.add_llm_call(100, 20);
        cost.add_llm_call(50, 10);
        cost.add_tool_call();
        assert_eq!(cost.llm_calls, 2);
        assert_eq!(cost.tool_calls, 1);
        assert_eq!(cost.total_tokens(), 180);
    }

    #[test]
    fn test_run_log_round_trip() {
        let mut log = RunLog::started("r1", "g1", "graph-1");
        log.decisions.push(Decision::new(
            "router",
            "route",
            vec![
                DecisionOption {
                    id: "pos".into(),
                    description: String::new(),
                },
                DecisionOption {
                    id: "neg".into(),
                    description: String::new(),
                },
            ],
            "neg",
            "x is negative",
        ));
        log.final_output = json!({"x": 3});
        log.finish(ExecutionStatus::Completed);

        let json = serde_json::to_string(&log).unwrap();
        let back: RunLog = serde_json::from_str(&json).unwrap();
        assert_eq!(back, log);
        assert!(back.end.is_some());
        assert_eq!(back.status, ExecutionStatus::Completed);
    }
}
