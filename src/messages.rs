//! Wire messages exchanged over the durable log.
//!
//! Shapes are JSON-stable: field names and status strings here are the
//! contract between scheduler, workers, and monitor, and must not drift.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dag::{NodeDef, Tier};
use crate::store::{RunId, StepRunId};

/// Subject carrying task results back to the scheduler.
pub const SUBJECT_RESULTS: &str = "results";
/// Subject carrying run-level control signals.
pub const SUBJECT_SIGNALS: &str = "signals";
/// Subject carrying worker liveness records.
pub const SUBJECT_HEARTBEATS: &str = "heartbeats";

/// All task subjects ([`Tier::subject`]) in strict priority order.
pub fn task_subjects() -> Vec<String> {
    Tier::all().iter().map(Tier::subject).collect()
}

/// A step handed to a worker. `id` is the step-run id, so redeliveries of
/// the same message converge on one row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: StepRunId,
    pub run_id: RunId,
    pub node: NodeDef,
    #[serde(default)]
    pub inputs: Value,
    pub attempt: i32,
    pub deadline_at: DateTime<Utc>,
}

/// Terminal outcome statuses a worker may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Succeeded,
    Failed,
}

/// Outcome published on `results` once a task delivery finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: StepRunId,
    pub status: ResultStatus,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub cost_cents: i64,
    #[serde(default)]
    pub tokens_prompt: i64,
    #[serde(default)]
    pub tokens_completion: i64,
    #[serde(default)]
    pub output: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Cancel,
}

/// Run-level control signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub run_id: RunId,
    pub action: SignalAction,
}

/// Periodic worker liveness record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{NodePolicy, NodeType};

    #[test]
    fn task_subjects_are_priority_ordered() {
        assert_eq!(
            task_subjects(),
            vec!["tasks.Gold", "tasks.Silver", "tasks.Bronze"]
        );
    }

    #[test]
    fn task_json_shape_is_stable() {
        let task = Task {
            id: StepRunId::new(),
            run_id: RunId::new(),
            node: NodeDef {
                id: "a".to_string(),
                node_type: NodeType::Function,
                dependencies: vec![],
                policy: NodePolicy::default(),
                params: serde_json::json!({"function": "noop"}),
                continue_on_failure: false,
            },
            inputs: serde_json::json!({"inputs": {"x": 1}}),
            attempt: 1,
            deadline_at: Utc::now(),
        };
        let value = serde_json::to_value(&task).expect("serialize");
        for field in ["id", "run_id", "node", "inputs", "attempt", "deadline_at"] {
            assert!(value.get(field).is_some(), "missing field {field}");
        }
        // deadline_at rides as an RFC3339 string
        assert!(value["deadline_at"].is_string());
        let back: Task = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back.id, task.id);
        assert_eq!(back.attempt, 1);
    }

    #[test]
    fn result_status_strings_are_lowercase() {
        assert_eq!(
            serde_json::to_string(&ResultStatus::Succeeded).expect("serialize"),
            "\"succeeded\""
        );
        assert_eq!(
            serde_json::to_string(&ResultStatus::Failed).expect("serialize"),
            "\"failed\""
        );
    }

    #[test]
    fn task_result_defaults_fill_missing_fields() {
        let json = format!(
            r#"{{"task_id": "{}", "status": "failed"}}"#,
            StepRunId::new()
        );
        let result: TaskResult = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.error, "");
        assert_eq!(result.cost_cents, 0);
        assert!(result.output.is_null());
    }

    #[test]
    fn signal_roundtrip() {
        let signal = Signal {
            run_id: RunId::new(),
            action: SignalAction::Cancel,
        };
        let json = serde_json::to_string(&signal).expect("serialize");
        assert!(json.contains("\"cancel\""));
        let back: Signal = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.run_id, signal.run_id);
    }
}
