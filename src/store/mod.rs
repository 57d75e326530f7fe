//! Run store: transactional persistence for specs, runs, and step runs.
//!
//! Every state transition is a conditional update keyed on the current
//! status. Handlers race freely across processes; losers of a compare-and-set
//! observe zero affected rows and skip their side effects. No implementation
//! may assume an in-memory "already processed" set survives a crash.
//!
//! Two implementations ship in this crate:
//! - [`PostgresStore`]: sqlx-backed, the production store
//! - [`MemoryStore`]: mutex-guarded maps for tests and single-process runs

mod memory;
mod postgres;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::dag::Dag;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

// ============================================================================
// Type Aliases & Newtypes
// ============================================================================

/// Unique identifier for a workflow spec
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SpecId(pub Uuid);

impl SpecId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SpecId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SpecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a workflow run
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a step run. Doubles as the task id on the wire so
/// redeliveries stay idempotent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StepRunId(pub Uuid);

impl StepRunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StepRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StepRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Status Enums
// ============================================================================

/// Status of a workflow run. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a single step run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "ready" => Some(Self::Ready),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Model Structs
// ============================================================================

/// A registered workflow spec. Immutable after creation; shared read-only by
/// every scheduler replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub id: SpecId,
    pub org_id: Option<Uuid>,
    pub name: String,
    pub version: i32,
    pub dag: Dag,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Submission metadata carried on a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetadata {
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub budget_cents: i64,
    /// Optional wall-clock deadline for the whole run; informs default task
    /// deadlines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_at: Option<DateTime<Utc>>,
}

/// One submission of a workflow spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub workflow_spec_id: SpecId,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cost_cents: i64,
    pub metadata: RunMetadata,
    pub created_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(workflow_spec_id: SpecId, metadata: RunMetadata) -> Self {
        Self {
            id: RunId::new(),
            workflow_spec_id,
            status: RunStatus::Queued,
            started_at: None,
            ended_at: None,
            cost_cents: 0,
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// Per-node execution record; the unit of scheduling and retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub id: StepRunId,
    pub run_id: RunId,
    pub node_id: String,
    pub status: StepStatus,
    pub attempt: i32,
    pub worker_id: Option<String>,
    pub lease_deadline: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub cost_cents: i64,
    pub tokens_prompt: i64,
    pub tokens_completion: i64,
    pub output: Option<Value>,
}

impl StepRun {
    /// Fresh pending record for a node of `run_id`.
    pub fn pending(run_id: RunId, node_id: &str) -> Self {
        Self {
            id: StepRunId::new(),
            run_id,
            node_id: node_id.to_string(),
            status: StepStatus::Pending,
            attempt: 0,
            worker_id: None,
            lease_deadline: None,
            started_at: None,
            ended_at: None,
            error: None,
            cost_cents: 0,
            tokens_prompt: 0,
            tokens_completion: 0,
            output: None,
        }
    }
}

/// Terminal write applied to a step row. `status` must be terminal; the
/// update only fires while the row is still `ready` or `running`.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step_id: StepRunId,
    pub status: StepStatus,
    pub attempt: i32,
    pub error: Option<String>,
    pub cost_cents: i64,
    pub tokens_prompt: i64,
    pub tokens_completion: i64,
    pub output: Option<Value>,
}

/// Result of a run cancellation sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct CancelOutcome {
    /// Whether this call moved the run out of `queued`/`running`.
    pub run_changed: bool,
    /// Non-terminal steps moved to `canceled`.
    pub steps_canceled: u64,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Message(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// RunStore
// ============================================================================

/// Transactional persistence for workflow specs, runs, and step runs.
///
/// Methods returning `bool` are compare-and-sets: `true` means this call won
/// the transition, `false` means the row was not in the expected state.
#[async_trait]
pub trait RunStore: Send + Sync {
    // ------------------------------------------------------------------
    // Workflow specs
    // ------------------------------------------------------------------

    /// Register a spec. Fails with `AlreadyExists` when `(name, version)` is
    /// taken.
    async fn create_spec(&self, spec: &WorkflowSpec) -> StoreResult<()>;

    async fn get_spec(&self, name: &str, version: i32) -> StoreResult<WorkflowSpec>;

    async fn get_spec_by_id(&self, id: SpecId) -> StoreResult<WorkflowSpec>;

    async fn list_specs(&self) -> StoreResult<Vec<WorkflowSpec>>;

    // ------------------------------------------------------------------
    // Workflow runs
    // ------------------------------------------------------------------

    /// Insert a run in `queued`. Fails with `AlreadyExists` on id collision.
    async fn insert_run(&self, run: &WorkflowRun) -> StoreResult<()>;

    async fn get_run(&self, id: RunId) -> StoreResult<WorkflowRun>;

    async fn list_runs(&self, limit: i64) -> StoreResult<Vec<WorkflowRun>>;

    /// CAS `queued -> running`, stamping `started_at`.
    async fn start_run(&self, id: RunId) -> StoreResult<bool>;

    /// CAS `running -> succeeded|failed`, stamping `ended_at`.
    async fn finish_run(&self, id: RunId, status: RunStatus) -> StoreResult<bool>;

    /// Recompute the run's accumulated cost from its step rows. Idempotent,
    /// so replaying a result converges instead of double-counting.
    async fn sync_run_cost(&self, id: RunId) -> StoreResult<i64>;

    // ------------------------------------------------------------------
    // Step runs
    // ------------------------------------------------------------------

    async fn insert_step_runs(&self, steps: &[StepRun]) -> StoreResult<()>;

    async fn get_step(&self, id: StepRunId) -> StoreResult<StepRun>;

    /// All steps of a run under one read-consistent snapshot.
    async fn list_steps(&self, run_id: RunId) -> StoreResult<Vec<StepRun>>;

    /// Outputs of the named nodes' steps for `run_id`, read under one
    /// consistent snapshot. A node whose step has no recorded output (never
    /// finished, or garbage collected) is absent from the map.
    async fn dependency_outputs(
        &self,
        run_id: RunId,
        node_ids: &[String],
    ) -> StoreResult<HashMap<String, Value>>;

    /// CAS `pending -> ready`.
    async fn mark_step_ready(&self, id: StepRunId) -> StoreResult<bool>;

    /// CAS `ready -> running`, stamping the lease. `attempt` never regresses
    /// below the value already on the row.
    async fn claim_step(
        &self,
        id: StepRunId,
        worker_id: &str,
        attempt: i32,
        lease_deadline: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// CAS `ready|running -> terminal`, writing the outcome columns and
    /// `ended_at` in a single statement.
    async fn finish_step(&self, outcome: &StepOutcome) -> StoreResult<bool>;

    /// CAS selected steps `pending -> canceled`. Returns how many moved.
    async fn cancel_steps_if_pending(&self, ids: &[StepRunId]) -> StoreResult<u64>;

    /// Cancel all non-terminal steps of a run. Returns how many moved.
    async fn cancel_nonterminal_steps(&self, run_id: RunId) -> StoreResult<u64>;

    /// One transaction: CAS the run `queued|running -> canceled` and cancel
    /// its non-terminal steps.
    async fn cancel_run(&self, id: RunId) -> StoreResult<CancelOutcome>;

    // ------------------------------------------------------------------
    // Monitor support
    // ------------------------------------------------------------------

    /// Running steps whose lease elapsed before `now`.
    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<StepRun>>;

    /// CAS `running -> ready` for an expired lease, clearing the lease and
    /// incrementing `attempt`. Returns the new attempt when this call won.
    async fn redrive_expired_step(
        &self,
        id: StepRunId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<i32>>;

    /// CAS `running -> ready` for a step held by a dead worker, regardless of
    /// lease expiry. Returns the new attempt when this call won.
    async fn redrive_worker_step(
        &self,
        id: StepRunId,
        worker_id: &str,
    ) -> StoreResult<Option<i32>>;

    async fn record_worker_heartbeat(
        &self,
        worker_id: &str,
        status: &str,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Workers whose last heartbeat predates `cutoff`.
    async fn stale_workers(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<String>>;

    /// Running steps currently leased by `worker_id`.
    async fn steps_running_on(&self, worker_id: &str) -> StoreResult<Vec<StepRun>>;
}
