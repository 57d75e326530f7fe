//! In-memory run store for tests and single-process runs.
//!
//! Keeps the exact compare-and-set semantics of the Postgres store so the
//! scheduler, worker, and monitor can be exercised without a database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{
    CancelOutcome, RunId, RunStatus, RunStore, SpecId, StepOutcome, StepRun, StepRunId,
    StepStatus, StoreError, StoreResult, WorkflowRun, WorkflowSpec,
};

#[derive(Debug, Clone)]
struct HeartbeatRow {
    status: String,
    last_seen_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    specs: HashMap<SpecId, WorkflowSpec>,
    runs: HashMap<RunId, WorkflowRun>,
    steps: HashMap<StepRunId, StepRun>,
    heartbeats: HashMap<String, HeartbeatRow>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("store state poisoned")
    }

    /// Test hook: overwrite a step's lease deadline, e.g. to simulate a
    /// crashed worker whose lease has already elapsed.
    pub fn force_lease_deadline(&self, id: StepRunId, deadline: DateTime<Utc>) {
        let mut inner = self.lock();
        if let Some(step) = inner.steps.get_mut(&id) {
            step.lease_deadline = Some(deadline);
        }
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_spec(&self, spec: &WorkflowSpec) -> StoreResult<()> {
        let mut inner = self.lock();
        let collision = inner
            .specs
            .values()
            .any(|existing| existing.name == spec.name && existing.version == spec.version);
        if collision || inner.specs.contains_key(&spec.id) {
            return Err(StoreError::AlreadyExists(format!(
                "workflow spec {} v{}",
                spec.name, spec.version
            )));
        }
        inner.specs.insert(spec.id, spec.clone());
        Ok(())
    }

    async fn get_spec(&self, name: &str, version: i32) -> StoreResult<WorkflowSpec> {
        let inner = self.lock();
        inner
            .specs
            .values()
            .find(|spec| spec.name == name && spec.version == version)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("workflow spec {name} v{version}")))
    }

    async fn get_spec_by_id(&self, id: SpecId) -> StoreResult<WorkflowSpec> {
        let inner = self.lock();
        inner
            .specs
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("workflow spec {id}")))
    }

    async fn list_specs(&self) -> StoreResult<Vec<WorkflowSpec>> {
        let inner = self.lock();
        let mut specs: Vec<WorkflowSpec> = inner.specs.values().cloned().collect();
        specs.sort_by(|a, b| (&a.name, a.version).cmp(&(&b.name, b.version)));
        Ok(specs)
    }

    async fn insert_run(&self, run: &WorkflowRun) -> StoreResult<()> {
        let mut inner = self.lock();
        if inner.runs.contains_key(&run.id) {
            return Err(StoreError::AlreadyExists(format!("workflow run {}", run.id)));
        }
        inner.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: RunId) -> StoreResult<WorkflowRun> {
        let inner = self.lock();
        inner
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("workflow run {id}")))
    }

    async fn list_runs(&self, limit: i64) -> StoreResult<Vec<WorkflowRun>> {
        let inner = self.lock();
        let mut runs: Vec<WorkflowRun> = inner.runs.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }

    async fn start_run(&self, id: RunId) -> StoreResult<bool> {
        let mut inner = self.lock();
        let Some(run) = inner.runs.get_mut(&id) else {
            return Ok(false);
        };
        if run.status != RunStatus::Queued {
            return Ok(false);
        }
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        Ok(true)
    }

    async fn finish_run(&self, id: RunId, status: RunStatus) -> StoreResult<bool> {
        if !status.is_terminal() {
            return Err(StoreError::Message(format!(
                "finish_run requires a terminal status, got {status}"
            )));
        }
        let mut inner = self.lock();
        let Some(run) = inner.runs.get_mut(&id) else {
            return Ok(false);
        };
        if run.status != RunStatus::Running {
            return Ok(false);
        }
        run.status = status;
        run.ended_at = Some(Utc::now());
        Ok(true)
    }

    async fn sync_run_cost(&self, id: RunId) -> StoreResult<i64> {
        let mut inner = self.lock();
        let total: i64 = inner
            .steps
            .values()
            .filter(|step| step.run_id == id)
            .map(|step| step.cost_cents)
            .sum();
        let run = inner
            .runs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("workflow run {id}")))?;
        run.cost_cents = total;
        Ok(total)
    }

    async fn insert_step_runs(&self, steps: &[StepRun]) -> StoreResult<()> {
        let mut inner = self.lock();
        for step in steps {
            if inner.steps.contains_key(&step.id) {
                return Err(StoreError::AlreadyExists(format!("step run {}", step.id)));
            }
        }
        for step in steps {
            inner.steps.insert(step.id, step.clone());
        }
        Ok(())
    }

    async fn get_step(&self, id: StepRunId) -> StoreResult<StepRun> {
        let inner = self.lock();
        inner
            .steps
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("step run {id}")))
    }

    async fn list_steps(&self, run_id: RunId) -> StoreResult<Vec<StepRun>> {
        let inner = self.lock();
        let mut steps: Vec<StepRun> = inner
            .steps
            .values()
            .filter(|step| step.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(steps)
    }

    async fn dependency_outputs(
        &self,
        run_id: RunId,
        node_ids: &[String],
    ) -> StoreResult<HashMap<String, Value>> {
        let inner = self.lock();
        Ok(inner
            .steps
            .values()
            .filter(|step| step.run_id == run_id && node_ids.contains(&step.node_id))
            .filter_map(|step| {
                step.output
                    .clone()
                    .map(|output| (step.node_id.clone(), output))
            })
            .collect())
    }

    async fn mark_step_ready(&self, id: StepRunId) -> StoreResult<bool> {
        let mut inner = self.lock();
        let Some(step) = inner.steps.get_mut(&id) else {
            return Ok(false);
        };
        if step.status != StepStatus::Pending {
            return Ok(false);
        }
        step.status = StepStatus::Ready;
        Ok(true)
    }

    async fn claim_step(
        &self,
        id: StepRunId,
        worker_id: &str,
        attempt: i32,
        lease_deadline: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.lock();
        let Some(step) = inner.steps.get_mut(&id) else {
            return Ok(false);
        };
        if step.status != StepStatus::Ready {
            return Ok(false);
        }
        step.status = StepStatus::Running;
        step.worker_id = Some(worker_id.to_string());
        step.attempt = step.attempt.max(attempt);
        step.started_at = Some(Utc::now());
        step.lease_deadline = Some(lease_deadline);
        Ok(true)
    }

    async fn finish_step(&self, outcome: &StepOutcome) -> StoreResult<bool> {
        if !outcome.status.is_terminal() {
            return Err(StoreError::Message(format!(
                "finish_step requires a terminal status, got {}",
                outcome.status
            )));
        }
        let mut inner = self.lock();
        let Some(step) = inner.steps.get_mut(&outcome.step_id) else {
            return Ok(false);
        };
        if !matches!(step.status, StepStatus::Ready | StepStatus::Running) {
            return Ok(false);
        }
        step.status = outcome.status;
        step.attempt = step.attempt.max(outcome.attempt);
        step.ended_at = Some(Utc::now());
        step.error = outcome.error.clone();
        step.cost_cents = outcome.cost_cents;
        step.tokens_prompt = outcome.tokens_prompt;
        step.tokens_completion = outcome.tokens_completion;
        step.output = outcome.output.clone();
        Ok(true)
    }

    async fn cancel_steps_if_pending(&self, ids: &[StepRunId]) -> StoreResult<u64> {
        let now = Utc::now();
        let mut inner = self.lock();
        let mut moved = 0u64;
        for id in ids {
            if let Some(step) = inner.steps.get_mut(id) {
                if step.status == StepStatus::Pending {
                    step.status = StepStatus::Canceled;
                    step.ended_at = Some(now);
                    moved += 1;
                }
            }
        }
        Ok(moved)
    }

    async fn cancel_nonterminal_steps(&self, run_id: RunId) -> StoreResult<u64> {
        let now = Utc::now();
        let mut inner = self.lock();
        let mut moved = 0u64;
        for step in inner.steps.values_mut() {
            if step.run_id == run_id && !step.status.is_terminal() {
                step.status = StepStatus::Canceled;
                step.ended_at = Some(now);
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn cancel_run(&self, id: RunId) -> StoreResult<CancelOutcome> {
        let now = Utc::now();
        let mut inner = self.lock();
        let Some(run) = inner.runs.get_mut(&id) else {
            return Err(StoreError::NotFound(format!("workflow run {id}")));
        };

        let run_changed = matches!(run.status, RunStatus::Queued | RunStatus::Running);
        if run_changed {
            run.status = RunStatus::Canceled;
            run.ended_at = Some(now);
        }

        let mut steps_canceled = 0u64;
        for step in inner.steps.values_mut() {
            if step.run_id == id && !step.status.is_terminal() {
                step.status = StepStatus::Canceled;
                step.ended_at = Some(now);
                steps_canceled += 1;
            }
        }

        Ok(CancelOutcome {
            run_changed,
            steps_canceled,
        })
    }

    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<StepRun>> {
        let inner = self.lock();
        let mut expired: Vec<StepRun> = inner
            .steps
            .values()
            .filter(|step| {
                step.status == StepStatus::Running
                    && step
                        .lease_deadline
                        .map(|deadline| deadline < now)
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        expired.sort_by_key(|step| step.lease_deadline);
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }

    async fn redrive_expired_step(
        &self,
        id: StepRunId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<i32>> {
        let mut inner = self.lock();
        let Some(step) = inner.steps.get_mut(&id) else {
            return Ok(None);
        };
        let expired = step
            .lease_deadline
            .map(|deadline| deadline < now)
            .unwrap_or(false);
        if step.status != StepStatus::Running || !expired {
            return Ok(None);
        }
        step.status = StepStatus::Ready;
        step.attempt += 1;
        step.worker_id = None;
        step.lease_deadline = None;
        Ok(Some(step.attempt))
    }

    async fn redrive_worker_step(
        &self,
        id: StepRunId,
        worker_id: &str,
    ) -> StoreResult<Option<i32>> {
        let mut inner = self.lock();
        let Some(step) = inner.steps.get_mut(&id) else {
            return Ok(None);
        };
        if step.status != StepStatus::Running || step.worker_id.as_deref() != Some(worker_id) {
            return Ok(None);
        }
        step.status = StepStatus::Ready;
        step.attempt += 1;
        step.worker_id = None;
        step.lease_deadline = None;
        Ok(Some(step.attempt))
    }

    async fn record_worker_heartbeat(
        &self,
        worker_id: &str,
        status: &str,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.heartbeats.insert(
            worker_id.to_string(),
            HeartbeatRow {
                status: status.to_string(),
                last_seen_at: seen_at,
            },
        );
        Ok(())
    }

    async fn stale_workers(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let inner = self.lock();
        let mut stale: Vec<String> = inner
            .heartbeats
            .iter()
            .filter(|(_, row)| row.last_seen_at < cutoff)
            .map(|(worker_id, _)| worker_id.clone())
            .collect();
        stale.sort();
        Ok(stale)
    }

    async fn steps_running_on(&self, worker_id: &str) -> StoreResult<Vec<StepRun>> {
        let inner = self.lock();
        Ok(inner
            .steps
            .values()
            .filter(|step| {
                step.status == StepStatus::Running
                    && step.worker_id.as_deref() == Some(worker_id)
            })
            .cloned()
            .collect())
    }
}
