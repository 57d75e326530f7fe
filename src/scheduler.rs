//! Control-plane scheduler: materializes ready steps, dispatches them, and
//! absorbs their outcomes.
//!
//! The scheduler owns the per-run state machine. It never executes anything
//! itself; it moves step rows `pending -> ready`, publishes tasks to the
//! tiered queue subjects, and folds results and signals back into run state.
//! Every mutation is a compare-and-set, so any number of replicas can consume
//! the same result stream: losers observe zero affected rows and skip their
//! side effects, which is what makes redelivered results harmless.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::dag::NodeDef;
use crate::error::{
    Error, Result, STEP_ERROR_INPUT_UNAVAILABLE,
};
use crate::log::DurableLog;
use crate::messages::{
    Signal, SignalAction, Task, TaskResult, ResultStatus, SUBJECT_RESULTS, SUBJECT_SIGNALS,
};
use crate::store::{
    RunStatus, RunStore, StepOutcome, StepRun, StepStatus, WorkflowRun, WorkflowSpec,
};

/// Consumer name shared by scheduler replicas; the result stream is a work
/// queue, so each result lands on exactly one replica.
const SCHEDULER_CONSUMER: &str = "scheduler";

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Result/signal poll cadence.
    pub poll_interval: Duration,
    /// Max messages claimed per poll.
    pub batch_size: usize,
    /// Visibility window for claimed results/signals.
    pub visibility: Duration,
    /// Task deadline when neither the node nor the run provides one.
    pub default_task_deadline: Duration,
    /// Floor for derived task deadlines.
    pub min_task_deadline: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            batch_size: 64,
            visibility: Duration::from_secs(30),
            default_task_deadline: Duration::from_secs(300),
            min_task_deadline: Duration::from_secs(30),
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn RunStore>,
    log: Arc<dyn DurableLog>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn RunStore>,
        log: Arc<dyn DurableLog>,
        config: SchedulerConfig,
    ) -> Self {
        Self { store, log, config }
    }

    // ------------------------------------------------------------------
    // Public contract
    // ------------------------------------------------------------------

    /// Admit a run: one pending step per node, roots moved to `ready` and
    /// enqueued. Rejects cyclic or dangling DAGs before any row is written.
    pub async fn submit_run(&self, run: &WorkflowRun, spec: &WorkflowSpec) -> Result<()> {
        spec.dag
            .validate()
            .map_err(|err| Error::InvalidSpec(err.0))?;

        self.store.insert_run(run).await?;

        let steps: Vec<StepRun> = spec
            .dag
            .nodes
            .iter()
            .map(|node| StepRun::pending(run.id, &node.id))
            .collect();
        self.store.insert_step_runs(&steps).await?;
        self.store.start_run(run.id).await?;

        metrics::counter!("agentflow_runs_submitted_total").increment(1);
        info!(
            run_id = %run.id,
            spec = %spec.name,
            version = spec.version,
            nodes = spec.dag.nodes.len(),
            "workflow run submitted"
        );

        for node in spec.dag.roots() {
            let Some(step) = steps.iter().find(|step| step.node_id == node.id) else {
                continue;
            };
            if self.store.mark_step_ready(step.id).await? {
                self.dispatch_step(run, spec, &steps, node, step.id, step.attempt + 1)
                    .await?;
            }
        }

        Ok(())
    }

    /// Fold one task result into run state.
    ///
    /// The terminal step row is usually written by the worker (or the
    /// monitor) before the result reaches us, so losing the `finish_step`
    /// CAS is the normal case, not an error. What must happen exactly once
    /// is the successor enqueue, and that is guarded by each successor's own
    /// `pending -> ready` CAS, which makes replaying any result a no-op.
    pub async fn on_result(&self, result: &TaskResult) -> Result<()> {
        let step = self.store.get_step(result.task_id).await?;
        let run = self.store.get_run(step.run_id).await?;
        let spec = self.store.get_spec_by_id(run.workflow_spec_id).await?;
        let node = spec.dag.node(&step.node_id).ok_or_else(|| {
            Error::InvalidSpec(format!(
                "step {} references node '{}' missing from spec {}",
                step.id, step.node_id, spec.id
            ))
        })?;

        let status = match result.status {
            ResultStatus::Succeeded => StepStatus::Succeeded,
            ResultStatus::Failed => StepStatus::Failed,
        };
        let outcome = StepOutcome {
            step_id: result.task_id,
            status,
            attempt: step.attempt,
            error: (!result.error.is_empty()).then(|| result.error.clone()),
            cost_cents: result.cost_cents,
            tokens_prompt: result.tokens_prompt,
            tokens_completion: result.tokens_completion,
            output: (!result.output.is_null()).then(|| result.output.clone()),
        };

        let changed = self.store.finish_step(&outcome).await?;
        if changed {
            metrics::counter!("agentflow_results_applied_total").increment(1);
            debug!(
                run_id = %run.id,
                step_id = %step.id,
                node = %step.node_id,
                status = %status,
                "step outcome applied"
            );
        }
        self.store.sync_run_cost(run.id).await?;

        // Drive the run from the settled row, not from this message: a late
        // result for a canceled step must not resurrect anything.
        let effective = if changed {
            status
        } else {
            self.store.get_step(step.id).await?.status
        };
        match effective {
            StepStatus::Succeeded => {
                self.dispatch_newly_ready(&run, &spec).await?;
            }
            StepStatus::Failed => {
                return self.settle_step_failure(&run, &spec, node).await;
            }
            _ => {}
        }

        self.check_run_completion(&run, &spec).await
    }

    /// Apply a run-level signal. Returns whether this call changed the run.
    /// Only a winning cancel republishes on `signals`, so replicated
    /// schedulers converge without a publish storm.
    pub async fn on_signal(&self, signal: &Signal) -> Result<bool> {
        match signal.action {
            SignalAction::Cancel => {
                let outcome = self.store.cancel_run(signal.run_id).await?;
                if outcome.run_changed {
                    let payload = serde_json::to_vec(signal)?;
                    self.log.publish(SUBJECT_SIGNALS, &payload).await?;
                    metrics::counter!("agentflow_runs_canceled_total").increment(1);
                    info!(
                        run_id = %signal.run_id,
                        steps_canceled = outcome.steps_canceled,
                        "workflow run canceled"
                    );
                }
                Ok(outcome.run_changed)
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Move every pending node whose dependencies all succeeded to `ready`
    /// and enqueue it.
    async fn dispatch_newly_ready(&self, run: &WorkflowRun, spec: &WorkflowSpec) -> Result<()> {
        let steps = self.store.list_steps(run.id).await?;
        for node in &spec.dag.nodes {
            let Some(step) = steps.iter().find(|step| step.node_id == node.id) else {
                continue;
            };
            if step.status != StepStatus::Pending {
                continue;
            }
            let deps_met = node.dependencies.iter().all(|dep| {
                steps
                    .iter()
                    .any(|s| s.node_id == *dep && s.status == StepStatus::Succeeded)
            });
            if !deps_met {
                continue;
            }
            if self.store.mark_step_ready(step.id).await? {
                self.dispatch_step(run, spec, &steps, node, step.id, step.attempt + 1)
                    .await?;
            }
        }
        Ok(())
    }

    /// Resolve inputs and publish the task for a step just moved to `ready`.
    /// A missing dependency output fails the step instead of enqueueing it.
    async fn dispatch_step(
        &self,
        run: &WorkflowRun,
        spec: &WorkflowSpec,
        steps: &[StepRun],
        node: &NodeDef,
        step_id: crate::store::StepRunId,
        attempt: i32,
    ) -> Result<()> {
        let outputs = self
            .store
            .dependency_outputs(run.id, &node.dependencies)
            .await?;
        let inputs = match build_inputs(run, node, &outputs) {
            Ok(inputs) => inputs,
            Err(missing) => {
                warn!(
                    run_id = %run.id,
                    node = %node.id,
                    missing = %missing,
                    "dependency output unavailable, failing step"
                );
                let changed = self
                    .store
                    .finish_step(&StepOutcome {
                        step_id,
                        status: StepStatus::Failed,
                        attempt,
                        error: Some(format!(
                            "{STEP_ERROR_INPUT_UNAVAILABLE}: output of '{missing}' is gone"
                        )),
                        cost_cents: 0,
                        tokens_prompt: 0,
                        tokens_completion: 0,
                        output: None,
                    })
                    .await?;
                if changed {
                    self.settle_step_failure(run, spec, node).await?;
                }
                return Ok(());
            }
        };

        let outstanding = steps
            .iter()
            .filter(|step| !step.status.is_terminal())
            .count();
        let deadline_at = compute_deadline(&self.config, run, node, outstanding);
        let task = Task {
            id: step_id,
            run_id: run.id,
            node: node.clone(),
            inputs,
            attempt,
            deadline_at,
        };
        let subject = node.tier(&run.metadata.tags).subject();
        let payload = serde_json::to_vec(&task)?;
        self.log.publish(&subject, &payload).await?;

        metrics::counter!("agentflow_tasks_enqueued_total").increment(1);
        debug!(
            run_id = %run.id,
            step_id = %step_id,
            node = %node.id,
            subject = %subject,
            attempt,
            "task enqueued"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Run fate
    // ------------------------------------------------------------------

    /// Settle the run after a step failed terminally. A plain node failure
    /// fails the run and cancels whatever is still in flight; a
    /// continue-on-failure node only dooms its own downstream subtree.
    async fn settle_step_failure(
        &self,
        run: &WorkflowRun,
        spec: &WorkflowSpec,
        node: &NodeDef,
    ) -> Result<()> {
        if !node.continue_on_failure {
            let canceled = self.store.cancel_nonterminal_steps(run.id).await?;
            if self.store.finish_run(run.id, RunStatus::Failed).await? {
                metrics::counter!("agentflow_runs_failed_total").increment(1);
                warn!(
                    run_id = %run.id,
                    node = %node.id,
                    steps_canceled = canceled,
                    "workflow run failed"
                );
            }
            return Ok(());
        }

        self.cancel_doomed_steps(run, spec).await?;
        self.check_run_completion(run, spec).await
    }

    /// Cancel pending steps that can never become ready because something
    /// upstream ended without succeeding.
    async fn cancel_doomed_steps(&self, run: &WorkflowRun, spec: &WorkflowSpec) -> Result<()> {
        let steps = self.store.list_steps(run.id).await?;
        let dead_ends: std::collections::HashSet<String> = steps
            .iter()
            .filter(|step| {
                matches!(step.status, StepStatus::Failed | StepStatus::Canceled)
            })
            .map(|step| step.node_id.clone())
            .collect();
        if dead_ends.is_empty() {
            return Ok(());
        }

        let doomed_nodes = spec.dag.downstream_of(&dead_ends);
        let doomed_steps: Vec<_> = steps
            .iter()
            .filter(|step| {
                step.status == StepStatus::Pending && doomed_nodes.contains(&step.node_id)
            })
            .map(|step| step.id)
            .collect();
        if doomed_steps.is_empty() {
            return Ok(());
        }

        let canceled = self.store.cancel_steps_if_pending(&doomed_steps).await?;
        if canceled > 0 {
            debug!(
                run_id = %run.id,
                canceled,
                "canceled steps unreachable after upstream failure"
            );
        }
        Ok(())
    }

    /// Terminate the run once no step remains non-terminal. A run succeeds
    /// unless some step failed on a node that was not continue-on-failure;
    /// that case is settled eagerly in `settle_step_failure`.
    async fn check_run_completion(&self, run: &WorkflowRun, spec: &WorkflowSpec) -> Result<()> {
        let steps = self.store.list_steps(run.id).await?;
        if steps.iter().any(|step| !step.status.is_terminal()) {
            return Ok(());
        }

        let run_failing_failure = steps.iter().any(|step| {
            step.status == StepStatus::Failed
                && spec
                    .dag
                    .node(&step.node_id)
                    .map(|node| !node.continue_on_failure)
                    .unwrap_or(true)
        });
        let verdict = if run_failing_failure {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        if self.store.finish_run(run.id, verdict).await? {
            metrics::counter!("agentflow_runs_finished_total").increment(1);
            info!(run_id = %run.id, status = %verdict, "workflow run finished");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Consumer loops
    // ------------------------------------------------------------------

    /// Drain one batch of results. Returns how many deliveries were settled.
    pub async fn process_results_once(&self) -> Result<usize> {
        let deliveries = self
            .log
            .pull(
                SCHEDULER_CONSUMER,
                &[SUBJECT_RESULTS.to_string()],
                self.config.batch_size,
                self.config.visibility,
            )
            .await?;
        let mut settled = 0;

        for delivery in deliveries {
            let result: TaskResult = match serde_json::from_slice(&delivery.payload) {
                Ok(result) => result,
                Err(err) => {
                    warn!(?err, "dropping undecodable result message");
                    self.log.ack(&delivery).await?;
                    continue;
                }
            };
            match self.on_result(&result).await {
                Ok(()) => {
                    self.log.ack(&delivery).await?;
                    settled += 1;
                }
                Err(err) if err.is_transient() => {
                    metrics::counter!("agentflow_scheduler_errors_total").increment(1);
                    warn!(?err, task_id = %result.task_id, "transient error, requeueing result");
                    self.log.nak(&delivery, Duration::from_secs(5)).await?;
                }
                Err(err) => {
                    // Permanent: a result for a purged step, a spec that no
                    // longer resolves. Requeueing cannot help.
                    warn!(?err, task_id = %result.task_id, "dropping unprocessable result");
                    self.log.ack(&delivery).await?;
                }
            }
        }

        Ok(settled)
    }

    /// Drain one batch of signals.
    pub async fn process_signals_once(&self) -> Result<usize> {
        let deliveries = self
            .log
            .pull(
                SCHEDULER_CONSUMER,
                &[SUBJECT_SIGNALS.to_string()],
                self.config.batch_size,
                self.config.visibility,
            )
            .await?;
        let mut settled = 0;

        for delivery in deliveries {
            let signal: Signal = match serde_json::from_slice(&delivery.payload) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(?err, "dropping undecodable signal message");
                    self.log.ack(&delivery).await?;
                    continue;
                }
            };
            match self.on_signal(&signal).await {
                Ok(_) => {
                    self.log.ack(&delivery).await?;
                    settled += 1;
                }
                Err(Error::NotFound(_)) => {
                    self.log.ack(&delivery).await?;
                }
                Err(err) if err.is_transient() => {
                    metrics::counter!("agentflow_scheduler_errors_total").increment(1);
                    warn!(?err, run_id = %signal.run_id, "transient error, requeueing signal");
                    self.log.nak(&delivery, Duration::from_secs(5)).await?;
                }
                Err(err) => {
                    warn!(?err, run_id = %signal.run_id, "dropping unprocessable signal");
                    self.log.ack(&delivery).await?;
                }
            }
        }

        Ok(settled)
    }
}

// ============================================================================
// Dispatch helpers (shared with the monitor's redrive path)
// ============================================================================

/// Assemble a task's input object from the run and the dependency outputs
/// fetched via [`RunStore::dependency_outputs`]. Returns the missing node id
/// when an output has been garbage collected.
pub(crate) fn build_inputs(
    run: &WorkflowRun,
    node: &NodeDef,
    outputs: &HashMap<String, Value>,
) -> std::result::Result<Value, String> {
    let mut inputs = serde_json::Map::new();
    if node.dependencies.is_empty() {
        inputs.insert("inputs".to_string(), run.metadata.inputs.clone());
    }
    for dep in &node.dependencies {
        let output = outputs.get(dep).cloned().ok_or_else(|| dep.clone())?;
        inputs.insert(dep.clone(), output);
    }
    Ok(Value::Object(inputs))
}

/// Absolute wall-clock deadline for a task. An explicit node deadline wins;
/// otherwise the run's remaining time is split across outstanding steps,
/// floored at the configured minimum.
pub(crate) fn compute_deadline(
    config: &SchedulerConfig,
    run: &WorkflowRun,
    node: &NodeDef,
    outstanding_steps: usize,
) -> DateTime<Utc> {
    let now = Utc::now();
    if let Some(secs) = node.policy.deadline_secs {
        return now + chrono::Duration::seconds(secs.max(0));
    }

    let budget = match run.metadata.deadline_at {
        Some(run_deadline) => {
            let remaining = (run_deadline - now).max(chrono::Duration::zero());
            remaining / outstanding_steps.max(1) as i32
        }
        None => chrono::Duration::from_std(config.default_task_deadline)
            .unwrap_or_else(|_| chrono::Duration::seconds(300)),
    };
    let floor = chrono::Duration::from_std(config.min_task_deadline)
        .unwrap_or_else(|_| chrono::Duration::seconds(30));
    now + budget.max(floor)
}

// ============================================================================
// Service loop
// ============================================================================

/// Background task draining results and signals until shutdown.
pub struct SchedulerService {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SchedulerService {
    pub fn start(scheduler: Arc<Scheduler>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(scheduler.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("scheduler service started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = scheduler.process_results_once().await {
                            metrics::counter!("agentflow_scheduler_errors_total").increment(1);
                            error!(?err, "result poll failed");
                        }
                        if let Err(err) = scheduler.process_signals_once().await {
                            metrics::counter!("agentflow_scheduler_errors_total").increment(1);
                            error!(?err, "signal poll failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_ok() && *shutdown_rx.borrow() {
                            info!("scheduler service shutting down");
                            break;
                        }
                    }
                }
            }
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::dag::{Dag, NodeDef, NodePolicy, NodeType};
    use crate::log::MemoryLog;
    use crate::store::{MemoryStore, RunMetadata, SpecId};

    fn node(id: &str, deps: &[&str]) -> NodeDef {
        NodeDef {
            id: id.to_string(),
            node_type: NodeType::Function,
            dependencies: deps.iter().map(|dep| dep.to_string()).collect(),
            policy: NodePolicy::default(),
            params: json!({"function": "noop"}),
            continue_on_failure: false,
        }
    }

    fn spec_with(nodes: Vec<NodeDef>) -> WorkflowSpec {
        WorkflowSpec {
            id: SpecId::new(),
            org_id: None,
            name: "test".to_string(),
            version: 1,
            dag: Dag::new(nodes),
            metadata: json!({}),
            created_at: Utc::now(),
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        log: Arc<MemoryLog>,
        scheduler: Scheduler,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let log = Arc::new(MemoryLog::new());
        let scheduler = Scheduler::new(
            store.clone(),
            log.clone(),
            SchedulerConfig::default(),
        );
        Fixture {
            store,
            log,
            scheduler,
        }
    }

    async fn submit(fixture: &Fixture, spec: &WorkflowSpec) -> WorkflowRun {
        fixture.store.create_spec(spec).await.expect("create spec");
        let run = WorkflowRun::new(spec.id, RunMetadata::default());
        fixture
            .scheduler
            .submit_run(&run, spec)
            .await
            .expect("submit");
        run
    }

    async fn pull_task(fixture: &Fixture, subject: &str) -> Task {
        let deliveries = fixture
            .log
            .pull("test", &[subject.to_string()], 1, Duration::from_secs(30))
            .await
            .expect("pull");
        assert_eq!(deliveries.len(), 1, "expected a task on {subject}");
        fixture.log.ack(&deliveries[0]).await.expect("ack");
        serde_json::from_slice(&deliveries[0].payload).expect("decode task")
    }

    fn succeeded(task_id: crate::store::StepRunId, output: Value) -> TaskResult {
        TaskResult {
            task_id,
            status: ResultStatus::Succeeded,
            error: String::new(),
            cost_cents: 0,
            tokens_prompt: 0,
            tokens_completion: 0,
            output,
        }
    }

    #[tokio::test]
    async fn submit_enqueues_roots_and_starts_run() {
        let fixture = fixture();
        let spec = spec_with(vec![node("a", &[]), node("b", &["a"])]);
        let run = submit(&fixture, &spec).await;

        let stored = fixture.store.get_run(run.id).await.expect("get run");
        assert_eq!(stored.status, RunStatus::Running);
        assert!(stored.started_at.is_some());

        let task = pull_task(&fixture, "tasks.Bronze").await;
        assert_eq!(task.node.id, "a");
        assert_eq!(task.attempt, 1);
        assert_eq!(task.inputs, json!({"inputs": null}));

        // only the root is enqueued
        assert_eq!(fixture.log.outstanding("tasks.Bronze"), 0);
    }

    #[tokio::test]
    async fn submit_rejects_cyclic_spec_without_creating_run() {
        let fixture = fixture();
        let spec = spec_with(vec![node("a", &["b"]), node("b", &["a"])]);
        fixture.store.create_spec(&spec).await.expect("create spec");
        let run = WorkflowRun::new(spec.id, RunMetadata::default());

        let err = fixture
            .scheduler
            .submit_run(&run, &spec)
            .await
            .expect_err("cyclic");
        assert!(matches!(err, Error::InvalidSpec(_)));
        assert!(matches!(
            fixture.store.get_run(run.id).await,
            Err(crate::store::StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn submit_duplicate_run_id_is_already_exists() {
        let fixture = fixture();
        let spec = spec_with(vec![node("a", &[])]);
        let run = submit(&fixture, &spec).await;

        let err = fixture
            .scheduler
            .submit_run(&run, &spec)
            .await
            .expect_err("duplicate");
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn result_unlocks_dependents_and_completes_run() {
        let fixture = fixture();
        let spec = spec_with(vec![node("a", &[]), node("b", &["a"])]);
        let run = submit(&fixture, &spec).await;

        let task_a = pull_task(&fixture, "tasks.Bronze").await;
        // worker writes the terminal row before publishing; mimic it
        claim_and_finish(&fixture, &task_a, json!({"ok": true})).await;
        fixture
            .scheduler
            .on_result(&succeeded(task_a.id, json!({"ok": true})))
            .await
            .expect("on_result");

        let task_b = pull_task(&fixture, "tasks.Bronze").await;
        assert_eq!(task_b.node.id, "b");
        assert_eq!(task_b.inputs, json!({"a": {"ok": true}}));

        claim_and_finish(&fixture, &task_b, json!({"done": true})).await;
        fixture
            .scheduler
            .on_result(&succeeded(task_b.id, json!({"done": true})))
            .await
            .expect("on_result");

        let stored = fixture.store.get_run(run.id).await.expect("get run");
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert!(stored.ended_at.is_some());
    }

    /// Stand-in for the worker's claim + terminal write.
    async fn claim_and_finish(fixture: &Fixture, task: &Task, output: Value) {
        let lease = Utc::now() + chrono::Duration::seconds(60);
        assert!(fixture
            .store
            .claim_step(task.id, "test-worker", task.attempt, lease)
            .await
            .expect("claim"));
        assert!(fixture
            .store
            .finish_step(&StepOutcome {
                step_id: task.id,
                status: StepStatus::Succeeded,
                attempt: task.attempt,
                error: None,
                cost_cents: 0,
                tokens_prompt: 0,
                tokens_completion: 0,
                output: Some(output),
            })
            .await
            .expect("finish"));
    }

    #[tokio::test]
    async fn replayed_result_does_not_double_enqueue() {
        let fixture = fixture();
        let spec = spec_with(vec![node("a", &[]), node("b", &["a"])]);
        submit(&fixture, &spec).await;

        let task_a = pull_task(&fixture, "tasks.Bronze").await;
        claim_and_finish(&fixture, &task_a, json!({"ok": true})).await;

        let result = succeeded(task_a.id, json!({"ok": true}));
        fixture.scheduler.on_result(&result).await.expect("first");
        fixture.scheduler.on_result(&result).await.expect("replay");
        fixture.scheduler.on_result(&result).await.expect("replay");

        assert_eq!(
            fixture.log.outstanding("tasks.Bronze"),
            1,
            "exactly one task for b"
        );
    }

    #[tokio::test]
    async fn failed_step_fails_run_and_cancels_the_rest() {
        let fixture = fixture();
        let spec = spec_with(vec![node("a", &[]), node("b", &["a"]), node("c", &["b"])]);
        let run = submit(&fixture, &spec).await;

        let task_a = pull_task(&fixture, "tasks.Bronze").await;
        let lease = Utc::now() + chrono::Duration::seconds(60);
        fixture
            .store
            .claim_step(task_a.id, "w", 1, lease)
            .await
            .expect("claim");
        fixture
            .store
            .finish_step(&StepOutcome {
                step_id: task_a.id,
                status: StepStatus::Failed,
                attempt: 1,
                error: Some("executor_error: boom".to_string()),
                cost_cents: 0,
                tokens_prompt: 0,
                tokens_completion: 0,
                output: None,
            })
            .await
            .expect("finish");

        fixture
            .scheduler
            .on_result(&TaskResult {
                task_id: task_a.id,
                status: ResultStatus::Failed,
                error: "executor_error: boom".to_string(),
                cost_cents: 0,
                tokens_prompt: 0,
                tokens_completion: 0,
                output: Value::Null,
            })
            .await
            .expect("on_result");

        let stored = fixture.store.get_run(run.id).await.expect("get run");
        assert_eq!(stored.status, RunStatus::Failed);
        let steps = fixture.store.list_steps(run.id).await.expect("steps");
        for step in steps {
            match step.node_id.as_str() {
                "a" => assert_eq!(step.status, StepStatus::Failed),
                _ => assert_eq!(step.status, StepStatus::Canceled),
            }
        }
    }

    #[tokio::test]
    async fn continue_on_failure_dooms_subtree_but_run_succeeds() {
        let fixture = fixture();
        let mut tolerant = node("a", &[]);
        tolerant.continue_on_failure = true;
        let spec = spec_with(vec![tolerant, node("b", &["a"]), node("c", &[])]);
        let run = submit(&fixture, &spec).await;

        // both roots enqueued
        let first = pull_task(&fixture, "tasks.Bronze").await;
        let second = pull_task(&fixture, "tasks.Bronze").await;
        let (task_a, task_c) = if first.node.id == "a" {
            (first, second)
        } else {
            (second, first)
        };

        let lease = Utc::now() + chrono::Duration::seconds(60);
        fixture
            .store
            .claim_step(task_a.id, "w", 1, lease)
            .await
            .expect("claim a");
        fixture
            .store
            .finish_step(&StepOutcome {
                step_id: task_a.id,
                status: StepStatus::Failed,
                attempt: 1,
                error: Some("executor_error: flaky".to_string()),
                cost_cents: 0,
                tokens_prompt: 0,
                tokens_completion: 0,
                output: None,
            })
            .await
            .expect("finish a");
        fixture
            .scheduler
            .on_result(&TaskResult {
                task_id: task_a.id,
                status: ResultStatus::Failed,
                error: "executor_error: flaky".to_string(),
                cost_cents: 0,
                tokens_prompt: 0,
                tokens_completion: 0,
                output: Value::Null,
            })
            .await
            .expect("on_result a");

        // run is still alive, b is doomed, c keeps going
        let stored = fixture.store.get_run(run.id).await.expect("get run");
        assert_eq!(stored.status, RunStatus::Running);

        claim_and_finish(&fixture, &task_c, json!({"ok": true})).await;
        fixture
            .scheduler
            .on_result(&succeeded(task_c.id, json!({"ok": true})))
            .await
            .expect("on_result c");

        let stored = fixture.store.get_run(run.id).await.expect("get run");
        assert_eq!(stored.status, RunStatus::Succeeded);
        let steps = fixture.store.list_steps(run.id).await.expect("steps");
        let step_b = steps.iter().find(|s| s.node_id == "b").expect("b");
        assert_eq!(step_b.status, StepStatus::Canceled);
    }

    #[tokio::test]
    async fn missing_dependency_output_fails_step_and_run() {
        let fixture = fixture();
        let spec = spec_with(vec![node("a", &[]), node("b", &["a"])]);
        let run = submit(&fixture, &spec).await;

        let task_a = pull_task(&fixture, "tasks.Bronze").await;
        // terminal success but with no recorded output (GC'd)
        let lease = Utc::now() + chrono::Duration::seconds(60);
        fixture
            .store
            .claim_step(task_a.id, "w", 1, lease)
            .await
            .expect("claim");
        fixture
            .store
            .finish_step(&StepOutcome {
                step_id: task_a.id,
                status: StepStatus::Succeeded,
                attempt: 1,
                error: None,
                cost_cents: 0,
                tokens_prompt: 0,
                tokens_completion: 0,
                output: None,
            })
            .await
            .expect("finish");

        fixture
            .scheduler
            .on_result(&succeeded(task_a.id, Value::Null))
            .await
            .expect("on_result");

        let steps = fixture.store.list_steps(run.id).await.expect("steps");
        let step_b = steps.iter().find(|s| s.node_id == "b").expect("b");
        assert_eq!(step_b.status, StepStatus::Failed);
        assert!(step_b
            .error
            .as_deref()
            .unwrap_or_default()
            .starts_with(STEP_ERROR_INPUT_UNAVAILABLE));

        let stored = fixture.store.get_run(run.id).await.expect("get run");
        assert_eq!(stored.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_signal_is_idempotent_and_publishes_once() {
        let fixture = fixture();
        let spec = spec_with(vec![node("a", &[])]);
        let run = submit(&fixture, &spec).await;

        let signal = Signal {
            run_id: run.id,
            action: SignalAction::Cancel,
        };
        assert!(fixture.scheduler.on_signal(&signal).await.expect("cancel"));
        assert!(!fixture.scheduler.on_signal(&signal).await.expect("replay"));
        assert_eq!(fixture.log.outstanding(SUBJECT_SIGNALS), 1);

        let stored = fixture.store.get_run(run.id).await.expect("get run");
        assert_eq!(stored.status, RunStatus::Canceled);
        let steps = fixture.store.list_steps(run.id).await.expect("steps");
        assert!(steps
            .iter()
            .all(|step| step.status == StepStatus::Canceled));
    }

    #[tokio::test]
    async fn tier_tag_routes_tasks_to_gold_subject() {
        let fixture = fixture();
        let spec = spec_with(vec![node("a", &[])]);
        fixture.store.create_spec(&spec).await.expect("create spec");
        let mut tags = BTreeMap::new();
        tags.insert("tier".to_string(), "Gold".to_string());
        let run = WorkflowRun::new(
            spec.id,
            RunMetadata {
                tags,
                ..RunMetadata::default()
            },
        );
        fixture
            .scheduler
            .submit_run(&run, &spec)
            .await
            .expect("submit");

        assert_eq!(fixture.log.outstanding("tasks.Gold"), 1);
        assert_eq!(fixture.log.outstanding("tasks.Bronze"), 0);
    }

    #[test]
    fn build_inputs_reports_the_missing_dependency() {
        let spec = spec_with(vec![node("a", &[]), node("b", &["a"])]);
        let run = WorkflowRun::new(spec.id, RunMetadata::default());

        let mut outputs = HashMap::new();
        let err = build_inputs(&run, spec.dag.node("b").expect("b"), &outputs)
            .expect_err("missing output");
        assert_eq!(err, "a");

        outputs.insert("a".to_string(), json!({"n": 1}));
        let inputs = build_inputs(&run, spec.dag.node("b").expect("b"), &outputs)
            .expect("inputs");
        assert_eq!(inputs, json!({"a": {"n": 1}}));
    }

    #[test]
    fn deadline_prefers_node_policy() {
        let config = SchedulerConfig::default();
        let spec = spec_with(vec![node("a", &[])]);
        let run = WorkflowRun::new(spec.id, RunMetadata::default());
        let mut policy_node = node("a", &[]);
        policy_node.policy.deadline_secs = Some(120);

        let deadline = compute_deadline(&config, &run, &policy_node, 4);
        let distance = deadline - Utc::now();
        assert!(distance <= chrono::Duration::seconds(121));
        assert!(distance >= chrono::Duration::seconds(115));
    }

    #[test]
    fn deadline_splits_run_budget_with_floor() {
        let config = SchedulerConfig::default();
        let spec = spec_with(vec![node("a", &[])]);
        let mut run = WorkflowRun::new(spec.id, RunMetadata::default());
        run.metadata.deadline_at = Some(Utc::now() + chrono::Duration::seconds(400));

        // 400s across 4 outstanding steps: 100s each
        let deadline = compute_deadline(&config, &run, &node("a", &[]), 4);
        let distance = deadline - Utc::now();
        assert!(distance <= chrono::Duration::seconds(101));
        assert!(distance >= chrono::Duration::seconds(95));

        // nearly exhausted budget floors at 30s
        run.metadata.deadline_at = Some(Utc::now() + chrono::Duration::seconds(4));
        let deadline = compute_deadline(&config, &run, &node("a", &[]), 4);
        let distance = deadline - Utc::now();
        assert!(distance >= chrono::Duration::seconds(29));
    }
}
