//! Pull-based worker: leases tasks off the tiered queues and executes them.
//!
//! Each delivery runs end-to-end in its own task: claim the step row, drive
//! the executor with bounded retries under the task deadline, persist the
//! terminal outcome, publish the result, and only then ack the delivery. A
//! crash anywhere before the ack leaves the message to redeliver; the claim
//! CAS and the terminal CAS make the redelivery converge instead of double-
//! executing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dag::Tier;
use crate::error::{
    Result, STEP_ERROR_DEADLINE, STEP_ERROR_EXECUTOR, STEP_ERROR_NO_EXECUTOR,
};
use crate::executor::{ExecutionOutput, ExecutorSet};
use crate::log::{Delivery, DurableLog};
use crate::messages::{
    Heartbeat, ResultStatus, Task, TaskResult, SUBJECT_HEARTBEATS, SUBJECT_RESULTS,
};
use crate::store::{RunId, RunStatus, RunStore, StepOutcome, StepRun, StepStatus, StoreError};

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Tiers this worker subscribes to, in priority order.
    pub tiers: Vec<Tier>,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_concurrent: usize,
    /// Claim duration on a step row; expiry hands the step to the monitor.
    pub lease_ttl: Duration,
    pub heartbeat_interval: Duration,
    /// Hard cap on a single task, regardless of its own deadline.
    pub max_task_runtime: Duration,
    /// How often an executing task checks for run cancellation.
    pub cancel_poll_interval: Duration,
    /// How long shutdown waits for in-flight tasks to settle.
    pub drain_grace: Duration,
    /// Attempt cap applied when a node's policy does not provide one.
    pub default_max_retries: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tiers: Tier::all().to_vec(),
            poll_interval: Duration::from_millis(100),
            batch_size: 16,
            max_concurrent: num_cpus::get().max(1) * 2,
            lease_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            max_task_runtime: Duration::from_secs(600),
            cancel_poll_interval: Duration::from_secs(2),
            drain_grace: Duration::from_secs(30),
            default_max_retries: 3,
        }
    }
}

enum ExecOutcome {
    Success(ExecutionOutput),
    Failure(String),
    Canceled,
}

pub struct Worker {
    id: String,
    store: Arc<dyn RunStore>,
    log: Arc<dyn DurableLog>,
    executors: ExecutorSet,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        store: Arc<dyn RunStore>,
        log: Arc<dyn DurableLog>,
        executors: ExecutorSet,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: format!("worker-{}", Uuid::new_v4()),
            store,
            log,
            executors,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Spawn the pull and heartbeat loops. The returned handle owns them.
    pub fn start(self) -> WorkerHandle {
        let worker = Arc::new(self);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(worker.config.max_concurrent.max(1)));

        let pull_handle = tokio::spawn(Self::pull_loop(
            worker.clone(),
            shutdown_rx.clone(),
            semaphore.clone(),
        ));
        let heartbeat_handle = tokio::spawn(Self::heartbeat_loop(worker.clone(), shutdown_rx));

        info!(worker_id = %worker.id, tiers = ?worker.config.tiers, "worker started");

        WorkerHandle {
            worker,
            shutdown_tx,
            pull_handle,
            heartbeat_handle,
        }
    }

    // ------------------------------------------------------------------
    // Loops
    // ------------------------------------------------------------------

    async fn pull_loop(
        worker: Arc<Worker>,
        mut shutdown_rx: watch::Receiver<bool>,
        semaphore: Arc<Semaphore>,
    ) {
        let subjects: Vec<String> = worker.config.tiers.iter().map(Tier::subject).collect();
        let mut ticker = interval(worker.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let available = semaphore.available_permits();
                    if available == 0 {
                        continue;
                    }
                    let max = available.min(worker.config.batch_size.max(1));
                    let deliveries = match worker
                        .log
                        .pull(&worker.id, &subjects, max, worker.config.lease_ttl)
                        .await
                    {
                        Ok(deliveries) => deliveries,
                        Err(err) => {
                            metrics::counter!("agentflow_worker_errors_total").increment(1);
                            error!(?err, worker_id = %worker.id, "task pull failed");
                            continue;
                        }
                    };
                    for delivery in deliveries {
                        let Ok(permit) = semaphore.clone().acquire_owned().await else {
                            return;
                        };
                        let worker = worker.clone();
                        tokio::spawn(async move {
                            worker.handle_delivery(delivery).await;
                            drop(permit);
                        });
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_ok() && *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        // Drain in-flight tasks up to the grace period.
        let expected = worker.config.max_concurrent.max(1);
        let deadline = tokio::time::Instant::now() + worker.config.drain_grace;
        while semaphore.available_permits() < expected
            && tokio::time::Instant::now() < deadline
        {
            sleep(Duration::from_millis(20)).await;
        }
        info!(worker_id = %worker.id, "worker pull loop stopped");
    }

    async fn heartbeat_loop(worker: Arc<Worker>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(worker.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // first tick fires immediately, announcing the worker
                    let heartbeat = Heartbeat {
                        worker_id: worker.id.clone(),
                        timestamp: Utc::now(),
                        status: "healthy".to_string(),
                    };
                    match serde_json::to_vec(&heartbeat) {
                        Ok(payload) => {
                            if let Err(err) =
                                worker.log.publish(SUBJECT_HEARTBEATS, &payload).await
                            {
                                warn!(?err, worker_id = %worker.id, "heartbeat publish failed");
                            }
                        }
                        Err(err) => warn!(?err, "heartbeat serialization failed"),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_ok() && *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Per-delivery processing
    // ------------------------------------------------------------------

    async fn handle_delivery(&self, delivery: Delivery) {
        let task: Task = match serde_json::from_slice(&delivery.payload) {
            Ok(task) => task,
            Err(err) => {
                warn!(?err, subject = %delivery.subject, "undecodable task message");
                if let Err(err) = self.log.nak(&delivery, Duration::from_secs(30)).await {
                    error!(?err, "nak failed");
                }
                return;
            }
        };

        match self.process_task(&task).await {
            Ok(()) => {
                if let Err(err) = self.log.ack(&delivery).await {
                    error!(?err, task_id = %task.id, "ack failed");
                }
            }
            Err(err) => {
                metrics::counter!("agentflow_worker_errors_total").increment(1);
                warn!(?err, task_id = %task.id, "task processing hit a transient error, requeueing");
                if let Err(err) = self.log.nak(&delivery, Duration::from_secs(5)).await {
                    error!(?err, "nak failed");
                }
            }
        }
    }

    /// Run one task delivery to a settled state. `Ok` means the delivery can
    /// be acked; `Err` means a store/log failure that redelivery may cure.
    pub async fn process_task(&self, task: &Task) -> Result<()> {
        let now = Utc::now();
        let lease_deadline = now
            + chrono::Duration::from_std(self.config.lease_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let claimed = self
            .store
            .claim_step(task.id, &self.id, task.attempt, lease_deadline)
            .await?;
        if !claimed {
            return self.settle_duplicate(task).await;
        }

        metrics::counter!("agentflow_tasks_claimed_total").increment(1);
        debug!(
            worker_id = %self.id,
            task_id = %task.id,
            node = %task.node.id,
            attempt = task.attempt,
            "task claimed"
        );

        let deadline = effective_deadline(task.deadline_at, now, self.config.max_task_runtime);
        let (exec, attempts) = self.execute_with_retries(task, deadline).await;
        let final_attempt = task.attempt + (attempts - 1).max(0);

        let (outcome, result) = match exec {
            ExecOutcome::Canceled => {
                // The cancel sweep usually gets to the row first; this CAS
                // covers a worker that noticed before the scheduler did.
                self.store
                    .finish_step(&StepOutcome {
                        step_id: task.id,
                        status: StepStatus::Canceled,
                        attempt: final_attempt,
                        error: Some("canceled".to_string()),
                        cost_cents: 0,
                        tokens_prompt: 0,
                        tokens_completion: 0,
                        output: None,
                    })
                    .await?;
                info!(task_id = %task.id, "task abandoned after run cancellation");
                return Ok(());
            }
            ExecOutcome::Success(output) => {
                metrics::counter!("agentflow_tasks_succeeded_total").increment(1);
                let outcome = StepOutcome {
                    step_id: task.id,
                    status: StepStatus::Succeeded,
                    attempt: final_attempt,
                    error: None,
                    cost_cents: output.cost_cents,
                    tokens_prompt: output.tokens_prompt,
                    tokens_completion: output.tokens_completion,
                    output: Some(output.output.clone()),
                };
                let result = TaskResult {
                    task_id: task.id,
                    status: ResultStatus::Succeeded,
                    error: String::new(),
                    cost_cents: output.cost_cents,
                    tokens_prompt: output.tokens_prompt,
                    tokens_completion: output.tokens_completion,
                    output: output.output,
                };
                (outcome, result)
            }
            ExecOutcome::Failure(error) => {
                metrics::counter!("agentflow_tasks_failed_total").increment(1);
                let outcome = StepOutcome {
                    step_id: task.id,
                    status: StepStatus::Failed,
                    attempt: final_attempt,
                    error: Some(error.clone()),
                    cost_cents: 0,
                    tokens_prompt: 0,
                    tokens_completion: 0,
                    output: None,
                };
                let result = TaskResult {
                    task_id: task.id,
                    status: ResultStatus::Failed,
                    error,
                    cost_cents: 0,
                    tokens_prompt: 0,
                    tokens_completion: 0,
                    output: Value::Null,
                };
                (outcome, result)
            }
        };

        let changed = self.store.finish_step(&outcome).await?;
        if changed {
            // Publish before acking; a crash in between redelivers the task
            // and the duplicate path below republishes the recorded outcome.
            self.publish_result(&result).await?;
            return Ok(());
        }

        // Lost the terminal CAS: the row was canceled under us or another
        // delivery finished first.
        self.settle_duplicate(task).await
    }

    /// Handle a delivery whose claim or terminal CAS lost: republish the
    /// recorded outcome when the step is settled, otherwise just ack.
    async fn settle_duplicate(&self, task: &Task) -> Result<()> {
        let step = match self.store.get_step(task.id).await {
            Ok(step) => step,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        match step.status {
            StepStatus::Succeeded | StepStatus::Failed => {
                let result = result_from_step(&step);
                self.publish_result(&result).await?;
                debug!(task_id = %task.id, "republished recorded outcome for duplicate delivery");
                Ok(())
            }
            _ => {
                debug!(
                    task_id = %task.id,
                    status = %step.status,
                    "duplicate delivery dropped"
                );
                Ok(())
            }
        }
    }

    async fn publish_result(&self, result: &TaskResult) -> Result<()> {
        let payload = serde_json::to_vec(result)?;
        self.log.publish(SUBJECT_RESULTS, &payload).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Retry loop
    // ------------------------------------------------------------------

    /// Drive the executor for up to `max_retries` attempts under `deadline`,
    /// racing every attempt and backoff sleep against run cancellation.
    /// Returns the outcome and the number of attempts consumed.
    async fn execute_with_retries(
        &self,
        task: &Task,
        deadline: DateTime<Utc>,
    ) -> (ExecOutcome, i32) {
        let Some(executor) = self.executors.get(task.node.node_type) else {
            return (
                ExecOutcome::Failure(format!(
                    "{STEP_ERROR_NO_EXECUTOR}: no executor registered for node type {}",
                    task.node.node_type
                )),
                1,
            );
        };

        let max_retries = if task.node.policy.max_retries > 0 {
            task.node.policy.max_retries
        } else {
            self.config.default_max_retries.max(1)
        };
        let mut last_error = String::new();

        for attempt in 1..=max_retries {
            if self.run_canceled(task.run_id).await {
                return (ExecOutcome::Canceled, attempt);
            }

            let now = Utc::now();
            let Ok(remaining) = (deadline - now).to_std() else {
                return (
                    ExecOutcome::Failure(deadline_error(attempt - 1, &last_error)),
                    attempt,
                );
            };

            let attempt_result = tokio::select! {
                result = executor.execute(task) => Some(result),
                _ = sleep(remaining) => None,
                _ = self.wait_for_cancel(task.run_id) => {
                    return (ExecOutcome::Canceled, attempt);
                }
            };

            match attempt_result {
                Some(Ok(output)) => return (ExecOutcome::Success(output), attempt),
                Some(Err(err)) => {
                    last_error = format!("{STEP_ERROR_EXECUTOR}: {err}");
                    debug!(
                        task_id = %task.id,
                        attempt,
                        error = %last_error,
                        "execution attempt failed"
                    );
                }
                None => {
                    return (
                        ExecOutcome::Failure(deadline_error(attempt, &last_error)),
                        attempt,
                    );
                }
            }

            if attempt < max_retries {
                let backoff = task.node.policy.backoff.delay(attempt);
                let now = Utc::now();
                let remaining = (deadline - now).to_std().unwrap_or_default();
                if backoff >= remaining {
                    return (
                        ExecOutcome::Failure(deadline_error(attempt, &last_error)),
                        attempt,
                    );
                }
                tokio::select! {
                    _ = sleep(backoff) => {}
                    _ = self.wait_for_cancel(task.run_id) => {
                        return (ExecOutcome::Canceled, attempt);
                    }
                }
            }
        }

        (
            ExecOutcome::Failure(format!(
                "task failed after {max_retries} attempts: {last_error}"
            )),
            max_retries,
        )
    }

    async fn run_canceled(&self, run_id: RunId) -> bool {
        match self.store.get_run(run_id).await {
            Ok(run) => run.status == RunStatus::Canceled,
            Err(_) => false,
        }
    }

    /// Resolves only once the run is canceled; dropped by the select arms
    /// otherwise.
    async fn wait_for_cancel(&self, run_id: RunId) {
        loop {
            sleep(self.config.cancel_poll_interval).await;
            if self.run_canceled(run_id).await {
                return;
            }
        }
    }
}

fn effective_deadline(
    task_deadline: DateTime<Utc>,
    now: DateTime<Utc>,
    max_runtime: Duration,
) -> DateTime<Utc> {
    let cap = now
        + chrono::Duration::from_std(max_runtime)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
    task_deadline.min(cap)
}

fn deadline_error(attempts: i32, last_error: &str) -> String {
    if last_error.is_empty() {
        format!("{STEP_ERROR_DEADLINE}: deadline elapsed after {attempts} attempts")
    } else {
        format!(
            "{STEP_ERROR_DEADLINE}: deadline elapsed after {attempts} attempts; last error: {last_error}"
        )
    }
}

fn result_from_step(step: &StepRun) -> TaskResult {
    TaskResult {
        task_id: step.id,
        status: if step.status == StepStatus::Succeeded {
            ResultStatus::Succeeded
        } else {
            ResultStatus::Failed
        },
        error: step.error.clone().unwrap_or_default(),
        cost_cents: step.cost_cents,
        tokens_prompt: step.tokens_prompt,
        tokens_completion: step.tokens_completion,
        output: step.output.clone().unwrap_or(Value::Null),
    }
}

/// Running worker loops; dropping the handle aborts nothing, call
/// [`WorkerHandle::shutdown`] to drain and stop.
pub struct WorkerHandle {
    worker: Arc<Worker>,
    shutdown_tx: watch::Sender<bool>,
    pull_handle: JoinHandle<()>,
    heartbeat_handle: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker.id
    }

    /// Stop new deliveries, drain in-flight work up to the grace period,
    /// then stop the heartbeat.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.pull_handle.await;
        let _ = self.heartbeat_handle.await;
        info!(worker_id = %self.worker.id, "worker shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;
    use crate::dag::{NodeDef, NodePolicy, NodeType};
    use crate::executor::{ExecutorError, FunctionExecutor};
    use crate::log::MemoryLog;
    use crate::retry::BackoffPolicy;
    use crate::store::{MemoryStore, StepRunId};

    struct Fixture {
        store: Arc<MemoryStore>,
        log: Arc<MemoryLog>,
        worker: Worker,
    }

    fn fixture_with(functions: FunctionExecutor) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let log = Arc::new(MemoryLog::new());
        let mut executors = ExecutorSet::new();
        executors.register(NodeType::Function, Arc::new(functions));
        let worker = Worker::new(
            store.clone(),
            log.clone(),
            executors,
            WorkerConfig {
                cancel_poll_interval: Duration::from_millis(20),
                ..WorkerConfig::default()
            },
        );
        Fixture { store, log, worker }
    }

    async fn ready_step(store: &MemoryStore) -> (RunId, StepRunId) {
        let run_id = RunId::new();
        let step = crate::store::StepRun::pending(run_id, "a");
        store.insert_step_runs(&[step.clone()]).await.expect("insert");
        store.mark_step_ready(step.id).await.expect("ready");
        (run_id, step.id)
    }

    fn task_for(
        run_id: RunId,
        step_id: StepRunId,
        params: Value,
        policy: NodePolicy,
    ) -> Task {
        Task {
            id: step_id,
            run_id,
            node: NodeDef {
                id: "a".to_string(),
                node_type: NodeType::Function,
                dependencies: vec![],
                policy,
                params,
                continue_on_failure: false,
            },
            inputs: json!({"inputs": null}),
            attempt: 1,
            deadline_at: Utc::now() + chrono::Duration::seconds(30),
        }
    }

    #[tokio::test]
    async fn happy_path_persists_and_publishes() {
        let mut functions = FunctionExecutor::new();
        functions.register("ok", |_| Box::pin(async { Ok(json!({"ok": true})) }));
        let fixture = fixture_with(functions);
        let (run_id, step_id) = ready_step(&fixture.store).await;

        let task = task_for(run_id, step_id, json!({"function": "ok"}), NodePolicy::default());
        fixture.worker.process_task(&task).await.expect("process");

        let step = fixture.store.get_step(step_id).await.expect("step");
        assert_eq!(step.status, StepStatus::Succeeded);
        assert_eq!(step.attempt, 1);
        assert_eq!(step.output, Some(json!({"ok": true})));
        assert!(step.ended_at.is_some());

        assert_eq!(fixture.log.outstanding(SUBJECT_RESULTS), 1);
    }

    #[tokio::test]
    async fn retries_until_success_and_counts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let mut functions = FunctionExecutor::new();
        functions.register("flaky", move |_| {
            let seen = seen.clone();
            Box::pin(async move {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ExecutorError::new("transient fault"))
                } else {
                    Ok(json!({"ok": true}))
                }
            })
        });
        let fixture = fixture_with(functions);
        let (run_id, step_id) = ready_step(&fixture.store).await;

        let policy = NodePolicy {
            max_retries: 3,
            backoff: BackoffPolicy::None,
            ..NodePolicy::default()
        };
        let task = task_for(run_id, step_id, json!({"function": "flaky"}), policy);
        fixture.worker.process_task(&task).await.expect("process");

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let step = fixture.store.get_step(step_id).await.expect("step");
        assert_eq!(step.status, StepStatus::Succeeded);
        assert_eq!(step.attempt, 3);
        assert_eq!(fixture.log.outstanding(SUBJECT_RESULTS), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_step() {
        let mut functions = FunctionExecutor::new();
        functions.register("broken", |_| {
            Box::pin(async { Err(ExecutorError::new("always down")) })
        });
        let fixture = fixture_with(functions);
        let (run_id, step_id) = ready_step(&fixture.store).await;

        let policy = NodePolicy {
            max_retries: 2,
            backoff: BackoffPolicy::None,
            ..NodePolicy::default()
        };
        let task = task_for(run_id, step_id, json!({"function": "broken"}), policy);
        fixture.worker.process_task(&task).await.expect("process");

        let step = fixture.store.get_step(step_id).await.expect("step");
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.attempt, 2);
        let error = step.error.expect("error");
        assert!(error.contains("after 2 attempts"));
        assert!(error.contains("always down"));
    }

    #[tokio::test]
    async fn missing_executor_fails_without_retrying() {
        let fixture = fixture_with(FunctionExecutor::new());
        let (run_id, step_id) = ready_step(&fixture.store).await;

        let mut task = task_for(run_id, step_id, json!({}), NodePolicy::default());
        task.node.node_type = NodeType::Llm;
        fixture.worker.process_task(&task).await.expect("process");

        let step = fixture.store.get_step(step_id).await.expect("step");
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step
            .error
            .expect("error")
            .starts_with(STEP_ERROR_NO_EXECUTOR));
        assert_eq!(fixture.log.outstanding(SUBJECT_RESULTS), 1);
    }

    #[tokio::test]
    async fn duplicate_delivery_republishes_recorded_outcome() {
        let mut functions = FunctionExecutor::new();
        functions.register("ok", |_| Box::pin(async { Ok(json!({"ok": true})) }));
        let fixture = fixture_with(functions);
        let (run_id, step_id) = ready_step(&fixture.store).await;

        let task = task_for(run_id, step_id, json!({"function": "ok"}), NodePolicy::default());
        fixture.worker.process_task(&task).await.expect("first");
        fixture.worker.process_task(&task).await.expect("duplicate");

        let step = fixture.store.get_step(step_id).await.expect("step");
        assert_eq!(step.status, StepStatus::Succeeded);
        assert_eq!(step.attempt, 1, "duplicate must not re-execute");
        // one result per delivery; the scheduler dedupes via its CAS
        assert_eq!(fixture.log.outstanding(SUBJECT_RESULTS), 2);
    }

    #[tokio::test]
    async fn task_deadline_bounds_execution() {
        let mut functions = FunctionExecutor::new();
        functions.register("slow", |_| {
            Box::pin(async {
                sleep(Duration::from_secs(60)).await;
                Ok(json!({"ok": true}))
            })
        });
        let fixture = fixture_with(functions);
        let (run_id, step_id) = ready_step(&fixture.store).await;

        let mut task = task_for(
            run_id,
            step_id,
            json!({"function": "slow"}),
            NodePolicy {
                max_retries: 1,
                ..NodePolicy::default()
            },
        );
        task.deadline_at = Utc::now() + chrono::Duration::milliseconds(50);
        fixture.worker.process_task(&task).await.expect("process");

        let step = fixture.store.get_step(step_id).await.expect("step");
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.error.expect("error").starts_with(STEP_ERROR_DEADLINE));
    }
}
