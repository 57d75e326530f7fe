//! Postgres-backed run store.
//!
//! Every transition is a conditional `UPDATE ... WHERE status IN (...)` so
//! concurrent scheduler, worker, and monitor replicas serialize through the
//! database; `rows_affected` decides who won.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use super::{
    CancelOutcome, RunId, RunMetadata, RunStatus, RunStore, SpecId, StepOutcome, StepRun,
    StepRunId, StepStatus, StoreError, StoreResult, WorkflowRun, WorkflowSpec,
};

const SPEC_COLUMNS: &str = "id, org_id, name, version, dag_json, metadata_json, created_at";
const RUN_COLUMNS: &str =
    "id, workflow_spec_id, status, started_at, ended_at, cost_cents, metadata_json, created_at";
const STEP_COLUMNS: &str = "id, run_id, node_id, status, attempt, worker_id, lease_deadline, \
     started_at, ended_at, error, cost_cents, tokens_prompt, tokens_completion, output_json";

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and run migrations.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        Self::connect_with_pool_size(database_url, 10).await
    }

    pub async fn connect_with_pool_size(
        database_url: &str,
        max_connections: u32,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| StoreError::Message(format!("migration failed: {err}")))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn spec_from_row(row: &PgRow) -> StoreResult<WorkflowSpec> {
        let dag_json: Value = row.get("dag_json");
        let dag = serde_json::from_value(dag_json)?;
        Ok(WorkflowSpec {
            id: SpecId(row.get::<Uuid, _>("id")),
            org_id: row.get("org_id"),
            name: row.get("name"),
            version: row.get("version"),
            dag,
            metadata: row.get("metadata_json"),
            created_at: row.get("created_at"),
        })
    }

    fn run_from_row(row: &PgRow) -> StoreResult<WorkflowRun> {
        let status: String = row.get("status");
        let status = RunStatus::parse(&status)
            .ok_or_else(|| StoreError::Message(format!("unknown run status '{status}'")))?;
        let metadata_json: Value = row.get("metadata_json");
        let metadata: RunMetadata = serde_json::from_value(metadata_json)?;
        Ok(WorkflowRun {
            id: RunId(row.get::<Uuid, _>("id")),
            workflow_spec_id: SpecId(row.get::<Uuid, _>("workflow_spec_id")),
            status,
            started_at: row.get("started_at"),
            ended_at: row.get("ended_at"),
            cost_cents: row.get("cost_cents"),
            metadata,
            created_at: row.get("created_at"),
        })
    }

    fn step_from_row(row: &PgRow) -> StoreResult<StepRun> {
        let status: String = row.get("status");
        let status = StepStatus::parse(&status)
            .ok_or_else(|| StoreError::Message(format!("unknown step status '{status}'")))?;
        Ok(StepRun {
            id: StepRunId(row.get::<Uuid, _>("id")),
            run_id: RunId(row.get::<Uuid, _>("run_id")),
            node_id: row.get("node_id"),
            status,
            attempt: row.get("attempt"),
            worker_id: row.get("worker_id"),
            lease_deadline: row.get("lease_deadline"),
            started_at: row.get("started_at"),
            ended_at: row.get("ended_at"),
            error: row.get("error"),
            cost_cents: row.get("cost_cents"),
            tokens_prompt: row.get("tokens_prompt"),
            tokens_completion: row.get("tokens_completion"),
            output: row.get("output_json"),
        })
    }

    fn map_unique_violation(err: sqlx::Error, what: String) -> StoreError {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return StoreError::AlreadyExists(what);
            }
        }
        StoreError::Sqlx(err)
    }
}

#[async_trait]
impl RunStore for PostgresStore {
    // ------------------------------------------------------------------
    // Workflow specs
    // ------------------------------------------------------------------

    async fn create_spec(&self, spec: &WorkflowSpec) -> StoreResult<()> {
        let dag_json = serde_json::to_value(&spec.dag)?;
        sqlx::query(
            r#"
            INSERT INTO workflow_spec (id, org_id, name, version, dag_json, metadata_json, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(spec.id.0)
        .bind(spec.org_id)
        .bind(&spec.name)
        .bind(spec.version)
        .bind(dag_json)
        .bind(&spec.metadata)
        .bind(spec.created_at)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            Self::map_unique_violation(
                err,
                format!("workflow spec {} v{}", spec.name, spec.version),
            )
        })?;

        Ok(())
    }

    async fn get_spec(&self, name: &str, version: i32) -> StoreResult<WorkflowSpec> {
        let row = sqlx::query(&format!(
            "SELECT {SPEC_COLUMNS} FROM workflow_spec WHERE name = $1 AND version = $2"
        ))
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("workflow spec {name} v{version}")))?;

        Self::spec_from_row(&row)
    }

    async fn get_spec_by_id(&self, id: SpecId) -> StoreResult<WorkflowSpec> {
        let row = sqlx::query(&format!(
            "SELECT {SPEC_COLUMNS} FROM workflow_spec WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("workflow spec {id}")))?;

        Self::spec_from_row(&row)
    }

    async fn list_specs(&self) -> StoreResult<Vec<WorkflowSpec>> {
        let rows = sqlx::query(&format!(
            "SELECT {SPEC_COLUMNS} FROM workflow_spec ORDER BY name, version"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::spec_from_row).collect()
    }

    // ------------------------------------------------------------------
    // Workflow runs
    // ------------------------------------------------------------------

    async fn insert_run(&self, run: &WorkflowRun) -> StoreResult<()> {
        let metadata_json = serde_json::to_value(&run.metadata)?;
        sqlx::query(
            r#"
            INSERT INTO workflow_run
                (id, workflow_spec_id, status, started_at, ended_at, cost_cents, metadata_json, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(run.id.0)
        .bind(run.workflow_spec_id.0)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(run.cost_cents)
        .bind(metadata_json)
        .bind(run.created_at)
        .execute(&self.pool)
        .await
        .map_err(|err| Self::map_unique_violation(err, format!("workflow run {}", run.id)))?;

        Ok(())
    }

    async fn get_run(&self, id: RunId) -> StoreResult<WorkflowRun> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_run WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("workflow run {id}")))?;

        Self::run_from_row(&row)
    }

    async fn list_runs(&self, limit: i64) -> StoreResult<Vec<WorkflowRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_run ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::run_from_row).collect()
    }

    async fn start_run(&self, id: RunId) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_run
            SET status = 'running', started_at = NOW()
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn finish_run(&self, id: RunId, status: RunStatus) -> StoreResult<bool> {
        if !status.is_terminal() {
            return Err(StoreError::Message(format!(
                "finish_run requires a terminal status, got {status}"
            )));
        }
        let result = sqlx::query(
            r#"
            UPDATE workflow_run
            SET status = $2, ended_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id.0)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn sync_run_cost(&self, id: RunId) -> StoreResult<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE workflow_run
            SET cost_cents = COALESCE(
                (SELECT SUM(cost_cents) FROM step_run WHERE run_id = $1), 0
            )
            WHERE id = $1
            RETURNING cost_cents
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(total,)| total)
            .ok_or_else(|| StoreError::NotFound(format!("workflow run {id}")))
    }

    // ------------------------------------------------------------------
    // Step runs
    // ------------------------------------------------------------------

    async fn insert_step_runs(&self, steps: &[StepRun]) -> StoreResult<()> {
        if steps.is_empty() {
            return Ok(());
        }

        let ids: Vec<Uuid> = steps.iter().map(|step| step.id.0).collect();
        let run_ids: Vec<Uuid> = steps.iter().map(|step| step.run_id.0).collect();
        let node_ids: Vec<String> = steps.iter().map(|step| step.node_id.clone()).collect();

        sqlx::query(
            r#"
            INSERT INTO step_run (id, run_id, node_id, status)
            SELECT id, run_id, node_id, 'pending'
            FROM UNNEST($1::uuid[], $2::uuid[], $3::text[]) AS t(id, run_id, node_id)
            "#,
        )
        .bind(&ids)
        .bind(&run_ids)
        .bind(&node_ids)
        .execute(&self.pool)
        .await
        .map_err(|err| Self::map_unique_violation(err, "step run batch".to_string()))?;

        Ok(())
    }

    async fn get_step(&self, id: StepRunId) -> StoreResult<StepRun> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM step_run WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("step run {id}")))?;

        Self::step_from_row(&row)
    }

    async fn list_steps(&self, run_id: RunId) -> StoreResult<Vec<StepRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM step_run WHERE run_id = $1 ORDER BY node_id"
        ))
        .bind(run_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::step_from_row).collect()
    }

    async fn dependency_outputs(
        &self,
        run_id: RunId,
        node_ids: &[String],
    ) -> StoreResult<HashMap<String, Value>> {
        if node_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(String, Value)> = sqlx::query_as(
            r#"
            SELECT node_id, output_json
            FROM step_run
            WHERE run_id = $1 AND node_id = ANY($2) AND output_json IS NOT NULL
            "#,
        )
        .bind(run_id.0)
        .bind(node_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn mark_step_ready(&self, id: StepRunId) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_run
            SET status = 'ready'
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn claim_step(
        &self,
        id: StepRunId,
        worker_id: &str,
        attempt: i32,
        lease_deadline: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE step_run
            SET status = 'running',
                worker_id = $2,
                attempt = GREATEST(attempt, $3),
                started_at = NOW(),
                lease_deadline = $4
            WHERE id = $1 AND status = 'ready'
            "#,
        )
        .bind(id.0)
        .bind(worker_id)
        .bind(attempt)
        .bind(lease_deadline)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn finish_step(&self, outcome: &StepOutcome) -> StoreResult<bool> {
        if !outcome.status.is_terminal() {
            return Err(StoreError::Message(format!(
                "finish_step requires a terminal status, got {}",
                outcome.status
            )));
        }
        let result = sqlx::query(
            r#"
            UPDATE step_run
            SET status = $2,
                attempt = GREATEST(attempt, $3),
                ended_at = NOW(),
                error = $4,
                cost_cents = $5,
                tokens_prompt = $6,
                tokens_completion = $7,
                output_json = $8
            WHERE id = $1 AND status IN ('ready', 'running')
            "#,
        )
        .bind(outcome.step_id.0)
        .bind(outcome.status.as_str())
        .bind(outcome.attempt)
        .bind(&outcome.error)
        .bind(outcome.cost_cents)
        .bind(outcome.tokens_prompt)
        .bind(outcome.tokens_completion)
        .bind(&outcome.output)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn cancel_steps_if_pending(&self, ids: &[StepRunId]) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| id.0).collect();
        let result = sqlx::query(
            r#"
            UPDATE step_run
            SET status = 'canceled', ended_at = NOW()
            WHERE id = ANY($1) AND status = 'pending'
            "#,
        )
        .bind(&ids)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn cancel_nonterminal_steps(&self, run_id: RunId) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE step_run
            SET status = 'canceled', ended_at = NOW()
            WHERE run_id = $1 AND status IN ('pending', 'ready', 'running')
            "#,
        )
        .bind(run_id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn cancel_run(&self, id: RunId) -> StoreResult<CancelOutcome> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM workflow_run WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!("workflow run {id}")));
        }

        let run_result = sqlx::query(
            r#"
            UPDATE workflow_run
            SET status = 'canceled', ended_at = NOW()
            WHERE id = $1 AND status IN ('queued', 'running')
            "#,
        )
        .bind(id.0)
        .execute(&mut *tx)
        .await?;

        let steps_result = sqlx::query(
            r#"
            UPDATE step_run
            SET status = 'canceled', ended_at = NOW()
            WHERE run_id = $1 AND status IN ('pending', 'ready', 'running')
            "#,
        )
        .bind(id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(CancelOutcome {
            run_changed: run_result.rows_affected() == 1,
            steps_canceled: steps_result.rows_affected(),
        })
    }

    // ------------------------------------------------------------------
    // Monitor support
    // ------------------------------------------------------------------

    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<StepRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM step_run \
             WHERE status = 'running' AND lease_deadline < $1 \
             ORDER BY lease_deadline LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::step_from_row).collect()
    }

    async fn redrive_expired_step(
        &self,
        id: StepRunId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<i32>> {
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE step_run
            SET status = 'ready',
                attempt = attempt + 1,
                worker_id = NULL,
                lease_deadline = NULL
            WHERE id = $1 AND status = 'running' AND lease_deadline < $2
            RETURNING attempt
            "#,
        )
        .bind(id.0)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(attempt,)| attempt))
    }

    async fn redrive_worker_step(
        &self,
        id: StepRunId,
        worker_id: &str,
    ) -> StoreResult<Option<i32>> {
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE step_run
            SET status = 'ready',
                attempt = attempt + 1,
                worker_id = NULL,
                lease_deadline = NULL
            WHERE id = $1 AND status = 'running' AND worker_id = $2
            RETURNING attempt
            "#,
        )
        .bind(id.0)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(attempt,)| attempt))
    }

    async fn record_worker_heartbeat(
        &self,
        worker_id: &str,
        status: &str,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO worker_heartbeat (worker_id, status, last_seen_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (worker_id) DO UPDATE SET
                status = EXCLUDED.status,
                last_seen_at = GREATEST(worker_heartbeat.last_seen_at, EXCLUDED.last_seen_at)
            "#,
        )
        .bind(worker_id)
        .bind(status)
        .bind(seen_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn stale_workers(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT worker_id FROM worker_heartbeat
            WHERE last_seen_at < $1
            ORDER BY worker_id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(worker_id,)| worker_id).collect())
    }

    async fn steps_running_on(&self, worker_id: &str) -> StoreResult<Vec<StepRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM step_run \
             WHERE status = 'running' AND worker_id = $1"
        ))
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::step_from_row).collect()
    }
}
