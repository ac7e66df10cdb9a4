// PostgreSQL implementation of the state store

//! # PostgreSQL State Store
//!
//! Production [`StateStore`] backed by a `sqlx` connection pool. Every update
//! is an explicit compare-and-swap:
//!
//! ```sql
//! UPDATE action SET ..., version = version + 1 WHERE id = $1 AND version = $2
//! ```
//!
//! and zero affected rows becomes
//! [`SchedulerError::ConditionalUpdateFailed`]. Mutex rows use the same idea
//! keyed on `state = 'READY'`.
//!
//! The pool is created once at process start ([`PostgresStateStore::connect`])
//! and closed at shutdown ([`PostgresStateStore::close`]); there is no global
//! session.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::info;

use super::storage::{ActionFilter, StateStore};
use crate::models::{
    Action, ActionState, Datastore, MutexRecord, MutexState, Workflow, WorkflowInstance,
};
use crate::{Result, SchedulerError};

/// Tables used by the scheduler. Each statement is idempotent.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS datastore (
        id TEXT PRIMARY KEY,
        version BIGINT NOT NULL DEFAULT 0,
        name TEXT NOT NULL,
        engine_name TEXT NOT NULL,
        concurrency INTEGER NOT NULL,
        state TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow (
        id TEXT PRIMARY KEY,
        version BIGINT NOT NULL DEFAULT 0,
        name TEXT NOT NULL,
        datastore_id TEXT NOT NULL,
        state TEXT NOT NULL,
        on_failure TEXT NOT NULL,
        retries_on_failures INTEGER NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_instance (
        id TEXT PRIMARY KEY,
        version BIGINT NOT NULL DEFAULT 0,
        workflow_id TEXT NOT NULL,
        datastore_id TEXT NOT NULL,
        state TEXT NOT NULL,
        retry_num INTEGER NOT NULL DEFAULT 0,
        start_time TIMESTAMPTZ,
        end_time TIMESTAMPTZ,
        error_message TEXT,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS action (
        id TEXT PRIMARY KEY,
        version BIGINT NOT NULL DEFAULT 0,
        name TEXT NOT NULL,
        state TEXT NOT NULL,
        order_idx INTEGER NOT NULL,
        parallelization_idx INTEGER,
        on_failure TEXT NOT NULL,
        engine_name TEXT NOT NULL,
        batch_job_id TEXT,
        workflow_id TEXT,
        workflow_instance_id TEXT,
        workflow_action_id TEXT,
        datastore_id TEXT NOT NULL,
        first_in_workflow BOOLEAN NOT NULL DEFAULT FALSE,
        last_in_workflow BOOLEAN NOT NULL DEFAULT FALSE,
        retries_on_failures INTEGER NOT NULL DEFAULT 0,
        queued_time TIMESTAMPTZ,
        start_time TIMESTAMPTZ,
        end_time TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
        error_message TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS action_state_datastore_idx ON action (state, datastore_id)",
    "CREATE INDEX IF NOT EXISTS action_instance_idx ON action (workflow_instance_id)",
    r#"
    CREATE TABLE IF NOT EXISTS mutex (
        name TEXT PRIMARY KEY,
        state TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
];

const ACTION_COLUMNS: &str = "id, version, name, state, order_idx, parallelization_idx, on_failure, \
     engine_name, batch_job_id, workflow_id, workflow_instance_id, workflow_action_id, datastore_id, \
     first_in_workflow, last_in_workflow, retries_on_failures, queued_time, start_time, end_time, \
     updated_at, error_message";

#[derive(Debug, FromRow)]
struct ActionRow {
    id: String,
    version: i64,
    name: String,
    state: String,
    order_idx: i32,
    parallelization_idx: Option<i32>,
    on_failure: String,
    engine_name: String,
    batch_job_id: Option<String>,
    workflow_id: Option<String>,
    workflow_instance_id: Option<String>,
    workflow_action_id: Option<String>,
    datastore_id: String,
    first_in_workflow: bool,
    last_in_workflow: bool,
    retries_on_failures: i32,
    queued_time: Option<DateTime<Utc>>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    error_message: Option<String>,
}

impl TryFrom<ActionRow> for Action {
    type Error = SchedulerError;

    fn try_from(row: ActionRow) -> Result<Self> {
        Ok(Action {
            id: row.id,
            version: row.version,
            name: row.name,
            state: row.state.parse()?,
            order_idx: row.order_idx,
            parallelization_idx: row.parallelization_idx,
            on_failure: row.on_failure.parse()?,
            engine_name: row.engine_name,
            batch_job_id: row.batch_job_id,
            workflow_id: row.workflow_id,
            workflow_instance_id: row.workflow_instance_id,
            workflow_action_id: row.workflow_action_id,
            datastore_id: row.datastore_id,
            first_in_workflow: row.first_in_workflow,
            last_in_workflow: row.last_in_workflow,
            retries_on_failures: to_u32(row.retries_on_failures),
            queued_time: row.queued_time,
            start_time: row.start_time,
            end_time: row.end_time,
            updated_at: row.updated_at,
            error_message: row.error_message,
        })
    }
}

#[derive(Debug, FromRow)]
struct WorkflowRow {
    id: String,
    version: i64,
    name: String,
    datastore_id: String,
    state: String,
    on_failure: String,
    retries_on_failures: i32,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WorkflowRow> for Workflow {
    type Error = SchedulerError;

    fn try_from(row: WorkflowRow) -> Result<Self> {
        Ok(Workflow {
            id: row.id,
            version: row.version,
            name: row.name,
            datastore_id: row.datastore_id,
            state: row.state.parse()?,
            on_failure: row.on_failure.parse()?,
            retries_on_failures: to_u32(row.retries_on_failures),
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct WorkflowInstanceRow {
    id: String,
    version: i64,
    workflow_id: String,
    datastore_id: String,
    state: String,
    retry_num: i32,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    error_message: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WorkflowInstanceRow> for WorkflowInstance {
    type Error = SchedulerError;

    fn try_from(row: WorkflowInstanceRow) -> Result<Self> {
        Ok(WorkflowInstance {
            id: row.id,
            version: row.version,
            workflow_id: row.workflow_id,
            datastore_id: row.datastore_id,
            state: row.state.parse()?,
            retry_num: to_u32(row.retry_num),
            start_time: row.start_time,
            end_time: row.end_time,
            error_message: row.error_message,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct DatastoreRow {
    id: String,
    version: i64,
    name: String,
    engine_name: String,
    concurrency: i32,
    state: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DatastoreRow> for Datastore {
    type Error = SchedulerError;

    fn try_from(row: DatastoreRow) -> Result<Self> {
        Ok(Datastore {
            id: row.id,
            version: row.version,
            name: row.name,
            engine_name: row.engine_name,
            concurrency: to_u32(row.concurrency),
            state: row.state.parse()?,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct MutexRow {
    name: String,
    state: String,
    updated_at: DateTime<Utc>,
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Fail with a conditional-update error unless exactly one row changed
fn expect_one_row(rows_affected: u64, entity: &'static str, id: &str) -> Result<()> {
    if rows_affected == 0 {
        return Err(SchedulerError::conditional(entity, id));
    }
    Ok(())
}

/// PostgreSQL-backed state store
#[derive(Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create the scheduler tables if they are missing
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("State store schema is up to date");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl StateStore for PostgresStateStore {
    async fn create_action(&self, action: Action) -> Result<Action> {
        sqlx::query(&format!(
            "INSERT INTO action ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)",
            ACTION_COLUMNS
        ))
        .bind(&action.id)
        .bind(action.version)
        .bind(&action.name)
        .bind(action.state.as_str())
        .bind(action.order_idx)
        .bind(action.parallelization_idx)
        .bind(action.on_failure.as_str())
        .bind(&action.engine_name)
        .bind(&action.batch_job_id)
        .bind(&action.workflow_id)
        .bind(&action.workflow_instance_id)
        .bind(&action.workflow_action_id)
        .bind(&action.datastore_id)
        .bind(action.first_in_workflow)
        .bind(action.last_in_workflow)
        .bind(to_i32(action.retries_on_failures))
        .bind(action.queued_time)
        .bind(action.start_time)
        .bind(action.end_time)
        .bind(action.updated_at)
        .bind(&action.error_message)
        .execute(&self.pool)
        .await?;
        Ok(action)
    }

    async fn get_action(&self, id: &str) -> Result<Option<Action>> {
        let row: Option<ActionRow> =
            sqlx::query_as(&format!("SELECT {} FROM action WHERE id = $1", ACTION_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Action::try_from).transpose()
    }

    async fn find_actions(&self, filter: &ActionFilter) -> Result<Vec<Action>> {
        let states: Vec<String> = filter.states.iter().map(|s| s.as_str().to_string()).collect();
        let rows: Vec<ActionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM action \
             WHERE (cardinality($1::text[]) = 0 OR state = ANY($1)) \
               AND ($2::text IS NULL OR datastore_id = $2) \
               AND ($3::text IS NULL OR workflow_id = $3) \
               AND ($4::text IS NULL OR workflow_instance_id = $4) \
             ORDER BY order_idx, id",
            ACTION_COLUMNS
        ))
        .bind(&states)
        .bind(&filter.datastore_id)
        .bind(&filter.workflow_id)
        .bind(&filter.workflow_instance_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Action::try_from).collect()
    }

    async fn count_actions(&self, datastore_id: &str, states: &[ActionState]) -> Result<u64> {
        let states: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM action WHERE datastore_id = $1 AND state = ANY($2)")
                .bind(datastore_id)
                .bind(&states)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn find_stale_pending_actions(&self, older_than: DateTime<Utc>) -> Result<Vec<Action>> {
        let rows: Vec<ActionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM action WHERE state = $1 AND updated_at < $2 ORDER BY updated_at",
            ACTION_COLUMNS
        ))
        .bind(ActionState::Pending.as_str())
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Action::try_from).collect()
    }

    async fn update_action(&self, action: &Action) -> Result<Action> {
        let result = sqlx::query(
            r#"
            UPDATE action
            SET version = version + 1,
                name = $3,
                state = $4,
                order_idx = $5,
                parallelization_idx = $6,
                on_failure = $7,
                engine_name = $8,
                batch_job_id = $9,
                workflow_id = $10,
                workflow_instance_id = $11,
                workflow_action_id = $12,
                datastore_id = $13,
                first_in_workflow = $14,
                last_in_workflow = $15,
                retries_on_failures = $16,
                queued_time = $17,
                start_time = $18,
                end_time = $19,
                updated_at = $20,
                error_message = $21
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(&action.id)
        .bind(action.version)
        .bind(&action.name)
        .bind(action.state.as_str())
        .bind(action.order_idx)
        .bind(action.parallelization_idx)
        .bind(action.on_failure.as_str())
        .bind(&action.engine_name)
        .bind(&action.batch_job_id)
        .bind(&action.workflow_id)
        .bind(&action.workflow_instance_id)
        .bind(&action.workflow_action_id)
        .bind(&action.datastore_id)
        .bind(action.first_in_workflow)
        .bind(action.last_in_workflow)
        .bind(to_i32(action.retries_on_failures))
        .bind(action.queued_time)
        .bind(action.start_time)
        .bind(action.end_time)
        .bind(action.updated_at)
        .bind(&action.error_message)
        .execute(&self.pool)
        .await?;

        expect_one_row(result.rows_affected(), "action", &action.id)?;
        let mut stored = action.clone();
        stored.version += 1;
        Ok(stored)
    }

    async fn create_workflow(&self, workflow: Workflow) -> Result<Workflow> {
        sqlx::query(
            "INSERT INTO workflow (id, version, name, datastore_id, state, on_failure, retries_on_failures, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&workflow.id)
        .bind(workflow.version)
        .bind(&workflow.name)
        .bind(&workflow.datastore_id)
        .bind(workflow.state.as_str())
        .bind(workflow.on_failure.as_str())
        .bind(to_i32(workflow.retries_on_failures))
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(workflow)
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let row: Option<WorkflowRow> = sqlx::query_as(
            "SELECT id, version, name, datastore_id, state, on_failure, retries_on_failures, updated_at \
             FROM workflow WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Workflow::try_from).transpose()
    }

    async fn update_workflow(&self, workflow: &Workflow) -> Result<Workflow> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE workflow SET version = version + 1, name = $3, datastore_id = $4, state = $5, \
             on_failure = $6, retries_on_failures = $7, updated_at = $8 \
             WHERE id = $1 AND version = $2",
        )
        .bind(&workflow.id)
        .bind(workflow.version)
        .bind(&workflow.name)
        .bind(&workflow.datastore_id)
        .bind(workflow.state.as_str())
        .bind(workflow.on_failure.as_str())
        .bind(to_i32(workflow.retries_on_failures))
        .bind(now)
        .execute(&self.pool)
        .await?;

        expect_one_row(result.rows_affected(), "workflow", &workflow.id)?;
        let mut stored = workflow.clone();
        stored.version += 1;
        stored.updated_at = now;
        Ok(stored)
    }

    async fn create_workflow_instance(&self, instance: WorkflowInstance) -> Result<WorkflowInstance> {
        sqlx::query(
            "INSERT INTO workflow_instance (id, version, workflow_id, datastore_id, state, retry_num, \
             start_time, end_time, error_message, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&instance.id)
        .bind(instance.version)
        .bind(&instance.workflow_id)
        .bind(&instance.datastore_id)
        .bind(instance.state.as_str())
        .bind(to_i32(instance.retry_num))
        .bind(instance.start_time)
        .bind(instance.end_time)
        .bind(&instance.error_message)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(instance)
    }

    async fn get_workflow_instance(&self, id: &str) -> Result<Option<WorkflowInstance>> {
        let row: Option<WorkflowInstanceRow> = sqlx::query_as(
            "SELECT id, version, workflow_id, datastore_id, state, retry_num, start_time, end_time, \
             error_message, updated_at FROM workflow_instance WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WorkflowInstance::try_from).transpose()
    }

    async fn update_workflow_instance(&self, instance: &WorkflowInstance) -> Result<WorkflowInstance> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE workflow_instance SET version = version + 1, state = $3, retry_num = $4, \
             start_time = $5, end_time = $6, error_message = $7, updated_at = $8 \
             WHERE id = $1 AND version = $2",
        )
        .bind(&instance.id)
        .bind(instance.version)
        .bind(instance.state.as_str())
        .bind(to_i32(instance.retry_num))
        .bind(instance.start_time)
        .bind(instance.end_time)
        .bind(&instance.error_message)
        .bind(now)
        .execute(&self.pool)
        .await?;

        expect_one_row(result.rows_affected(), "workflow_instance", &instance.id)?;
        let mut stored = instance.clone();
        stored.version += 1;
        stored.updated_at = now;
        Ok(stored)
    }

    async fn create_datastore(&self, datastore: Datastore) -> Result<Datastore> {
        sqlx::query(
            "INSERT INTO datastore (id, version, name, engine_name, concurrency, state, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&datastore.id)
        .bind(datastore.version)
        .bind(&datastore.name)
        .bind(&datastore.engine_name)
        .bind(to_i32(datastore.concurrency))
        .bind(datastore.state.as_str())
        .bind(datastore.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(datastore)
    }

    async fn get_datastore(&self, id: &str) -> Result<Option<Datastore>> {
        let row: Option<DatastoreRow> = sqlx::query_as(
            "SELECT id, version, name, engine_name, concurrency, state, updated_at FROM datastore WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Datastore::try_from).transpose()
    }

    async fn update_datastore(&self, datastore: &Datastore) -> Result<Datastore> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE datastore SET version = version + 1, name = $3, engine_name = $4, concurrency = $5, \
             state = $6, updated_at = $7 WHERE id = $1 AND version = $2",
        )
        .bind(&datastore.id)
        .bind(datastore.version)
        .bind(&datastore.name)
        .bind(&datastore.engine_name)
        .bind(to_i32(datastore.concurrency))
        .bind(datastore.state.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        expect_one_row(result.rows_affected(), "datastore", &datastore.id)?;
        let mut stored = datastore.clone();
        stored.version += 1;
        stored.updated_at = now;
        Ok(stored)
    }

    async fn try_lock_mutex(&self, name: &str) -> Result<bool> {
        sqlx::query("INSERT INTO mutex (name, state) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .bind(MutexState::Ready.as_str())
            .execute(&self.pool)
            .await?;

        let result = sqlx::query(
            "UPDATE mutex SET state = $2, updated_at = CURRENT_TIMESTAMP WHERE name = $1 AND state = $3",
        )
        .bind(name)
        .bind(MutexState::Locked.as_str())
        .bind(MutexState::Ready.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn unlock_mutex(&self, name: &str) -> Result<()> {
        sqlx::query("UPDATE mutex SET state = $2, updated_at = CURRENT_TIMESTAMP WHERE name = $1")
            .bind(name)
            .bind(MutexState::Ready.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_mutex(&self, name: &str) -> Result<Option<MutexRecord>> {
        let row: Option<MutexRow> =
            sqlx::query_as("SELECT name, state, updated_at FROM mutex WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|row| {
            Ok(MutexRecord {
                name: row.name,
                state: row.state.parse()?,
                updated_at: row.updated_at,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_rows_is_a_lost_race() {
        let err = expect_one_row(0, "action", "a1").unwrap_err();
        assert!(err.is_conditional_update_failure());
        assert!(expect_one_row(1, "action", "a1").is_ok());
    }

    #[test]
    fn test_action_row_conversion() {
        let row = ActionRow {
            id: "a1".into(),
            version: 3,
            name: "load".into(),
            state: "PENDING".into(),
            order_idx: 1,
            parallelization_idx: Some(10),
            on_failure: "CONTINUE".into(),
            engine_name: "redshift_engine".into(),
            batch_job_id: Some("job-1".into()),
            workflow_id: Some("wf".into()),
            workflow_instance_id: Some("wfi".into()),
            workflow_action_id: None,
            datastore_id: "ds".into(),
            first_in_workflow: true,
            last_in_workflow: false,
            retries_on_failures: -1,
            queued_time: None,
            start_time: None,
            end_time: None,
            updated_at: Utc::now(),
            error_message: None,
        };
        let action = Action::try_from(row).unwrap();
        assert_eq!(action.state, ActionState::Pending);
        assert!(action.is_continue_on_failure());
        assert_eq!(action.retries_on_failures, 0);
    }

    #[test]
    fn test_unknown_state_is_rejected() {
        let row = DatastoreRow {
            id: "ds".into(),
            version: 0,
            name: "warehouse".into(),
            engine_name: "redshift_engine".into(),
            concurrency: 2,
            state: "MELTING".into(),
            updated_at: Utc::now(),
        };
        assert!(Datastore::try_from(row).is_err());
    }
}
