//! Postgres-backed invocation store.
//!
//! Claim exclusivity rides on `FOR UPDATE SKIP LOCKED`: racing consumers
//! each lock a different candidate row or skip past, so exactly one caller
//! wins a given invocation without anyone blocking. Completion uses a
//! conditional UPDATE that names the expected state and claimant, so a
//! duplicate or late return matches zero rows and reports "not found".

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::invocation::{Agent, Invocation, InvocationState, NewInvocation};
use crate::store::InvocationStore;

/// Bootstrap DDL. Safe to re-run; deployments with managed migrations can
/// apply the equivalent statements there instead.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS invocations (
    id BIGSERIAL PRIMARY KEY,
    queue_id BIGINT NOT NULL,
    state TEXT NOT NULL DEFAULT 'available',
    payload JSONB NOT NULL DEFAULT '{}'::jsonb,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    result JSONB,
    errors JSONB,
    priority INT NOT NULL DEFAULT 0,
    created_by TEXT NOT NULL DEFAULT '',
    created_at BIGINT NOT NULL,
    attempted_at BIGINT,
    finalized_at BIGINT,
    attempted_by TEXT[] NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS invocations_claim_idx
    ON invocations (queue_id, priority, id)
    WHERE state = 'available';

CREATE TABLE IF NOT EXISTS agents (
    name TEXT PRIMARY KEY,
    queue_id BIGINT NOT NULL
);
"#;

const RETURNING_COLUMNS: &str = "id, queue_id, state, payload, metadata, result, errors, \
     priority, created_by, created_at, attempted_at, finalized_at, attempted_by";

/// Row shape as stored; decoded into [`Invocation`] with state validation.
#[derive(Debug, FromRow)]
struct InvocationRow {
    id: i64,
    queue_id: i64,
    state: String,
    payload: Value,
    metadata: Value,
    result: Option<Value>,
    errors: Option<Value>,
    priority: i32,
    created_by: String,
    created_at: i64,
    attempted_at: Option<i64>,
    finalized_at: Option<i64>,
    attempted_by: Vec<String>,
}

impl TryFrom<InvocationRow> for Invocation {
    type Error = CoreError;

    fn try_from(row: InvocationRow) -> Result<Self> {
        let state: InvocationState = row.state.parse()?;
        Ok(Invocation {
            id: row.id,
            queue_id: row.queue_id,
            state,
            payload: row.payload,
            metadata: row.metadata,
            result: row.result,
            errors: row.errors,
            priority: row.priority,
            created_by: row.created_by,
            created_at: row.created_at,
            attempted_at: row.attempted_at,
            finalized_at: row.finalized_at,
            attempted_by: row.attempted_by,
        })
    }
}

/// Invocation store over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PgInvocationStore {
    pool: PgPool,
    schema: String,
}

impl PgInvocationStore {
    /// Build a store, resolving the active schema for channel namespacing.
    pub async fn new(pool: PgPool) -> Result<Self> {
        let schema: String = sqlx::query_scalar("SELECT current_schema()::text")
            .fetch_one(&pool)
            .await?;
        Ok(Self { pool, schema })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Schema used to namespace notification channels.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Create the invocation tables if they do not exist.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Bind an agent name to a queue (upsert). Operational helper for the
    /// CLI and tests; the admin surface owns this table in production.
    pub async fn register_agent(&self, name: &str, queue_id: i64) -> Result<Agent> {
        sqlx::query(
            "INSERT INTO agents (name, queue_id) VALUES ($1, $2) \
             ON CONFLICT (name) DO UPDATE SET queue_id = EXCLUDED.queue_id",
        )
        .bind(name)
        .bind(queue_id)
        .execute(&self.pool)
        .await?;
        Ok(Agent {
            name: name.to_string(),
            queue_id,
        })
    }

    fn now_epoch() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

#[async_trait]
impl InvocationStore for PgInvocationStore {
    async fn insert(&self, new: NewInvocation) -> Result<Invocation> {
        let sql = format!(
            "INSERT INTO invocations \
                 (queue_id, state, payload, metadata, priority, created_by, created_at) \
             VALUES ($1, 'available', $2, $3, $4, $5, $6) \
             RETURNING {RETURNING_COLUMNS}"
        );
        let row: InvocationRow = sqlx::query_as(&sql)
            .bind(new.queue_id)
            .bind(&new.payload)
            .bind(&new.metadata)
            .bind(new.priority)
            .bind(&new.created_by)
            .bind(Self::now_epoch())
            .fetch_one(&self.pool)
            .await?;
        debug!(invocation_id = row.id, queue_id = row.queue_id, "invocation inserted");
        row.try_into()
    }

    async fn claim_next(&self, queue_id: i64, claimant: &str) -> Result<Option<Invocation>> {
        let sql = format!(
            "UPDATE invocations SET \
                 state = 'running', \
                 attempted_at = $3, \
                 attempted_by = array_append(attempted_by, $2) \
             WHERE id = ( \
                 SELECT id FROM invocations \
                 WHERE queue_id = $1 AND state = 'available' \
                 ORDER BY priority ASC, id ASC \
                 FOR UPDATE SKIP LOCKED \
                 LIMIT 1 \
             ) \
             RETURNING {RETURNING_COLUMNS}"
        );
        let row: Option<InvocationRow> = sqlx::query_as(&sql)
            .bind(queue_id)
            .bind(claimant)
            .bind(Self::now_epoch())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Invocation::try_from).transpose()
    }

    async fn complete(
        &self,
        id: i64,
        claimant: &str,
        result: Value,
    ) -> Result<Option<Invocation>> {
        let sql = format!(
            "UPDATE invocations SET \
                 state = 'completed', \
                 result = $3, \
                 finalized_at = $4 \
             WHERE id = $1 \
               AND state = 'running' \
               AND attempted_by[cardinality(attempted_by)] = $2 \
             RETURNING {RETURNING_COLUMNS}"
        );
        let row: Option<InvocationRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(claimant)
            .bind(&result)
            .bind(Self::now_epoch())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Invocation::try_from).transpose()
    }

    async fn discard(
        &self,
        id: i64,
        claimant: &str,
        errors: Value,
    ) -> Result<Option<Invocation>> {
        let sql = format!(
            "UPDATE invocations SET \
                 state = 'discarded', \
                 errors = $3, \
                 finalized_at = $4 \
             WHERE id = $1 \
               AND state = 'running' \
               AND attempted_by[cardinality(attempted_by)] = $2 \
             RETURNING {RETURNING_COLUMNS}"
        );
        let row: Option<InvocationRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(claimant)
            .bind(&errors)
            .bind(Self::now_epoch())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Invocation::try_from).transpose()
    }

    async fn get(&self, id: i64) -> Result<Option<Invocation>> {
        let sql = format!("SELECT {RETURNING_COLUMNS} FROM invocations WHERE id = $1");
        let row: Option<InvocationRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Invocation::try_from).transpose()
    }

    async fn find_agent(&self, name: &str) -> Result<Option<Agent>> {
        let agent: Option<Agent> =
            sqlx::query_as("SELECT name, queue_id FROM agents WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(agent)
    }

    async fn notify(&self, topic: &str, payload: &str) -> Result<()> {
        let channel = format!("{}.{}", self.schema, topic);
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
