// Repository layer for database operations.
// All SQL lives here; the engine and scheduler never issue ad-hoc queries.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use loomline_contracts::{
    DeploymentStatus, ExecutionStatus, LogCursor, LogPage, LogQuery, TriggerStatus,
    MAX_LOG_PAGE_SIZE,
};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::*;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create database connection from URL
    pub async fn from_url(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Startup connectivity check
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Postgres ping failed")?;
        Ok(())
    }

    // ============================================
    // Workflows
    // ============================================

    pub async fn create_workflow(&self, input: CreateWorkflow) -> Result<WorkflowRow> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            INSERT INTO workflows (id, owner_user_id, name, spec)
            VALUES ($1, $2, $3, $4)
            RETURNING id, owner_user_id, name, version, spec, deployment_status, deployment_version, created_at, updated_at
            "#,
        )
        .bind(input.id)
        .bind(input.owner_user_id)
        .bind(&input.name)
        .bind(&input.spec)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowRow>> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, owner_user_id, name, version, spec, deployment_status, deployment_version, created_at, updated_at
            FROM workflows
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Replace the draft spec and bump the edit version
    pub async fn update_workflow_spec(
        &self,
        id: Uuid,
        name: &str,
        spec: &serde_json::Value,
    ) -> Result<Option<WorkflowRow>> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            UPDATE workflows
            SET name = $2, spec = $3, version = version + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING id, owner_user_id, name, version, spec, deployment_status, deployment_version, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(spec)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Spec pinned at a given version; executions resume against these
    /// even after the workflow has been redeployed.
    pub async fn get_workflow_version(
        &self,
        workflow_id: Uuid,
        version: i64,
    ) -> Result<Option<WorkflowVersionRow>> {
        let row = sqlx::query_as::<_, WorkflowVersionRow>(
            r#"
            SELECT workflow_id, version, spec, created_at
            FROM workflow_versions
            WHERE workflow_id = $1 AND version = $2
            "#,
        )
        .bind(workflow_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    // ============================================
    // Deployment (transactional with the trigger index)
    // ============================================

    /// Write all index rows, pin the spec version, flip the workflow to
    /// DEPLOYED and append a history row, atomically. On any failure the
    /// transaction rolls back and the index is unchanged.
    pub async fn deploy_workflow(
        &self,
        workflow_id: Uuid,
        version: i64,
        spec: &serde_json::Value,
        entries: &[CreateTriggerIndexEntry],
        actor: &str,
    ) -> Result<Uuid> {
        let mut tx = self.pool.begin().await?;

        // A redeploy replaces the previous index rows wholesale
        sqlx::query("DELETE FROM trigger_index WHERE workflow_id = $1")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO trigger_index
                    (id, workflow_id, trigger_node_id, trigger_type, trigger_subtype, index_key, config, status)
                VALUES ($1, $2, $3, $4, $5, $6, $7, 'active')
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(workflow_id)
            .bind(&entry.trigger_node_id)
            .bind(&entry.trigger_type)
            .bind(&entry.trigger_subtype)
            .bind(&entry.index_key)
            .bind(&entry.config)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO workflow_versions (workflow_id, version, spec)
            VALUES ($1, $2, $3)
            ON CONFLICT (workflow_id, version) DO UPDATE SET spec = EXCLUDED.spec
            "#,
        )
        .bind(workflow_id)
        .bind(version)
        .bind(spec)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE workflows
            SET deployment_status = 'DEPLOYED', deployment_version = deployment_version + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .execute(&mut *tx)
        .await?;

        let deployment_id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO workflow_deployment_history (id, workflow_id, action, actor, trigger_count)
            VALUES ($1, $2, 'deploy', $3, $4)
            "#,
        )
        .bind(deployment_id)
        .bind(workflow_id)
        .bind(actor)
        .bind(entries.len() as i32)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(deployment_id)
    }

    /// Remove index rows and mark the workflow UNDEPLOYED. Idempotent.
    pub async fn undeploy_workflow(&self, workflow_id: Uuid, actor: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM trigger_index WHERE workflow_id = $1")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query(
            r#"
            UPDATE workflows
            SET deployment_status = 'UNDEPLOYED', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO workflow_deployment_history (id, workflow_id, action, actor, trigger_count)
            VALUES ($1, $2, 'undeploy', $3, $4)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(workflow_id)
        .bind(actor)
        .bind(deleted as i32)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(deleted)
    }

    /// Pause/resume: flip index row status without removing rows
    pub async fn set_trigger_status(
        &self,
        workflow_id: Uuid,
        status: TriggerStatus,
        actor: &str,
    ) -> Result<u64> {
        let workflow_status = match status {
            TriggerStatus::Active => DeploymentStatus::Deployed,
            TriggerStatus::Paused => DeploymentStatus::Paused,
        };
        let action = match status {
            TriggerStatus::Active => "resume",
            TriggerStatus::Paused => "pause",
        };

        let mut tx = self.pool.begin().await?;

        let affected = sqlx::query(
            "UPDATE trigger_index SET status = $2, updated_at = NOW() WHERE workflow_id = $1",
        )
        .bind(workflow_id)
        .bind(status.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("UPDATE workflows SET deployment_status = $2, updated_at = NOW() WHERE id = $1")
            .bind(workflow_id)
            .bind(workflow_status.to_string())
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO workflow_deployment_history (id, workflow_id, action, actor, trigger_count)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(workflow_id)
        .bind(action)
        .bind(actor)
        .bind(affected as i32)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(affected)
    }

    pub async fn list_deployment_history(
        &self,
        workflow_id: Uuid,
        limit: i64,
    ) -> Result<Vec<DeploymentHistoryRow>> {
        let rows = sqlx::query_as::<_, DeploymentHistoryRow>(
            r#"
            SELECT id, workflow_id, action, actor, trigger_count, message, created_at
            FROM workflow_deployment_history
            WHERE workflow_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(workflow_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ============================================
    // Trigger index queries (event routing path)
    // ============================================

    pub async fn find_triggers_by_key(&self, index_key: &str) -> Result<Vec<TriggerIndexRow>> {
        let rows = sqlx::query_as::<_, TriggerIndexRow>(
            r#"
            SELECT id, workflow_id, trigger_node_id, trigger_type, trigger_subtype, index_key, config, status, created_at, updated_at
            FROM trigger_index
            WHERE index_key = $1 AND status = 'active'
            "#,
        )
        .bind(index_key)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Active WEBHOOK rows colliding with `index_key`, excluding the
    /// workflow being (re)deployed.
    pub async fn webhook_key_conflicts(
        &self,
        index_key: &str,
        exclude_workflow: Uuid,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM trigger_index
            WHERE index_key = $1 AND trigger_subtype = 'WEBHOOK' AND status = 'active' AND workflow_id != $2
            "#,
        )
        .bind(index_key)
        .bind(exclude_workflow)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    pub async fn list_active_cron_triggers(&self) -> Result<Vec<TriggerIndexRow>> {
        let rows = sqlx::query_as::<_, TriggerIndexRow>(
            r#"
            SELECT id, workflow_id, trigger_node_id, trigger_type, trigger_subtype, index_key, config, status, created_at, updated_at
            FROM trigger_index
            WHERE trigger_subtype = 'CRON' AND status = 'active'
            ORDER BY index_key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn list_triggers_for_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<TriggerIndexRow>> {
        let rows = sqlx::query_as::<_, TriggerIndexRow>(
            r#"
            SELECT id, workflow_id, trigger_node_id, trigger_type, trigger_subtype, index_key, config, status, created_at, updated_at
            FROM trigger_index
            WHERE workflow_id = $1
            ORDER BY trigger_node_id
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ============================================
    // Executions
    // ============================================

    pub async fn create_execution(&self, input: CreateExecution) -> Result<ExecutionRow> {
        let trigger_info = serde_json::to_value(&input.trigger_info)?;

        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            INSERT INTO executions (id, workflow_id, workflow_version, trigger_info, status, is_debug)
            VALUES ($1, $2, $3, $4, 'NEW', $5)
            RETURNING id, workflow_id, workflow_version, trigger_info, status, is_debug, start_time, end_time,
                      execution_sequence, node_results, final_output, error_message, pending_pause, created_at, updated_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.workflow_id)
        .bind(input.workflow_version)
        .bind(&trigger_info)
        .bind(input.is_debug)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRow>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, workflow_id, workflow_version, trigger_info, status, is_debug, start_time, end_time,
                   execution_sequence, node_results, final_output, error_message, pending_pause, created_at, updated_at
            FROM executions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Mark RUNNING and stamp start_time once
    pub async fn mark_execution_started(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE executions
            SET status = 'RUNNING', start_time = COALESCE(start_time, NOW()), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persist the engine's in-memory view after a node boundary
    pub async fn update_execution_state(&self, id: Uuid, update: ExecutionStateUpdate) -> Result<()> {
        let sequence = serde_json::to_value(&update.execution_sequence)?;
        let node_results = serde_json::to_value(&update.node_results)?;
        let pending_pause = update
            .pending_pause
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(
            r#"
            UPDATE executions
            SET status = $2,
                execution_sequence = $3,
                node_results = $4,
                final_output = $5,
                error_message = $6,
                pending_pause = $7,
                end_time = COALESCE($8, end_time),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.status.to_string())
        .bind(&sequence)
        .bind(&node_results)
        .bind(&update.final_output)
        .bind(&update.error_message)
        .bind(&pending_pause)
        .bind(update.end_time)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Compare-and-set the status; returns false when the current status
    /// did not match (e.g. cancel raced completion).
    pub async fn transition_execution_status(
        &self,
        id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = $3, updated_at = NOW(),
                end_time = CASE WHEN $3 IN ('SUCCESS', 'ERROR', 'CANCELED') THEN NOW() ELSE end_time END
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.to_string())
        .bind(to.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_executions(
        &self,
        workflow_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ExecutionRow>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, workflow_id, workflow_version, trigger_info, status, is_debug, start_time, end_time,
                   execution_sequence, node_results, final_output, error_message, pending_pause, created_at, updated_at
            FROM executions
            WHERE workflow_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(workflow_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Paused executions whose human-input window has lapsed
    pub async fn find_timed_out_pauses(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionRow>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, workflow_id, workflow_version, trigger_info, status, is_debug, start_time, end_time,
                   execution_sequence, node_results, final_output, error_message, pending_pause, created_at, updated_at
            FROM executions
            WHERE status = 'PAUSED'
              AND pending_pause IS NOT NULL
              AND (pending_pause->>'paused_at')::timestamptz
                  + make_interval(secs => (pending_pause->>'timeout_seconds')::float) <= $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ============================================
    // Execution logs
    // ============================================

    pub async fn append_log(&self, input: AppendLog) -> Result<Uuid> {
        let id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO execution_logs (id, execution_id, node_id, level, event_type, message, data, is_milestone, priority)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(id)
        .bind(input.execution_id)
        .bind(&input.node_id)
        .bind(input.level.to_string())
        .bind(input.event_type.to_string())
        .bind(&input.message)
        .bind(&input.data)
        .bind(input.is_milestone)
        .bind(input.priority.clamp(1, 10))
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Keyset-paginated log query. Entries present when iteration started
    /// are each yielded exactly once; later appends only show up under a
    /// fresh cursor.
    pub async fn query_logs(&self, execution_id: Uuid, query: &LogQuery) -> Result<LogPage> {
        let page_size = query
            .page_size
            .unwrap_or(50)
            .clamp(1, MAX_LOG_PAGE_SIZE);

        let mut builder = sqlx::QueryBuilder::new(
            "SELECT id, execution_id, node_id, level, event_type, message, data, is_milestone, priority, created_at \
             FROM execution_logs WHERE execution_id = ",
        );
        builder.push_bind(execution_id);

        if let Some(min_priority) = query.min_priority {
            builder.push(" AND priority >= ").push_bind(min_priority);
        }
        if query.milestones_only.unwrap_or(false) {
            builder.push(" AND is_milestone = TRUE");
        }
        if let Some(level) = query.level {
            builder.push(" AND level = ").push_bind(level.to_string());
        }
        if let Some(cursor) = query.cursor.as_deref().and_then(LogCursor::decode) {
            builder
                .push(" AND (created_at, id) > (")
                .push_bind(cursor.ts)
                .push(", ")
                .push_bind(cursor.id)
                .push(")");
        }

        // Fetch one extra row to detect a following page
        builder
            .push(" ORDER BY created_at ASC, id ASC LIMIT ")
            .push_bind(page_size + 1);

        let mut rows: Vec<ExecutionLogRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await?;

        let has_next = rows.len() as i64 > page_size;
        if has_next {
            rows.truncate(page_size as usize);
        }

        let next_cursor = if has_next {
            rows.last().map(|r| {
                LogCursor {
                    ts: r.created_at,
                    id: r.id,
                }
                .encode()
            })
        } else {
            None
        };

        Ok(LogPage {
            entries: rows.into_iter().map(ExecutionLogRow::into_entry).collect(),
            next_cursor,
            has_next,
        })
    }

    /// Retention sweep: drop entries older than the window
    pub async fn prune_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM execution_logs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    // ============================================
    // Credentials (written by the OAuth path, read-mostly here)
    // ============================================

    pub async fn get_credential(
        &self,
        user_id: Uuid,
        provider: &str,
    ) -> Result<Option<CredentialRow>> {
        let row = sqlx::query_as::<_, CredentialRow>(
            r#"
            SELECT user_id, provider, credential_type, encrypted_access_token, encrypted_refresh_token,
                   token_expires_at, scopes, is_valid, created_at, updated_at
            FROM credentials
            WHERE user_id = $1 AND provider = $2
            "#,
        )
        .bind(user_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn update_credential_tokens(
        &self,
        user_id: Uuid,
        provider: &str,
        encrypted_access_token: &[u8],
        encrypted_refresh_token: Option<&[u8]>,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE credentials
            SET encrypted_access_token = $3,
                encrypted_refresh_token = COALESCE($4, encrypted_refresh_token),
                token_expires_at = $5,
                is_valid = TRUE,
                updated_at = NOW()
            WHERE user_id = $1 AND provider = $2
            "#,
        )
        .bind(user_id)
        .bind(provider)
        .bind(encrypted_access_token)
        .bind(encrypted_refresh_token)
        .bind(token_expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_credential_invalid(&self, user_id: Uuid, provider: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE credentials
            SET is_valid = FALSE, updated_at = NOW()
            WHERE user_id = $1 AND provider = $2
            "#,
        )
        .bind(user_id)
        .bind(provider)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ============================================
    // Workflow memory (TOOL / MEMORY runners)
    // ============================================

    pub async fn memory_get(
        &self,
        workflow_id: Uuid,
        collection: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>> {
        let value: Option<serde_json::Value> = sqlx::query_scalar(
            r#"
            SELECT value FROM workflow_memory
            WHERE workflow_id = $1 AND collection = $2 AND key = $3
            "#,
        )
        .bind(workflow_id)
        .bind(collection)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    pub async fn memory_set(
        &self,
        workflow_id: Uuid,
        collection: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_memory (workflow_id, collection, key, value)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (workflow_id, collection, key)
            DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(workflow_id)
        .bind(collection)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append to a JSON array value, creating it when absent
    pub async fn memory_append(
        &self,
        workflow_id: Uuid,
        collection: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_memory (workflow_id, collection, key, value)
            VALUES ($1, $2, $3, jsonb_build_array($4::jsonb))
            ON CONFLICT (workflow_id, collection, key)
            DO UPDATE SET
                value = CASE
                    WHEN jsonb_typeof(workflow_memory.value) = 'array'
                        THEN workflow_memory.value || $4::jsonb
                    ELSE jsonb_build_array(workflow_memory.value) || $4::jsonb
                END,
                updated_at = NOW()
            "#,
        )
        .bind(workflow_id)
        .bind(collection)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn memory_query(
        &self,
        workflow_id: Uuid,
        collection: &str,
        key_prefix: &str,
        limit: i64,
    ) -> Result<Vec<MemoryRow>> {
        let pattern = format!("{}%", key_prefix.replace('%', "\\%").replace('_', "\\_"));
        let rows = sqlx::query_as::<_, MemoryRow>(
            r#"
            SELECT workflow_id, collection, key, value, updated_at
            FROM workflow_memory
            WHERE workflow_id = $1 AND collection = $2 AND key LIKE $3
            ORDER BY key
            LIMIT $4
            "#,
        )
        .bind(workflow_id)
        .bind(collection)
        .bind(&pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
