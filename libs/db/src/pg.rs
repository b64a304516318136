//! PostgreSQL store implementations
//!
//! Rows are read through plain `query_as` with `FromRow` structs and
//! converted into domain types; JSONB columns carry the structured
//! fields. Schema lives in `migrations/0001_workflow_tables.sql`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use maestro_domain::{
    DefinitionId, InstanceId, WorkflowDefinition, WorkflowInstance, WorkflowStatus,
};

use crate::definition_store::{
    DefinitionStore, FindDefinitionError, ListDefinitionsError, UpsertDefinitionError,
};
use crate::instance_store::{
    FindInstanceError, InstanceFilter, InstanceStore, ListInstancesError, SaveInstanceError,
    UpdateInstanceError,
};

// =============================================================================
// Instance Rows
// =============================================================================

#[derive(sqlx::FromRow)]
struct InstanceRow {
    instance_id: Uuid,
    workflow_id: Uuid,
    workflow_version: String,
    status: String,
    current_step_id: Option<String>,
    completed_steps: Value,
    failed_steps: Value,
    context: Value,
    input_data: Value,
    output_data: Value,
    step_results: Value,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    paused_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    error_details: Option<Value>,
    retry_count: i32,
    triggered_by: Option<String>,
    parent_instance_id: Option<Uuid>,
}

impl TryFrom<InstanceRow> for WorkflowInstance {
    type Error = String;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: InstanceId::from_uuid(row.instance_id),
            workflow_id: DefinitionId::from_uuid(row.workflow_id),
            workflow_version: row.workflow_version,
            status: row.status.parse()?,
            current_step_id: row.current_step_id,
            completed_steps: serde_json::from_value(row.completed_steps)
                .map_err(|e| format!("completed_steps: {e}"))?,
            failed_steps: serde_json::from_value(row.failed_steps)
                .map_err(|e| format!("failed_steps: {e}"))?,
            context: serde_json::from_value(row.context).map_err(|e| format!("context: {e}"))?,
            input_data: serde_json::from_value(row.input_data)
                .map_err(|e| format!("input_data: {e}"))?,
            output_data: serde_json::from_value(row.output_data)
                .map_err(|e| format!("output_data: {e}"))?,
            step_results: serde_json::from_value(row.step_results)
                .map_err(|e| format!("step_results: {e}"))?,
            started_at: row.started_at,
            completed_at: row.completed_at,
            paused_at: row.paused_at,
            error_message: row.error_message,
            error_details: row.error_details,
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            triggered_by: row.triggered_by,
            parent_instance_id: row.parent_instance_id.map(InstanceId::from_uuid),
        })
    }
}

const INSTANCE_COLUMNS: &str = r"
    instance_id, workflow_id, workflow_version, status, current_step_id,
    completed_steps, failed_steps, context, input_data, output_data,
    step_results, started_at, completed_at, paused_at,
    error_message, error_details, retry_count, triggered_by, parent_instance_id
";

// =============================================================================
// PostgreSQL Instance Store
// =============================================================================

/// PostgreSQL-backed instance store
pub struct PgInstanceStore {
    pool: PgPool,
}

impl PgInstanceStore {
    /// Create a new store over an existing pool
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstanceStore for PgInstanceStore {
    async fn save(&self, instance: &WorkflowInstance) -> Result<(), SaveInstanceError> {
        sqlx::query(
            r"
            INSERT INTO workflow_instances (
                instance_id, workflow_id, workflow_version, status, current_step_id,
                completed_steps, failed_steps, context, input_data, output_data,
                step_results, started_at, completed_at, paused_at,
                error_message, error_details, retry_count, triggered_by, parent_instance_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ",
        )
        .bind(instance.id.as_uuid())
        .bind(instance.workflow_id.as_uuid())
        .bind(&instance.workflow_version)
        .bind(instance.status.as_str())
        .bind(&instance.current_step_id)
        .bind(Value::from(instance.completed_steps.clone()))
        .bind(Value::from(instance.failed_steps.clone()))
        .bind(Value::Object(instance.context.clone()))
        .bind(Value::Object(instance.input_data.clone()))
        .bind(Value::Object(instance.output_data.clone()))
        .bind(Value::Object(instance.step_results.clone()))
        .bind(instance.started_at)
        .bind(instance.completed_at)
        .bind(instance.paused_at)
        .bind(&instance.error_message)
        .bind(&instance.error_details)
        .bind(i32::try_from(instance.retry_count).unwrap_or(i32::MAX))
        .bind(&instance.triggered_by)
        .bind(instance.parent_instance_id.map(|id| *id.as_uuid()))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.as_database_error()
                .is_some_and(sqlx::error::DatabaseError::is_unique_violation)
            {
                SaveInstanceError::Duplicate(instance.id)
            } else {
                SaveInstanceError::Database(e)
            }
        })?;

        Ok(())
    }

    async fn update(&self, instance: &WorkflowInstance) -> Result<(), UpdateInstanceError> {
        let result = sqlx::query(
            r"
            UPDATE workflow_instances
            SET status = $2,
                current_step_id = $3,
                completed_steps = $4,
                failed_steps = $5,
                context = $6,
                output_data = $7,
                step_results = $8,
                completed_at = $9,
                paused_at = $10,
                error_message = $11,
                error_details = $12,
                retry_count = $13,
                updated_at = NOW()
            WHERE instance_id = $1
            ",
        )
        .bind(instance.id.as_uuid())
        .bind(instance.status.as_str())
        .bind(&instance.current_step_id)
        .bind(Value::from(instance.completed_steps.clone()))
        .bind(Value::from(instance.failed_steps.clone()))
        .bind(Value::Object(instance.context.clone()))
        .bind(Value::Object(instance.output_data.clone()))
        .bind(Value::Object(instance.step_results.clone()))
        .bind(instance.completed_at)
        .bind(instance.paused_at)
        .bind(&instance.error_message)
        .bind(&instance.error_details)
        .bind(i32::try_from(instance.retry_count).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await
        .map_err(UpdateInstanceError::Database)?;

        if result.rows_affected() == 0 {
            return Err(UpdateInstanceError::NotFound(instance.id));
        }
        Ok(())
    }

    async fn get(&self, id: &InstanceId) -> Result<Option<WorkflowInstance>, FindInstanceError> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE instance_id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(FindInstanceError::Database)?;

        row.map(TryInto::try_into)
            .transpose()
            .map_err(FindInstanceError::Corrupt)
    }

    async fn list(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<WorkflowInstance>, ListInstancesError> {
        let rows = sqlx::query_as::<_, InstanceRow>(&format!(
            r"
            SELECT {INSTANCE_COLUMNS}
            FROM workflow_instances
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR triggered_by = $2)
              AND ($3::timestamptz IS NULL OR started_at >= $3)
            ORDER BY started_at DESC NULLS LAST
            LIMIT $4
            "
        ))
        .bind(filter.status.map(WorkflowStatus::as_str))
        .bind(&filter.triggered_by)
        .bind(filter.started_after)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await
        .map_err(ListInstancesError::Database)?;

        rows.into_iter()
            .map(|r| r.try_into().map_err(ListInstancesError::Corrupt))
            .collect()
    }
}

// =============================================================================
// Definition Rows
// =============================================================================

#[derive(sqlx::FromRow)]
struct DefinitionRow {
    definition_id: Uuid,
    name: String,
    description: Option<String>,
    version: String,
    category: String,
    tags: Value,
    steps: Value,
    entry_point: Option<String>,
    timeout_seconds: i64,
    max_parallel_steps: i32,
    created_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    is_active: bool,
}

impl TryFrom<DefinitionRow> for WorkflowDefinition {
    type Error = String;

    fn try_from(row: DefinitionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: DefinitionId::from_uuid(row.definition_id),
            name: row.name,
            description: row.description,
            version: row.version,
            category: row.category,
            tags: serde_json::from_value(row.tags).map_err(|e| format!("tags: {e}"))?,
            steps: serde_json::from_value(row.steps).map_err(|e| format!("steps: {e}"))?,
            entry_point: row.entry_point,
            timeout_seconds: u64::try_from(row.timeout_seconds).unwrap_or(0),
            max_parallel_steps: usize::try_from(row.max_parallel_steps).unwrap_or(1),
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
            is_active: row.is_active,
        })
    }
}

const DEFINITION_COLUMNS: &str = r"
    definition_id, name, description, version, category, tags, steps,
    entry_point, timeout_seconds, max_parallel_steps,
    created_by, created_at, updated_at, is_active
";

// =============================================================================
// PostgreSQL Definition Store
// =============================================================================

/// PostgreSQL-backed definition store
pub struct PgDefinitionStore {
    pool: PgPool,
}

impl PgDefinitionStore {
    /// Create a new store over an existing pool
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DefinitionStore for PgDefinitionStore {
    async fn upsert(&self, def: &WorkflowDefinition) -> Result<(), UpsertDefinitionError> {
        let steps = serde_json::to_value(&def.steps)?;

        sqlx::query(
            r"
            INSERT INTO workflow_definitions (
                definition_id, name, description, version, category, tags, steps,
                entry_point, timeout_seconds, max_parallel_steps,
                created_by, created_at, updated_at, is_active
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW(), $13)
            ON CONFLICT (name, version) DO UPDATE
            SET description = EXCLUDED.description,
                category = EXCLUDED.category,
                tags = EXCLUDED.tags,
                steps = EXCLUDED.steps,
                entry_point = EXCLUDED.entry_point,
                timeout_seconds = EXCLUDED.timeout_seconds,
                max_parallel_steps = EXCLUDED.max_parallel_steps,
                updated_at = NOW(),
                is_active = EXCLUDED.is_active
            ",
        )
        .bind(def.id.as_uuid())
        .bind(&def.name)
        .bind(&def.description)
        .bind(&def.version)
        .bind(&def.category)
        .bind(Value::from(def.tags.clone()))
        .bind(steps)
        .bind(&def.entry_point)
        .bind(i64::try_from(def.timeout_seconds).unwrap_or(i64::MAX))
        .bind(i32::try_from(def.max_parallel_steps).unwrap_or(i32::MAX))
        .bind(&def.created_by)
        .bind(def.created_at)
        .bind(def.is_active)
        .execute(&self.pool)
        .await
        .map_err(UpsertDefinitionError::Database)?;

        Ok(())
    }

    async fn find_by_name(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<WorkflowDefinition>, FindDefinitionError> {
        let row = sqlx::query_as::<_, DefinitionRow>(&format!(
            r"
            SELECT {DEFINITION_COLUMNS}
            FROM workflow_definitions
            WHERE name = $1
              AND is_active
              AND ($2::text IS NULL OR version = $2)
            ORDER BY created_at DESC
            LIMIT 1
            "
        ))
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(FindDefinitionError::Database)?;

        row.map(TryInto::try_into)
            .transpose()
            .map_err(FindDefinitionError::Corrupt)
    }

    async fn find_by_id(
        &self,
        id: &DefinitionId,
    ) -> Result<Option<WorkflowDefinition>, FindDefinitionError> {
        let row = sqlx::query_as::<_, DefinitionRow>(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM workflow_definitions WHERE definition_id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(FindDefinitionError::Database)?;

        row.map(TryInto::try_into)
            .transpose()
            .map_err(FindDefinitionError::Corrupt)
    }

    async fn list(
        &self,
        category: Option<&str>,
        active_only: bool,
    ) -> Result<Vec<WorkflowDefinition>, ListDefinitionsError> {
        let rows = sqlx::query_as::<_, DefinitionRow>(&format!(
            r"
            SELECT {DEFINITION_COLUMNS}
            FROM workflow_definitions
            WHERE ($1::text IS NULL OR category = $1)
              AND (NOT $2 OR is_active)
            ORDER BY name, created_at DESC
            "
        ))
        .bind(category)
        .bind(active_only)
        .fetch_all(&self.pool)
        .await
        .map_err(ListDefinitionsError::Database)?;

        rows.into_iter()
            .map(|r| r.try_into().map_err(ListDefinitionsError::Corrupt))
            .collect()
    }

    async fn categories(&self) -> Result<Vec<String>, ListDefinitionsError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT category FROM workflow_definitions ORDER BY category",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(ListDefinitionsError::Database)?;

        Ok(rows.into_iter().map(|(c,)| c).collect())
    }

    async fn set_active(&self, name: &str, active: bool) -> Result<bool, UpsertDefinitionError> {
        let result = sqlx::query(
            "UPDATE workflow_definitions SET is_active = $2, updated_at = NOW() WHERE name = $1",
        )
        .bind(name)
        .bind(active)
        .execute(&self.pool)
        .await
        .map_err(UpsertDefinitionError::Database)?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_domain::{StepSpec, StepType};

    #[test]
    fn test_instance_row_conversion() {
        let id = Uuid::now_v7();
        let row = InstanceRow {
            instance_id: id,
            workflow_id: Uuid::now_v7(),
            workflow_version: "1.0.0".to_string(),
            status: "running".to_string(),
            current_step_id: Some("analyze".to_string()),
            completed_steps: serde_json::json!(["fetch"]),
            failed_steps: serde_json::json!([]),
            context: serde_json::json!({"workflow_name": "test"}),
            input_data: serde_json::json!({}),
            output_data: serde_json::json!({}),
            step_results: serde_json::json!({"fetch": {"status": "ok"}}),
            started_at: Some(Utc::now()),
            completed_at: None,
            paused_at: None,
            error_message: None,
            error_details: None,
            retry_count: 0,
            triggered_by: Some("api".to_string()),
            parent_instance_id: None,
        };

        let instance: WorkflowInstance = row.try_into().unwrap();
        assert_eq!(instance.id, InstanceId::from_uuid(id));
        assert_eq!(instance.status, WorkflowStatus::Running);
        assert_eq!(instance.completed_steps, vec!["fetch"]);
        assert_eq!(instance.current_step_id.as_deref(), Some("analyze"));
    }

    #[test]
    fn test_instance_row_rejects_unknown_status() {
        let row = InstanceRow {
            instance_id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            workflow_version: "1.0.0".to_string(),
            status: "exploded".to_string(),
            current_step_id: None,
            completed_steps: serde_json::json!([]),
            failed_steps: serde_json::json!([]),
            context: serde_json::json!({}),
            input_data: serde_json::json!({}),
            output_data: serde_json::json!({}),
            step_results: serde_json::json!({}),
            started_at: None,
            completed_at: None,
            paused_at: None,
            error_message: None,
            error_details: None,
            retry_count: 0,
            triggered_by: None,
            parent_instance_id: None,
        };

        let result: Result<WorkflowInstance, _> = row.try_into();
        assert!(result.is_err());
    }

    #[test]
    fn test_definition_row_conversion() {
        let steps = vec![StepSpec::new("a", "A", StepType::Analysis, "tasks.a")];
        let row = DefinitionRow {
            definition_id: Uuid::now_v7(),
            name: "seo".to_string(),
            description: None,
            version: "1.0.0".to_string(),
            category: "seo".to_string(),
            tags: serde_json::json!(["seo"]),
            steps: serde_json::to_value(&steps).unwrap(),
            entry_point: None,
            timeout_seconds: 7200,
            max_parallel_steps: 5,
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            is_active: true,
        };

        let def: WorkflowDefinition = row.try_into().unwrap();
        assert_eq!(def.steps.len(), 1);
        assert_eq!(def.steps[0].task_name, "tasks.a");
        assert_eq!(def.max_parallel_steps, 5);
    }
}
