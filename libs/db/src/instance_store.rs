//! Instance store trait and filters
//!
//! The instance store is the system of record. The engine treats it as
//! the source of truth on restart; all transitions to terminal status are
//! durable here before the corresponding event is emitted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use maestro_domain::{InstanceId, WorkflowInstance, WorkflowStatus};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum SaveInstanceError {
    #[error("instance already exists: {0}")]
    Duplicate(InstanceId),
    #[error("database error")]
    Database(#[source] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum UpdateInstanceError {
    #[error("instance not found: {0}")]
    NotFound(InstanceId),
    #[error("database error")]
    Database(#[source] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum FindInstanceError {
    #[error("database error")]
    Database(#[source] sqlx::Error),
    #[error("corrupt instance record: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum ListInstancesError {
    #[error("database error")]
    Database(#[source] sqlx::Error),
    #[error("corrupt instance record: {0}")]
    Corrupt(String),
}

// =============================================================================
// Filter
// =============================================================================

/// Indexed lookup criteria for [`InstanceStore::list`]
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub status: Option<WorkflowStatus>,
    pub triggered_by: Option<String>,
    pub started_after: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl InstanceFilter {
    /// Filter by status
    #[must_use]
    pub fn with_status(mut self, status: WorkflowStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filter by the submitter recorded at start
    #[must_use]
    pub fn with_triggered_by(mut self, triggered_by: impl Into<String>) -> Self {
        self.triggered_by = Some(triggered_by.into());
        self
    }

    /// Only instances started at or after the given time
    #[must_use]
    pub fn with_started_after(mut self, after: DateTime<Utc>) -> Self {
        self.started_after = Some(after);
        self
    }
}

// =============================================================================
// Trait
// =============================================================================

/// Durable persistence for workflow instances
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert a new instance record
    async fn save(&self, instance: &WorkflowInstance) -> Result<(), SaveInstanceError>;

    /// Replace the mutable fields of an instance atomically
    async fn update(&self, instance: &WorkflowInstance) -> Result<(), UpdateInstanceError>;

    /// Read an instance by id
    async fn get(&self, id: &InstanceId) -> Result<Option<WorkflowInstance>, FindInstanceError>;

    /// List instances matching a filter, newest first
    async fn list(&self, filter: &InstanceFilter)
        -> Result<Vec<WorkflowInstance>, ListInstancesError>;
}
