//! Definition store trait
//!
//! Backing persistence for the definition registry. Definitions are
//! upserted whole; a logical version is the (name, version) pair and the
//! latest active row wins when no version is requested.

use async_trait::async_trait;
use thiserror::Error;

use maestro_domain::{DefinitionId, WorkflowDefinition};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum UpsertDefinitionError {
    #[error("database error")]
    Database(#[source] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum FindDefinitionError {
    #[error("database error")]
    Database(#[source] sqlx::Error),
    #[error("corrupt definition record: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum ListDefinitionsError {
    #[error("database error")]
    Database(#[source] sqlx::Error),
    #[error("corrupt definition record: {0}")]
    Corrupt(String),
}

// =============================================================================
// Trait
// =============================================================================

/// Durable persistence for workflow definitions
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Insert or replace a definition keyed by (name, version)
    async fn upsert(&self, def: &WorkflowDefinition) -> Result<(), UpsertDefinitionError>;

    /// Find a definition by name; latest active version when `version`
    /// is omitted
    async fn find_by_name(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<WorkflowDefinition>, FindDefinitionError>;

    /// Find a definition by id, active or not
    async fn find_by_id(
        &self,
        id: &DefinitionId,
    ) -> Result<Option<WorkflowDefinition>, FindDefinitionError>;

    /// List definitions, optionally restricted to a category
    async fn list(
        &self,
        category: Option<&str>,
        active_only: bool,
    ) -> Result<Vec<WorkflowDefinition>, ListDefinitionsError>;

    /// Distinct categories, sorted
    async fn categories(&self) -> Result<Vec<String>, ListDefinitionsError>;

    /// Flip the active flag on every version of a named definition.
    /// Returns false when no definition carries that name.
    async fn set_active(&self, name: &str, active: bool) -> Result<bool, UpsertDefinitionError>;
}
