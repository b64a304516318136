//! Definition registry
//!
//! Read-mostly cache over the definition store: register with
//! validation, versioned lookup, soft-deactivation, JSON import/export
//! and the built-in content-optimization templates seeded at startup.
//! Templates are cloned at submission time; registry mutation never
//! alters running instances.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map};
use thiserror::Error;
use tokio::sync::RwLock;

use maestro_db::DefinitionStore;
use maestro_domain::{DefinitionId, RetryPolicy, StepSpec, StepType, WorkflowDefinition};

use crate::validate::{validate_definition, ValidationError};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum RegistryError {
    /// A definition with that name exists and overwrite was not requested
    #[error("workflow definition already exists: {0}")]
    AlreadyExists(String),

    /// The definition failed structural validation
    #[error("invalid workflow definition: {0}")]
    Invalid(#[from] ValidationError),

    /// Import payload could not be parsed
    #[error("malformed definition payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Backing store failure
    #[error("definition store error: {0}")]
    Store(String),
}

// =============================================================================
// Registry
// =============================================================================

/// Central registry for workflow definitions
pub struct DefinitionRegistry {
    store: Arc<dyn DefinitionStore>,
    /// Per-name cache of the latest active version
    cache: RwLock<HashMap<String, WorkflowDefinition>>,
}

impl DefinitionRegistry {
    /// Create a registry over a definition store
    #[must_use]
    pub fn new(store: Arc<dyn DefinitionStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Register a definition
    ///
    /// Validates the definition first. Fails with
    /// [`RegistryError::AlreadyExists`] when the name is taken and
    /// `overwrite` is false; otherwise upserts by (name, version).
    /// Re-registering identical content with `overwrite` is idempotent.
    pub async fn register(
        &self,
        def: &WorkflowDefinition,
        overwrite: bool,
    ) -> Result<(), RegistryError> {
        validate_definition(def)?;

        let existing = self
            .store
            .find_by_name(&def.name, None)
            .await
            .map_err(|e| RegistryError::Store(e.to_string()))?;
        if existing.is_some() && !overwrite {
            return Err(RegistryError::AlreadyExists(def.name.clone()));
        }

        self.store
            .upsert(def)
            .await
            .map_err(|e| RegistryError::Store(e.to_string()))?;

        // Invalidate rather than insert so the next lookup resolves the
        // latest-version question against the store
        self.cache.write().await.remove(&def.name);

        tracing::info!(name = %def.name, version = %def.version, "registered workflow");
        Ok(())
    }

    /// Get a definition by name, latest active version when `version` is
    /// omitted
    pub async fn get(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<WorkflowDefinition>, RegistryError> {
        if version.is_none() {
            if let Some(cached) = self.cache.read().await.get(name) {
                return Ok(Some(cached.clone()));
            }
        }

        let found = self
            .store
            .find_by_name(name, version)
            .await
            .map_err(|e| RegistryError::Store(e.to_string()))?;

        if version.is_none() {
            if let Some(def) = &found {
                self.cache
                    .write()
                    .await
                    .insert(name.to_string(), def.clone());
            }
        }
        Ok(found)
    }

    /// Get a definition by id, active or not
    pub async fn get_by_id(
        &self,
        id: &DefinitionId,
    ) -> Result<Option<WorkflowDefinition>, RegistryError> {
        self.store
            .find_by_id(id)
            .await
            .map_err(|e| RegistryError::Store(e.to_string()))
    }

    /// List definitions, optionally by category
    pub async fn list(
        &self,
        category: Option<&str>,
        active_only: bool,
    ) -> Result<Vec<WorkflowDefinition>, RegistryError> {
        self.store
            .list(category, active_only)
            .await
            .map_err(|e| RegistryError::Store(e.to_string()))
    }

    /// Distinct categories, sorted
    pub async fn categories(&self) -> Result<Vec<String>, RegistryError> {
        self.store
            .categories()
            .await
            .map_err(|e| RegistryError::Store(e.to_string()))
    }

    /// Soft-deactivate every version of a named definition
    ///
    /// Running instances keep executing; new submissions are rejected.
    /// Returns false when the name is unknown.
    pub async fn deactivate(&self, name: &str) -> Result<bool, RegistryError> {
        let found = self
            .store
            .set_active(name, false)
            .await
            .map_err(|e| RegistryError::Store(e.to_string()))?;
        self.cache.write().await.remove(name);
        Ok(found)
    }

    /// Export a definition as pretty-printed JSON
    pub async fn export_json(&self, name: &str) -> Result<Option<String>, RegistryError> {
        match self.get(name, None).await? {
            Some(def) => Ok(Some(serde_json::to_string_pretty(&def)?)),
            None => Ok(None),
        }
    }

    /// Import a definition from JSON
    pub async fn import_json(
        &self,
        data: &str,
        overwrite: bool,
    ) -> Result<WorkflowDefinition, RegistryError> {
        let def: WorkflowDefinition = serde_json::from_str(data)?;
        self.register(&def, overwrite).await?;
        Ok(def)
    }

    /// Seed the built-in content-optimization workflows
    pub async fn seed_builtins(&self) -> Result<(), RegistryError> {
        for def in builtin_definitions() {
            self.register(&def, true).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Built-in Templates
// =============================================================================

/// The workflows shipped with the engine
#[must_use]
pub fn builtin_definitions() -> Vec<WorkflowDefinition> {
    vec![
        seo_optimization_workflow(),
        ab_testing_workflow(),
        quality_check_workflow(),
    ]
}

fn args(value: serde_json::Value) -> Map<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// SEO content optimization: analyze, extract keywords, generate and
/// apply suggestions
fn seo_optimization_workflow() -> WorkflowDefinition {
    let mut def = WorkflowDefinition::new(
        "seo_content_optimization",
        "seo",
        vec![
            StepSpec::new(
                "analyze_content",
                "Analyze Content",
                StepType::Analysis,
                "content_optimization.tasks.analyze_content",
            )
            .with_task_args(args(json!({"analysis_type": "seo"}))),
            StepSpec::new(
                "extract_keywords",
                "Extract Keywords",
                StepType::Analysis,
                "content_optimization.tasks.extract_keywords",
            )
            .with_depends_on(vec!["analyze_content".to_string()]),
            StepSpec::new(
                "generate_suggestions",
                "Generate SEO Suggestions",
                StepType::Optimization,
                "content_optimization.tasks.generate_seo_suggestions",
            )
            .with_depends_on(vec!["extract_keywords".to_string()]),
            StepSpec::new(
                "apply_optimizations",
                "Apply Optimizations",
                StepType::Approval,
                "content_optimization.tasks.apply_seo_optimizations",
            )
            .with_depends_on(vec!["generate_suggestions".to_string()]),
        ],
    );
    def.description = Some("Optimize content for search engines".to_string());
    def.tags = vec!["seo".to_string(), "optimization".to_string(), "content".to_string()];
    def
}

/// A/B testing: create variants, split traffic, monitor, pick a winner
fn ab_testing_workflow() -> WorkflowDefinition {
    let mut def = WorkflowDefinition::new(
        "ab_testing_workflow",
        "ab_test",
        vec![
            StepSpec::new(
                "create_variants",
                "Create Test Variants",
                StepType::Transformation,
                "content_optimization.tasks.create_test_variants",
            )
            .with_task_args(args(json!({"num_variants": 2}))),
            StepSpec::new(
                "setup_traffic_split",
                "Setup Traffic Split",
                StepType::Custom,
                "content_optimization.tasks.setup_traffic_split",
            )
            .with_depends_on(vec!["create_variants".to_string()]),
            StepSpec::new(
                "monitor_performance",
                "Monitor Performance",
                StepType::Analysis,
                "content_optimization.tasks.monitor_test_performance",
            )
            .with_depends_on(vec!["setup_traffic_split".to_string()])
            .with_task_args(args(json!({"check_interval": 3600}))),
            StepSpec::new(
                "calculate_winner",
                "Calculate Winner",
                StepType::Analysis,
                "content_optimization.tasks.calculate_test_winner",
            )
            .with_depends_on(vec!["monitor_performance".to_string()]),
        ],
    );
    def.description = Some("Create and manage A/B tests for content".to_string());
    def.tags = vec![
        "testing".to_string(),
        "optimization".to_string(),
        "experimentation".to_string(),
    ];
    def
}

/// Content quality: four independent checks fanned out in parallel,
/// then an aggregated report
fn quality_check_workflow() -> WorkflowDefinition {
    let mut def = WorkflowDefinition::new(
        "content_quality_check",
        "quality",
        vec![
            StepSpec::new(
                "run_checks",
                "Run Quality Checks",
                StepType::Parallel,
                "content_optimization.tasks.run_quality_checks",
            )
            .with_task_args(args(json!({
                "tasks": [
                    {"name": "content_optimization.tasks.check_grammar"},
                    {"name": "content_optimization.tasks.analyze_readability"},
                    {"name": "content_optimization.tasks.fact_check"},
                    {"name": "content_optimization.tasks.check_plagiarism"}
                ]
            })))
            .with_retry_policy(RetryPolicy {
                max_attempts: 2,
                delay_seconds: 30,
                backoff_multiplier: 2.0,
                max_delay_seconds: 120,
            }),
            StepSpec::new(
                "generate_report",
                "Generate Quality Report",
                StepType::Analysis,
                "content_optimization.tasks.generate_quality_report",
            )
            .with_depends_on(vec!["run_checks".to_string()]),
        ],
    );
    def.description = Some("Comprehensive content quality analysis".to_string());
    def.tags = vec![
        "quality".to_string(),
        "analysis".to_string(),
        "validation".to_string(),
    ];
    def
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_db::InMemoryDefinitionStore;

    fn registry() -> DefinitionRegistry {
        DefinitionRegistry::new(Arc::new(InMemoryDefinitionStore::new()))
    }

    fn simple_def(name: &str) -> WorkflowDefinition {
        WorkflowDefinition::new(
            name,
            "content",
            vec![StepSpec::new("a", "A", StepType::Analysis, "tasks.a")],
        )
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = registry();
        registry.register(&simple_def("wf"), false).await.unwrap();

        let found = registry.get("wf", None).await.unwrap().unwrap();
        assert_eq!(found.name, "wf");

        // Cached path returns the same definition
        let cached = registry.get("wf", None).await.unwrap().unwrap();
        assert_eq!(cached.id, found.id);
    }

    #[tokio::test]
    async fn test_register_without_overwrite_fails_on_existing() {
        let registry = registry();
        registry.register(&simple_def("wf"), false).await.unwrap();

        let result = registry.register(&simple_def("wf"), false).await;
        assert!(matches!(result, Err(RegistryError::AlreadyExists(_))));

        // Overwrite upserts
        registry.register(&simple_def("wf"), true).await.unwrap();
    }

    #[tokio::test]
    async fn test_register_is_idempotent_with_overwrite() {
        let registry = registry();
        let def = simple_def("wf");

        registry.register(&def, true).await.unwrap();
        registry.register(&def, true).await.unwrap();

        let all = registry.list(None, false).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_definition() {
        let registry = registry();
        let mut def = simple_def("wf");
        def.steps[0].depends_on = vec!["missing".to_string()];

        let result = registry.register(&def, false).await;
        assert!(matches!(result, Err(RegistryError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_deactivate_hides_definition() {
        let registry = registry();
        registry.register(&simple_def("wf"), false).await.unwrap();

        assert!(registry.deactivate("wf").await.unwrap());
        assert!(registry.get("wf", None).await.unwrap().is_none());
        assert!(!registry.deactivate("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_export_import_roundtrip() {
        let reg = registry();
        reg.register(&simple_def("wf"), false).await.unwrap();

        let json = reg.export_json("wf").await.unwrap().unwrap();
        let other = registry();
        let imported = other.import_json(&json, false).await.unwrap();

        assert_eq!(imported.name, "wf");
        assert!(other.get("wf", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_import_rejects_malformed_payload() {
        let registry = registry();
        let result = registry.import_json("{not json", false).await;
        assert!(matches!(result, Err(RegistryError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_seed_builtins() {
        let registry = registry();
        registry.seed_builtins().await.unwrap();

        for name in [
            "seo_content_optimization",
            "ab_testing_workflow",
            "content_quality_check",
        ] {
            let def = registry.get(name, None).await.unwrap();
            assert!(def.is_some(), "builtin {name} missing");
            validate_definition(&def.unwrap()).unwrap();
        }

        let categories = registry.categories().await.unwrap();
        assert_eq!(categories, vec!["ab_test", "quality", "seo"]);

        // Seeding again is idempotent in count
        registry.seed_builtins().await.unwrap();
        assert_eq!(registry.list(None, true).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_list_by_category() {
        let registry = registry();
        registry.seed_builtins().await.unwrap();

        let seo = registry.list(Some("seo"), true).await.unwrap();
        assert_eq!(seo.len(), 1);
        assert_eq!(seo[0].name, "seo_content_optimization");
    }
}
