//! Slug to definition lookup for tasks and workflows.

use crate::definition::{TaskDefinition, WorkflowDefinition};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tsuzuki_core::{Slug, WorkflowError};

/// Slug under which inline task records are stored.
pub const INLINE_TASK_SLUG: &str = "inline";

/// Task and workflow definitions, keyed by slug.
///
/// Task and workflow slugs share a single namespace. The registry is filled
/// once at startup and read-only while jobs run.
#[derive(Default)]
pub struct Registry {
    tasks: HashMap<Slug, Arc<TaskDefinition>>,
    workflows: HashMap<Slug, Arc<WorkflowDefinition>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .field("workflows", &self.workflows.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new registry builder.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Registers a task.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::DuplicateSlug`] if any task or workflow
    /// already uses the slug.
    pub fn register_task(&mut self, definition: TaskDefinition) -> Result<(), WorkflowError> {
        self.ensure_available(definition.slug())?;
        self.tasks
            .insert(definition.slug().clone(), Arc::new(definition));
        Ok(())
    }

    /// Registers a workflow.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::DuplicateSlug`] if any task or workflow
    /// already uses the slug.
    pub fn register_workflow(
        &mut self,
        definition: WorkflowDefinition,
    ) -> Result<(), WorkflowError> {
        self.ensure_available(definition.slug())?;
        self.workflows
            .insert(definition.slug().clone(), Arc::new(definition));
        Ok(())
    }

    fn ensure_available(&self, slug: &Slug) -> Result<(), WorkflowError> {
        if slug.as_str() == INLINE_TASK_SLUG {
            return Err(WorkflowError::Configuration(format!(
                "slug '{INLINE_TASK_SLUG}' is reserved for inline tasks"
            )));
        }
        if self.tasks.contains_key(slug) || self.workflows.contains_key(slug) {
            return Err(WorkflowError::DuplicateSlug(slug.clone()));
        }
        Ok(())
    }

    /// Looks up a task definition.
    pub fn task(&self, slug: &str) -> Result<Arc<TaskDefinition>, WorkflowError> {
        self.tasks
            .get(slug)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownTask(Slug::new(slug)))
    }

    /// Looks up a workflow definition.
    pub fn workflow(&self, slug: &str) -> Result<Arc<WorkflowDefinition>, WorkflowError> {
        self.workflows
            .get(slug)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownWorkflow(Slug::new(slug)))
    }

    /// Returns an iterator over all registered task slugs.
    pub fn task_slugs(&self) -> impl Iterator<Item = &Slug> {
        self.tasks.keys()
    }

    /// Returns an iterator over all registered workflow slugs.
    pub fn workflow_slugs(&self) -> impl Iterator<Item = &Slug> {
        self.workflows.keys()
    }
}

/// Builder for constructing a [`Registry`].
///
/// # Examples
///
/// ```
/// use tsuzuki::prelude::*;
/// use serde_json::Value;
///
/// let echo = |input: Value| async move { Ok::<_, TaskFailure>(input) };
/// let result = Registry::builder()
///     .task(TaskDefinition::new("echo", echo))
///     .task(TaskDefinition::new("echo", echo))
///     .build();
/// assert!(matches!(result, Err(WorkflowError::DuplicateSlug(_))));
/// ```
#[derive(Default)]
pub struct RegistryBuilder {
    tasks: Vec<TaskDefinition>,
    workflows: Vec<WorkflowDefinition>,
}

impl RegistryBuilder {
    /// Creates a new empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task definition.
    pub fn task(mut self, definition: TaskDefinition) -> Self {
        self.tasks.push(definition);
        self
    }

    /// Adds a workflow definition.
    pub fn workflow(mut self, definition: WorkflowDefinition) -> Self {
        self.workflows.push(definition);
        self
    }

    /// Builds the registry, failing on the first slug collision.
    pub fn build(self) -> Result<Registry, WorkflowError> {
        let mut registry = Registry::new();
        for task in self.tasks {
            registry.register_task(task)?;
        }
        for workflow in self.workflows {
            registry.register_workflow(workflow)?;
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TaskContext;
    use serde_json::Value;
    use tsuzuki_core::TaskFailure;

    fn task(slug: &str) -> TaskDefinition {
        TaskDefinition::new(slug, |input: Value| async move { Ok::<_, TaskFailure>(input) })
    }

    fn workflow(slug: &str) -> WorkflowDefinition {
        WorkflowDefinition::new(slug, |_input: Value, _tasks: TaskContext| async {
            Ok::<(), WorkflowError>(())
        })
    }

    #[test]
    fn test_lookup() {
        let registry = Registry::builder()
            .task(task("createPost"))
            .workflow(workflow("createPostAndUpdate"))
            .build()
            .expect("valid registry");

        assert!(registry.task("createPost").is_ok());
        assert!(registry.workflow("createPostAndUpdate").is_ok());
        assert_eq!(registry.task_slugs().count(), 1);
        assert!(matches!(
            registry.task("missing"),
            Err(WorkflowError::UnknownTask(slug)) if slug.as_str() == "missing"
        ));
        assert!(matches!(
            registry.workflow("createPost"),
            Err(WorkflowError::UnknownWorkflow(_))
        ));
    }

    #[test]
    fn test_duplicate_task_slug() {
        let mut registry = Registry::new();
        registry.register_task(task("createPost")).expect("first");
        let err = registry.register_task(task("createPost")).unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateSlug(slug) if slug.as_str() == "createPost"));
    }

    #[test]
    fn test_task_and_workflow_share_namespace() {
        let result = Registry::builder()
            .task(task("publish"))
            .workflow(workflow("publish"))
            .build();
        assert!(matches!(result, Err(WorkflowError::DuplicateSlug(_))));

        let mut registry = Registry::new();
        registry.register_workflow(workflow("publish")).expect("first");
        assert!(matches!(
            registry.register_task(task("publish")),
            Err(WorkflowError::DuplicateSlug(_))
        ));
    }

    #[test]
    fn test_inline_slug_is_reserved() {
        let result = Registry::builder().task(task(INLINE_TASK_SLUG)).build();
        assert!(matches!(result, Err(WorkflowError::Configuration(_))));
    }
}
