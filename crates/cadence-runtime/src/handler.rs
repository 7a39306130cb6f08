//! Step handler trait and registry
//!
//! A workflow step names a handler by string. The [`HandlerRegistry`]
//! resolves that name to an implementation of [`StepHandler`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::StepError;

/// Read-only view handed to a step while it runs
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub step_index: usize,
    pub step_id: String,
    /// Parameters the run was started with
    pub params: Value,
    /// Outputs of completed steps keyed by step id
    pub outputs: serde_json::Map<String, Value>,
}

/// The interface every step handler implements.
///
/// `handle` receives the step config with templates already resolved.
/// Return [`StepError::Transient`] or [`StepError::DependencyDown`] for
/// failures worth retrying, anything else to fail the step at once.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Name workflows use to refer to this handler
    fn name(&self) -> &str;

    async fn handle(&self, config: &Value, ctx: &StepContext) -> Result<Value, StepError>;

    /// Check a config at definition time. Templates are still unresolved.
    fn validate(&self, _config: &Value) -> Result<(), StepError> {
        Ok(())
    }

    /// Dependency this call guards with a circuit breaker. A step's
    /// explicit `dependency` takes precedence.
    fn dependency(&self, _config: &Value) -> Option<String> {
        None
    }
}

/// Handlers by name
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with echo, sleep and http registered
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::builtins::register_all(&mut registry);
        registry
    }

    /// Returns false if a handler with this name already exists
    pub fn register(&mut self, handler: Arc<dyn StepHandler>) -> bool {
        let name = handler.name().to_string();
        if self.handlers.contains_key(&name) {
            tracing::warn!(handler = %name, "Step handler already registered, keeping the first");
            return false;
        }
        self.handlers.insert(name, handler);
        true
    }

    pub fn register_replace(&mut self, handler: Arc<dyn StepHandler>) {
        let name = handler.name().to_string();
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::debug!(handler = %name, "Replaced step handler");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
