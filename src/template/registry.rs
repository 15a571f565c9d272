/*!
 * Template Registry
 * Maps `templateKind` to its registered implementation
 */

use super::traits::ServiceTemplate;
use crate::core::errors::{OrchestratorError, OrchestratorResult};
use ahash::RandomState;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Clone, Default)]
pub struct TemplateRegistry {
    templates: Arc<DashMap<String, Arc<dyn ServiceTemplate>, RandomState>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self {
            templates: Arc::new(DashMap::with_hasher(RandomState::new())),
        }
    }

    /// Register (or replace) the template for its kind
    pub fn register(&self, template: Arc<dyn ServiceTemplate>) {
        let kind = template.kind().to_string();
        info!(kind = %kind, "Template registered");
        self.templates.insert(kind, template);
    }

    pub fn get(&self, kind: &str) -> OrchestratorResult<Arc<dyn ServiceTemplate>> {
        self.templates
            .get(kind)
            .map(|t| Arc::clone(t.value()))
            .ok_or_else(|| OrchestratorError::UnknownTemplate(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.templates.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.templates.iter().map(|e| e.key().clone()).collect();
        kinds.sort();
        kinds
    }
}
