/*!
 * Template Traits
 *
 * The capability contract every service kind implements. Templates are
 * external collaborators: the supervisor calls them under a timeout and panic
 * boundary and owns whatever `ProcessHandle` they hand back.
 */

use crate::core::types::{Budget, InstanceId, Port};
use crate::health::ProbeSpec;
use crate::instance::ServiceInstance;
use crate::optimization::Directive;
use crate::process::ProcessHandle;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Collaborator failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("{0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Invalid template configuration: {0}")]
    InvalidConfig(String),
}

impl From<std::io::Error> for TemplateError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

pub type TemplateResult<T> = Result<T, TemplateError>;

/// What a template sees of its instance
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateContext {
    pub id: InstanceId,
    pub name: String,
    pub port: Port,
    pub budget: Budget,
    pub config: BTreeMap<String, String>,
    pub log_dir: PathBuf,
}

impl TemplateContext {
    pub fn from_instance(instance: &ServiceInstance, log_dir: &Path) -> Self {
        Self {
            id: instance.id.clone(),
            name: instance.name.clone(),
            port: instance.port,
            budget: instance.granted,
            config: instance.config.clone(),
            log_dir: log_dir.to_path_buf(),
        }
    }

    /// Conventional per-instance log file
    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(format!("{}.log", self.id))
    }

    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// Deployment recipe for one `templateKind`
#[async_trait]
pub trait ServiceTemplate: Send + Sync {
    fn kind(&self) -> &str;

    /// Reject unusable configuration at creation time
    fn validate(&self, _config: &BTreeMap<String, String>) -> TemplateResult<()> {
        Ok(())
    }

    /// First-time provisioning; not assumed idempotent
    async fn deploy(&self, ctx: &TemplateContext) -> TemplateResult<()>;

    async fn start(&self, ctx: &TemplateContext) -> TemplateResult<ProcessHandle>;

    async fn stop(&self, ctx: &TemplateContext, handle: &mut ProcessHandle) -> TemplateResult<()>;

    /// Release everything the template created
    async fn delete(&self, ctx: &TemplateContext) -> TemplateResult<()>;

    /// How health should be checked
    fn probe(&self, ctx: &TemplateContext) -> ProbeSpec;

    /// Act on an advisory directive; ignoring it is allowed
    async fn apply_directive(
        &self,
        _ctx: &TemplateContext,
        _handle: &ProcessHandle,
        _directive: &Directive,
    ) -> TemplateResult<()> {
        Ok(())
    }

    /// Where error reports should point the operator
    fn log_location(&self, ctx: &TemplateContext) -> Option<String> {
        Some(ctx.log_path().display().to_string())
    }
}
