//! HandlerRegistry - Handler の登録と class_name による解決
//!
//! - HashMap での型消去された trait object の管理
//! - 起動時検証（Fail-fast）: `expect_classes`

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::class::JobClass;
use super::typed::{DynHandler, Handler, TypedHandler};
use crate::domain::{Job, JobError};
use crate::error::SpoolError;
use crate::ports::JobExecutor;

/// Class name recorded on the failed execution of a job nobody can run.
pub const HANDLER_NOT_FOUND: &str = "HandlerNotFound";

/// HandlerRegistry は class_name → Handler の対応表
///
/// # 使用例
/// ```ignore
/// let mut registry = HandlerRegistry::new();
/// registry.register::<SendInvoice, _>(SendInvoiceHandler)?;
/// registry.expect_classes(&["billing.send_invoice"])?;
///
/// let executor: Arc<dyn JobExecutor> = Arc::new(registry);
/// ```
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn DynHandler>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for class '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("missing handlers for classes: {0:?}")]
    MissingClasses(Vec<String>),
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<J: JobClass, H: Handler<J> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        let class = J::CLASS.to_string();
        if self.handlers.contains_key(&class) {
            return Err(RegistryError::AlreadyRegistered(class));
        }
        self.handlers
            .insert(class, Arc::new(TypedHandler::<J, H>::new(handler)));
        Ok(())
    }

    pub fn get(&self, class_name: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(class_name).cloned()
    }

    /// Like `get`, but an unknown class is `SpoolError::HandlerNotFound`.
    pub fn resolve(&self, class_name: &str) -> Result<Arc<dyn DynHandler>, SpoolError> {
        self.get(class_name)
            .ok_or_else(|| SpoolError::HandlerNotFound(class_name.to_string()))
    }

    /// Registered class names, sorted.
    pub fn registered_classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.handlers.keys().cloned().collect();
        classes.sort();
        classes
    }

    /// Fails unless every class in `expected` has a handler.
    pub fn expect_classes(&self, expected: &[&str]) -> Result<(), RegistryError> {
        let missing: Vec<String> = expected
            .iter()
            .filter(|class| !self.handlers.contains_key(**class))
            .map(|class| class.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::MissingClasses(missing))
        }
    }
}

#[async_trait]
impl JobExecutor for HandlerRegistry {
    async fn perform(&self, job: &Job) -> Result<(), JobError> {
        let handler = self.resolve(&job.class_name).map_err(|e| {
            warn!(job_id = %job.id, class = %job.class_name, "no handler registered for job class");
            JobError::new(HANDLER_NOT_FOUND, e.to_string())
        })?;
        handler.perform_dyn(job.arguments.clone()).await
    }
}
