/*!
 * Autosave
 * Periodic safety-net write of the instance table
 */

use super::store::StateStore;
use crate::core::periodic::PeriodicJob;
use crate::instance::InstanceTable;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{trace, warn};

pub struct AutosaveJob {
    store: Arc<StateStore>,
    table: InstanceTable,
}

impl AutosaveJob {
    pub fn new(store: Arc<StateStore>, table: InstanceTable) -> Self {
        Self { store, table }
    }
}

#[async_trait]
impl PeriodicJob for AutosaveJob {
    fn name(&self) -> &'static str {
        "autosave"
    }

    async fn tick(&self) {
        match self.store.persist(&self.table).await {
            Ok(true) => trace!(revision = self.table.revision(), "Autosaved"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Autosave failed"),
        }
    }
}
