mod backup;
mod report;

pub use backup::{BackupJob, SnapshotSource};
pub use report::{DynamicReportJob, ReportEmailJob, report_window};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ActionError;
use crate::model::{JobKind, Ms, ScheduleConfig};

/// The side effect behind one job kind. The dispatcher only sees this.
#[async_trait]
pub trait JobAction: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Run once for `config`. `now` is the tick instant that found it due.
    async fn fire(&self, config: &ScheduleConfig, now: Ms) -> Result<(), ActionError>;
}

/// Actions keyed by the kind they serve.
#[derive(Clone, Default)]
pub struct JobSet {
    actions: HashMap<JobKind, Arc<dyn JobAction>>,
}

impl JobSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action, replacing any previous one for the same kind.
    pub fn with(mut self, action: Arc<dyn JobAction>) -> Self {
        self.actions.insert(action.kind(), action);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobAction>> {
        self.actions.get(&kind).cloned()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
