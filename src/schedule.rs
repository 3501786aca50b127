//! Background trigger: once at startup, then on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::consolidate::{ConsolidateRequest, Consolidator, RunOutcome};
use crate::error::TallyError;

#[derive(Debug, Clone, Default)]
pub struct Schedule {
    pub run_on_start: bool,
    /// Wait before the first run so startup isn't slowed.
    pub startup_delay: Duration,
    pub every: Option<Duration>,
}

impl Schedule {
    pub fn is_idle(&self) -> bool {
        !self.run_on_start && self.every.is_none()
    }
}

/// Spawn the trigger loop. `None` when the schedule never fires.
pub fn spawn(consolidator: Arc<Consolidator>, schedule: Schedule) -> Option<JoinHandle<()>> {
    if schedule.is_idle() {
        return None;
    }
    Some(tokio::spawn(async move {
        tokio::time::sleep(schedule.startup_delay).await;
        if schedule.run_on_start {
            run_once(&consolidator, "startup").await;
        }
        let Some(every) = schedule.every else {
            return;
        };
        loop {
            tokio::time::sleep(every).await;
            if consolidator.is_stopping() {
                return;
            }
            run_once(&consolidator, "interval").await;
        }
    }))
}

/// One scheduled run with configured defaults. Overlap with an on-demand run
/// is not an error, the scheduled one just yields.
pub async fn run_once(consolidator: &Consolidator, trigger: &'static str) -> Option<RunOutcome> {
    match consolidator.run(ConsolidateRequest::default()).await {
        Ok(o) => {
            if o.records_deleted > 0 || o.errors.total() > 0 {
                info!(
                    trigger,
                    merged = o.groups_merged,
                    deleted = o.records_deleted,
                    errors = o.errors.total(),
                    "auto-consolidate"
                );
            }
            Some(o)
        }
        Err(TallyError::AlreadyRunning) => {
            debug!(trigger, "consolidation already running, skipped");
            None
        }
        Err(TallyError::ShuttingDown) => {
            debug!(trigger, "shutting down, skipped");
            None
        }
        Err(e) => {
            warn!(trigger, error = %e, "auto-consolidate failed");
            None
        }
    }
}
