use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::now_ms;
use crate::error::ActionError;
use crate::jobs::{JobAction, JobSet};
use crate::model::*;
use crate::observability;
use crate::schedule::{ScheduleRegistry, is_due};
use crate::timezone::TimezoneService;

pub const DEFAULT_TICK: Duration = Duration::from_secs(600);
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Result of one firing within a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firing {
    pub kind: JobKind,
    pub outcome: JobOutcome,
}

/// Single polling loop over every registered schedule.
///
/// Only one instance may run against a journal; nothing coordinates two.
pub struct JobDispatcher {
    schedules: Arc<ScheduleRegistry>,
    timezone: Arc<TimezoneService>,
    jobs: JobSet,
    tick: Duration,
    action_timeout: Duration,
}

impl JobDispatcher {
    pub fn new(schedules: Arc<ScheduleRegistry>, timezone: Arc<TimezoneService>, jobs: JobSet) -> Self {
        Self {
            schedules,
            timezone,
            jobs,
            tick: DEFAULT_TICK,
            action_timeout: DEFAULT_ACTION_TIMEOUT,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// Tick until cancelled. Ticks never overlap; late ones are skipped.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "dispatcher started: {} jobs, tick {}s",
            self.jobs.len(),
            self.tick.as_secs()
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick_at(now_ms()).await;
                }
            }
        }
        info!("dispatcher stopped");
    }

    /// Evaluate every schedule against `now` and fire the due ones in turn.
    pub async fn tick_at(&self, now: Ms) -> Vec<Firing> {
        let started = Instant::now();
        let mut firings = Vec::new();

        for config in self.schedules.list().await {
            let tz = self.timezone.zone_for(config.timezone.as_deref());
            if !is_due(&config, now, tz) {
                continue;
            }
            let outcome = match self.jobs.get(config.kind) {
                Some(action) => self.fire(action, &config, now).await,
                None => {
                    warn!("schedule {} is due but has no action", config.kind.as_str());
                    JobOutcome::Failure(ActionError::NotConfigured("action").to_string())
                }
            };
            self.record(config.kind, now, &outcome).await;
            firings.push(Firing {
                kind: config.kind,
                outcome,
            });
        }

        metrics::histogram!(observability::TICK_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        debug!("tick at {now}: {} fired", firings.len());
        firings
    }

    /// Run the action on its own task under the timeout. A panic or a hang in
    /// one job becomes that job's failure.
    async fn fire(&self, action: Arc<dyn JobAction>, config: &ScheduleConfig, now: Ms) -> JobOutcome {
        let kind = config.kind;
        let started = Instant::now();
        let task_config = config.clone();
        let mut handle = tokio::spawn(async move { action.fire(&task_config, now).await });

        let result = match tokio::time::timeout(self.action_timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ActionError::Aborted(join.to_string())),
            Err(_) => {
                handle.abort();
                Err(ActionError::TimedOut(self.action_timeout))
            }
        };
        metrics::histogram!(observability::JOB_DURATION_SECONDS, "kind" => kind.as_str())
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                info!("job {} fired", kind.as_str());
                JobOutcome::Success
            }
            Err(e) => {
                error!("job {} failed: {e}", kind.as_str());
                JobOutcome::Failure(e.to_string())
            }
        }
    }

    async fn record(&self, kind: JobKind, now: Ms, outcome: &JobOutcome) {
        let (label, result) = match outcome {
            JobOutcome::Success => ("success", self.schedules.record_success(kind, now).await),
            JobOutcome::Failure(reason) => (
                "failure",
                self.schedules.record_failure(kind, reason.clone()).await,
            ),
        };
        metrics::counter!(
            observability::JOB_FIRINGS_TOTAL,
            "kind" => kind.as_str(),
            "outcome" => label
        )
        .increment(1);
        if let Err(e) = result {
            // The action already ran; an unrecorded success fires again next tick.
            error!("could not record {label} for {}: {e}", kind.as_str());
        }
    }
}
