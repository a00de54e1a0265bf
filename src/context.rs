use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::collaborators::{DirectoryUploader, JsonReportGenerator, LogMailer, Mailer, ReportGenerator};
use crate::engine::Engine;
use crate::error::ActionError;
use crate::jobs::{BackupJob, DynamicReportJob, JobSet, ReportEmailJob, SnapshotSource};
use crate::journal::{Journal, JournalError};
use crate::model::Event;
use crate::schedule::ScheduleRegistry;
use crate::settings::Settings;
use crate::timezone::TimezoneService;
use crate::wal;

pub const JOURNAL_FILE: &str = "parkd.wal";

/// Everything stateful, built once at startup and handed to the dispatcher,
/// the compactor, and every connection.
pub struct Context {
    pub journal: Journal,
    pub settings: Arc<Settings>,
    pub timezone: Arc<TimezoneService>,
    pub engine: Arc<Engine>,
    pub schedules: Arc<ScheduleRegistry>,
    journal_path: PathBuf,
}

impl Context {
    /// Replay the journal in `data_dir` and build every component from it.
    /// Must be called from within a tokio runtime.
    pub fn open(data_dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let journal_path = data_dir.join(JOURNAL_FILE);
        let (journal, events) = Journal::open(&journal_path)?;

        let settings = Arc::new(Settings::from_events(journal.clone(), &events));
        let timezone = Arc::new(TimezoneService::new(settings.clone()));
        let engine = Arc::new(Engine::from_events(journal.clone(), timezone.clone(), &events));
        let schedules = Arc::new(ScheduleRegistry::from_events(journal.clone(), &events));
        tracing::info!(
            "state restored: {} resources, timezone {}",
            engine.state.len(),
            timezone.resolve().name()
        );

        Ok(Self {
            journal,
            settings,
            timezone,
            engine,
            schedules,
            journal_path,
        })
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    /// Events recreating the current state of every component.
    /// Callers that need a consistent cut hold [`Journal::exclusive`].
    pub async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = self.settings.snapshot_events();
        events.extend(self.engine.snapshot_events().await);
        events.extend(self.schedules.snapshot_events().await);
        events
    }

    /// Rewrite the journal from a snapshot. Returns the number of events kept.
    pub async fn compact(&self) -> Result<usize, JournalError> {
        let _exclusive = self.journal.exclusive().await;
        let events = self.snapshot_events().await;
        let count = events.len();
        self.journal.compact(events).await?;
        Ok(count)
    }

    /// The stock job actions: log-only mail, JSON reports, local-directory backups.
    pub fn default_jobs(self: &Arc<Self>, backup_dir: impl Into<PathBuf>) -> JobSet {
        let generator: Arc<dyn ReportGenerator> = Arc::new(JsonReportGenerator::new(self.engine.clone()));
        let mailer: Arc<dyn Mailer> = Arc::new(LogMailer);
        JobSet::new()
            .with(Arc::new(ReportEmailJob::new(
                generator.clone(),
                mailer.clone(),
                self.timezone.clone(),
            )))
            .with(Arc::new(DynamicReportJob::new(
                generator,
                mailer,
                self.timezone.clone(),
            )))
            .with(Arc::new(BackupJob::new(
                self.clone(),
                Arc::new(DirectoryUploader::new(backup_dir)),
            )))
    }
}

#[async_trait]
impl SnapshotSource for Context {
    async fn snapshot(&self) -> Result<Vec<u8>, ActionError> {
        let events = {
            let _exclusive = self.journal.exclusive().await;
            self.snapshot_events().await
        };
        wal::encode_snapshot(&events).map_err(|e| ActionError::Snapshot(e.to_string()))
    }
}
