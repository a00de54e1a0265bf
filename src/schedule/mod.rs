mod due;

pub use due::{is_due, is_occurrence, occurrence};

use std::collections::BTreeMap;

use tokio::sync::RwLock;

use crate::collaborators::REPORT_TEMPLATES;
use crate::error::ConfigError;
use crate::journal::{Journal, JournalError};
use crate::limits::*;
use crate::model::*;
use crate::timezone::parse_timezone;

/// Administrator input for one schedule. Applied as an upsert keyed by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleUpdate {
    pub kind: JobKind,
    pub enabled: bool,
    pub frequency: Frequency,
    pub target_hour: u32,
    pub timezone: Option<String>,
    pub recipients: Vec<String>,
    pub template: Option<String>,
}

impl ScheduleUpdate {
    pub fn new(kind: JobKind, frequency: Frequency, target_hour: u32) -> Self {
        Self {
            kind,
            enabled: true,
            frequency,
            target_hour,
            timezone: None,
            recipients: Vec::new(),
            template: None,
        }
    }
}

fn validate_recipient(addr: &str) -> Result<(), ConfigError> {
    match addr.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') && !domain.contains('@') => {
            Ok(())
        }
        _ => Err(ConfigError::InvalidRecipient(addr.to_string())),
    }
}

fn apply(schedules: &mut BTreeMap<JobKind, ScheduleConfig>, event: &Event) {
    match event {
        Event::ScheduleConfigured { config } => {
            schedules.insert(config.kind, config.clone());
        }
        Event::ScheduleFired { kind, at } => {
            if let Some(cfg) = schedules.get_mut(kind) {
                cfg.last_fired = Some(*at);
                cfg.last_result = Some(JobOutcome::Success);
            }
        }
        Event::ScheduleFailed { kind, reason } => {
            if let Some(cfg) = schedules.get_mut(kind) {
                cfg.last_result = Some(JobOutcome::Failure(reason.clone()));
            }
        }
        _ => {}
    }
}

/// The recurring-job configurations, one per [`JobKind`].
///
/// Every write holds the registry lock across journal append and apply, so a
/// schedule's recorded outcome is never torn against a concurrent reconfigure.
pub struct ScheduleRegistry {
    journal: Journal,
    schedules: RwLock<BTreeMap<JobKind, ScheduleConfig>>,
}

impl ScheduleRegistry {
    pub fn from_events(journal: Journal, events: &[Event]) -> Self {
        let mut schedules = BTreeMap::new();
        for event in events {
            apply(&mut schedules, event);
        }
        Self {
            journal,
            schedules: RwLock::new(schedules),
        }
    }

    /// Validate and store a schedule. Firing history survives reconfiguration.
    pub async fn configure(&self, update: ScheduleUpdate) -> Result<ScheduleConfig, ConfigError> {
        if update.target_hour > 23 {
            return Err(ConfigError::InvalidHour(update.target_hour));
        }
        let timezone = match update.timezone.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(name) => Some(parse_timezone(name)?.name().to_string()),
        };
        if update.recipients.len() > MAX_RECIPIENTS {
            return Err(ConfigError::LimitExceeded("too many recipients"));
        }
        let recipients: Vec<String> = update
            .recipients
            .iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        for r in &recipients {
            validate_recipient(r)?;
        }
        let template = match update.template.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(t) if t.len() > MAX_TEMPLATE_LEN => {
                return Err(ConfigError::LimitExceeded("template name too long"));
            }
            Some(t) if !REPORT_TEMPLATES.contains(&t) => {
                return Err(ConfigError::UnknownTemplate(t.to_string()));
            }
            Some(t) => Some(t.to_string()),
        };
        match update.kind {
            JobKind::ReportEmail | JobKind::DynamicReport if recipients.is_empty() => {
                return Err(ConfigError::MissingRecipients(update.kind.as_str()));
            }
            JobKind::DynamicReport if template.is_none() => {
                return Err(ConfigError::MissingTemplate);
            }
            _ => {}
        }

        let _permit = self.journal.permit().await;
        let mut schedules = self.schedules.write().await;
        let previous = schedules.get(&update.kind);
        let config = ScheduleConfig {
            kind: update.kind,
            enabled: update.enabled,
            frequency: update.frequency,
            target_hour: update.target_hour,
            timezone,
            recipients,
            template,
            last_fired: previous.and_then(|p| p.last_fired),
            last_result: previous.and_then(|p| p.last_result.clone()),
        };
        let event = Event::ScheduleConfigured { config: config.clone() };
        self.journal.append(&event).await?;
        apply(&mut schedules, &event);
        tracing::info!(
            "schedule {} configured: {} at {:02}:00 ({})",
            config.kind.as_str(),
            config.frequency.as_str(),
            config.target_hour,
            config.timezone.as_deref().unwrap_or("global timezone")
        );
        Ok(config)
    }

    pub async fn get(&self, kind: JobKind) -> Option<ScheduleConfig> {
        self.schedules.read().await.get(&kind).cloned()
    }

    /// All schedules, ordered by kind.
    pub async fn list(&self) -> Vec<ScheduleConfig> {
        self.schedules.read().await.values().cloned().collect()
    }

    /// Advance `last_fired` to `at` and mark the run successful.
    pub async fn record_success(&self, kind: JobKind, at: Ms) -> Result<(), JournalError> {
        self.record(Event::ScheduleFired { kind, at }).await
    }

    /// Record a failed run. `last_fired` stays put so the job is retried.
    pub async fn record_failure(&self, kind: JobKind, reason: String) -> Result<(), JournalError> {
        self.record(Event::ScheduleFailed { kind, reason }).await
    }

    async fn record(&self, event: Event) -> Result<(), JournalError> {
        let _permit = self.journal.permit().await;
        let mut schedules = self.schedules.write().await;
        self.journal.append(&event).await?;
        apply(&mut schedules, &event);
        Ok(())
    }

    pub async fn snapshot_events(&self) -> Vec<Event> {
        self.schedules
            .read()
            .await
            .values()
            .map(|config| Event::ScheduleConfigured { config: config.clone() })
            .collect()
    }
}
