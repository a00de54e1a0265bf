use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Days, Months};
use chrono_tz::Tz;

use crate::collaborators::{Mailer, ReportGenerator, ReportKind, ReportRequest};
use crate::error::ActionError;
use crate::model::*;
use crate::timezone::{TimezoneService, start_of_local_day, to_local};

use super::JobAction;

/// `[from, to)` covered by a report fired at `now`: the period that ended at
/// the start of the local day, one daily/weekly/monthly period long.
pub fn report_window(frequency: Frequency, now: Ms, tz: Tz) -> (Ms, Ms) {
    let to = start_of_local_day(now, tz);
    let day = to_local(to, tz).date_naive();
    let first = match frequency {
        Frequency::Daily => day.checked_sub_days(Days::new(1)),
        Frequency::Weekly => day.checked_sub_days(Days::new(7)),
        Frequency::Monthly => day.checked_sub_months(Months::new(1)),
    };
    let from = first
        .and_then(|d| d.and_hms_opt(12, 0, 0))
        .and_then(|noon| noon.and_local_timezone(tz).earliest())
        .map(|dt| start_of_local_day(dt.timestamp_millis(), tz))
        .unwrap_or(to);
    (from, to)
}

fn subject(title: &str, from: Ms, to: Ms, tz: Tz) -> String {
    let first = to_local(from, tz).date_naive();
    let last = to_local(to - 1, tz).date_naive();
    if first == last {
        format!("{title} for {first}")
    } else {
        format!("{title} {first} to {last}")
    }
}

async fn render_and_mail(
    generator: &dyn ReportGenerator,
    mailer: &dyn Mailer,
    timezone: &TimezoneService,
    config: &ScheduleConfig,
    now: Ms,
    kind: ReportKind,
    title: &str,
) -> Result<(), ActionError> {
    if config.recipients.is_empty() {
        return Err(ActionError::NotConfigured("recipients"));
    }
    let tz = timezone.zone_for(config.timezone.as_deref());
    let (from, to) = report_window(config.frequency, now, tz);
    let body = generator.render(&ReportRequest { kind, from, to }).await?;
    let body = String::from_utf8_lossy(&body);
    mailer
        .send(&config.recipients, &subject(title, from, to, tz), &body)
        .await
}

/// Mails the reservation summary for the last period.
pub struct ReportEmailJob {
    generator: Arc<dyn ReportGenerator>,
    mailer: Arc<dyn Mailer>,
    timezone: Arc<TimezoneService>,
}

impl ReportEmailJob {
    pub fn new(
        generator: Arc<dyn ReportGenerator>,
        mailer: Arc<dyn Mailer>,
        timezone: Arc<TimezoneService>,
    ) -> Self {
        Self { generator, mailer, timezone }
    }
}

#[async_trait]
impl JobAction for ReportEmailJob {
    fn kind(&self) -> JobKind {
        JobKind::ReportEmail
    }

    async fn fire(&self, config: &ScheduleConfig, now: Ms) -> Result<(), ActionError> {
        render_and_mail(
            self.generator.as_ref(),
            self.mailer.as_ref(),
            &self.timezone,
            config,
            now,
            ReportKind::Summary,
            "Parking report",
        )
        .await
    }
}

/// Mails a report rendered from the schedule's template.
pub struct DynamicReportJob {
    generator: Arc<dyn ReportGenerator>,
    mailer: Arc<dyn Mailer>,
    timezone: Arc<TimezoneService>,
}

impl DynamicReportJob {
    pub fn new(
        generator: Arc<dyn ReportGenerator>,
        mailer: Arc<dyn Mailer>,
        timezone: Arc<TimezoneService>,
    ) -> Self {
        Self { generator, mailer, timezone }
    }
}

#[async_trait]
impl JobAction for DynamicReportJob {
    fn kind(&self) -> JobKind {
        JobKind::DynamicReport
    }

    async fn fire(&self, config: &ScheduleConfig, now: Ms) -> Result<(), ActionError> {
        let template = config
            .template
            .clone()
            .ok_or(ActionError::NotConfigured("template"))?;
        let title = format!("Parking report ({template})");
        render_and_mail(
            self.generator.as_ref(),
            self.mailer.as_ref(),
            &self.timezone,
            config,
            now,
            ReportKind::Dynamic { template },
            &title,
        )
        .await
    }
}
