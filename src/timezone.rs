use std::sync::{Arc, RwLock};

use chrono::{DateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::ConfigError;
use crate::model::Ms;
use crate::settings::Settings;

pub const TIMEZONE_KEY: &str = "timezone";

/// Parse an IANA timezone id. Used at configuration write time only.
pub fn parse_timezone(name: &str) -> Result<Tz, ConfigError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ConfigError::UnknownTimezone(name.to_string()))
}

pub fn utc_from_ms(at: Ms) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at).unwrap_or_default()
}

/// Zone-database conversion; correct on both sides of a DST transition.
pub fn to_local(at: Ms, tz: Tz) -> DateTime<Tz> {
    tz.from_utc_datetime(&utc_from_ms(at).naive_utc())
}

/// UTC instant of local midnight on the calendar day containing `at`.
pub fn start_of_local_day(at: Ms, tz: Tz) -> Ms {
    let date = to_local(at, tz).date_naive();
    // Zones that spring forward at midnight have no 00:00 that day.
    for hour in 0..3 {
        let naive = date.and_time(NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or_default());
        if let Some(local) = tz.from_local_datetime(&naive).earliest() {
            return local.timestamp_millis();
        }
    }
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

/// Converts between UTC and the administrator's configured timezone.
///
/// The resolved zone is cached and only re-read from [`Settings`] after
/// [`TimezoneService::invalidate`], which `set_timezone` calls itself.
pub struct TimezoneService {
    settings: Arc<Settings>,
    cache: RwLock<Option<Tz>>,
}

impl TimezoneService {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            cache: RwLock::new(None),
        }
    }

    /// The configured zone, UTC if unset.
    pub fn resolve(&self) -> Tz {
        if let Some(tz) = *self.cache.read().unwrap_or_else(|e| e.into_inner()) {
            return tz;
        }
        let tz = match self.settings.get(TIMEZONE_KEY) {
            None => Tz::UTC,
            Some(name) => name.parse::<Tz>().unwrap_or_else(|_| {
                tracing::warn!("configured timezone {name:?} is not available, falling back to UTC");
                Tz::UTC
            }),
        };
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Some(tz);
        tz
    }

    pub fn invalidate(&self) {
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Validate, persist, and invalidate the cache. `None` resets to UTC.
    pub async fn set_timezone(&self, name: Option<&str>) -> Result<Tz, ConfigError> {
        let tz = match name {
            Some(n) => Some(parse_timezone(n)?),
            None => None,
        };
        self.settings
            .set(TIMEZONE_KEY, tz.map(|t| t.name().to_string()))
            .await?;
        self.invalidate();
        let resolved = tz.unwrap_or(Tz::UTC);
        tracing::info!("timezone set to {}", resolved.name());
        Ok(resolved)
    }

    /// Zone for a per-schedule override; `None` follows the global setting.
    /// Never fails: an unusable id falls back to UTC with a warning.
    pub fn zone_for(&self, name: Option<&str>) -> Tz {
        match name {
            None => self.resolve(),
            Some(n) => n.parse::<Tz>().unwrap_or_else(|_| {
                tracing::warn!("schedule timezone {n:?} is not available, falling back to UTC");
                Tz::UTC
            }),
        }
    }

    pub fn to_local(&self, at: Ms, tz: Tz) -> DateTime<Tz> {
        to_local(at, tz)
    }

    pub fn local_hour_of(&self, at: Ms) -> u32 {
        to_local(at, self.resolve()).hour()
    }

    pub fn start_of_local_day(&self, at: Ms) -> Ms {
        start_of_local_day(at, self.resolve())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;

    fn ms(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Ms {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap().timestamp_millis()
    }

    fn test_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("parkd_test_timezone");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn service(name: &str) -> (TimezoneService, Arc<Settings>) {
        let (journal, events) = Journal::open(&test_path(name)).unwrap();
        let settings = Arc::new(Settings::from_events(journal, &events));
        (TimezoneService::new(settings.clone()), settings)
    }

    #[test]
    fn prague_offset_follows_dst() {
        let prague: Tz = "Europe/Prague".parse().unwrap();
        // Winter: UTC+1
        assert_eq!(to_local(ms(2024, 1, 15, 8, 0), prague).hour(), 9);
        // Summer: UTC+2
        assert_eq!(to_local(ms(2024, 7, 15, 7, 0), prague).hour(), 9);
    }

    #[test]
    fn start_of_day_in_zone() {
        let prague: Tz = "Europe/Prague".parse().unwrap();
        // 2024-07-15 00:30 local == 2024-07-14 22:30 UTC
        let at = ms(2024, 7, 14, 22, 30);
        assert_eq!(start_of_local_day(at, prague), ms(2024, 7, 14, 22, 0));
        assert_eq!(start_of_local_day(at, Tz::UTC), ms(2024, 7, 14, 0, 0));
    }

    #[test]
    fn start_of_day_when_midnight_is_skipped() {
        // Santiago springs forward at 00:00 → 01:00 on 2023-09-03
        let santiago: Tz = "America/Santiago".parse().unwrap();
        let at = ms(2023, 9, 3, 15, 0);
        let start = start_of_local_day(at, santiago);
        assert_eq!(to_local(start, santiago).hour(), 1);
    }

    #[test]
    fn unknown_zone_rejected() {
        assert!(matches!(
            parse_timezone("Mars/Olympus_Mons"),
            Err(ConfigError::UnknownTimezone(_))
        ));
        assert!(parse_timezone(" Europe/Prague ").is_ok());
    }

    #[tokio::test]
    async fn resolve_defaults_to_utc_and_caches() {
        let (svc, settings) = service("cache.wal");
        assert_eq!(svc.resolve(), Tz::UTC);

        // Written behind the service's back: cache still answers UTC
        settings.set(TIMEZONE_KEY, Some("Europe/Prague".into())).await.unwrap();
        assert_eq!(svc.resolve(), Tz::UTC);

        svc.invalidate();
        assert_eq!(svc.resolve().name(), "Europe/Prague");
    }

    #[tokio::test]
    async fn set_timezone_invalidates() {
        let (svc, _) = service("set.wal");
        assert_eq!(svc.resolve(), Tz::UTC);
        svc.set_timezone(Some("Asia/Tokyo")).await.unwrap();
        assert_eq!(svc.resolve().name(), "Asia/Tokyo");
        assert_eq!(svc.local_hour_of(ms(2024, 3, 1, 0, 0)), 9);

        svc.set_timezone(None).await.unwrap();
        assert_eq!(svc.resolve(), Tz::UTC);
    }

    #[tokio::test]
    async fn invalid_zone_leaves_setting_untouched() {
        let (svc, settings) = service("invalid.wal");
        svc.set_timezone(Some("Europe/Prague")).await.unwrap();
        let err = svc.set_timezone(Some("Nowhere/Special")).await;
        assert!(matches!(err, Err(ConfigError::UnknownTimezone(_))));
        assert_eq!(settings.get(TIMEZONE_KEY).as_deref(), Some("Europe/Prague"));
        assert_eq!(svc.resolve().name(), "Europe/Prague");
    }

    #[tokio::test]
    async fn unavailable_stored_zone_falls_back_to_utc() {
        let (svc, settings) = service("fallback.wal");
        settings.set(TIMEZONE_KEY, Some("Gone/Away".into())).await.unwrap();
        svc.invalidate();
        assert_eq!(svc.resolve(), Tz::UTC);
        assert_eq!(svc.zone_for(Some("Also/Gone")), Tz::UTC);
    }
}
