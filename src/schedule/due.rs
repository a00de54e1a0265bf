use chrono::{Datelike, Days, Months, NaiveDate, Timelike};
use chrono_tz::Tz;

use crate::model::*;
use crate::timezone::to_local;

/// The `k`-th scheduled date after `last`. Monthly periods clamp to the last
/// day of the target month, always counted from `last` so a clamp does not
/// carry into later months.
pub fn occurrence(last: NaiveDate, k: u32, frequency: Frequency) -> Option<NaiveDate> {
    match frequency {
        Frequency::Daily => last.checked_add_days(Days::new(u64::from(k))),
        Frequency::Weekly => last.checked_add_days(Days::new(7 * u64::from(k))),
        Frequency::Monthly => last.checked_add_months(Months::new(k)),
    }
}

/// Whether `date` is one of the scheduled dates following `last`.
pub fn is_occurrence(last: NaiveDate, date: NaiveDate, frequency: Frequency) -> bool {
    if date <= last {
        return false;
    }
    match frequency {
        Frequency::Daily => true,
        Frequency::Weekly => date.signed_duration_since(last).num_days() % 7 == 0,
        Frequency::Monthly => {
            let months = (date.year() - last.year()) * 12 + date.month() as i32
                - last.month() as i32;
            u32::try_from(months)
                .ok()
                .and_then(|k| occurrence(last, k, frequency))
                == Some(date)
        }
    }
}

/// Whether `config` should fire at `now`, evaluated in `tz`.
///
/// Due iff the local hour equals the target hour and today is a scheduled
/// date counted from the local date of the last successful firing. A period
/// missed to failure or downtime is not caught up on later days; the job
/// waits for the next scheduled date. Hours that a DST transition skips never
/// match; hours it repeats match twice but the second pass falls on the same
/// local date and is rejected.
pub fn is_due(config: &ScheduleConfig, now: Ms, tz: Tz) -> bool {
    if !config.enabled {
        return false;
    }
    let local_now = to_local(now, tz);
    if local_now.hour() != config.target_hour {
        return false;
    }
    let Some(last) = config.last_fired else {
        return true;
    };
    if last > now {
        // Clock went backwards; wait until it catches up.
        return false;
    }
    let last_date = to_local(last, tz).date_naive();
    is_occurrence(last_date, local_now.date_naive(), config.frequency)
}
