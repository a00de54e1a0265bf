use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC) — the only instant type that is persisted.
pub type Ms = i64;

/// Identity of whoever owns a reservation, as resolved by the transport.
pub type OwnerId = String;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Active,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

/// A time-bounded claim on one parking space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    /// `None` once the owning identity has been forgotten; the record stays.
    pub owner: Option<OwnerId>,
    pub span: Span,
    pub status: ReservationStatus,
    pub label: Option<String>,
    pub created_at: Ms,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }
}

/// A parking space plus every reservation ever made on it.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub lot_id: Ulid,
    pub name: Option<String>,
    /// Active and cancelled reservations, sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    pub fn new(id: Ulid, lot_id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            lot_id,
            name,
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Active reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn active_overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.is_active() && r.span.end > query.start)
    }

    pub fn active_count(&self) -> usize {
        self.reservations.iter().filter(|r| r.is_active()).count()
    }
}

// ── Schedules ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobKind {
    ReportEmail,
    DynamicReport,
    Backup,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::ReportEmail, JobKind::DynamicReport, JobKind::Backup];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ReportEmail => "report_email",
            JobKind::DynamicReport => "dynamic_report",
            JobKind::Backup => "backup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "report_email" => Some(JobKind::ReportEmail),
            "dynamic_report" => Some(JobKind::DynamicReport),
            "backup" => Some(JobKind::Backup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Some(Frequency::Daily),
            "weekly" => Some(Frequency::Weekly),
            "monthly" => Some(Frequency::Monthly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Success,
    Failure(String),
}

/// One recurring administrative job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub kind: JobKind,
    pub enabled: bool,
    pub frequency: Frequency,
    /// Local hour of day, 0–23.
    pub target_hour: u32,
    /// IANA zone id. `None` follows the administrator's global timezone.
    pub timezone: Option<String>,
    pub recipients: Vec<String>,
    pub template: Option<String>,
    pub last_fired: Option<Ms>,
    pub last_result: Option<JobOutcome>,
}

impl ScheduleConfig {
    pub fn new(kind: JobKind, frequency: Frequency, target_hour: u32) -> Self {
        Self {
            kind,
            enabled: true,
            frequency,
            target_hour,
            timezone: None,
            recipients: Vec::new(),
            template: None,
            last_fired: None,
            last_result: None,
        }
    }
}

/// The journal record format — flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        lot_id: Ulid,
        name: Option<String>,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationCancelled {
        id: Ulid,
        resource_id: Ulid,
    },
    OwnerForgotten {
        owner: OwnerId,
    },
    ScheduleConfigured {
        config: ScheduleConfig,
    },
    ScheduleFired {
        kind: JobKind,
        at: Ms,
    },
    ScheduleFailed {
        kind: JobKind,
        reason: String,
    },
    SettingChanged {
        key: String,
        value: Option<String>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub lot_id: Ulid,
    pub name: Option<String>,
}

/// One row of a lot availability view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookedSlot {
    pub resource_id: Ulid,
    /// `Some` iff an active reservation overlaps the window; inner value is its label.
    pub booking: Option<Option<String>>,
}

impl BookedSlot {
    pub fn is_booked(&self) -> bool {
        self.booking.is_some()
    }
}
