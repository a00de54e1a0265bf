mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{booked_in, conflicts};
pub use conflict::now_ms;
pub use error::EngineError;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::journal::Journal;
use crate::model::*;
use crate::timezone::TimezoneService;

/// One lock per parking space; held for writing across check-and-insert.
pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// Authenticated caller of an engine operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: OwnerId,
    pub admin: bool,
}

impl Actor {
    pub fn user(id: impl Into<OwnerId>) -> Self {
        Self { id: id.into(), admin: false }
    }

    pub fn admin(id: impl Into<OwnerId>) -> Self {
        Self { id: id.into(), admin: true }
    }
}

/// Owns every booking. All mutations go journal-first, then memory.
pub struct Engine {
    pub state: DashMap<Ulid, SharedResourceState>,
    journal: Journal,
    timezone: Arc<TimezoneService>,
    /// Reverse lookup: reservation id → resource id
    reservation_to_resource: DashMap<Ulid, Ulid>,
    /// Lot → resources index.
    lots: DashMap<Ulid, Vec<Ulid>>,
    /// Serializes resource creation.
    create_lock: tokio::sync::Mutex<()>,
}

/// Apply an event directly to a ResourceState (no locking — caller holds the lock).
fn apply_to_resource(rs: &mut ResourceState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservationCreated { reservation } => {
            index.insert(reservation.id, reservation.resource_id);
            rs.insert_reservation(reservation.clone());
        }
        Event::ReservationCancelled { id, .. } => {
            if let Some(r) = rs.reservation_mut(id) {
                r.status = ReservationStatus::Cancelled;
            }
        }
        Event::OwnerForgotten { owner } => {
            for r in rs.reservations.iter_mut() {
                if r.owner.as_ref() == Some(owner) {
                    r.owner = None;
                }
            }
        }
        // Handled at the DashMap level or by other components
        Event::ResourceCreated { .. }
        | Event::ScheduleConfigured { .. }
        | Event::ScheduleFired { .. }
        | Event::ScheduleFailed { .. }
        | Event::SettingChanged { .. } => {}
    }
}

impl Engine {
    /// Rebuild state from replayed journal events.
    pub fn from_events(journal: Journal, timezone: Arc<TimezoneService>, events: &[Event]) -> Self {
        let engine = Self {
            state: DashMap::new(),
            journal,
            timezone,
            reservation_to_resource: DashMap::new(),
            lots: DashMap::new(),
            create_lock: tokio::sync::Mutex::new(()),
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds. Never blocking_write: this runs inside the async runtime.
        for event in events {
            match event {
                Event::ResourceCreated { id, lot_id, name } => {
                    let rs = ResourceState::new(*id, *lot_id, name.clone());
                    engine.state.insert(*id, Arc::new(RwLock::new(rs)));
                    engine.lots.entry(*lot_id).or_default().push(*id);
                }
                Event::ReservationCreated { reservation } => {
                    engine.replay_on(&reservation.resource_id, event);
                }
                Event::ReservationCancelled { resource_id, .. } => {
                    engine.replay_on(resource_id, event);
                }
                Event::OwnerForgotten { .. } => {
                    let ids: Vec<Ulid> = engine.state.iter().map(|e| *e.key()).collect();
                    for id in ids {
                        engine.replay_on(&id, event);
                    }
                }
                _ => {}
            }
        }

        engine
    }

    fn replay_on(&self, resource_id: &Ulid, event: &Event) {
        match self.state.get(resource_id) {
            Some(entry) => {
                let rs = entry.value().clone();
                drop(entry);
                match rs.try_write() {
                    Ok(mut guard) => apply_to_resource(&mut guard, event, &self.reservation_to_resource),
                    Err(_) => tracing::error!("replay: resource {resource_id} unexpectedly locked"),
                }
            }
            None => tracing::warn!("replay: event for unknown resource {resource_id} skipped"),
        }
    }

    /// Write event to the journal via the background group-commit writer.
    async fn journal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.journal
            .append(event)
            .await
            .map_err(|e| EngineError::Journal(e.0))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_resource
            .get(reservation_id)
            .map(|e| *e.value())
    }

    pub fn lot_resources(&self, lot_id: &Ulid) -> Vec<Ulid> {
        self.lots
            .get(lot_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Journal-append + apply in one call.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.journal_append(event).await?;
        apply_to_resource(rs, event, &self.reservation_to_resource);
        Ok(())
    }

    /// Lookup reservation → resource, get resource, acquire write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let resource_id = self
            .get_resource_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.write_owned().await;
        Ok((resource_id, guard))
    }

    /// Events that recreate the current reservation state from scratch.
    pub async fn snapshot_events(&self) -> Vec<Event> {
        let mut resources: Vec<(Ulid, SharedResourceState)> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        resources.sort_by_key(|(id, _)| *id);
        let mut guards = Vec::with_capacity(resources.len());
        for (_, rs) in resources {
            guards.push(rs.read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::ResourceCreated {
                id: guard.id,
                lot_id: guard.lot_id,
                name: guard.name.clone(),
            });
        }
        for guard in &guards {
            for r in &guard.reservations {
                events.push(Event::ReservationCreated {
                    reservation: r.clone(),
                });
            }
        }
        events
    }
}
