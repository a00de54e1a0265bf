use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, now_ms, validate_window};
use super::{Actor, Engine, EngineError};

impl Engine {
    pub async fn create_resource(
        &self,
        id: Ulid,
        lot_id: Ulid,
        name: Option<String>,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("resource name too long"));
            }

        let _permit = self.journal.permit().await;
        let _create = self.create_lock.lock().await;
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::ResourceCreated { id, lot_id, name: name.clone() };
        self.journal_append(&event).await?;
        let rs = ResourceState::new(id, lot_id, name);
        self.state.insert(id, Arc::new(RwLock::new(rs)));
        self.lots.entry(lot_id).or_default().push(id);
        tracing::info!("resource {id} created in lot {lot_id}");
        Ok(())
    }

    /// Book `[start, end)` on a resource.
    ///
    /// The overlap check and the insert run under the resource's write lock,
    /// so two racing requests for intersecting windows cannot both succeed.
    pub async fn create_reservation(
        &self,
        id: Ulid,
        resource_id: Ulid,
        owner: &Actor,
        start: Ms,
        end: Ms,
        label: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let now = now_ms();
        let span = validate_window(start, end, self.timezone.start_of_local_day(now))?;
        if let Some(ref l) = label
            && l.len() > MAX_LABEL_LEN {
                return Err(EngineError::LimitExceeded("label too long"));
            }
        if owner.id.len() > MAX_OWNER_LEN {
            return Err(EngineError::LimitExceeded("owner id too long"));
        }
        if self.reservation_to_resource.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let _permit = self.journal.permit().await;
        let mut guard = rs.write().await;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many reservations on resource"));
        }

        if let Err(e) = check_no_conflict(&guard, &span) {
            metrics::counter!(observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            tracing::debug!("reservation on {resource_id} rejected: {e}");
            return Err(e);
        }

        // Claim the id; a racing create on another resource may hold it.
        match self.reservation_to_resource.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(resource_id);
            }
        }

        let reservation = Reservation {
            id,
            resource_id,
            owner: Some(owner.id.clone()),
            span,
            status: ReservationStatus::Active,
            label,
            created_at: now,
        };
        let event = Event::ReservationCreated { reservation: reservation.clone() };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.reservation_to_resource.remove(&id);
            return Err(e);
        }
        metrics::counter!(observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        tracing::info!(
            "reservation {id} on {resource_id} [{}, {}) for {}",
            span.start,
            span.end,
            owner.id
        );
        Ok(reservation)
    }

    /// Flip a reservation to cancelled. Cancelling twice succeeds without a
    /// second journal write; the record is never removed.
    pub async fn cancel_reservation(&self, id: Ulid, actor: &Actor) -> Result<Reservation, EngineError> {
        let _permit = self.journal.permit().await;
        let (resource_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let current = guard
            .reservation(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        let is_owner = current.owner.as_ref() == Some(&actor.id);
        if !is_owner && !actor.admin {
            return Err(EngineError::Forbidden(id));
        }
        if !current.is_active() {
            return Ok(current);
        }

        let event = Event::ReservationCancelled { id, resource_id };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::RESERVATIONS_CANCELLED_TOTAL).increment(1);
        tracing::info!("reservation {id} cancelled by {}", actor.id);
        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Detach a deleted identity from its reservations. History is kept with
    /// no owner. Returns how many reservations were affected.
    pub async fn forget_owner(&self, owner: &str) -> Result<usize, EngineError> {
        let _permit = self.journal.permit().await;
        let mut resources: Vec<(Ulid, super::SharedResourceState)> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        // Sorted lock order, same as any other multi-resource writer.
        resources.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(resources.len());
        for (_, rs) in resources {
            guards.push(rs.write_owned().await);
        }

        let affected: usize = guards
            .iter()
            .map(|g| {
                g.reservations
                    .iter()
                    .filter(|r| r.owner.as_deref() == Some(owner))
                    .count()
            })
            .sum();
        if affected == 0 {
            return Ok(0);
        }

        let event = Event::OwnerForgotten { owner: owner.to_string() };
        self.journal_append(&event).await?;
        for guard in guards.iter_mut() {
            super::apply_to_resource(guard, &event, &self.reservation_to_resource);
        }
        tracing::info!("owner {owner} forgotten on {affected} reservations");
        Ok(affected)
    }
}
