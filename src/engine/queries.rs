use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::booked_in;
use super::{Engine, EngineError, SharedResourceState};

fn validate_query(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::invalid_range(start, end, "end must be after start"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end.saturating_sub(start) > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(Span::new(start, end))
}

impl Engine {
    /// Booked/free status of every space in a lot over `[start, end)`.
    ///
    /// Read locks are taken in resource-id order and held together, so the
    /// answer reflects a single consistent moment for the whole lot. Unknown
    /// lots yield an empty list.
    pub async fn availability(
        &self,
        lot_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<BookedSlot>, EngineError> {
        let query = validate_query(start, end)?;
        let mut ids = self.lot_resources(&lot_id);
        ids.sort();

        let resources: Vec<SharedResourceState> =
            ids.iter().filter_map(|id| self.get_resource(id)).collect();
        let mut guards = Vec::with_capacity(resources.len());
        for rs in &resources {
            guards.push(rs.read().await);
        }
        Ok(booked_in(guards.iter().map(|g| &**g), &query))
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let resource_id = self
            .get_resource_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// All reservations on a resource, cancelled ones included, by start.
    pub async fn reservations_for_resource(
        &self,
        resource_id: Ulid,
    ) -> Result<Vec<Reservation>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard.reservations.clone())
    }

    pub async fn reservations_for_owner(&self, owner: &str) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = Vec::new();
        for rs in self.sorted_resources() {
            let guard = rs.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.owner.as_deref() == Some(owner))
                    .cloned(),
            );
        }
        out.sort_by_key(|r| (r.span.start, r.id));
        out
    }

    /// Every reservation (any status) intersecting `[start, end)`. Feeds reports.
    pub async fn reservations_between(
        &self,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Reservation>, EngineError> {
        let query = validate_query(start, end)?;
        let mut out = Vec::new();
        for rs in self.sorted_resources() {
            let guard = rs.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.span.overlaps(&query))
                    .cloned(),
            );
        }
        out.sort_by_key(|r| (r.span.start, r.id));
        Ok(out)
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut out = Vec::with_capacity(self.state.len());
        for rs in self.sorted_resources() {
            let guard = rs.read().await;
            out.push(ResourceInfo {
                id: guard.id,
                lot_id: guard.lot_id,
                name: guard.name.clone(),
            });
        }
        out
    }

    fn sorted_resources(&self) -> Vec<SharedResourceState> {
        let mut resources: Vec<(Ulid, SharedResourceState)> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        resources.sort_by_key(|(id, _)| *id);
        resources.into_iter().map(|(_, rs)| rs).collect()
    }
}
