use ulid::Ulid;

use crate::model::*;

// ── Availability index ────────────────────────────────────────────
//
// Read-side predicates over per-resource reservation lists. Both use the same
// half-open overlap test, so what `booked_in` shows as free is exactly what
// `conflicts` would accept.

/// First active reservation on `resource` intersecting `query`, if any.
pub fn conflicts(resource: &ResourceState, query: &Span) -> Option<Ulid> {
    resource.active_overlapping(query).next().map(|r| r.id)
}

/// One row per resource: booked (with its label) or free during `query`.
/// Output is sorted by resource id.
pub fn booked_in<'a>(
    resources: impl IntoIterator<Item = &'a ResourceState>,
    query: &Span,
) -> Vec<BookedSlot> {
    let mut rows: Vec<BookedSlot> = resources
        .into_iter()
        .map(|rs| BookedSlot {
            resource_id: rs.id,
            booking: rs.active_overlapping(query).next().map(|r| r.label.clone()),
        })
        .collect();
    rows.sort_by_key(|r| r.resource_id);
    rows
}
