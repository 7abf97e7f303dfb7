//! Surface integer identities, re-derived from persisted rows on every run.

use harvest_core::RecordId;
use tracing::warn;

/// One greater than the largest integer id among `ids`, or 1 when there is none.
/// Blank ids are ignored; non-numeric ones are logged and ignored.
pub fn next_id<'a>(ids: impl IntoIterator<Item = &'a RecordId>, record_kind: &str) -> u64 {
    let mut max = 0u64;
    for id in ids {
        if id.is_blank() {
            continue;
        }
        match id.parse() {
            Some(value) => max = max.max(value),
            None => warn!(record_kind, id = %id, "skipping non-numeric id"),
        }
    }
    max.saturating_add(1)
}

/// Hands out strictly increasing ids for one record kind. Ids are never reused within a
/// run, even when the write that would have persisted them fails.
#[derive(Debug, Clone)]
pub struct IdentityAllocator {
    next: u64,
}

impl IdentityAllocator {
    pub fn from_existing<'a>(ids: impl IntoIterator<Item = &'a RecordId>, record_kind: &str) -> Self {
        Self {
            next: next_id(ids, record_kind),
        }
    }

    pub fn allocate(&mut self) -> RecordId {
        let id = RecordId::allocated(self.next);
        self.next = self.next.saturating_add(1);
        id
    }

    pub fn peek(&self) -> u64 {
        self.next
    }
}
