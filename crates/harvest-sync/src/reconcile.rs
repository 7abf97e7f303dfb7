//! Merges candidates into stored records and admits new ones.

use chrono::NaiveDateTime;
use harvest_core::{
    format_date, format_refresh_timestamp, Field, RecordId, Review, ReviewContent,
    ReviewKeyScheme, Venue, VenueDraft, VenueField, VenueTarget,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::admission::{check_target, Blocklist, Rejection};
use crate::attributes;
use crate::dedup::{DedupIndex, NaturalKey};
use crate::identity::IdentityAllocator;
use crate::relative_time;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Added,
    Changed,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled<T> {
    pub record: T,
    pub outcome: Outcome,
}

impl<T> Reconciled<T> {
    pub fn changed(&self) -> bool {
        self.outcome == Outcome::Changed
    }
}

/// Merges `candidate` into `old`, or creates a new venue from it when there is no `old`.
///
/// On the update path a blank candidate field never overwrites a populated one, and an
/// empty attribute set is read as "nothing extracted" rather than "no categories". The
/// refresh timestamp moves only when something changed.
pub fn reconcile_venue(
    old: Option<&Venue>,
    candidate: &VenueDraft,
    ids: &mut IdentityAllocator,
    now: NaiveDateTime,
) -> Reconciled<Venue> {
    match old {
        Some(old) => update_venue(old, candidate, now),
        None => Reconciled {
            record: Venue {
                id: ids.allocate(),
                url: candidate.url.clone(),
                name: candidate.name.clone(),
                details: candidate.details.clone(),
                refreshed_at: format_refresh_timestamp(now),
                attributes: attributes::namespaced(&candidate.attributes),
            },
            outcome: Outcome::Added,
        },
    }
}

fn update_venue(old: &Venue, candidate: &VenueDraft, now: NaiveDateTime) -> Reconciled<Venue> {
    let mut merged = old.clone();
    let mut changed = false;

    for field in VenueField::ALL {
        changed |= merge_field(merged.details.get_mut(field), candidate.details.get(field));
    }

    if !candidate.attributes.is_empty() {
        let attributes = attributes::merge(&old.attributes, &candidate.attributes);
        if attributes != old.attributes {
            changed = true;
            merged.attributes = attributes;
        }
    }

    if changed {
        merged.refreshed_at = format_refresh_timestamp(now);
    }
    Reconciled {
        record: merged,
        outcome: if changed { Outcome::Changed } else { Outcome::Unchanged },
    }
}

fn merge_field(slot: &mut Field, new: &Field) -> bool {
    if new.is_blank() || new.normalized() == slot.normalized() {
        return false;
    }
    *slot = new.clone();
    true
}

/// Per-run venue admission: blocklist, dedup index and identity allocation.
#[derive(Debug, Clone)]
pub struct VenueReconciler {
    blocklist: Blocklist,
    index: DedupIndex,
    ids: IdentityAllocator,
}

impl VenueReconciler {
    pub fn new(existing: &[Venue], blocklist: Blocklist) -> Self {
        Self {
            blocklist,
            index: DedupIndex::for_venues(existing),
            ids: IdentityAllocator::from_existing(existing.iter().map(|v| &v.id), "venue"),
        }
    }

    /// Turns a listing entry into a new venue row, or says why it was not admitted.
    pub fn admit(&mut self, target: &VenueTarget, now: NaiveDateTime) -> Result<Venue, Rejection> {
        let key = check_target(target, &self.blocklist, &self.index)?;
        let draft = VenueDraft {
            url: Field::new(target.url.trim()),
            name: Field::new(target.name.trim()),
            ..Default::default()
        };
        let created = reconcile_venue(None, &draft, &mut self.ids, now);
        self.index.insert(key);
        Ok(created.record)
    }

    pub fn reconcile(&mut self, old: &Venue, candidate: &VenueDraft, now: NaiveDateTime) -> Reconciled<Venue> {
        reconcile_venue(Some(old), candidate, &mut self.ids, now)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReviewAdmission {
    New(Review),
    Duplicate,
    MissingKey,
}

/// Per-run review admission. Reviews are never updated in place; only unseen keys are
/// turned into rows.
#[derive(Debug, Clone)]
pub struct ReviewLedger {
    scheme: ReviewKeyScheme,
    index: DedupIndex,
    ids: IdentityAllocator,
}

impl ReviewLedger {
    pub fn new(existing: &[Review], scheme: ReviewKeyScheme) -> Self {
        Self {
            scheme,
            index: DedupIndex::for_reviews(existing, scheme),
            ids: IdentityAllocator::from_existing(existing.iter().map(|r| &r.id), "review"),
        }
    }

    pub fn scheme(&self) -> ReviewKeyScheme {
        self.scheme
    }

    pub fn known_keys(&self) -> usize {
        self.index.len()
    }

    pub fn admit(&mut self, venue_id: &RecordId, content: ReviewContent, crawled_at: NaiveDateTime) -> ReviewAdmission {
        let Some(key) = NaturalKey::review(self.scheme, venue_id, &content) else {
            warn!(venue_id = %venue_id, scheme = ?self.scheme, "discarding review without a natural key");
            return ReviewAdmission::MissingKey;
        };
        if self.index.contains(&key) {
            debug!(?key, "review already stored");
            return ReviewAdmission::Duplicate;
        }

        let mut content = content;
        if content.body.is_blank() && !content.rating.is_blank() {
            content.body = Field::new(format!("Rated {}", content.rating.normalized()));
        }
        let resolved_date = match content.relative_time.value() {
            Some(phrase) => relative_time::resolve(crawled_at, phrase)
                .map(format_date)
                .unwrap_or_default(),
            None => Field::empty(),
        };

        self.index.insert(key);
        ReviewAdmission::New(Review {
            id: self.ids.allocate(),
            venue_id: venue_id.clone(),
            content,
            resolved_date,
            refreshed_at: format_refresh_timestamp(crawled_at),
        })
    }
}
