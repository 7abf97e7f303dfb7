//! Natural keys and the per-run in-memory index built from them.

use std::collections::HashSet;

use harvest_core::{normalize_name, RecordId, Review, ReviewContent, ReviewKeyScheme, Venue};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NaturalKey {
    Venue(String),
    Reviewer { venue_id: String, reviewer: String },
    ProviderReview { venue_id: String, review_id: String },
}

impl NaturalKey {
    /// `None` when the name is blank.
    pub fn venue(name: &str) -> Option<Self> {
        let key = normalize_name(name);
        (!key.is_empty()).then_some(Self::Venue(key))
    }

    /// Key of a review under `scheme`; `None` when the component it needs is blank.
    pub fn review(scheme: ReviewKeyScheme, venue_id: &RecordId, content: &ReviewContent) -> Option<Self> {
        if venue_id.is_blank() {
            return None;
        }
        let venue_id = venue_id.as_str().to_string();
        match scheme {
            ReviewKeyScheme::ReviewerName => {
                let reviewer = normalize_name(content.reviewer_name.as_str());
                (!reviewer.is_empty()).then_some(Self::Reviewer { venue_id, reviewer })
            }
            ReviewKeyScheme::ProviderId => {
                let review_id = content.provider_review_id.normalized();
                (!review_id.is_empty()).then(|| Self::ProviderReview {
                    venue_id,
                    review_id: review_id.to_string(),
                })
            }
        }
    }
}

/// Keys of everything already stored or accepted this run. Built once from a full scan,
/// then grown as records are accepted.
#[derive(Debug, Clone, Default)]
pub struct DedupIndex {
    keys: HashSet<NaturalKey>,
}

impl DedupIndex {
    pub fn for_venues(venues: &[Venue]) -> Self {
        Self {
            keys: venues
                .iter()
                .filter_map(|v| NaturalKey::venue(v.name.as_str()))
                .collect(),
        }
    }

    pub fn for_reviews(reviews: &[Review], scheme: ReviewKeyScheme) -> Self {
        Self {
            keys: reviews
                .iter()
                .filter_map(|r| NaturalKey::review(scheme, &r.venue_id, &r.content))
                .collect(),
        }
    }

    pub fn contains(&self, key: &NaturalKey) -> bool {
        self.keys.contains(key)
    }

    /// Returns `false` when the key was already present.
    pub fn insert(&mut self, key: NaturalKey) -> bool {
        self.keys.insert(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::Field;

    fn review(venue_id: &str, reviewer: &str, provider_id: &str) -> Review {
        Review {
            id: RecordId::allocated(1),
            venue_id: RecordId::from_raw(venue_id),
            content: ReviewContent {
                reviewer_name: Field::new(reviewer),
                provider_review_id: Field::new(provider_id),
                ..Default::default()
            },
            resolved_date: Field::empty(),
            refreshed_at: Field::empty(),
        }
    }

    #[test]
    fn reviewer_keys_ignore_case_and_padding() {
        let index = DedupIndex::for_reviews(&[review("5", "Jane", "")], ReviewKeyScheme::ReviewerName);
        let candidate = ReviewContent {
            reviewer_name: Field::new("  JANE "),
            ..Default::default()
        };
        let key = NaturalKey::review(ReviewKeyScheme::ReviewerName, &RecordId::from_raw("5"), &candidate)
            .expect("key");
        assert!(index.contains(&key));

        let other_venue =
            NaturalKey::review(ReviewKeyScheme::ReviewerName, &RecordId::from_raw("6"), &candidate)
                .expect("key");
        assert!(!index.contains(&other_venue));
    }

    #[test]
    fn schemes_never_mix() {
        let stored = [review("5", "Jane", "ChZDSUhN")];
        let by_provider = DedupIndex::for_reviews(&stored, ReviewKeyScheme::ProviderId);
        assert_eq!(by_provider.len(), 1);
        let by_name_key = NaturalKey::review(
            ReviewKeyScheme::ReviewerName,
            &RecordId::from_raw("5"),
            &stored[0].content,
        )
        .expect("key");
        assert!(!by_provider.contains(&by_name_key));
    }

    #[test]
    fn blank_components_yield_no_key() {
        let anonymous = ReviewContent::default();
        assert!(NaturalKey::review(ReviewKeyScheme::ReviewerName, &RecordId::from_raw("5"), &anonymous).is_none());
        assert!(NaturalKey::review(ReviewKeyScheme::ProviderId, &RecordId::from_raw("5"), &anonymous).is_none());
        assert!(NaturalKey::venue("   ").is_none());
    }

    #[test]
    fn insert_reports_repeats() {
        let mut index = DedupIndex::default();
        assert!(index.insert(NaturalKey::venue("Cafe A").expect("key")));
        assert!(!index.insert(NaturalKey::venue(" cafe a").expect("key")));
        assert_eq!(index.len(), 1);
    }
}
