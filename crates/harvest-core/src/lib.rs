//! Core record model for the venue harvester: venues, their dynamic attribute sets and reviews.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "harvest-core";

/// Format of the refresh timestamp column (capture-time instant, local clock).
pub const REFRESH_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Format of resolved review dates.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// A single scraped or persisted value. Blank text is the unset state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Field {
    value: Option<String>,
}

impl Field {
    pub fn empty() -> Self {
        Self { value: None }
    }

    /// Wraps raw text; whitespace-only input becomes the unset state.
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.trim().is_empty() {
            Self::empty()
        } else {
            Self { value: Some(value) }
        }
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Raw text, or `""` when unset.
    pub fn as_str(&self) -> &str {
        self.value.as_deref().unwrap_or_default()
    }

    /// Text used for change detection.
    pub fn normalized(&self) -> &str {
        self.as_str().trim()
    }

    pub fn is_blank(&self) -> bool {
        self.value.is_none()
    }
}

impl From<&str> for Field {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Field {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<Option<String>> for Field {
    fn from(value: Option<String>) -> Self {
        value.map(Self::new).unwrap_or_default()
    }
}

/// Surface integer identity as persisted. Kept as text so rows with a malformed id
/// survive a rewrite unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn allocated(value: u64) -> Self {
        Self(value.to_string())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.is_empty()
    }

    /// Integer value, when the persisted text is a valid non-negative integer.
    pub fn parse(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase-trimmed form used as the venue natural key and reviewer key.
pub fn normalize_name(input: &str) -> String {
    input.trim().to_lowercase()
}

pub fn format_refresh_timestamp(at: NaiveDateTime) -> Field {
    Field::new(at.format(REFRESH_TIMESTAMP_FORMAT).to_string())
}

pub fn format_date(date: NaiveDate) -> Field {
    Field::new(date.format(DATE_FORMAT).to_string())
}

/// Category label -> ordered item list, discovered at scrape time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeSet(BTreeMap<String, Vec<String>>);

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, category: impl Into<String>, items: Vec<String>) -> Option<Vec<String>> {
        self.0.insert(category.into(), items)
    }

    pub fn get(&self, category: &str) -> Option<&[String]> {
        self.0.get(category).map(Vec::as_slice)
    }

    pub fn contains(&self, category: &str) -> bool {
        self.0.contains_key(category)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

impl From<BTreeMap<String, Vec<String>>> for AttributeSet {
    fn from(map: BTreeMap<String, Vec<String>>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>> FromIterator<(K, Vec<String>)> for AttributeSet {
    fn from_iter<I: IntoIterator<Item = (K, Vec<String>)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Tracked scalar venue fields, in persisted column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VenueField {
    VenueType,
    Rating,
    ReviewCount,
    Phone,
    PriceTier,
    Address,
    Latitude,
    Longitude,
}

impl VenueField {
    pub const ALL: [VenueField; 8] = [
        VenueField::VenueType,
        VenueField::Rating,
        VenueField::ReviewCount,
        VenueField::Phone,
        VenueField::PriceTier,
        VenueField::Address,
        VenueField::Latitude,
        VenueField::Longitude,
    ];

    pub fn column(self) -> &'static str {
        match self {
            VenueField::VenueType => "type",
            VenueField::Rating => "rating",
            VenueField::ReviewCount => "review_count",
            VenueField::Phone => "phone",
            VenueField::PriceTier => "price_tier",
            VenueField::Address => "address",
            VenueField::Latitude => "latitude",
            VenueField::Longitude => "longitude",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VenueDetails {
    pub venue_type: Field,
    pub rating: Field,
    pub review_count: Field,
    pub phone: Field,
    pub price_tier: Field,
    pub address: Field,
    pub latitude: Field,
    pub longitude: Field,
}

impl VenueDetails {
    pub fn get(&self, field: VenueField) -> &Field {
        match field {
            VenueField::VenueType => &self.venue_type,
            VenueField::Rating => &self.rating,
            VenueField::ReviewCount => &self.review_count,
            VenueField::Phone => &self.phone,
            VenueField::PriceTier => &self.price_tier,
            VenueField::Address => &self.address,
            VenueField::Latitude => &self.latitude,
            VenueField::Longitude => &self.longitude,
        }
    }

    pub fn get_mut(&mut self, field: VenueField) -> &mut Field {
        match field {
            VenueField::VenueType => &mut self.venue_type,
            VenueField::Rating => &mut self.rating,
            VenueField::ReviewCount => &mut self.review_count,
            VenueField::Phone => &mut self.phone,
            VenueField::PriceTier => &mut self.price_tier,
            VenueField::Address => &mut self.address,
            VenueField::Latitude => &mut self.latitude,
            VenueField::Longitude => &mut self.longitude,
        }
    }
}

/// Listing entry yielded by the target list: enough to create a venue row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueTarget {
    pub url: String,
    pub name: String,
}

/// Candidate venue extracted from an opened target. Missing fields are blank.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VenueDraft {
    pub url: Field,
    pub name: Field,
    pub details: VenueDetails,
    pub attributes: AttributeSet,
}

/// Persisted venue row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Venue {
    pub id: RecordId,
    pub url: Field,
    pub name: Field,
    pub details: VenueDetails,
    pub refreshed_at: Field,
    pub attributes: AttributeSet,
}

impl Venue {
    pub fn natural_key(&self) -> String {
        normalize_name(self.name.as_str())
    }
}

/// Which natural key identifies a review within one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewKeyScheme {
    /// `(venue_id, normalized reviewer name)`
    #[default]
    ReviewerName,
    /// `(venue_id, provider-assigned review id)`
    ProviderId,
}

impl FromStr for ReviewKeyScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reviewer_name" | "reviewer-name" | "name" => Ok(Self::ReviewerName),
            "provider_id" | "provider-id" | "provider" => Ok(Self::ProviderId),
            other => Err(format!("unknown review key scheme: {other}")),
        }
    }
}

/// Extracted review content, shared by candidates and persisted rows.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReviewContent {
    pub provider_review_id: Field,
    pub reviewer_name: Field,
    pub reviewer_info: Field,
    pub rating: Field,
    pub relative_time: Field,
    pub body: Field,
    pub service_rating: Field,
    pub food_rating: Field,
    pub atmosphere_rating: Field,
    pub service_type: Field,
    pub meal_type: Field,
    pub language: Field,
}

/// Persisted review row. Owned by exactly one venue through `venue_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: RecordId,
    pub venue_id: RecordId,
    pub content: ReviewContent,
    pub resolved_date: Field,
    pub refreshed_at: Field,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn blank_text_is_unset() {
        assert!(Field::new("   ").is_blank());
        assert!(Field::from(None).is_blank());
        assert_eq!(Field::new(" 4.5 ").normalized(), "4.5");
        assert_eq!(Field::empty().as_str(), "");
    }

    #[test]
    fn record_id_keeps_malformed_text() {
        let id = RecordId::from_raw(" abc ");
        assert_eq!(id.as_str(), "abc");
        assert_eq!(id.parse(), None);
        assert_eq!(RecordId::allocated(7).parse(), Some(7));
    }

    #[test]
    fn names_normalize_case_and_whitespace() {
        assert_eq!(normalize_name("  Cafe A "), "cafe a");
        assert_eq!(normalize_name("QUÁN Cây Đa"), "quán cây đa");
    }

    #[test]
    fn details_accessors_cover_every_column() {
        let mut details = VenueDetails::default();
        for (i, field) in VenueField::ALL.iter().enumerate() {
            *details.get_mut(*field) = Field::new(i.to_string());
        }
        assert_eq!(details.rating.as_str(), "1");
        assert_eq!(details.longitude.as_str(), "7");
        assert_eq!(VenueField::VenueType.column(), "type");
    }

    #[test]
    fn scheme_parses_from_config_text() {
        assert_eq!("provider_id".parse::<ReviewKeyScheme>(), Ok(ReviewKeyScheme::ProviderId));
        assert_eq!("Reviewer_Name".parse::<ReviewKeyScheme>(), Ok(ReviewKeyScheme::ReviewerName));
        assert!("uuid".parse::<ReviewKeyScheme>().is_err());
    }

    #[test]
    fn timestamps_use_fixed_formats() {
        let at = NaiveDate::from_ymd_opt(2024, 1, 10)
            .and_then(|d| d.and_hms_opt(9, 5, 0))
            .unwrap();
        assert_eq!(format_refresh_timestamp(at).as_str(), "2024-01-10 09:05:00");
        assert_eq!(format_date(at.date()).as_str(), "2024-01-10");
    }

    #[test]
    fn attribute_set_serializes_as_plain_map() {
        let set: AttributeSet = [("Offerings", vec!["Coffee".to_string()])].into_iter().collect();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"{"Offerings":["Coffee"]}"#);
    }
}
