//! Raw extracted text -> typed record fields.
//!
//! Extraction misses arrive as blank text and stay blank; text that does not have the
//! expected shape is logged and treated as blank.

use harvest_core::{Field, ReviewContent, VenueDetails};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const MAX_REVIEWER_CHARS: usize = 500;
pub const MAX_SHORT_TEXT_CHARS: usize = 100;

const SERVICE_TYPES: [&str; 3] = ["Dine in", "Takeout", "Delivery"];
const MEAL_TYPES: [&str; 6] = ["Breakfast", "Brunch", "Lunch", "Dinner", "Dessert", "Seating"];

/// Venue fields as they come off the page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawVenueFields {
    /// One or more category labels, joined with ", ".
    pub venue_types: Vec<String>,
    pub rating: String,
    /// e.g. `"1,234 reviews"`
    pub review_count_label: String,
    /// e.g. `"phone:tel:+84 236 3888 888"`
    pub phone_data: String,
    pub price_tier: String,
    pub address: String,
    pub latitude: String,
    pub longitude: String,
}

impl RawVenueFields {
    pub fn into_details(self) -> VenueDetails {
        let venue_type = self
            .venue_types
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(", ");
        VenueDetails {
            venue_type: Field::new(venue_type),
            rating: Field::new(self.rating.trim()),
            review_count: parse_review_count(&self.review_count_label),
            phone: strip_phone_prefix(&self.phone_data),
            price_tier: Field::new(self.price_tier.trim()),
            address: Field::new(self.address.trim()),
            latitude: Field::new(self.latitude.trim()),
            longitude: Field::new(self.longitude.trim()),
        }
    }
}

/// One review container as it comes off the page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawReview {
    pub provider_review_id: String,
    pub reviewer_name: String,
    pub reviewer_info: String,
    /// e.g. `"4 stars"`
    pub rating_label: String,
    pub relative_time: String,
    pub body: String,
    /// e.g. `"Translated by Google ・ See original (Vietnamese)"`
    pub translation_note: String,
    /// Sub-rating and tag chips, e.g. `"Food: 5"`, `"Dine in"`, `"Lunch"`.
    pub chips: Vec<String>,
}

impl RawReview {
    pub fn into_content(self) -> ReviewContent {
        let mut content = ReviewContent {
            provider_review_id: Field::new(self.provider_review_id.trim()),
            reviewer_name: truncate_chars(self.reviewer_name.trim(), MAX_REVIEWER_CHARS),
            reviewer_info: truncate_chars(self.reviewer_info.trim(), MAX_REVIEWER_CHARS),
            rating: parse_star_rating(&self.rating_label),
            relative_time: truncate_chars(self.relative_time.trim(), MAX_SHORT_TEXT_CHARS),
            body: Field::new(self.body),
            language: extract_language(&self.translation_note),
            ..Default::default()
        };
        content.language = truncate_chars(content.language.as_str(), MAX_SHORT_TEXT_CHARS);
        for chip in &self.chips {
            apply_chip(&mut content, chip);
        }
        content
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chip {
    ServiceRating(String),
    FoodRating(String),
    AtmosphereRating(String),
    ServiceType(String),
    MealType(String),
}

pub fn classify_chip(text: &str) -> Option<Chip> {
    let text = text.trim();
    if let Some((label, value)) = text.split_once(':') {
        let value = value.trim().to_string();
        return match label.trim() {
            "Service" => Some(Chip::ServiceRating(value)),
            "Food" => Some(Chip::FoodRating(value)),
            "Atmosphere" => Some(Chip::AtmosphereRating(value)),
            _ => None,
        };
    }
    if SERVICE_TYPES.contains(&text) {
        Some(Chip::ServiceType(text.to_string()))
    } else if MEAL_TYPES.contains(&text) {
        Some(Chip::MealType(text.to_string()))
    } else {
        None
    }
}

fn apply_chip(content: &mut ReviewContent, chip: &str) {
    match classify_chip(chip) {
        Some(Chip::ServiceRating(v)) => content.service_rating = Field::new(v),
        Some(Chip::FoodRating(v)) => content.food_rating = Field::new(v),
        Some(Chip::AtmosphereRating(v)) => content.atmosphere_rating = Field::new(v),
        Some(Chip::ServiceType(v)) => content.service_type = Field::new(v),
        Some(Chip::MealType(v)) => content.meal_type = Field::new(v),
        None => {}
    }
}

/// `"4 stars"` -> `"4"`, `"4,5 stars"` -> `"4.5"`.
pub fn parse_star_rating(label: &str) -> Field {
    let Some(token) = label.split_whitespace().next() else {
        return Field::empty();
    };
    match token.replace(',', ".").parse::<f64>() {
        Ok(value) if value.is_finite() => Field::new(value.to_string()),
        _ => {
            warn!(label, "unparseable star rating");
            Field::empty()
        }
    }
}

/// `"1,234 reviews"` -> `"1234"`.
pub fn parse_review_count(label: &str) -> Field {
    let Some(token) = label.split_whitespace().next() else {
        return Field::empty();
    };
    let digits = token.chars().filter(char::is_ascii_digit).collect::<String>();
    match digits.parse::<u64>() {
        Ok(count) => Field::new(count.to_string()),
        Err(_) => {
            warn!(label, "unparseable review count");
            Field::empty()
        }
    }
}

pub fn strip_phone_prefix(data: &str) -> Field {
    let data = data.trim();
    Field::new(data.strip_prefix("phone:tel:").unwrap_or(data))
}

/// Language named in the trailing parenthesis of a translation note.
pub fn extract_language(note: &str) -> Field {
    let Some(open) = note.rfind('(') else {
        return Field::empty();
    };
    let tail = &note[open + 1..];
    match tail.find(')') {
        Some(close) => Field::new(tail[..close].trim()),
        None => Field::empty(),
    }
}

pub fn truncate_chars(text: &str, max: usize) -> Field {
    match text.char_indices().nth(max) {
        Some((cut, _)) => Field::new(&text[..cut]),
        None => Field::new(text),
    }
}
