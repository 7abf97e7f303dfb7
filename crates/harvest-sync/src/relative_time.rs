//! Resolves review-age phrases ("2 days ago", "a month ago", "Edited 3 weeks ago") against
//! the capture instant.

use chrono::{Days, Months, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

static LEADING_ARTICLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^an?\b").expect("article pattern compiles"));

static AGO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d+)\s*(day|week|month|year)s?\s*ago").expect("age pattern compiles")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Day,
    Week,
    Month,
    Year,
}

/// Absolute date `phrase` refers to, seen at `reference`. Unrecognized phrases log a
/// warning and resolve to `None`.
pub fn resolve(reference: NaiveDateTime, phrase: &str) -> Option<NaiveDate> {
    let today = reference.date();
    let (amount, unit) = parse_phrase(phrase)?;
    let resolved = match unit {
        _ if amount == 0 => Some(today),
        Unit::Day => today.checked_sub_days(Days::new(amount)),
        Unit::Week => amount
            .checked_mul(7)
            .and_then(|days| today.checked_sub_days(Days::new(days))),
        Unit::Month => u32::try_from(amount)
            .ok()
            .and_then(|months| today.checked_sub_months(Months::new(months))),
        Unit::Year => u32::try_from(amount)
            .ok()
            .and_then(|years| years.checked_mul(12))
            .and_then(|months| today.checked_sub_months(Months::new(months))),
    };
    if resolved.is_none() {
        warn!(phrase, "relative time out of range");
    }
    resolved
}

/// Months as 30 days and years as 365 days.
#[deprecated(note = "drifts from calendar months; use `resolve`")]
pub fn resolve_fixed_days(reference: NaiveDateTime, phrase: &str) -> Option<NaiveDate> {
    let today = reference.date();
    let (amount, unit) = parse_phrase(phrase)?;
    let per_unit = match unit {
        Unit::Day => 1,
        Unit::Week => 7,
        Unit::Month => 30,
        Unit::Year => 365,
    };
    amount
        .checked_mul(per_unit)
        .and_then(|days| today.checked_sub_days(Days::new(days)))
}

/// `Some((0, Day))` for sub-day phrases.
fn parse_phrase(phrase: &str) -> Option<(u64, Unit)> {
    let lowered = phrase.to_lowercase();
    if lowered.contains("hour") || lowered.contains("minute") {
        return Some((0, Unit::Day));
    }

    let stripped = strip_edited(phrase);
    let normalized = LEADING_ARTICLE.replace(stripped, "1");
    let Some(caps) = AGO.captures(&normalized) else {
        warn!(phrase, "unrecognized relative time");
        return None;
    };
    let amount = caps[1].parse::<u64>().ok().or_else(|| {
        warn!(phrase, "relative time amount out of range");
        None
    })?;
    let unit = match caps[2].to_ascii_lowercase().as_str() {
        "day" => Unit::Day,
        "week" => Unit::Week,
        "month" => Unit::Month,
        _ => Unit::Year,
    };
    Some((amount, unit))
}

fn strip_edited(phrase: &str) -> &str {
    let mut text = phrase.trim();
    for affix in ["edited", "Edited"] {
        if let Some(rest) = text.strip_prefix(affix) {
            text = rest.trim_start();
        }
        if let Some(rest) = text.strip_suffix(affix) {
            text = rest.trim_end();
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .and_then(|date| date.and_hms_opt(14, 30, 0))
            .unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn resolves_common_phrases() {
        let now = at(2024, 1, 10);
        assert_eq!(resolve(now, "2 days ago"), Some(date(2024, 1, 8)));
        assert_eq!(resolve(now, "a month ago"), Some(date(2023, 12, 10)));
        assert_eq!(resolve(now, "3 hours ago"), Some(date(2024, 1, 10)));
        assert_eq!(resolve(now, "garbage"), None);
    }

    #[test]
    fn weeks_years_and_edits() {
        let now = at(2024, 1, 10);
        assert_eq!(resolve(now, "a week ago"), Some(date(2024, 1, 3)));
        assert_eq!(resolve(now, "Edited 3 weeks ago"), Some(date(2023, 12, 20)));
        assert_eq!(resolve(now, "2 years ago Edited"), Some(date(2022, 1, 10)));
        assert_eq!(resolve(now, "an hour ago"), Some(date(2024, 1, 10)));
        assert_eq!(resolve(now, "A year ago"), Some(date(2023, 1, 10)));
        assert_eq!(resolve(now, "12 minutes ago"), Some(date(2024, 1, 10)));
    }

    #[test]
    fn calendar_months_clamp_to_month_end() {
        assert_eq!(resolve(at(2024, 3, 31), "a month ago"), Some(date(2024, 2, 29)));
    }

    #[test]
    #[allow(deprecated)]
    fn fixed_day_variant_drifts() {
        let now = at(2024, 3, 31);
        assert_eq!(resolve_fixed_days(now, "a month ago"), Some(date(2024, 3, 1)));
        assert_eq!(resolve_fixed_days(now, "1 year ago"), Some(date(2023, 4, 1)));
        assert_eq!(resolve_fixed_days(now, "nonsense"), None);
    }

    #[test]
    fn absurd_amounts_are_absent() {
        assert_eq!(resolve(at(2024, 1, 10), "99999999999999999999 days ago"), None);
        assert_eq!(resolve(at(2024, 1, 10), "900000 years ago"), None);
    }
}
