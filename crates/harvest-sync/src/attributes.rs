//! Dynamic attribute categories: per-venue merge and the store-wide column set.

use std::collections::BTreeSet;

use harvest_core::AttributeSet;
use harvest_storage::VENUE_BASE_COLUMNS;

const RESERVED_SUFFIX: &str = " (attribute)";

/// Store column of a discovered category. Labels equal to a fixed venue column are
/// suffixed so they cannot shadow it.
pub fn column_name(category: &str) -> String {
    if VENUE_BASE_COLUMNS.contains(&category) {
        format!("{category}{RESERVED_SUFFIX}")
    } else {
        category.to_string()
    }
}

/// `set` keyed by store column names.
pub fn namespaced(set: &AttributeSet) -> AttributeSet {
    set.iter()
        .map(|(category, items)| (column_name(category), items.to_vec()))
        .collect()
}

/// Right-biased union: categories in `new` replace the same categories in `old`; categories
/// only in `old` survive.
pub fn merge(old: &AttributeSet, new: &AttributeSet) -> AttributeSet {
    let mut merged = old.clone();
    for (category, items) in new.iter() {
        merged.insert(column_name(category), items.to_vec());
    }
    merged
}

/// Existing columns plus every category seen on any of `sets`, sorted and deduplicated.
pub fn union_columns<'a>(
    existing: &[String],
    sets: impl IntoIterator<Item = &'a AttributeSet>,
) -> Vec<String> {
    let mut columns: BTreeSet<String> = existing.iter().cloned().collect();
    for set in sets {
        columns.extend(set.categories().map(column_name));
    }
    columns.into_iter().collect()
}
