use std::collections::HashSet;

use harvest_core::{normalize_name, VenueTarget};

use crate::dedup::{DedupIndex, NaturalKey};

/// Venue names excluded from harvesting, matched on the normalized name.
#[derive(Debug, Clone, Default)]
pub struct Blocklist {
    names: HashSet<String>,
}

impl Blocklist {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: names
                .into_iter()
                .map(|n| normalize_name(n.as_ref()))
                .filter(|n| !n.is_empty())
                .collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(&normalize_name(name))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MissingIdentity,
    Blocklisted,
    Duplicate,
}

/// Decides whether a listing entry may become a new venue. The blocklist is consulted
/// before the dedup index.
pub fn check_target(
    target: &VenueTarget,
    blocklist: &Blocklist,
    index: &DedupIndex,
) -> Result<NaturalKey, Rejection> {
    if target.url.trim().is_empty() {
        return Err(Rejection::MissingIdentity);
    }
    let key = NaturalKey::venue(&target.name).ok_or(Rejection::MissingIdentity)?;
    if blocklist.contains(&target.name) {
        return Err(Rejection::Blocklisted);
    }
    if index.contains(&key) {
        return Err(Rejection::Duplicate);
    }
    Ok(key)
}
