//! Fixture-first source: replays a recorded JSON bundle instead of driving a browser.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use harvest_core::{AttributeSet, Field, ReviewContent, VenueDraft, VenueTarget};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::normalize::{RawReview, RawVenueFields};
use crate::{AdapterError, TargetSource};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub source_id: String,
    #[serde(default)]
    pub targets: Vec<FixtureTarget>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureTarget {
    pub url: String,
    pub name: String,
    /// Whether the target shows up in the listing pass.
    #[serde(default = "default_true")]
    pub listed: bool,
    /// Opening the target fails, as a navigation timeout would.
    #[serde(default)]
    pub unreachable: bool,
    #[serde(default)]
    pub fields: RawVenueFields,
    #[serde(default)]
    pub attributes: AttributeSet,
    #[serde(default)]
    pub review_pages: Vec<Vec<RawReview>>,
}

fn default_true() -> bool {
    true
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Default)]
struct Cursor {
    current: Option<usize>,
    next_page: usize,
}

#[derive(Debug)]
pub struct FixtureSource {
    bundle: FixtureBundle,
    cursor: Mutex<Cursor>,
    shut_down: AtomicBool,
}

impl FixtureSource {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self {
            bundle,
            cursor: Mutex::new(Cursor::default()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_bundle(path)?))
    }

    pub fn bundle(&self) -> &FixtureBundle {
        &self.bundle
    }

    pub fn was_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    async fn current_target(&self) -> Result<&FixtureTarget, AdapterError> {
        let cursor = self.cursor.lock().await;
        cursor
            .current
            .and_then(|i| self.bundle.targets.get(i))
            .ok_or_else(|| AdapterError::Message("no target opened".to_string()))
    }
}

#[async_trait]
impl TargetSource for FixtureSource {
    fn source_id(&self) -> &str {
        &self.bundle.source_id
    }

    async fn fetch_target_list(&self) -> Result<Vec<VenueTarget>, AdapterError> {
        Ok(self
            .bundle
            .targets
            .iter()
            .filter(|t| t.listed)
            .map(|t| VenueTarget {
                url: t.url.clone(),
                name: t.name.clone(),
            })
            .collect())
    }

    async fn open_target(&self, url: &str) -> Result<(), AdapterError> {
        let mut cursor = self.cursor.lock().await;
        cursor.current = None;
        cursor.next_page = 0;
        let index = self
            .bundle
            .targets
            .iter()
            .position(|t| t.url == url)
            .ok_or_else(|| AdapterError::Unreachable(format!("no recorded page for {url}")))?;
        if self.bundle.targets[index].unreachable {
            return Err(AdapterError::Unreachable(url.to_string()));
        }
        cursor.current = Some(index);
        Ok(())
    }

    async fn extract_current_target_fields(&self) -> Result<VenueDraft, AdapterError> {
        let target = self.current_target().await?;
        Ok(VenueDraft {
            url: Field::new(target.url.as_str()),
            name: Field::new(target.name.as_str()),
            details: target.fields.clone().into_details(),
            attributes: AttributeSet::new(),
        })
    }

    async fn extract_attribute_categories(&self) -> Result<AttributeSet, AdapterError> {
        Ok(self.current_target().await?.attributes.clone())
    }

    async fn next_review_page(&self) -> Result<Option<Vec<ReviewContent>>, AdapterError> {
        let mut cursor = self.cursor.lock().await;
        let Some(target) = cursor.current.and_then(|i| self.bundle.targets.get(i)) else {
            return Err(AdapterError::Message("no target opened".to_string()));
        };
        let Some(page) = target.review_pages.get(cursor.next_page) else {
            return Ok(None);
        };
        cursor.next_page += 1;
        Ok(Some(page.iter().cloned().map(RawReview::into_content).collect()))
    }

    async fn shutdown(&self) -> Result<(), AdapterError> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}
