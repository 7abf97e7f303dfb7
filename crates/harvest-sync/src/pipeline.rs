use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use harvest_adapters::{AdapterError, TargetSource};
use harvest_core::{AttributeSet, RecordId, Review, ReviewKeyScheme, Venue, VenueDraft};
use harvest_storage::{ReviewStore, VenueStore, VenueTable};
use serde::Serialize;
use tokio::fs;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::admission::{Blocklist, Rejection};
use crate::attributes::union_columns;
use crate::config::{HarvestConfig, PersistenceMode};
use crate::reconcile::{Outcome, ReviewAdmission, ReviewLedger, VenueReconciler};

/// Source of capture instants for refresh timestamps and review date resolution.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

/// Which passes a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPlan {
    pub discover: bool,
    pub details: bool,
    pub reviews: bool,
}

impl RunPlan {
    pub fn all() -> Self {
        Self {
            discover: true,
            details: true,
            reviews: true,
        }
    }

    pub fn venues() -> Self {
        Self {
            discover: true,
            details: true,
            reviews: false,
        }
    }

    pub fn reviews() -> Self {
        Self {
            discover: false,
            details: false,
            reviews: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub added: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub duplicates: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub persistence: PersistenceMode,
    pub venues: Tally,
    pub reviews: Tally,
    /// Targets skipped because the source failed for them.
    pub failed_targets: usize,
    /// Store writes that were abandoned; their records are not persisted.
    pub failed_writes: usize,
    /// SHA-256 of each store file after the run.
    pub venue_store_sha256: Option<String>,
    pub review_store_sha256: Option<String>,
    pub status: RunStatus,
    pub error: Option<String>,
}

impl RunSummary {
    fn start(source_id: &str, persistence: PersistenceMode) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            source_id: source_id.to_string(),
            started_at: now,
            finished_at: now,
            elapsed_ms: 0,
            persistence,
            venues: Tally::default(),
            reviews: Tally::default(),
            failed_targets: 0,
            failed_writes: 0,
            venue_store_sha256: None,
            review_store_sha256: None,
            status: RunStatus::Completed,
            error: None,
        }
    }
}

pub struct HarvestPipeline<S> {
    config: HarvestConfig,
    source: S,
    venue_store: VenueStore,
    review_store: ReviewStore,
    clock: Box<dyn Clock>,
}

impl<S: TargetSource> HarvestPipeline<S> {
    pub fn new(config: HarvestConfig, source: S) -> Self {
        let venue_store = VenueStore::new(config.venues_csv.clone());
        let review_store = ReviewStore::new(config.reviews_csv.clone(), config.review_key_scheme);
        Self {
            config,
            source,
            venue_store,
            review_store,
            clock: Box::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Runs the planned passes. The source is always shut down and a summary always
    /// logged; the error is returned only for failures that end the run (store unreadable
    /// at startup, driver setup failure).
    pub async fn run_once(&self, plan: RunPlan) -> Result<RunSummary> {
        let timer = Instant::now();
        let mut summary = RunSummary::start(self.source.source_id(), self.config.persistence);
        info!(run_id = %summary.run_id, source = %summary.source_id, ?plan, "harvest run started");

        let span = info_span!("harvest_run", run_id = %summary.run_id);
        let outcome = self.run_passes(plan, &mut summary).instrument(span).await;

        if let Err(err) = self.source.shutdown().await {
            error!(error = %err, "source shutdown failed");
        }

        summary.venue_store_sha256 = self.venue_store.fingerprint().unwrap_or_else(|err| {
            warn!(error = %err, "could not fingerprint venue store");
            None
        });
        summary.review_store_sha256 = self.review_store.fingerprint().unwrap_or_else(|err| {
            warn!(error = %err, "could not fingerprint review store");
            None
        });
        summary.finished_at = Utc::now();
        summary.elapsed_ms = u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX);
        if let Err(err) = &outcome {
            summary.status = RunStatus::Failed;
            summary.error = Some(format!("{err:#}"));
        }
        info!(
            run_id = %summary.run_id,
            status = ?summary.status,
            elapsed_ms = summary.elapsed_ms,
            venues_added = summary.venues.added,
            venues_changed = summary.venues.changed,
            reviews_added = summary.reviews.added,
            failed_targets = summary.failed_targets,
            failed_writes = summary.failed_writes,
            "harvest run finished"
        );
        if let Some(dir) = &self.config.reports_dir {
            if let Err(err) = write_reports(dir, &summary).await {
                let message = format!("{err:#}");
                warn!(error = %message, "could not write run report");
            }
        }

        outcome.map(|()| summary)
    }

    async fn run_passes(&self, plan: RunPlan, summary: &mut RunSummary) -> Result<()> {
        if plan.discover || plan.details {
            self.venue_store
                .ensure_initialized()
                .context("initializing venue store")?;
            let mut table = self.venue_store.load().context("loading venue store")?;
            let blocklist = Blocklist::new(&self.config.blocklist);
            let mut reconciler = VenueReconciler::new(&table.venues, blocklist);
            info!(venues = table.venues.len(), "venue store loaded");

            let mut added_now = HashSet::new();
            if plan.discover {
                self.discover(&mut table, &mut reconciler, &mut added_now, summary)
                    .await?;
            }
            if plan.details {
                self.refresh_details(&mut table, &mut reconciler, &added_now, summary)
                    .await?;
            }
        }

        if plan.reviews {
            self.review_store
                .ensure_initialized()
                .context("initializing review store")?;
            let existing = self.review_store.load().context("loading review store")?;
            let venues = self.venue_store.load().context("loading venue store")?.venues;
            info!(reviews = existing.len(), venues = venues.len(), "review store loaded");
            self.collect_reviews(&venues, &existing, summary).await?;
        }
        Ok(())
    }

    /// Listing pass: admits unseen targets as bare rows and appends them.
    async fn discover(
        &self,
        table: &mut VenueTable,
        reconciler: &mut VenueReconciler,
        added_now: &mut HashSet<RecordId>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let targets = match self.source.fetch_target_list().await {
            Ok(targets) => targets,
            Err(err) => {
                let err = recoverable(err)?;
                error!(error = %err, "target listing failed; continuing with stored venues");
                summary.failed_targets += 1;
                return Ok(());
            }
        };
        info!(targets = targets.len(), "target listing fetched");

        let now = self.clock.now();
        let mut fresh = Vec::new();
        for target in &targets {
            match reconciler.admit(target, now) {
                Ok(venue) => {
                    debug!(id = %venue.id, name = %target.name, "new venue");
                    fresh.push(venue);
                }
                Err(Rejection::Duplicate) => summary.venues.duplicates += 1,
                Err(Rejection::Blocklisted) => {
                    info!(name = %target.name, "skipping blocklisted venue");
                    summary.venues.skipped += 1;
                }
                Err(Rejection::MissingIdentity) => {
                    warn!(url = %target.url, name = %target.name, "skipping target without name or url");
                    summary.venues.skipped += 1;
                }
            }
        }

        match self.venue_store.append(&fresh, &table.attribute_columns) {
            Ok(written) => {
                summary.venues.added += written;
                added_now.extend(fresh.iter().map(|v| v.id.clone()));
                table.venues.extend(fresh);
            }
            Err(err) => {
                error!(error = %err, venues = fresh.len(), "appending new venues failed");
                summary.failed_writes += 1;
            }
        }
        Ok(())
    }

    /// Detail pass: opens every stored venue, merges the scrape and rewrites the store
    /// when anything (or the attribute column set) changed.
    async fn refresh_details(
        &self,
        table: &mut VenueTable,
        reconciler: &mut VenueReconciler,
        added_now: &HashSet<RecordId>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let total = table.venues.len();
        let mut dirty = false;
        let mut since_checkpoint = 0usize;

        for index in 0..total {
            if self.config.progress_every > 0 && index > 0 && index % self.config.progress_every == 0 {
                info!(processed = index, total, "detail pass progress");
            }
            let url = table.venues[index].url.as_str().trim().to_string();
            if url.is_empty() {
                warn!(id = %table.venues[index].id, "stored venue has no url");
                summary.venues.skipped += 1;
                continue;
            }

            let candidate = match self.scrape_venue(&url).await {
                Ok(candidate) => candidate,
                Err(err) => {
                    let err = match recoverable(err) {
                        Ok(err) => err,
                        Err(fatal) => {
                            if dirty {
                                self.persist_venues(table, summary);
                            }
                            return Err(fatal);
                        }
                    };
                    error!(url = %url, error = %err, "skipping unreachable venue");
                    summary.failed_targets += 1;
                    continue;
                }
            };

            let merged = reconciler.reconcile(&table.venues[index], &candidate, self.clock.now());
            let counted_as_added = added_now.contains(&merged.record.id);
            match merged.outcome {
                Outcome::Changed => {
                    dirty = true;
                    since_checkpoint += 1;
                    if !counted_as_added {
                        summary.venues.changed += 1;
                    }
                }
                Outcome::Unchanged if !counted_as_added => summary.venues.unchanged += 1,
                Outcome::Unchanged | Outcome::Added => {}
            }
            table.venues[index] = merged.record;

            if self.config.persistence == PersistenceMode::Resilient
                && since_checkpoint >= self.config.checkpoint_every
            {
                if self.persist_venues(table, summary) {
                    dirty = false;
                }
                since_checkpoint = 0;
            }
        }

        let columns = union_columns(&table.attribute_columns, table.venues.iter().map(|v| &v.attributes));
        if dirty || columns != table.attribute_columns {
            self.persist_venues(table, summary);
        } else {
            info!("venue store unchanged; skipping rewrite");
        }
        Ok(())
    }

    async fn scrape_venue(&self, url: &str) -> Result<VenueDraft, AdapterError> {
        self.source.open_target(url).await?;
        let mut draft = self.source.extract_current_target_fields().await?;
        draft.attributes = match self.source.extract_attribute_categories().await {
            Ok(attributes) => attributes,
            Err(err) => {
                warn!(url, error = %err, "attribute categories not extracted");
                AttributeSet::new()
            }
        };
        Ok(draft)
    }

    /// Full rewrite with the unioned column set. Returns whether it succeeded.
    fn persist_venues(&self, table: &mut VenueTable, summary: &mut RunSummary) -> bool {
        table.attribute_columns =
            union_columns(&table.attribute_columns, table.venues.iter().map(|v| &v.attributes));
        match self.venue_store.rewrite(table) {
            Ok(_) => true,
            Err(err) => {
                error!(error = %err, "venue store rewrite failed");
                summary.failed_writes += 1;
                false
            }
        }
    }

    /// Review pass over every stored venue.
    async fn collect_reviews(
        &self,
        venues: &[Venue],
        existing: &[Review],
        summary: &mut RunSummary,
    ) -> Result<()> {
        let mut ledger = ReviewLedger::new(existing, self.config.review_key_scheme);
        let total = venues.len();

        for (index, venue) in venues.iter().enumerate() {
            if self.config.progress_every > 0 && index > 0 && index % self.config.progress_every == 0 {
                info!(processed = index, total, "review pass progress");
            }
            if venue.id.parse().is_none() {
                warn!(id = %venue.id, name = %venue.name.as_str(), "skipping reviews of venue without a numeric id");
                summary.reviews.skipped += 1;
                continue;
            }
            let url = venue.url.as_str().trim();
            if url.is_empty() {
                summary.reviews.skipped += 1;
                continue;
            }
            if let Err(err) = self.source.open_target(url).await {
                let err = recoverable(err)?;
                error!(url, error = %err, "skipping unreachable venue");
                summary.failed_targets += 1;
                continue;
            }
            self.collect_venue_reviews(venue, &mut ledger, summary).await?;
        }
        Ok(())
    }

    async fn collect_venue_reviews(
        &self,
        venue: &Venue,
        ledger: &mut ReviewLedger,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let resilient = self.config.persistence == PersistenceMode::Resilient;
        let stop_at_boundary = resilient && ledger.scheme() == ReviewKeyScheme::ProviderId;
        let cap = self.config.max_reviews_per_target;
        let mut pending = Vec::new();
        let mut seen = 0usize;

        loop {
            if seen >= cap {
                info!(venue_id = %venue.id, cap, "review cap reached");
                break;
            }
            let page = match self.source.next_review_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(err) => {
                    let err = match recoverable(err) {
                        Ok(err) => err,
                        Err(fatal) => {
                            self.flush_reviews(&mut pending, summary);
                            return Err(fatal);
                        }
                    };
                    error!(venue_id = %venue.id, error = %err, "review page failed; keeping what was collected");
                    summary.failed_targets += 1;
                    break;
                }
            };

            let crawled_at = self.clock.now();
            let mut reached_boundary = false;
            for content in page {
                if seen >= cap {
                    break;
                }
                seen += 1;
                match ledger.admit(&venue.id, content, crawled_at) {
                    ReviewAdmission::New(review) => pending.push(review),
                    ReviewAdmission::Duplicate => {
                        summary.reviews.duplicates += 1;
                        reached_boundary = true;
                    }
                    ReviewAdmission::MissingKey => summary.reviews.skipped += 1,
                }
                if resilient && pending.len() >= self.config.review_batch_size {
                    self.flush_reviews(&mut pending, summary);
                }
            }
            if stop_at_boundary && reached_boundary {
                info!(venue_id = %venue.id, "reached reviews stored by an earlier run");
                break;
            }
        }

        self.flush_reviews(&mut pending, summary);
        Ok(())
    }

    fn flush_reviews(&self, pending: &mut Vec<Review>, summary: &mut RunSummary) {
        if pending.is_empty() {
            return;
        }
        match self.review_store.append(pending) {
            Ok(written) => summary.reviews.added += written,
            Err(err) => {
                error!(error = %err, reviews = pending.len(), "appending reviews failed");
                summary.failed_writes += 1;
            }
        }
        pending.clear();
    }
}

/// Driver setup failures end the run; every other adapter error stays with its target.
fn recoverable(err: AdapterError) -> Result<AdapterError> {
    match err {
        AdapterError::Setup(_) => Err(anyhow::Error::new(err).context("target source setup failed")),
        other => Ok(other),
    }
}

async fn write_reports(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    let brief = format!(
        "# Harvest Run\n\n- Run ID: `{}`\n- Source: {}\n- Status: {:?}\n- Started: {}\n- Finished: {}\n\n## Venues\n- added: {}\n- changed: {}\n- unchanged: {}\n\n## Reviews\n- added: {}\n- duplicates: {}\n\n## Failures\n- targets: {}\n- writes: {}\n",
        summary.run_id,
        summary.source_id,
        summary.status,
        summary.started_at,
        summary.finished_at,
        summary.venues.added,
        summary.venues.changed,
        summary.venues.unchanged,
        summary.reviews.added,
        summary.reviews.duplicates,
        summary.failed_targets,
        summary.failed_writes,
    );
    fs::write(dir.join("run_brief.md"), brief)
        .await
        .context("writing run_brief.md")?;
    Ok(dir)
}
