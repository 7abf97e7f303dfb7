//! Incremental harvest engine: identity allocation, natural-key dedup, field-level
//! reconciliation and the run loop that drives a target source against the CSV stores.

use std::path::Path;

use anyhow::{Context, Result};
use harvest_adapters::{FixtureSource, RetryingSource};

pub mod admission;
pub mod attributes;
mod config;
pub mod dedup;
pub mod identity;
mod pipeline;
pub mod reconcile;
pub mod relative_time;

pub use admission::{Blocklist, Rejection};
pub use config::{ConfigError, HarvestConfig, PersistenceMode};
pub use dedup::{DedupIndex, NaturalKey};
pub use identity::{next_id, IdentityAllocator};
pub use pipeline::{
    Clock, FixedClock, HarvestPipeline, RunPlan, RunStatus, RunSummary, SystemClock, Tally,
};
pub use reconcile::{
    reconcile_venue, Outcome, Reconciled, ReviewAdmission, ReviewLedger, VenueReconciler,
};

pub const CRATE_NAME: &str = "harvest-sync";

/// Pipeline over a recorded fixture bundle, wrapped in the configured retry policy.
pub fn fixture_pipeline(
    config: HarvestConfig,
    fixture: &Path,
) -> Result<HarvestPipeline<RetryingSource<FixtureSource>>> {
    let source = FixtureSource::from_path(fixture)
        .with_context(|| format!("opening fixture source {}", fixture.display()))?;
    let policy = config.retry_policy();
    Ok(HarvestPipeline::new(config, RetryingSource::new(source, policy)))
}
