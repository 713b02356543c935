use std::path::PathBuf;

use chrono::Local;

use crate::aggregate::PhaseOutput;
use crate::config::{DigestSettings, PartialPolicy};
use crate::dispatch::Phase;
use crate::export::{digest_path, save_to_csv};
use crate::listing::{listing_queries, posted_on, yesterday_label, DigestRow, DETAIL_LINK, SELLER_NAME};
use crate::model::{Query, QueryId, Record};
use crate::service::{with_session, ExtractionService};
use crate::{info_time, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Connect,
    ListingDispatch,
    ListingWait,
    Filter,
    DetailDispatch,
    DetailWait,
    MergeAndExport,
    Done,
}

fn enter(stage: Stage) {
    tracing::debug!(?stage, "Entering stage");
}

/// What a run produced.
#[derive(Debug, Clone)]
pub struct DigestReport {
    pub day: String,
    /// Listing records collected over all pages.
    pub listings: usize,
    /// Listings posted on `day`.
    pub matched: usize,
    /// Detail queries sent, zero when nothing matched.
    pub detail_queries: usize,
    pub rows: Vec<DigestRow>,
    pub path: PathBuf,
    /// Queries that failed or listings that couldn't be joined.
    pub excluded: usize,
}

/// Runs both phases and writes the csv. The session is released on every path.
pub async fn run_digest<S>(service: &S, settings: &DigestSettings) -> Result<DigestReport>
where
    S: ExtractionService + ?Sized,
{
    enter(Stage::Connect);
    // `with_session` logs the disconnect itself.
    let report = with_session(service, || collect_digest(service, settings)).await?;
    enter(Stage::Done);
    Ok(report)
}

async fn collect_digest<S>(service: &S, settings: &DigestSettings) -> Result<DigestReport>
where
    S: ExtractionService + ?Sized,
{
    let start_time = Local::now();
    let day = settings
        .target_day
        .clone()
        .unwrap_or_else(|| yesterday_label(Local::now()));
    let mut excluded = 0;

    // Listing pages
    enter(Stage::ListingDispatch);
    let queries = listing_queries(settings);
    let mut phase = Phase::open("listing", service, queries.len());
    for query in queries {
        phase.dispatch(query)?;
    }
    enter(Stage::ListingWait);
    let listing_output = phase.wait(settings.phase_timeout).await?;
    excluded += check_failures(&listing_output, settings.partial_policy)?;

    enter(Stage::Filter);
    let listings = listing_output.records_in_dispatch_order();
    let listing_count = listings.len();
    let matched = posted_on(listings, &day);
    info_time!(
        start_time,
        "New listings posted on {}: {} of {}",
        day,
        matched.len(),
        listing_count
    );

    // Details, one query per matched listing
    let (rows, detail_queries) = if matched.is_empty() {
        tracing::info!("Nothing matched, skipping detail queries");
        (Vec::new(), 0)
    } else {
        let (rows, detail_queries, dropped) = collect_details(service, settings, &matched).await?;
        excluded += dropped;
        (rows, detail_queries)
    };

    enter(Stage::MergeAndExport);
    let path = digest_path(&settings.output_dir, &day);
    tokio::task::spawn_blocking({
        let rows = rows.clone();
        let path = path.clone();
        move || save_to_csv(&rows, &path)
    })
    .await??;
    info_time!(start_time, "Wrote {} rows to {}", rows.len(), path.display());

    Ok(DigestReport {
        day,
        listings: listing_count,
        matched: matched.len(),
        detail_queries,
        rows,
        path,
        excluded,
    })
}

/// Returns the joined rows, the number of detail queries sent and how many listings were dropped.
async fn collect_details<S>(
    service: &S,
    settings: &DigestSettings,
    matched: &[Record],
) -> Result<(Vec<DigestRow>, usize, usize)>
where
    S: ExtractionService + ?Sized,
{
    enter(Stage::DetailDispatch);
    let mut targets = Vec::with_capacity(matched.len());
    let mut dropped = 0;
    for (position, listing) in matched.iter().enumerate() {
        match listing.text(DETAIL_LINK) {
            Some(link) => targets.push((position, link)),
            None => {
                tracing::warn!(listing = position, "Listing has no detail link, leaving it out");
                dropped += 1;
            }
        }
    }

    let mut phase = Phase::open("detail", service, targets.len());
    // Each listing remembers the query that fetches its details.
    let mut pending: Vec<(usize, QueryId)> = Vec::with_capacity(targets.len());
    for (position, link) in targets {
        let handle = phase.dispatch(Query::new(link, settings.detail_connector.clone()))?;
        pending.push((position, handle.id()));
    }

    enter(Stage::DetailWait);
    let output = phase.wait(settings.phase_timeout).await?;
    dropped += check_failures(&output, settings.partial_policy)?;

    let (rows, mismatched) = join_details(matched, &pending, &output, settings.partial_policy)?;
    Ok((rows, pending.len(), dropped + mismatched))
}

/// Keyed join: listing position -> its detail query -> that query's single record.
/// Completion order never enters into it.
pub fn join_details(
    matched: &[Record],
    pending: &[(usize, QueryId)],
    output: &PhaseOutput,
    policy: PartialPolicy,
) -> Result<(Vec<DigestRow>, usize)> {
    let mut rows = Vec::with_capacity(pending.len());
    let mut mismatched = 0;

    for &(position, query) in pending {
        if output.failures.iter().any(|f| f.query() == query) {
            // Already reported by the aggregator.
            continue;
        }
        let details = output.results_for(query);
        let seller = match details {
            [only] => only.text(SELLER_NAME),
            _ => None,
        };
        match (seller, matched.get(position)) {
            (Some(seller), Some(listing)) => rows.push(DigestRow::project(listing, seller)),
            _ => {
                let err = Error::JoinArityMismatch {
                    listing: position,
                    query,
                    found: details.len(),
                };
                if policy == PartialPolicy::Abort {
                    return Err(err);
                }
                tracing::warn!(error = %err, "Leaving listing out of the digest");
                mismatched += 1;
            }
        }
    }
    Ok((rows, mismatched))
}

/// Applies the partial-results policy to a finished phase. Returns how many queries failed.
fn check_failures(output: &PhaseOutput, policy: PartialPolicy) -> Result<usize> {
    let failed = output.failures.len();
    if failed == 0 {
        return Ok(0);
    }
    match policy {
        PartialPolicy::Abort => Err(output.failures[0].clone().into()),
        PartialPolicy::Continue => {
            tracing::warn!(failed, "Some queries failed, continuing with partial data");
            Ok(failed)
        }
    }
}
