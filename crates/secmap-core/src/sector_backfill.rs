//! Sector back-fill for recently reported holdings that no active sector row
//! covers, by ticker or by CUSIP.

use std::collections::{BTreeMap, BTreeSet};

use secmap_warehouse::{ApplyCounts, SectorRow};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::EnrichConfig;
use crate::controller::{ControllerSnapshot, Stage};
use crate::domain::{CanonicalSymbol, Cusip, GicsSector, HoldingKey, ResolvedIdentity};
use crate::error::EnrichError;
use crate::executor::{Resolution, StageResult};
use crate::persist::BatchPersister;
use crate::provider::LookupProvider;
use crate::run::{round_to, FailurePreview, LookupStack, RequestStats};
use crate::stages;
use crate::store::{ActiveSector, SectorBackfillStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectorBackfillSummary {
    pub run_id: Uuid,
    pub dry_run: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub elapsed_seconds: f64,
    pub report_periods: usize,
    /// Distinct holdings in the report periods.
    pub holdings: usize,
    pub mapped_tickers: usize,
    pub mapped_cusips: usize,
    /// Holdings neither mapped ticker nor mapped CUSIP covers.
    pub unmapped: usize,
    /// Unmapped holdings with a ticker to classify, after the limit.
    pub resolved_holdings: usize,
    pub tickers_classified: usize,
    pub unresolved_no_ticker: usize,
    pub unresolved_sector: usize,
    pub deactivated: usize,
    pub inserted: usize,
    #[serde(flatten)]
    pub requests: RequestStats,
    pub adaptive: ControllerSnapshot,
    pub failure_preview: Vec<String>,
}

/// Unmapped holdings reduced to the ticker each one is classified under.
#[derive(Debug, Default, PartialEq, Eq)]
struct BackfillPlan {
    unmapped: usize,
    no_ticker: usize,
    holdings: Vec<(CanonicalSymbol, Option<Cusip>)>,
}

pub struct SectorBackfillRun<'a> {
    config: EnrichConfig,
    store: &'a dyn SectorBackfillStore,
    provider: &'a dyn LookupProvider,
}

impl<'a> SectorBackfillRun<'a> {
    pub fn new(
        config: EnrichConfig,
        store: &'a dyn SectorBackfillStore,
        provider: &'a dyn LookupProvider,
    ) -> Self {
        Self {
            config,
            store,
            provider,
        }
    }

    /// Classifies every unmapped recent holding and writes the sectors found.
    pub async fn execute(&self) -> Result<SectorBackfillSummary, EnrichError> {
        self.config.validate()?;
        let config = &self.config;
        let run_id = Uuid::new_v4();
        let started_at = OffsetDateTime::now_utc();
        let run_started = Instant::now();

        let holdings = self
            .store
            .recent_holdings(config.report_periods)
            .map_err(EnrichError::StoreRead)?;
        let active_sectors = self
            .store
            .active_sectors()
            .map_err(EnrichError::StoreRead)?;
        let identities = self
            .store
            .active_identities()
            .map_err(EnrichError::StoreRead)?;

        let mapped_tickers: BTreeSet<&str> = active_sectors.keys().map(String::as_str).collect();
        let mapped_cusips: BTreeSet<&str> = active_sectors
            .values()
            .filter_map(|sector| sector.cusip.as_deref())
            .collect();
        let holding_count = holdings.len();
        let mut plan = plan_backfill(holdings, &active_sectors, &identities);

        let mut tickers: Vec<CanonicalSymbol> = plan
            .holdings
            .iter()
            .map(|(ticker, _)| ticker.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if config.item_limit > 0 {
            tickers.truncate(config.item_limit);
            let kept: BTreeSet<&CanonicalSymbol> = tickers.iter().collect();
            plan.holdings.retain(|(ticker, _)| kept.contains(ticker));
        }

        let stack = LookupStack::new(config);
        let mut failures = FailurePreview::new(config.failure_preview_limit);
        tracing::info!(
            %run_id,
            report_periods = config.report_periods,
            holdings = holding_count,
            mapped_tickers = mapped_tickers.len(),
            mapped_cusips = mapped_cusips.len(),
            unmapped = plan.unmapped,
            tickers = tickers.len(),
            dry_run = config.dry_run,
            "sector back-fill started"
        );

        let inputs: Vec<ResolvedIdentity> = tickers
            .iter()
            .map(|ticker| ResolvedIdentity {
                provider_symbol: ticker.provider_symbol(),
                ticker: ticker.clone(),
            })
            .collect();
        let tickers_classified = inputs.len();
        let provider = self.provider;
        let pipeline = &stack.pipeline;
        let results = stack
            .executor
            .run(Stage::Sector, inputs, |identity| {
                stages::classify_identity(pipeline, provider, identity)
            })
            .await;

        let sectors = collect_sectors(results, &mut failures);
        let (unresolved_sector, rows) = sector_rows(&plan.holdings, &sectors);

        let mut applied = ApplyCounts::default();
        if config.dry_run {
            tracing::info!(rows = rows.len(), "dry run, sector rows not written");
        } else if !rows.is_empty() {
            let persister = BatchPersister::new(self.store, &stack.metrics, config.batch_size);
            applied = persister
                .apply_sectors(rows, &config.sector_provenance())
                .map_err(EnrichError::StoreWrite)?;
        }

        tracing::info!(
            resolved = plan.holdings.len(),
            no_ticker = plan.no_ticker,
            unresolved_sector,
            deactivated = applied.deactivated,
            inserted = applied.inserted,
            "sector back-fill complete"
        );

        Ok(SectorBackfillSummary {
            run_id,
            dry_run: config.dry_run,
            started_at,
            elapsed_seconds: round_to(run_started.elapsed().as_secs_f64(), 2),
            report_periods: config.report_periods,
            holdings: holding_count,
            mapped_tickers: mapped_tickers.len(),
            mapped_cusips: mapped_cusips.len(),
            unmapped: plan.unmapped,
            resolved_holdings: plan.holdings.len(),
            tickers_classified,
            unresolved_no_ticker: plan.no_ticker,
            unresolved_sector,
            deactivated: applied.deactivated,
            inserted: applied.inserted,
            requests: RequestStats::from_metrics(&stack.metrics),
            adaptive: stack.controller.snapshot(),
            failure_preview: failures.lines,
        })
    }
}

/// A holding is unmapped when neither its ticker nor its CUSIP has an active
/// sector row. It is classified under its own ticker, or under the active
/// identity of its CUSIP when it was reported without one.
fn plan_backfill(
    holdings: Vec<HoldingKey>,
    active_sectors: &BTreeMap<String, ActiveSector>,
    identities: &BTreeMap<String, String>,
) -> BackfillPlan {
    let mapped_cusips: BTreeSet<&str> = active_sectors
        .values()
        .filter_map(|sector| sector.cusip.as_deref())
        .collect();

    let mut plan = BackfillPlan::default();
    for holding in holdings {
        let ticker_mapped = holding
            .ticker
            .as_ref()
            .is_some_and(|ticker| active_sectors.contains_key(ticker.as_str()));
        let cusip_mapped = holding
            .cusip
            .as_ref()
            .is_some_and(|cusip| mapped_cusips.contains(cusip.as_str()));
        if ticker_mapped || cusip_mapped {
            continue;
        }
        plan.unmapped += 1;

        let ticker = holding.ticker.or_else(|| {
            let cusip = holding.cusip.as_ref()?;
            CanonicalSymbol::normalize(identities.get(cusip.as_str())?).ok()
        });
        match ticker {
            Some(ticker) => plan.holdings.push((ticker, holding.cusip)),
            None => plan.no_ticker += 1,
        }
    }
    plan
}

fn collect_sectors(
    results: Vec<StageResult<ResolvedIdentity, GicsSector>>,
    failures: &mut FailurePreview,
) -> BTreeMap<CanonicalSymbol, GicsSector> {
    let mut sectors = BTreeMap::new();
    for result in results {
        match result.resolution {
            Resolution::Resolved(sector) => {
                sectors.insert(result.input.ticker, sector);
            }
            Resolution::Unresolved(reason) => failures.push(result.input.ticker.as_str(), reason),
        }
    }
    sectors
}

/// One row per classified ticker, carrying the first CUSIP it was held under.
/// Every holding whose ticker found no sector counts as unresolved.
fn sector_rows(
    holdings: &[(CanonicalSymbol, Option<Cusip>)],
    sectors: &BTreeMap<CanonicalSymbol, GicsSector>,
) -> (usize, Vec<SectorRow>) {
    let mut unresolved = 0;
    let mut rows: BTreeMap<&CanonicalSymbol, SectorRow> = BTreeMap::new();
    for (ticker, cusip) in holdings {
        let Some(sector) = sectors.get(ticker) else {
            unresolved += 1;
            continue;
        };
        let row = rows.entry(ticker).or_insert_with(|| SectorRow {
            ticker: ticker.as_str().to_owned(),
            cusip: None,
            sector_code: sector.code.to_owned(),
            sector_label: sector.label.to_owned(),
        });
        if row.cusip.is_none() {
            row.cusip = cusip.as_ref().map(|cusip| cusip.as_str().to_owned());
        }
    }
    (unresolved, rows.into_values().collect())
}
