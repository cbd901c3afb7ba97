//! Stale-ticker refresh: tickers of held identities that no longer trade are
//! replaced, and every CUSIP still pointing at them follows.

use std::collections::BTreeMap;

use secmap_warehouse::{ApplyCounts, IdentityRow};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::EnrichConfig;
use crate::controller::{ControllerSnapshot, Stage};
use crate::domain::{CanonicalSymbol, HeldIdentity, TickerGroup};
use crate::error::EnrichError;
use crate::executor::{Resolution, StageResult, UnresolvedReason};
use crate::provider::LookupProvider;
use crate::run::{round_to, FailurePreview, LookupStack, RequestStats};
use crate::stages::{self, TickerStatus};
use crate::store::TickerRefreshStore;

/// Structured end-of-run report of a ticker refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickerRefreshSummary {
    pub run_id: Uuid,
    pub dry_run: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub elapsed_seconds: f64,
    pub target_ticker: Option<String>,
    /// Held identity rows read from the store.
    pub candidate_rows: usize,
    pub tickers_checked: usize,
    /// Tickers that still trade.
    pub unchanged: usize,
    /// CUSIPs moved to a replacement ticker, or that would be on a dry run.
    pub upgraded: usize,
    /// Tickers left alone for lack of a usable replacement.
    pub unresolved: usize,
    pub deactivated: usize,
    pub inserted: usize,
    #[serde(flatten)]
    pub requests: RequestStats,
    pub adaptive: ControllerSnapshot,
    pub failure_preview: Vec<String>,
}

#[derive(Debug, Default)]
struct RefreshOutcome {
    unchanged: usize,
    unresolved: usize,
    /// Rows to repoint, grouped per old ticker for logging.
    replacements: Vec<(CanonicalSymbol, Vec<IdentityRow>)>,
}

pub struct TickerRefreshRun<'a> {
    config: EnrichConfig,
    store: &'a dyn TickerRefreshStore,
    provider: &'a dyn LookupProvider,
}

impl<'a> TickerRefreshRun<'a> {
    pub fn new(
        config: EnrichConfig,
        store: &'a dyn TickerRefreshStore,
        provider: &'a dyn LookupProvider,
    ) -> Self {
        Self {
            config,
            store,
            provider,
        }
    }

    /// Checks every held ticker and repoints the CUSIPs of dead ones.
    ///
    /// Each CUSIP is replaced in its own transaction; a store failure aborts
    /// the run and leaves earlier replacements in place.
    pub async fn execute(&self) -> Result<TickerRefreshSummary, EnrichError> {
        self.config.validate()?;
        let config = &self.config;
        let target = config
            .target_ticker
            .as_deref()
            .map(CanonicalSymbol::normalize)
            .transpose()?;
        let run_id = Uuid::new_v4();
        let started_at = OffsetDateTime::now_utc();
        let run_started = Instant::now();

        let rows = self.candidate_rows(target.as_ref())?;
        let active = self
            .store
            .active_identities()
            .map_err(EnrichError::StoreRead)?;
        let candidate_rows = rows.len();

        let mut groups = TickerGroup::group(rows);
        if let Some(target) = &target {
            groups.retain(|group| &group.ticker == target);
        }
        if config.item_limit > 0 {
            groups.truncate(config.item_limit);
        }
        let tickers_checked = groups.len();

        let stack = LookupStack::new(config);
        let mut failures = FailurePreview::new(config.failure_preview_limit);
        tracing::info!(
            %run_id,
            candidate_rows,
            tickers = tickers_checked,
            target_ticker = target.as_ref().map(CanonicalSymbol::as_str),
            dry_run = config.dry_run,
            "ticker refresh started"
        );

        let provider = self.provider;
        let pipeline = &stack.pipeline;
        let results = stack
            .executor
            .run(Stage::Identity, groups, |group| {
                stages::verify_ticker(pipeline, provider, group)
            })
            .await;

        let outcome = reduce_refresh_results(results, &active, &mut failures);
        let mut upgraded = 0;
        let mut applied = ApplyCounts::default();
        let provenance = config.ticker_refresh_provenance();
        for (old, rows) in &outcome.replacements {
            if config.dry_run {
                upgraded += rows.len();
                continue;
            }
            for row in rows {
                let started = Instant::now();
                let result = self.store.replace_identity(row, &provenance);
                stack.metrics.record_db_write(started.elapsed());
                applied += result.map_err(EnrichError::StoreWrite)?;
                upgraded += 1;
            }
            if let Some(row) = rows.first() {
                tracing::info!(old = %old, new = %row.ticker, cusips = rows.len(), "ticker replaced");
            }
        }

        tracing::info!(
            unchanged = outcome.unchanged,
            upgraded,
            unresolved = outcome.unresolved,
            deactivated = applied.deactivated,
            inserted = applied.inserted,
            "ticker refresh complete"
        );

        Ok(TickerRefreshSummary {
            run_id,
            dry_run: config.dry_run,
            started_at,
            elapsed_seconds: round_to(run_started.elapsed().as_secs_f64(), 2),
            target_ticker: target.map(|ticker| ticker.as_str().to_owned()),
            candidate_rows,
            tickers_checked,
            unchanged: outcome.unchanged,
            upgraded,
            unresolved: outcome.unresolved,
            deactivated: applied.deactivated,
            inserted: applied.inserted,
            requests: RequestStats::from_metrics(&stack.metrics),
            adaptive: stack.controller.snapshot(),
            failure_preview: failures.lines,
        })
    }

    /// Held identities, or every identity of the target ticker when one is
    /// set and the store knows it.
    fn candidate_rows(
        &self,
        target: Option<&CanonicalSymbol>,
    ) -> Result<Vec<HeldIdentity>, EnrichError> {
        if let Some(target) = target {
            let targeted = self
                .store
                .identities_for_ticker(target)
                .map_err(EnrichError::StoreRead)?;
            if !targeted.is_empty() {
                return Ok(targeted);
            }
        }
        self.store
            .held_identities(self.config.top_institutions)
            .map_err(EnrichError::StoreRead)
    }
}

/// Only CUSIPs whose active ticker is still the old one, already the
/// replacement, or missing are repointed.
fn reduce_refresh_results(
    results: Vec<StageResult<TickerGroup, TickerStatus>>,
    active: &BTreeMap<String, String>,
    failures: &mut FailurePreview,
) -> RefreshOutcome {
    let mut outcome = RefreshOutcome::default();

    for result in results {
        let group = result.input;
        let old = group.ticker.as_str();
        let replacement = match result.resolution {
            Resolution::Resolved(TickerStatus::Active) => {
                outcome.unchanged += 1;
                continue;
            }
            Resolution::Resolved(TickerStatus::Replaced(identity)) => identity.ticker,
            Resolution::Unresolved(reason) => {
                outcome.unresolved += 1;
                failures.push(old, reason);
                continue;
            }
        };

        let rows: Vec<IdentityRow> = group
            .holdings
            .iter()
            .filter(|row| {
                active.get(row.cusip.as_str()).is_none_or(|current| {
                    current == old || current == replacement.as_str()
                })
            })
            .map(|row| IdentityRow {
                cusip: row.cusip.as_str().to_owned(),
                ticker: replacement.as_str().to_owned(),
            })
            .collect();
        if rows.is_empty() {
            outcome.unresolved += 1;
            failures.push(old, UnresolvedReason::ConflictingIdentity);
            continue;
        }

        outcome.replacements.push((group.ticker, rows));
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ResolvedIdentity;

    fn group(ticker: &str, cusips: &[&str]) -> TickerGroup {
        TickerGroup {
            ticker: CanonicalSymbol::normalize(ticker).expect("ticker"),
            holdings: cusips
                .iter()
                .map(|cusip| HeldIdentity::new(cusip, ticker, "Issuer").expect("row"))
                .collect(),
        }
    }

    fn replaced(symbol: &str) -> Resolution<TickerStatus> {
        Resolution::Resolved(TickerStatus::Replaced(ResolvedIdentity {
            provider_symbol: symbol.to_string(),
            ticker: CanonicalSymbol::normalize(symbol).expect("symbol"),
        }))
    }

    #[test]
    fn reduction_skips_cusips_already_mapped_elsewhere() {
        let active = BTreeMap::from([
            (String::from("30303M102"), String::from("FB")),
            (String::from("30303M201"), String::from("OTHER")),
        ]);
        let results = vec![
            StageResult {
                input: group("AAPL", &["037833100"]),
                resolution: Resolution::Resolved(TickerStatus::Active),
            },
            StageResult {
                input: group("FB", &["30303M102", "30303M201", "30303M300"]),
                resolution: replaced("META"),
            },
        ];
        let mut failures = FailurePreview::new(30);

        let outcome = reduce_refresh_results(results, &active, &mut failures);

        assert_eq!(outcome.unchanged, 1);
        assert_eq!(outcome.unresolved, 0);
        let (old, rows) = &outcome.replacements[0];
        assert_eq!(old.as_str(), "FB");
        let cusips: Vec<_> = rows.iter().map(|row| row.cusip.as_str()).collect();
        assert_eq!(cusips, vec!["30303M102", "30303M300"]);
        assert!(rows.iter().all(|row| row.ticker == "META"));
    }

    #[test]
    fn reduction_reports_conflicts_and_unresolved_tickers() {
        let active = BTreeMap::from([(String::from("30303M102"), String::from("OTHER"))]);
        let results = vec![
            StageResult {
                input: group("FB", &["30303M102"]),
                resolution: replaced("META"),
            },
            StageResult {
                input: group("ZZZ", &["000000001"]),
                resolution: Resolution::Unresolved(UnresolvedReason::ReplacementSameAsOld),
            },
        ];
        let mut failures = FailurePreview::new(30);

        let outcome = reduce_refresh_results(results, &active, &mut failures);

        assert_eq!(outcome.unresolved, 2);
        assert!(outcome.replacements.is_empty());
        assert_eq!(
            failures.lines,
            vec![
                String::from("FB: conflicting_active_identity"),
                String::from("ZZZ: replacement_same_as_old"),
            ]
        );
    }
}
