//! Behavior-driven tests for the maintenance jobs.
//!
//! These tests drive the stale-ticker refresh and the sector back-fill
//! against real DuckDB files and a scripted provider, focusing on which rows
//! end up active and what the summaries report.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use secmap_core::{
    EnrichConfig, EnrichmentStore, IdentityRow, LookupFuture, LookupProvider, Provenance,
    RequestGate, RetryPolicy, SearchMatch, SectorBackfillRun, SectorRow, SecurityDetail,
    TickerRefreshRun,
};
use secmap_warehouse::{
    FilingRecord, InstitutionRecord, PositionRecord, Warehouse, WarehouseConfig,
};
use tempfile::{tempdir, TempDir};

// =============================================================================
// Test doubles and fixtures
// =============================================================================

/// Provider answering from fixed tables and logging every quote and detail
/// lookup. Logs are returned sorted since stage items run concurrently.
#[derive(Default)]
struct ScriptedProvider {
    listings: BTreeMap<String, Vec<SearchMatch>>,
    trading: BTreeSet<String>,
    sectors: BTreeMap<String, String>,
    quote_checks: Mutex<Vec<String>>,
    detail_calls: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn listing(mut self, query: &str, symbols: &[&str]) -> Self {
        self.listings.insert(
            query.to_string(),
            symbols
                .iter()
                .map(|symbol| SearchMatch::equity(*symbol, Some("NMS")))
                .collect(),
        );
        self
    }

    fn trading(mut self, symbol: &str) -> Self {
        self.trading.insert(symbol.to_string());
        self
    }

    fn sector(mut self, symbol: &str, sector: &str) -> Self {
        self.sectors.insert(symbol.to_string(), sector.to_string());
        self
    }

    fn quote_checks(&self) -> Vec<String> {
        let mut checks = self.quote_checks.lock().expect("quote log").clone();
        checks.sort();
        checks
    }

    fn detail_calls(&self) -> Vec<String> {
        let mut calls = self.detail_calls.lock().expect("detail log").clone();
        calls.sort();
        calls
    }
}

impl LookupProvider for ScriptedProvider {
    fn search<'a>(&'a self, query: &'a str) -> LookupFuture<'a, Vec<SearchMatch>> {
        let matches = self.listings.get(query).cloned().unwrap_or_default();
        Box::pin(async move { Ok(matches) })
    }

    fn fetch_detail<'a>(
        &'a self,
        symbol: &'a str,
        _gate: &'a dyn RequestGate,
    ) -> LookupFuture<'a, SecurityDetail> {
        self.detail_calls
            .lock()
            .expect("detail log")
            .push(symbol.to_string());
        let detail = SecurityDetail {
            symbol: symbol.to_string(),
            sector: self.sectors.get(symbol).cloned(),
            industry: None,
        };
        Box::pin(async move { Ok(detail) })
    }

    fn has_active_quote<'a>(
        &'a self,
        symbol: &'a str,
        _gate: &'a dyn RequestGate,
    ) -> LookupFuture<'a, bool> {
        self.quote_checks
            .lock()
            .expect("quote log")
            .push(symbol.to_string());
        let active = self.trading.contains(symbol);
        Box::pin(async move { Ok(active) })
    }
}

fn open_warehouse(temp: &TempDir) -> Warehouse {
    Warehouse::open(WarehouseConfig {
        secmap_home: temp.path().to_path_buf(),
        db_path: temp.path().join("warehouse.duckdb"),
        max_pool_size: 2,
    })
    .expect("warehouse open")
}

/// One 13F-HR filing of `inst-1` with `(cusip, ticker, issuer)` positions.
fn filing(
    warehouse: &Warehouse,
    id: &str,
    report_period: &str,
    positions: &[(&str, Option<&str>, &str)],
) {
    warehouse
        .upsert_institution(&InstitutionRecord {
            id: String::from("inst-1"),
            institution_name: String::from("Alpha Capital"),
        })
        .expect("institution");
    warehouse
        .record_filing(&FilingRecord {
            id: id.to_string(),
            institution_id: String::from("inst-1"),
            filing_form_type: String::from("13F-HR"),
            report_period: report_period.to_string(),
            filing_date: report_period.to_string(),
            accession_number: format!("0000000000-00-{id}"),
        })
        .expect("filing");

    let rows: Vec<_> = positions
        .iter()
        .map(|(cusip, ticker, issuer)| PositionRecord {
            cusip: cusip.to_string(),
            ticker: ticker.map(str::to_owned),
            issuer_name: Some(issuer.to_string()),
            value_usd_thousands: 500.0,
            shares: 100.0,
        })
        .collect();
    warehouse.ingest_positions(id, &rows).expect("positions");
}

fn seed_identities(warehouse: &Warehouse, pairs: &[(&str, &str)]) {
    let rows: Vec<_> = pairs
        .iter()
        .map(|(cusip, ticker)| IdentityRow {
            cusip: cusip.to_string(),
            ticker: ticker.to_string(),
        })
        .collect();
    warehouse
        .apply_identity_batch(
            &rows,
            &Provenance::new("yahoo-search-cusip", "yahoo-search-cusip-v1", 0.90),
        )
        .expect("seed identities");
}

fn active_identities(warehouse: &Warehouse) -> BTreeMap<String, String> {
    EnrichmentStore::active_identities(warehouse).expect("identities")
}

fn fast_config() -> EnrichConfig {
    EnrichConfig {
        identity_retry: RetryPolicy::immediate(1),
        sector_retry: RetryPolicy::immediate(1),
        pacing_jitter: (Duration::ZERO, Duration::ZERO),
        ..EnrichConfig::default()
    }
}

fn held_meta_and_apple(temp: &TempDir) -> Warehouse {
    let warehouse = open_warehouse(temp);
    filing(
        &warehouse,
        "f-1",
        "2025-12-31",
        &[
            ("30303M102", None, "META PLATFORMS INC"),
            ("037833100", None, "APPLE INC"),
        ],
    );
    seed_identities(&warehouse, &[("30303M102", "FB"), ("037833100", "AAPL")]);
    warehouse
}

// =============================================================================
// Ticker Refresh
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_a_held_ticker_stopped_trading_its_cusip_moves_to_the_replacement() {
    // Given: FB no longer trades and the issuer name finds META, which does
    let temp = tempdir().expect("tempdir");
    let warehouse = held_meta_and_apple(&temp);
    let provider = ScriptedProvider::default()
        .trading("AAPL")
        .trading("META")
        .listing("META PLATFORMS INC", &["META"]);

    // When: The ticker refresh runs
    let summary = TickerRefreshRun::new(fast_config(), &warehouse, &provider)
        .execute()
        .await
        .expect("refresh");

    // Then: AAPL is left alone and the Meta CUSIP now maps to META
    assert_eq!(summary.tickers_checked, 2);
    assert_eq!(summary.unchanged, 1);
    assert_eq!(summary.upgraded, 1);
    assert_eq!(summary.unresolved, 0);
    assert_eq!((summary.deactivated, summary.inserted), (1, 1));
    let active = active_identities(&warehouse);
    assert_eq!(active["30303M102"], "META");
    assert_eq!(active["037833100"], "AAPL");
    assert_eq!(provider.quote_checks(), vec!["AAPL", "FB", "META"]);
}

#[tokio::test(start_paused = true)]
async fn when_a_target_ticker_is_set_only_it_is_checked_and_a_dry_run_writes_nothing() {
    // Given: A dead FB ticker alongside a live AAPL
    let temp = tempdir().expect("tempdir");
    let warehouse = held_meta_and_apple(&temp);
    let provider = ScriptedProvider::default()
        .trading("META")
        .listing("META PLATFORMS INC", &["META"]);
    let config = EnrichConfig {
        target_ticker: Some(String::from("FB")),
        dry_run: true,
        ..fast_config()
    };

    // When: A dry run targets FB
    let summary = TickerRefreshRun::new(config, &warehouse, &provider)
        .execute()
        .await
        .expect("refresh");

    // Then: The upgrade is counted but nothing is written, and AAPL is never checked
    assert_eq!(summary.target_ticker.as_deref(), Some("FB"));
    assert_eq!(summary.tickers_checked, 1);
    assert_eq!(summary.upgraded, 1);
    assert_eq!((summary.deactivated, summary.inserted), (0, 0));
    assert_eq!(active_identities(&warehouse)["30303M102"], "FB");
    assert!(!provider.quote_checks().contains(&String::from("AAPL")));
}

#[tokio::test(start_paused = true)]
async fn when_a_target_ticker_is_not_held_its_identity_rows_are_used_instead() {
    // Given: An identity for OLDCO that no filing holds
    let temp = tempdir().expect("tempdir");
    let warehouse = held_meta_and_apple(&temp);
    seed_identities(&warehouse, &[("999999999", "OLDCO")]);
    let provider = ScriptedProvider::default()
        .trading("NEWCO")
        .listing("OLDCO", &["NEWCO"]);
    let config = EnrichConfig {
        target_ticker: Some(String::from("oldco")),
        ..fast_config()
    };

    // When: The refresh targets OLDCO
    let summary = TickerRefreshRun::new(config, &warehouse, &provider)
        .execute()
        .await
        .expect("refresh");

    // Then: The identity row is found by ticker and repointed
    assert_eq!(summary.candidate_rows, 1);
    assert_eq!(summary.upgraded, 1);
    assert_eq!(active_identities(&warehouse)["999999999"], "NEWCO");
}

#[tokio::test(start_paused = true)]
async fn when_every_search_finds_the_old_ticker_again_nothing_changes() {
    // Given: FB is dead and the only match for Meta is FB itself
    let temp = tempdir().expect("tempdir");
    let warehouse = held_meta_and_apple(&temp);
    let provider = ScriptedProvider::default()
        .trading("AAPL")
        .listing("META PLATFORMS INC", &["FB"]);

    // When: The ticker refresh runs
    let summary = TickerRefreshRun::new(fast_config(), &warehouse, &provider)
        .execute()
        .await
        .expect("refresh");

    // Then: FB is reported and left in place
    assert_eq!(summary.unresolved, 1);
    assert_eq!(summary.upgraded, 0);
    assert_eq!(
        summary.failure_preview,
        vec![String::from("FB: replacement_same_as_old")]
    );
    assert_eq!(active_identities(&warehouse)["30303M102"], "FB");
}

#[tokio::test(start_paused = true)]
async fn when_no_query_finds_a_listing_the_ticker_is_unresolved() {
    // Given: FB is dead and no search returns anything
    let temp = tempdir().expect("tempdir");
    let warehouse = held_meta_and_apple(&temp);
    let provider = ScriptedProvider::default().trading("AAPL");

    // When: The ticker refresh runs
    let summary = TickerRefreshRun::new(fast_config(), &warehouse, &provider)
        .execute()
        .await
        .expect("refresh");

    // Then: Issuer name, old ticker and CUSIP were all tried without result
    assert_eq!(summary.unresolved, 1);
    assert_eq!(summary.failure_preview, vec![String::from("FB: unresolved")]);
}

#[tokio::test(start_paused = true)]
async fn when_no_match_trades_the_first_acceptable_match_is_taken() {
    // Given: Neither candidate replacement has recent prices
    let temp = tempdir().expect("tempdir");
    let warehouse = held_meta_and_apple(&temp);
    let provider = ScriptedProvider::default()
        .trading("AAPL")
        .listing("META PLATFORMS INC", &["METAX", "METAY"]);

    // When: The ticker refresh runs
    let summary = TickerRefreshRun::new(fast_config(), &warehouse, &provider)
        .execute()
        .await
        .expect("refresh");

    // Then: The first listed equity wins after both were checked
    assert_eq!(summary.upgraded, 1);
    assert_eq!(active_identities(&warehouse)["30303M102"], "METAX");
    assert_eq!(provider.quote_checks(), vec!["AAPL", "FB", "METAX", "METAY"]);
}

// =============================================================================
// Sector Back-fill
// =============================================================================

fn warehouse_with_three_periods(temp: &TempDir) -> Warehouse {
    let warehouse = open_warehouse(temp);
    filing(
        &warehouse,
        "f-q2",
        "2025-06-30",
        &[("111111111", Some("OLDX"), "OLD HOLDING CO")],
    );
    filing(
        &warehouse,
        "f-q3",
        "2025-09-30",
        &[("594918104", Some("msft"), "MICROSOFT CORP")],
    );
    filing(
        &warehouse,
        "f-q4",
        "2025-12-31",
        &[
            ("037833100", None, "APPLE INC"),
            ("084670702", Some("BRK.B"), "BERKSHIRE HATHAWAY INC"),
            ("38259P508", Some("GOOGL"), "ALPHABET INC"),
            ("000000009", None, "UNKNOWN CO"),
        ],
    );
    seed_identities(&warehouse, &[("037833100", "AAPL")]);
    warehouse
        .apply_sector_batch(
            &[SectorRow {
                ticker: String::from("GOOGL"),
                cusip: Some(String::from("38259P508")),
                sector_code: String::from("50"),
                sector_label: String::from("Communication Services"),
            }],
            &Provenance::new("yfinance", "yfinance-info-v1", 0.90),
        )
        .expect("seed sector");
    warehouse
}

#[tokio::test(start_paused = true)]
async fn when_recent_holdings_lack_a_sector_they_are_classified_and_written() {
    // Given: Holdings over three report periods, GOOGL already mapped
    let temp = tempdir().expect("tempdir");
    let warehouse = warehouse_with_three_periods(&temp);
    let provider = ScriptedProvider::default()
        .sector("AAPL", "Technology")
        .sector("MSFT", "Technology")
        .sector("BRK-B", "Financial Services");

    // When: The back-fill runs over the latest two periods
    let summary = SectorBackfillRun::new(fast_config(), &warehouse, &provider)
        .execute()
        .await
        .expect("back-fill");

    // Then: Only unmapped recent holdings were looked up, AAPL through its identity
    assert_eq!(provider.detail_calls(), vec!["AAPL", "BRK-B", "MSFT"]);
    assert_eq!(summary.holdings, 5);
    assert_eq!(summary.unmapped, 4);
    assert_eq!(summary.unresolved_no_ticker, 1);
    assert_eq!(summary.unresolved_sector, 0);
    assert_eq!(summary.inserted, 3);

    let sectors: BTreeMap<_, _> = warehouse
        .active_sectors()
        .expect("sectors")
        .into_iter()
        .map(|row| (row.ticker.clone(), row))
        .collect();
    assert_eq!(sectors["AAPL"].cusip.as_deref(), Some("037833100"));
    assert_eq!(sectors["BRK.B"].sector_code, "40");
    assert_eq!(sectors["MSFT"].sector_label, "Information Technology");
    assert_eq!(sectors["GOOGL"].sector_code, "50");
    assert!(!sectors.contains_key("OLDX"));
}

#[tokio::test(start_paused = true)]
async fn when_the_back_fill_runs_again_nothing_is_left_to_classify() {
    // Given: A completed back-fill
    let temp = tempdir().expect("tempdir");
    let warehouse = warehouse_with_three_periods(&temp);
    let provider = ScriptedProvider::default()
        .sector("AAPL", "Technology")
        .sector("MSFT", "Technology")
        .sector("BRK-B", "Financial Services");
    SectorBackfillRun::new(fast_config(), &warehouse, &provider)
        .execute()
        .await
        .expect("first back-fill");

    // When: It runs a second time
    let summary = SectorBackfillRun::new(fast_config(), &warehouse, &provider)
        .execute()
        .await
        .expect("second back-fill");

    // Then: Only the holding without any ticker remains, and no request is made
    assert_eq!(summary.unmapped, 1);
    assert_eq!(summary.unresolved_no_ticker, 1);
    assert_eq!(summary.tickers_classified, 0);
    assert_eq!(summary.requests.requests_total, 0);
    assert_eq!(summary.inserted, 0);
}

#[tokio::test(start_paused = true)]
async fn when_a_sector_is_unknown_the_holding_is_counted_and_nothing_is_written() {
    // Given: The provider knows no sector for any symbol
    let temp = tempdir().expect("tempdir");
    let warehouse = warehouse_with_three_periods(&temp);
    let provider = ScriptedProvider::default();
    let config = EnrichConfig {
        report_periods: 1,
        ..fast_config()
    };

    // When: The back-fill looks at the latest period only
    let summary = SectorBackfillRun::new(config, &warehouse, &provider)
        .execute()
        .await
        .expect("back-fill");

    // Then: MSFT from the older period is out of scope, the rest stay unmapped
    assert_eq!(provider.detail_calls(), vec!["AAPL", "BRK-B"]);
    assert_eq!(summary.unresolved_sector, 2);
    assert_eq!(summary.inserted, 0);
    assert_eq!(warehouse.active_sectors().expect("sectors").len(), 1);
}
