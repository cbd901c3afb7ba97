//! Behavior-driven tests for the security map warehouse.
//!
//! These tests verify HOW candidates are selected from holdings filings and
//! how identity and sector changes are applied, against real DuckDB files.

use std::collections::BTreeMap;
use std::time::Duration;

use secmap_core::{
    EnrichConfig, EnrichmentRun, EnrichmentStore, IdentityRow, LookupFuture, LookupProvider,
    Provenance, RequestGate, RetryPolicy, SearchMatch, SectorRow, SecurityDetail,
};
use secmap_warehouse::{
    FilingRecord, InstitutionRecord, PositionRecord, Warehouse, WarehouseConfig,
};
use tempfile::{tempdir, TempDir};

fn open_warehouse(temp: &TempDir) -> Warehouse {
    Warehouse::open(WarehouseConfig {
        secmap_home: temp.path().to_path_buf(),
        db_path: temp.path().join("warehouse.duckdb"),
        max_pool_size: 2,
    })
    .expect("warehouse open")
}

fn institution(warehouse: &Warehouse, id: &str, name: &str) {
    warehouse
        .upsert_institution(&InstitutionRecord {
            id: id.to_string(),
            institution_name: name.to_string(),
        })
        .expect("institution");
}

fn filing(
    warehouse: &Warehouse,
    id: &str,
    institution_id: &str,
    form_type: &str,
    report_period: &str,
    positions: &[(&str, &str, f64)],
) {
    warehouse
        .record_filing(&FilingRecord {
            id: id.to_string(),
            institution_id: institution_id.to_string(),
            filing_form_type: form_type.to_string(),
            report_period: report_period.to_string(),
            filing_date: report_period.to_string(),
            accession_number: format!("0000000000-00-{id}"),
        })
        .expect("filing");

    let rows: Vec<_> = positions
        .iter()
        .map(|(cusip, issuer, value)| PositionRecord {
            cusip: cusip.to_string(),
            ticker: None,
            issuer_name: Some(issuer.to_string()),
            value_usd_thousands: *value,
            shares: 100.0,
        })
        .collect();
    warehouse.ingest_positions(id, &rows).expect("positions");
}

fn cusips(warehouse: &Warehouse, top: usize) -> Vec<String> {
    warehouse
        .candidates(top)
        .expect("candidates")
        .into_iter()
        .map(|candidate| candidate.cusip)
        .collect()
}

fn provenance() -> Provenance {
    Provenance::new("yahoo-search-cusip", "yahoo-search-cusip-v1", 0.90)
}

// =============================================================================
// Warehouse: Candidate Selection
// =============================================================================

#[test]
fn when_an_institution_has_several_filings_only_its_latest_13f_feeds_candidates() {
    // Given: An older and a newer holdings report plus a notice filing
    let temp = tempdir().expect("tempdir");
    let warehouse = open_warehouse(&temp);
    institution(&warehouse, "inst-1", "Alpha Capital");
    filing(
        &warehouse,
        "f-old",
        "inst-1",
        "13F-HR",
        "2025-09-30",
        &[("38259P508", "GOOGLE INC", 500.0)],
    );
    filing(
        &warehouse,
        "f-new",
        "inst-1",
        "13F-HR/A",
        "2025-12-31",
        &[
            ("594918104", "MICROSOFT CORP", 900.0),
            ("037833100", "APPLE INC", 800.0),
        ],
    );
    filing(
        &warehouse,
        "f-nt",
        "inst-1",
        "13F-NT",
        "2026-03-31",
        &[("88160R101", "TESLA INC", 700.0)],
    );

    // When: Candidates are selected
    let selected = cusips(&warehouse, 50);

    // Then: Only the latest holdings report counts, ordered by CUSIP
    assert_eq!(selected, vec!["037833100", "594918104"]);
}

#[test]
fn when_the_institution_limit_is_small_the_largest_holders_win() {
    // Given: A large and a small institution holding different securities
    let temp = tempdir().expect("tempdir");
    let warehouse = open_warehouse(&temp);
    institution(&warehouse, "big", "Big Fund");
    institution(&warehouse, "small", "Small Fund");
    filing(
        &warehouse,
        "f-big",
        "big",
        "13F-HR",
        "2025-12-31",
        &[("037833100", "APPLE INC", 10_000.0)],
    );
    filing(
        &warehouse,
        "f-small",
        "small",
        "13F-HR",
        "2025-12-31",
        &[("30303M102", "META PLATFORMS", 10.0)],
    );

    // When: Only the top institution is considered
    let selected = cusips(&warehouse, 1);

    // Then: Only its holdings are candidates
    assert_eq!(selected, vec!["037833100"]);
    assert_eq!(cusips(&warehouse, 2).len(), 2);
}

#[test]
fn when_positions_carry_malformed_cusips_they_are_skipped_and_the_rest_uppercased() {
    // Given: Positions with short, punctuated and lowercase CUSIPs
    let temp = tempdir().expect("tempdir");
    let warehouse = open_warehouse(&temp);
    institution(&warehouse, "inst-1", "Alpha Capital");
    filing(
        &warehouse,
        "f-1",
        "inst-1",
        "13F-HR",
        "2025-12-31",
        &[
            ("ABC", "TOO SHORT", 1.0),
            ("0378-3310", "PUNCTUATED", 1.0),
            ("g5960l103", "MEDTRONIC PLC", 1.0),
        ],
    );

    // When: Candidates are selected
    let candidates = warehouse.candidates(50).expect("candidates");

    // Then: Only the well-formed CUSIP survives, uppercased with its issuer
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].cusip, "G5960L103");
    assert_eq!(candidates[0].issuer_name, "MEDTRONIC PLC");
}

// =============================================================================
// Warehouse: Conditional Upserts
// =============================================================================

#[test]
fn when_a_ticker_changes_the_old_mapping_is_retired_not_deleted() {
    // Given: A store mapping a CUSIP to its old ticker
    let temp = tempdir().expect("tempdir");
    let warehouse = open_warehouse(&temp);
    let store: &dyn EnrichmentStore = &warehouse;
    store
        .apply_identity_batch(
            &[IdentityRow {
                cusip: String::from("30303M102"),
                ticker: String::from("FB"),
            }],
            &provenance(),
        )
        .expect("seed");

    // When: The new ticker is applied twice
    let rows = [IdentityRow {
        cusip: String::from("30303M102"),
        ticker: String::from("META"),
    }];
    let first = store
        .apply_identity_batch(&rows, &provenance())
        .expect("first apply");
    let second = store
        .apply_identity_batch(&rows, &provenance())
        .expect("second apply");

    // Then: One row is retired and one inserted, and the repeat changes nothing
    assert_eq!((first.deactivated, first.inserted), (1, 1));
    assert_eq!((second.deactivated, second.inserted), (0, 0));
    let active = store.active_identities().expect("active");
    assert_eq!(active.get("30303M102").map(String::as_str), Some("META"));
}

#[test]
fn when_a_sector_label_changes_the_new_assignment_replaces_the_old_one() {
    // Given: A ticker assigned to one sector
    let temp = tempdir().expect("tempdir");
    let warehouse = open_warehouse(&temp);
    let store: &dyn EnrichmentStore = &warehouse;
    let sector = |code: &str, label: &str| SectorRow {
        ticker: String::from("GOOGL"),
        cusip: Some(String::from("02079K305")),
        sector_code: code.to_string(),
        sector_label: label.to_string(),
    };
    store
        .apply_sector_batch(&[sector("45", "Information Technology")], &provenance())
        .expect("seed");

    // When: A different sector is applied
    let counts = store
        .apply_sector_batch(&[sector("50", "Communication Services")], &provenance())
        .expect("apply");

    // Then: The active assignment is the new one
    assert_eq!((counts.deactivated, counts.inserted), (1, 1));
    let active = store.active_sectors().expect("active");
    assert_eq!(active["GOOGL"].sector_code, "50");
    assert_eq!(active["GOOGL"].sector_label, "Communication Services");
}

// =============================================================================
// Warehouse: Full Refresh
// =============================================================================

struct FixedProvider {
    symbols: BTreeMap<&'static str, &'static str>,
}

impl LookupProvider for FixedProvider {
    fn search<'a>(&'a self, query: &'a str) -> LookupFuture<'a, Vec<SearchMatch>> {
        let matches = self
            .symbols
            .get(query)
            .map(|symbol| vec![SearchMatch::equity(*symbol, Some("NMS"))])
            .unwrap_or_default();
        Box::pin(async move { Ok(matches) })
    }

    fn fetch_detail<'a>(
        &'a self,
        symbol: &'a str,
        _gate: &'a dyn RequestGate,
    ) -> LookupFuture<'a, SecurityDetail> {
        let detail = SecurityDetail {
            symbol: symbol.to_string(),
            sector: Some(String::from("Technology")),
            industry: None,
        };
        Box::pin(async move { Ok(detail) })
    }

    fn has_active_quote<'a>(
        &'a self,
        _symbol: &'a str,
        _gate: &'a dyn RequestGate,
    ) -> LookupFuture<'a, bool> {
        Box::pin(async { Ok(true) })
    }
}

#[tokio::test(start_paused = true)]
async fn when_a_refresh_runs_twice_against_the_warehouse_the_second_is_a_no_op() {
    // Given: A warehouse with one institution holding two securities
    let temp = tempdir().expect("tempdir");
    let warehouse = open_warehouse(&temp);
    institution(&warehouse, "inst-1", "Alpha Capital");
    filing(
        &warehouse,
        "f-1",
        "inst-1",
        "13F-HR",
        "2025-12-31",
        &[
            ("037833100", "APPLE INC", 800.0),
            ("594918104", "MICROSOFT CORP", 900.0),
        ],
    );
    let provider = FixedProvider {
        symbols: BTreeMap::from([("037833100", "AAPL"), ("594918104", "MSFT")]),
    };
    let config = EnrichConfig {
        identity_retry: RetryPolicy::immediate(1),
        sector_retry: RetryPolicy::immediate(1),
        pacing_jitter: (Duration::ZERO, Duration::ZERO),
        ..EnrichConfig::default()
    };

    // When: The refresh runs twice
    let first = EnrichmentRun::new(config.clone(), &warehouse, &provider)
        .execute()
        .await
        .expect("first run");
    let second = EnrichmentRun::new(config, &warehouse, &provider)
        .execute()
        .await
        .expect("second run");

    // Then: The first run inserts, the second finds everything current
    assert_eq!(first.identity.inserted, 2);
    assert_eq!(first.sector.inserted, 2);
    assert_eq!(second.identity.unchanged, 2);
    assert_eq!(second.sector.unchanged, 2);
    assert_eq!(second.identity.inserted + second.sector.inserted, 0);

    let sectors = warehouse.active_sectors().expect("sectors");
    assert!(sectors
        .iter()
        .all(|row| row.sector_code == "45" && row.cusip.is_some()));
}
