//! # Secmap Warehouse
//!
//! DuckDB-based store for the security identity and sector maps.
//!
//! ## Overview
//!
//! The warehouse holds the 13F holdings that select which CUSIPs get
//! enriched, and the two slowly-changing maps the enrichment job maintains:
//!
//! - **Parameterized SQL**: every incoming value is bound, never interpolated
//! - **Connection pooling**: pooled handles share one database instance
//! - **Conditional upserts**: each batch is one transaction that soft-retires
//!   conflicting active rows and inserts only rows that changed
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use secmap_warehouse::{IdentityRow, Provenance, Warehouse};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let warehouse = Warehouse::open_default()?;
//!
//!     let rows = vec![IdentityRow {
//!         cusip: "037833100".to_string(),
//!         ticker: "AAPL".to_string(),
//!     }];
//!     let provenance = Provenance::new("yahoo-search-cusip", "yahoo-search-cusip-v1", 0.90);
//!     let counts = warehouse.apply_identity_batch(&rows, &provenance)?;
//!     println!("deactivated={} inserted={}", counts.deactivated, counts.inserted);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Tables
//!
//! | Table | Description |
//! |-------|-------------|
//! | `institutions` | 13F filers |
//! | `filings` | Filing headers (form type, report period) |
//! | `positions` | Holding lines per filing |
//! | `security_identity_map` | CUSIP → ticker, soft-retired history |
//! | `security_sector_map` | Ticker → GICS sector, soft-retired history |

pub mod duckdb;
pub mod migrations;
pub mod models;

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ::duckdb::{params, Connection, ToSql};
use thiserror::Error;

pub use self::duckdb::{DuckDbConnectionManager, PooledConnection};
pub use models::{
    ApplyCounts, CandidateRecord, FilingRecord, HeldIdentityRecord, HoldingKeyRecord, IdentityRow,
    InstitutionRecord, PositionRecord, Provenance, SectorRow,
};

/// Errors that can occur during warehouse operations.
#[derive(Debug, Error)]
pub enum WarehouseError {
    /// `DuckDB` database error.
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    /// I/O error (file system operations).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A row was rejected before reaching the database.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Configuration for the warehouse database.
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    /// Root directory for secmap data.
    pub secmap_home: PathBuf,
    /// Path to the `DuckDB` database file.
    pub db_path: PathBuf,
    /// Maximum number of idle connections in the pool.
    pub max_pool_size: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        let secmap_home = resolve_secmap_home();
        let db_path = secmap_home.join("warehouse.duckdb");
        Self {
            secmap_home,
            db_path,
            max_pool_size: 4,
        }
    }
}

impl WarehouseConfig {
    /// Configuration rooted at an explicit database file.
    pub fn at(db_path: impl Into<PathBuf>) -> Self {
        let db_path = db_path.into();
        let secmap_home = db_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            secmap_home,
            db_path,
            max_pool_size: 4,
        }
    }
}

/// Latest canonical 13F filing per institution, its holdings by CUSIP, and
/// institutions ranked by total positive holding value.
macro_rules! latest_holdings_cte {
    () => {
        r#"
WITH canonical_latest AS (
    SELECT
        f.institution_id,
        f.id AS filing_id,
        row_number() OVER (
            PARTITION BY f.institution_id
            ORDER BY f.report_period DESC, f.filing_date DESC, f.accession_number DESC
        ) AS rn
    FROM filings f
    WHERE f.filing_form_type IN ('13F-HR', '13F-HR/A')
), latest_holdings AS (
    SELECT
        cl.institution_id,
        upper(trim(p.cusip)) AS cusip,
        max(p.issuer_name) AS issuer_name,
        sum(CASE WHEN p.value_usd_thousands > 0 AND p.shares > 0
                 THEN p.value_usd_thousands ELSE 0 END) AS value_usd_thousands
    FROM canonical_latest cl
    JOIN positions p ON p.filing_id = cl.filing_id
    WHERE cl.rn = 1
      AND regexp_full_match(trim(p.cusip), '[A-Za-z0-9]{8,9}')
    GROUP BY cl.institution_id, upper(trim(p.cusip))
), ranked_institutions AS (
    SELECT
        i.id AS institution_id,
        row_number() OVER (
            ORDER BY sum(lh.value_usd_thousands) DESC, i.institution_name ASC, i.id ASC
        ) AS canonical_rank
    FROM institutions i
    JOIN latest_holdings lh ON lh.institution_id = i.id
    GROUP BY i.id, i.institution_name
)
"#
    };
}

const CANDIDATES_SQL: &str = concat!(
    latest_holdings_cte!(),
    r#"
SELECT lh.cusip, coalesce(max(lh.issuer_name), '') AS issuer_name
FROM latest_holdings lh
JOIN ranked_institutions r ON r.institution_id = lh.institution_id
WHERE r.canonical_rank <= ?
GROUP BY lh.cusip
ORDER BY lh.cusip
"#
);

const HELD_IDENTITIES_SQL: &str = concat!(
    latest_holdings_cte!(),
    r#"
SELECT lh.cusip, upper(trim(s.ticker)) AS ticker, coalesce(max(lh.issuer_name), '') AS issuer_name
FROM latest_holdings lh
JOIN ranked_institutions r ON r.institution_id = lh.institution_id
JOIN security_identity_map s ON s.cusip = lh.cusip AND s.is_active
WHERE r.canonical_rank <= ?
  AND regexp_full_match(trim(s.ticker), '[A-Za-z.]{1,10}')
GROUP BY lh.cusip, upper(trim(s.ticker))
ORDER BY 2, 1
"#
);

const RECENT_HOLDINGS_SQL: &str = r#"
WITH target_periods AS (
    SELECT report_period
    FROM filings
    WHERE filing_form_type IN ('13F-HR', '13F-HR/A')
    GROUP BY report_period
    ORDER BY report_period DESC
    LIMIT ?
)
SELECT upper(trim(p.ticker)) AS ticker, upper(trim(p.cusip)) AS cusip
FROM positions p
JOIN filings f ON f.id = p.filing_id
WHERE (p.ticker IS NOT NULL OR p.cusip IS NOT NULL)
  AND f.report_period IN (SELECT report_period FROM target_periods)
GROUP BY 1, 2
ORDER BY 1, 2
"#;

/// The main warehouse interface.
#[derive(Clone)]
pub struct Warehouse {
    manager: DuckDbConnectionManager,
}

impl Warehouse {
    /// Open a warehouse with default configuration.
    pub fn open_default() -> Result<Self, WarehouseError> {
        Self::open(WarehouseConfig::default())
    }

    /// Open a warehouse with the specified configuration.
    pub fn open(config: WarehouseConfig) -> Result<Self, WarehouseError> {
        fs::create_dir_all(&config.secmap_home)?;
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let manager = DuckDbConnectionManager::open(config.db_path, config.max_pool_size)?;
        let warehouse = Self { manager };
        warehouse.initialize()?;
        Ok(warehouse)
    }

    /// Initialize database schema.
    pub fn initialize(&self) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire()?;
        migrations::apply_migrations(&connection)?;
        Ok(())
    }

    /// Get the path to the database file.
    pub fn db_path(&self) -> &Path {
        self.manager.db_path()
    }

    /// Insert or rename an institution.
    pub fn upsert_institution(&self, record: &InstitutionRecord) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire()?;
        connection.execute(
            "INSERT OR REPLACE INTO institutions (id, institution_name, updated_at) \
             VALUES (?, ?, CURRENT_TIMESTAMP)",
            params![record.id, record.institution_name],
        )?;
        Ok(())
    }

    /// Insert or replace a filing header.
    pub fn record_filing(&self, record: &FilingRecord) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire()?;
        let params: [&dyn ToSql; 6] = [
            &record.id,
            &record.institution_id,
            &record.filing_form_type,
            &record.report_period,
            &record.filing_date,
            &record.accession_number,
        ];
        connection.execute(
            "INSERT OR REPLACE INTO filings \
             (id, institution_id, filing_form_type, report_period, filing_date, accession_number, updated_at) \
             VALUES (?, ?, ?, TRY_CAST(? AS DATE), TRY_CAST(? AS DATE), ?, CURRENT_TIMESTAMP)",
            params.as_slice(),
        )?;
        Ok(())
    }

    /// Append holding lines to a filing in one transaction.
    pub fn ingest_positions(
        &self,
        filing_id: &str,
        rows: &[PositionRecord],
    ) -> Result<(), WarehouseError> {
        if rows.is_empty() {
            return Ok(());
        }

        let connection = self.manager.acquire()?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<(), WarehouseError> {
            for row in rows {
                let params: [&dyn ToSql; 6] = [
                    &filing_id,
                    &row.cusip,
                    &row.ticker,
                    &row.issuer_name,
                    &row.value_usd_thousands,
                    &row.shares,
                ];
                connection.execute(
                    "INSERT INTO positions \
                     (filing_id, cusip, ticker, issuer_name, value_usd_thousands, shares) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                    params.as_slice(),
                )?;
            }
            Ok(())
        })();

        finalize_transaction(&connection, result)
    }

    /// Distinct CUSIPs held in the latest 13F filing of the top institutions,
    /// ranked by total positive holding value. Ordered by CUSIP.
    pub fn candidates(
        &self,
        top_institutions: usize,
    ) -> Result<Vec<CandidateRecord>, WarehouseError> {
        let top = i64::try_from(top_institutions).unwrap_or(i64::MAX);
        let connection = self.manager.acquire()?;
        let mut statement = connection.prepare(CANDIDATES_SQL)?;
        let rows = statement.query_map(params![top], |row| {
            Ok(CandidateRecord {
                cusip: row.get(0)?,
                issuer_name: row.get(1)?,
            })
        })?;

        let mut candidates = Vec::new();
        for row in rows {
            let row = row?;
            if !row.cusip.is_empty() {
                candidates.push(CandidateRecord {
                    cusip: row.cusip,
                    issuer_name: row.issuer_name.trim().to_owned(),
                });
            }
        }
        Ok(candidates)
    }

    /// Active identities of the CUSIPs the top institutions hold in their
    /// latest filing, restricted to plain alphabetic tickers. Ordered by ticker.
    pub fn held_identities(
        &self,
        top_institutions: usize,
    ) -> Result<Vec<HeldIdentityRecord>, WarehouseError> {
        let top = i64::try_from(top_institutions).unwrap_or(i64::MAX);
        let connection = self.manager.acquire()?;
        let mut statement = connection.prepare(HELD_IDENTITIES_SQL)?;
        let rows = statement.query_map(params![top], |row| {
            Ok(HeldIdentityRecord {
                cusip: row.get(0)?,
                ticker: row.get(1)?,
                issuer_name: row.get(2)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(WarehouseError::from)
    }

    /// Every active identity mapped to `ticker`, with the issuer name the
    /// CUSIP was filed under (or the ticker when it never was).
    pub fn identities_for_ticker(
        &self,
        ticker: &str,
    ) -> Result<Vec<HeldIdentityRecord>, WarehouseError> {
        let connection = self.manager.acquire()?;
        let mut statement = connection.prepare(
            "SELECT s.cusip, upper(trim(s.ticker)), coalesce(max(p.issuer_name), s.ticker) \
             FROM security_identity_map s \
             LEFT JOIN positions p ON upper(trim(p.cusip)) = s.cusip \
             WHERE s.is_active AND upper(trim(s.ticker)) = upper(trim(?)) \
             GROUP BY s.cusip, s.ticker \
             ORDER BY s.cusip",
        )?;
        let rows = statement.query_map(params![ticker], |row| {
            Ok(HeldIdentityRecord {
                cusip: row.get(0)?,
                ticker: row.get(1)?,
                issuer_name: row.get(2)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(WarehouseError::from)
    }

    /// Distinct ticker and CUSIP pairs reported in the latest
    /// `report_periods` 13F report periods.
    pub fn recent_holdings(
        &self,
        report_periods: usize,
    ) -> Result<Vec<HoldingKeyRecord>, WarehouseError> {
        let periods = i64::try_from(report_periods).unwrap_or(i64::MAX);
        let connection = self.manager.acquire()?;
        let mut statement = connection.prepare(RECENT_HOLDINGS_SQL)?;
        let rows = statement.query_map(params![periods], |row| {
            Ok(HoldingKeyRecord {
                ticker: row.get(0)?,
                cusip: row.get(1)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(WarehouseError::from)
    }

    /// Currently active CUSIP → ticker rows, both uppercased.
    pub fn active_identities(&self) -> Result<Vec<IdentityRow>, WarehouseError> {
        let connection = self.manager.acquire()?;
        let mut statement = connection.prepare(
            "SELECT upper(trim(cusip)), upper(trim(ticker)) \
             FROM security_identity_map WHERE is_active ORDER BY 1",
        )?;
        let rows = statement.query_map([], |row| {
            Ok(IdentityRow {
                cusip: row.get(0)?,
                ticker: row.get(1)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(WarehouseError::from)
    }

    /// Currently active ticker → sector rows.
    pub fn active_sectors(&self) -> Result<Vec<SectorRow>, WarehouseError> {
        let connection = self.manager.acquire()?;
        let mut statement = connection.prepare(
            "SELECT ticker, cusip, sector_code, sector_label \
             FROM security_sector_map WHERE is_active ORDER BY ticker",
        )?;
        let rows = statement.query_map([], |row| {
            Ok(SectorRow {
                ticker: row.get(0)?,
                cusip: row.get(1)?,
                sector_code: row.get(2)?,
                sector_label: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(WarehouseError::from)
    }

    /// Apply one identity batch as a single conditional upsert.
    ///
    /// Active rows whose CUSIP appears in the batch with a different ticker are
    /// retired; a new active row is inserted for every incoming pair that has
    /// no identical active row. Re-applying the same batch returns `(0, 0)`.
    pub fn apply_identity_batch(
        &self,
        rows: &[IdentityRow],
        provenance: &Provenance,
    ) -> Result<ApplyCounts, WarehouseError> {
        let mut incoming = BTreeMap::new();
        for row in rows {
            if row.cusip.is_empty() || row.ticker.is_empty() {
                return Err(WarehouseError::InvalidData(format!(
                    "identity row must carry cusip and ticker: {row:?}"
                )));
            }
            incoming.insert(row.cusip.as_str(), row.ticker.as_str());
        }
        if incoming.is_empty() {
            return Ok(ApplyCounts::default());
        }

        let connection = self.manager.acquire()?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<ApplyCounts, WarehouseError> {
            connection.execute_batch(
                "CREATE OR REPLACE TEMP TABLE incoming_identity (cusip TEXT NOT NULL, ticker TEXT NOT NULL)",
            )?;
            for (cusip, ticker) in &incoming {
                connection.execute(
                    "INSERT INTO incoming_identity (cusip, ticker) VALUES (?, ?)",
                    params![cusip, ticker],
                )?;
            }

            let deactivated = connection.execute(
                "UPDATE security_identity_map \
                 SET is_active = FALSE, effective_to = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP \
                 FROM incoming_identity \
                 WHERE security_identity_map.is_active \
                   AND incoming_identity.cusip = security_identity_map.cusip \
                   AND incoming_identity.ticker <> security_identity_map.ticker",
                [],
            )?;

            let params: [&dyn ToSql; 3] = [
                &provenance.source,
                &provenance.source_version,
                &provenance.confidence,
            ];
            let inserted = connection.execute(
                "INSERT INTO security_identity_map \
                 (cusip, ticker, source, source_version, confidence, effective_from, is_active, updated_at) \
                 SELECT i.cusip, i.ticker, ?, ?, ?, CURRENT_TIMESTAMP, TRUE, CURRENT_TIMESTAMP \
                 FROM incoming_identity i \
                 WHERE NOT EXISTS ( \
                     SELECT 1 FROM security_identity_map s \
                     WHERE s.is_active AND s.cusip = i.cusip AND s.ticker = i.ticker \
                 )",
                params.as_slice(),
            )?;

            connection.execute_batch("DROP TABLE incoming_identity")?;
            Ok(ApplyCounts::new(deactivated, inserted))
        })();

        finalize_transaction(&connection, result)
    }

    /// Point a CUSIP at a new ticker in one transaction: every active row for
    /// the CUSIP is retired and a new active row is inserted, even when the
    /// ticker is unchanged.
    pub fn replace_active_identity(
        &self,
        row: &IdentityRow,
        provenance: &Provenance,
    ) -> Result<ApplyCounts, WarehouseError> {
        if row.cusip.is_empty() || row.ticker.is_empty() {
            return Err(WarehouseError::InvalidData(format!(
                "identity row must carry cusip and ticker: {row:?}"
            )));
        }

        let connection = self.manager.acquire()?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<ApplyCounts, WarehouseError> {
            let deactivated = connection.execute(
                "UPDATE security_identity_map \
                 SET is_active = FALSE, effective_to = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP \
                 WHERE cusip = ? AND is_active",
                params![row.cusip],
            )?;

            let params: [&dyn ToSql; 5] = [
                &row.cusip,
                &row.ticker,
                &provenance.source,
                &provenance.source_version,
                &provenance.confidence,
            ];
            let inserted = connection.execute(
                "INSERT INTO security_identity_map \
                 (cusip, ticker, source, source_version, confidence, effective_from, is_active, updated_at) \
                 VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP, TRUE, CURRENT_TIMESTAMP)",
                params.as_slice(),
            )?;

            Ok(ApplyCounts::new(deactivated, inserted))
        })();

        finalize_transaction(&connection, result)
    }

    /// Apply one sector batch as a single conditional upsert.
    ///
    /// Active rows for a ticker whose code or label differs from the incoming
    /// row are retired; tickers left without an active row get a new one.
    pub fn apply_sector_batch(
        &self,
        rows: &[SectorRow],
        provenance: &Provenance,
    ) -> Result<ApplyCounts, WarehouseError> {
        let mut incoming = BTreeMap::new();
        for row in rows {
            if row.ticker.is_empty() || row.sector_code.is_empty() || row.sector_label.is_empty() {
                return Err(WarehouseError::InvalidData(format!(
                    "sector row must carry ticker, code and label: {row:?}"
                )));
            }
            incoming.insert(row.ticker.as_str(), row);
        }
        if incoming.is_empty() {
            return Ok(ApplyCounts::default());
        }

        let connection = self.manager.acquire()?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<ApplyCounts, WarehouseError> {
            connection.execute_batch(
                "CREATE OR REPLACE TEMP TABLE incoming_sector (\
                 ticker TEXT NOT NULL, cusip TEXT, sector_code TEXT NOT NULL, sector_label TEXT NOT NULL)",
            )?;
            for row in incoming.values() {
                let params: [&dyn ToSql; 4] =
                    [&row.ticker, &row.cusip, &row.sector_code, &row.sector_label];
                connection.execute(
                    "INSERT INTO incoming_sector (ticker, cusip, sector_code, sector_label) \
                     VALUES (?, ?, ?, ?)",
                    params.as_slice(),
                )?;
            }

            let deactivated = connection.execute(
                "UPDATE security_sector_map \
                 SET is_active = FALSE, effective_to = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP \
                 FROM incoming_sector \
                 WHERE security_sector_map.is_active \
                   AND incoming_sector.ticker = security_sector_map.ticker \
                   AND (incoming_sector.sector_code <> security_sector_map.sector_code \
                        OR incoming_sector.sector_label <> security_sector_map.sector_label)",
                [],
            )?;

            let params: [&dyn ToSql; 3] = [
                &provenance.source,
                &provenance.source_version,
                &provenance.confidence,
            ];
            let inserted = connection.execute(
                "INSERT INTO security_sector_map \
                 (ticker, cusip, sector_code, sector_label, source, source_version, confidence, \
                  effective_from, is_active, updated_at) \
                 SELECT i.ticker, i.cusip, i.sector_code, i.sector_label, ?, ?, ?, \
                        CURRENT_TIMESTAMP, TRUE, CURRENT_TIMESTAMP \
                 FROM incoming_sector i \
                 WHERE NOT EXISTS ( \
                     SELECT 1 FROM security_sector_map s \
                     WHERE s.is_active AND s.ticker = i.ticker \
                 )",
                params.as_slice(),
            )?;

            connection.execute_batch("DROP TABLE incoming_sector")?;
            Ok(ApplyCounts::new(deactivated, inserted))
        })();

        finalize_transaction(&connection, result)
    }
}

/// Finalize a transaction, committing on success or rolling back on failure.
fn finalize_transaction<T>(
    connection: &Connection,
    result: Result<T, WarehouseError>,
) -> Result<T, WarehouseError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

/// Resolve the secmap home directory from environment or default.
fn resolve_secmap_home() -> PathBuf {
    if let Some(path) = env::var_os("SECMAP_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".secmap");
    }

    PathBuf::from(".secmap")
}
