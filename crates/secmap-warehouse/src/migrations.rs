use ::duckdb::{params, Connection};

struct Migration {
    version: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_holdings",
        sql: r#"
CREATE TABLE IF NOT EXISTS institutions (
    id TEXT PRIMARY KEY,
    institution_name TEXT NOT NULL,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS filings (
    id TEXT PRIMARY KEY,
    institution_id TEXT NOT NULL,
    filing_form_type TEXT NOT NULL,
    report_period DATE NOT NULL,
    filing_date DATE NOT NULL,
    accession_number TEXT NOT NULL,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS positions (
    filing_id TEXT NOT NULL,
    cusip TEXT NOT NULL,
    issuer_name TEXT,
    value_usd_thousands DOUBLE NOT NULL DEFAULT 0,
    shares DOUBLE NOT NULL DEFAULT 0
);
"#,
    },
    Migration {
        version: "0002_security_maps",
        sql: r#"
CREATE SEQUENCE IF NOT EXISTS security_identity_map_id_seq;
CREATE SEQUENCE IF NOT EXISTS security_sector_map_id_seq;

CREATE TABLE IF NOT EXISTS security_identity_map (
    id BIGINT NOT NULL DEFAULT nextval('security_identity_map_id_seq'),
    cusip TEXT NOT NULL,
    ticker TEXT NOT NULL,
    source TEXT NOT NULL,
    source_version TEXT NOT NULL,
    confidence DOUBLE NOT NULL,
    effective_from TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    effective_to TIMESTAMP,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS security_sector_map (
    id BIGINT NOT NULL DEFAULT nextval('security_sector_map_id_seq'),
    ticker TEXT NOT NULL,
    cusip TEXT,
    sector_code TEXT NOT NULL,
    sector_label TEXT NOT NULL,
    source TEXT NOT NULL,
    source_version TEXT NOT NULL,
    confidence DOUBLE NOT NULL,
    effective_from TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    effective_to TIMESTAMP,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    },
    Migration {
        version: "0003_indexes",
        sql: r#"
CREATE INDEX IF NOT EXISTS idx_filings_institution ON filings(institution_id);
CREATE INDEX IF NOT EXISTS idx_positions_filing ON positions(filing_id);
"#,
    },
    Migration {
        version: "0004_position_tickers",
        sql: r#"
ALTER TABLE positions ADD COLUMN IF NOT EXISTS ticker TEXT;
"#,
    },
];

pub fn apply_migrations(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    )?;

    for migration in MIGRATIONS {
        let applied_count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?",
            params![migration.version],
            |row| row.get(0),
        )?;

        if applied_count == 0 {
            connection.execute_batch(migration.sql)?;
            connection.execute(
                "INSERT INTO schema_migrations (version) VALUES (?)",
                params![migration.version],
            )?;
        }
    }

    Ok(())
}
