use serde::Serialize;

/// An institution that files 13F holdings reports.
#[derive(Debug, Clone)]
pub struct InstitutionRecord {
    pub id: String,
    pub institution_name: String,
}

/// A holdings filing header.
#[derive(Debug, Clone)]
pub struct FilingRecord {
    pub id: String,
    pub institution_id: String,
    /// Form type, e.g. `13F-HR` or `13F-HR/A`.
    pub filing_form_type: String,
    /// Report period as an ISO 8601 date.
    pub report_period: String,
    /// Filing date as an ISO 8601 date.
    pub filing_date: String,
    pub accession_number: String,
}

/// One holding line of a filing.
#[derive(Debug, Clone)]
pub struct PositionRecord {
    pub cusip: String,
    /// Ticker as reported on the filing, when it carries one.
    pub ticker: Option<String>,
    pub issuer_name: Option<String>,
    pub value_usd_thousands: f64,
    pub shares: f64,
}

/// A CUSIP selected for enrichment together with its best-known issuer name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateRecord {
    pub cusip: String,
    pub issuer_name: String,
}

/// Active identity of a held CUSIP plus the issuer name it was filed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeldIdentityRecord {
    pub cusip: String,
    pub ticker: String,
    pub issuer_name: String,
}

/// Ticker and CUSIP of a position in a recent report period, uppercased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HoldingKeyRecord {
    pub ticker: Option<String>,
    pub cusip: Option<String>,
}

/// CUSIP to ticker mapping row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityRow {
    pub cusip: String,
    pub ticker: String,
}

/// Ticker to GICS sector mapping row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectorRow {
    pub ticker: String,
    pub cusip: Option<String>,
    pub sector_code: String,
    pub sector_label: String,
}

/// Provenance stamped on every row inserted by a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Provenance {
    pub source: String,
    pub source_version: String,
    pub confidence: f64,
}

impl Provenance {
    pub fn new(source: impl Into<String>, source_version: impl Into<String>, confidence: f64) -> Self {
        Self {
            source: source.into(),
            source_version: source_version.into(),
            confidence,
        }
    }
}

/// Outcome of one conditional upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyCounts {
    /// Active rows soft-retired because an incoming row disagreed with them.
    pub deactivated: usize,
    /// New active rows written.
    pub inserted: usize,
}

impl ApplyCounts {
    pub const fn new(deactivated: usize, inserted: usize) -> Self {
        Self {
            deactivated,
            inserted,
        }
    }
}

impl std::ops::AddAssign for ApplyCounts {
    fn add_assign(&mut self, other: Self) {
        self.deactivated += other.deactivated;
        self.inserted += other.inserted;
    }
}
