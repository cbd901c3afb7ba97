//! Store seam: where candidates come from and where changes go.

use std::collections::BTreeMap;

use secmap_warehouse::{
    ApplyCounts, HeldIdentityRecord, IdentityRow, Provenance, SectorRow, Warehouse, WarehouseError,
};
use thiserror::Error;

use crate::domain::{Candidate, CanonicalSymbol, HeldIdentity, HoldingKey};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Active sector assignment of a ticker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSector {
    pub cusip: Option<String>,
    pub sector_code: String,
    pub sector_label: String,
}

/// Candidate source plus batched conditional upserts.
pub trait EnrichmentStore: Send + Sync {
    /// CUSIPs held by the top `top_institutions` filers, ordered by CUSIP.
    fn candidates(&self, top_institutions: usize) -> Result<Vec<Candidate>, StoreError>;

    /// Active CUSIP to ticker mapping, keys and values uppercased.
    fn active_identities(&self) -> Result<BTreeMap<String, String>, StoreError>;

    /// Active ticker to sector mapping.
    fn active_sectors(&self) -> Result<BTreeMap<String, ActiveSector>, StoreError>;

    fn apply_identity_batch(
        &self,
        rows: &[IdentityRow],
        provenance: &Provenance,
    ) -> Result<ApplyCounts, StoreError>;

    fn apply_sector_batch(
        &self,
        rows: &[SectorRow],
        provenance: &Provenance,
    ) -> Result<ApplyCounts, StoreError>;
}

/// Reads and writes of the stale-ticker refresh.
pub trait TickerRefreshStore: EnrichmentStore {
    /// Active identities of CUSIPs the top `top_institutions` filers hold.
    fn held_identities(&self, top_institutions: usize) -> Result<Vec<HeldIdentity>, StoreError>;

    /// Every active identity mapped to `ticker`, whether held or not.
    fn identities_for_ticker(
        &self,
        ticker: &CanonicalSymbol,
    ) -> Result<Vec<HeldIdentity>, StoreError>;

    /// Retires every active identity of the row's CUSIP and inserts the row.
    fn replace_identity(
        &self,
        row: &IdentityRow,
        provenance: &Provenance,
    ) -> Result<ApplyCounts, StoreError>;
}

/// Reads of the sector back-fill.
pub trait SectorBackfillStore: EnrichmentStore {
    /// Distinct holdings of the latest `report_periods` report periods.
    fn recent_holdings(&self, report_periods: usize) -> Result<Vec<HoldingKey>, StoreError>;
}

fn held_identities_from(records: Vec<HeldIdentityRecord>) -> Vec<HeldIdentity> {
    let mut identities = Vec::with_capacity(records.len());
    for record in records {
        match HeldIdentity::new(&record.cusip, &record.ticker, record.issuer_name) {
            Ok(identity) => identities.push(identity),
            Err(error) => {
                tracing::warn!(
                    cusip = %record.cusip,
                    ticker = %record.ticker,
                    %error,
                    "skipping malformed identity"
                );
            }
        }
    }
    identities
}

impl TickerRefreshStore for Warehouse {
    fn held_identities(&self, top_institutions: usize) -> Result<Vec<HeldIdentity>, StoreError> {
        Ok(held_identities_from(Warehouse::held_identities(
            self,
            top_institutions,
        )?))
    }

    fn identities_for_ticker(
        &self,
        ticker: &CanonicalSymbol,
    ) -> Result<Vec<HeldIdentity>, StoreError> {
        Ok(held_identities_from(Warehouse::identities_for_ticker(
            self,
            ticker.as_str(),
        )?))
    }

    fn replace_identity(
        &self,
        row: &IdentityRow,
        provenance: &Provenance,
    ) -> Result<ApplyCounts, StoreError> {
        Ok(Warehouse::replace_active_identity(self, row, provenance)?)
    }
}

impl SectorBackfillStore for Warehouse {
    fn recent_holdings(&self, report_periods: usize) -> Result<Vec<HoldingKey>, StoreError> {
        Ok(Warehouse::recent_holdings(self, report_periods)?
            .into_iter()
            .map(|record| HoldingKey::parse(record.ticker.as_deref(), record.cusip.as_deref()))
            .filter(|key| key.ticker.is_some() || key.cusip.is_some())
            .collect())
    }
}

impl EnrichmentStore for Warehouse {
    fn candidates(&self, top_institutions: usize) -> Result<Vec<Candidate>, StoreError> {
        let records = Warehouse::candidates(self, top_institutions)?;
        let mut candidates = Vec::with_capacity(records.len());
        for record in records {
            match Candidate::new(&record.cusip, record.issuer_name) {
                Ok(candidate) => candidates.push(candidate),
                Err(error) => {
                    tracing::warn!(cusip = %record.cusip, %error, "skipping malformed candidate");
                }
            }
        }
        Ok(candidates)
    }

    fn active_identities(&self) -> Result<BTreeMap<String, String>, StoreError> {
        Ok(Warehouse::active_identities(self)?
            .into_iter()
            .filter(|row| !row.cusip.is_empty() && !row.ticker.is_empty())
            .map(|row| (row.cusip, row.ticker))
            .collect())
    }

    fn active_sectors(&self) -> Result<BTreeMap<String, ActiveSector>, StoreError> {
        Ok(Warehouse::active_sectors(self)?
            .into_iter()
            .map(|row| {
                (
                    row.ticker,
                    ActiveSector {
                        cusip: row.cusip,
                        sector_code: row.sector_code,
                        sector_label: row.sector_label,
                    },
                )
            })
            .collect())
    }

    fn apply_identity_batch(
        &self,
        rows: &[IdentityRow],
        provenance: &Provenance,
    ) -> Result<ApplyCounts, StoreError> {
        Ok(Warehouse::apply_identity_batch(self, rows, provenance)?)
    }

    fn apply_sector_batch(
        &self,
        rows: &[SectorRow],
        provenance: &Provenance,
    ) -> Result<ApplyCounts, StoreError> {
        Ok(Warehouse::apply_sector_batch(self, rows, provenance)?)
    }
}
