//! # Domain Models
//!
//! Validated identifiers flowing through the enrichment stages.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Cusip`] | 8–9 character security identifier |
//! | [`Candidate`] | CUSIP plus issuer name selected for enrichment |
//! | [`CanonicalSymbol`] | Ticker in the store's canonical form |
//! | [`ResolvedIdentity`] | Provider symbol paired with its canonical ticker |
//! | [`HeldIdentity`] | Active CUSIP → ticker mapping of a held security |
//! | [`TickerGroup`] | Held identities sharing one ticker, checked together |
//! | [`HoldingKey`] | Ticker and/or CUSIP of a recently reported position |
//! | [`GicsSector`] | Sector code and label from the closed vocabulary |

mod cusip;
mod sector;
mod symbol;

use std::collections::BTreeMap;

use serde::Serialize;

pub use cusip::Cusip;
pub use sector::{classify_sector, GicsSector, GICS_SECTORS};
pub use symbol::CanonicalSymbol;

use crate::ValidationError;

/// An immutable input record for the identity stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub cusip: Cusip,
    pub issuer_name: String,
}

impl Candidate {
    pub fn new(cusip: &str, issuer_name: impl Into<String>) -> Result<Self, ValidationError> {
        Ok(Self {
            cusip: Cusip::parse(cusip)?,
            issuer_name: issuer_name.into().trim().to_owned(),
        })
    }

    /// Search queries in the order they are tried: the CUSIP, then the issuer
    /// name when one is known.
    pub fn queries(&self) -> Vec<&str> {
        let mut queries = vec![self.cusip.as_str()];
        if !self.issuer_name.is_empty() {
            queries.push(self.issuer_name.as_str());
        }
        queries
    }
}

/// A symbol as the provider spells it, and the same symbol as the store keeps it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ResolvedIdentity {
    pub provider_symbol: String,
    pub ticker: CanonicalSymbol,
}

/// An active identity mapping of a security the top institutions hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeldIdentity {
    pub cusip: Cusip,
    pub ticker: CanonicalSymbol,
    pub issuer_name: String,
}

impl HeldIdentity {
    pub fn new(
        cusip: &str,
        ticker: &str,
        issuer_name: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            cusip: Cusip::parse(cusip)?,
            ticker: CanonicalSymbol::normalize(ticker)?,
            issuer_name: issuer_name.into().trim().to_owned(),
        })
    }
}

/// Every held identity that maps to one ticker. The first row supplies the
/// issuer name and CUSIP used to search for a replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickerGroup {
    pub ticker: CanonicalSymbol,
    pub holdings: Vec<HeldIdentity>,
}

impl TickerGroup {
    /// Groups rows by ticker in ticker order, keeping row order within a group.
    pub fn group(rows: Vec<HeldIdentity>) -> Vec<TickerGroup> {
        let mut groups: BTreeMap<CanonicalSymbol, Vec<HeldIdentity>> = BTreeMap::new();
        for row in rows {
            groups.entry(row.ticker.clone()).or_default().push(row);
        }
        groups
            .into_iter()
            .map(|(ticker, holdings)| TickerGroup { ticker, holdings })
            .collect()
    }

    /// Replacement search queries: issuer name, old ticker, then CUSIP.
    pub fn queries(&self) -> Vec<&str> {
        let first = self.holdings.first();
        [
            first.map(|row| row.issuer_name.as_str()),
            Some(self.ticker.as_str()),
            first.map(|row| row.cusip.as_str()),
        ]
        .into_iter()
        .flatten()
        .filter(|query| !query.is_empty())
        .collect()
    }
}

/// How a recently reported position names its security. Either part may be
/// missing; a part that fails validation is treated as missing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct HoldingKey {
    pub ticker: Option<CanonicalSymbol>,
    pub cusip: Option<Cusip>,
}

impl HoldingKey {
    pub fn parse(ticker: Option<&str>, cusip: Option<&str>) -> Self {
        Self {
            ticker: ticker.and_then(|ticker| CanonicalSymbol::normalize(ticker).ok()),
            cusip: cusip.and_then(|cusip| Cusip::parse(cusip).ok()),
        }
    }
}
