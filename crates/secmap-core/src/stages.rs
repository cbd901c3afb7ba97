//! Per-item logic of the enrichment stages.

use crate::controller::Stage;
use crate::domain::{
    classify_sector, CanonicalSymbol, Candidate, GicsSector, ResolvedIdentity, TickerGroup,
};
use crate::executor::{LookupPipeline, Resolution, UnresolvedReason};
use crate::provider::{LookupProvider, SearchMatch};

/// Exchanges whose listings are accepted as a CUSIP's primary symbol.
pub const LISTED_EXCHANGES: &[&str] = &["NYQ", "NMS", "ASE", "NYE", "NGM", "NCM", "BTS", "PNK"];

const EQUITY_QUOTE_TYPE: &str = "EQUITY";

fn listed_equity(candidate: &SearchMatch) -> Option<ResolvedIdentity> {
    let provider_symbol = candidate.symbol.trim().to_ascii_uppercase();
    if provider_symbol.is_empty() {
        return None;
    }

    let quote_type = candidate.quote_type.as_deref().unwrap_or_default();
    if !quote_type.trim().eq_ignore_ascii_case(EQUITY_QUOTE_TYPE) {
        return None;
    }

    let exchange = candidate
        .exchange
        .as_deref()
        .unwrap_or_default()
        .trim()
        .to_ascii_uppercase();
    if !exchange.is_empty() && !LISTED_EXCHANGES.contains(&exchange.as_str()) {
        return None;
    }

    let ticker = CanonicalSymbol::normalize(&provider_symbol).ok()?;
    Some(ResolvedIdentity {
        provider_symbol,
        ticker,
    })
}

/// First match that is an equity on an accepted exchange (or with no exchange
/// reported) and whose symbol normalizes to canonical form.
pub fn select_listed_equity(matches: &[SearchMatch]) -> Option<ResolvedIdentity> {
    matches.iter().find_map(listed_equity)
}

/// Every acceptable match, in provider order.
pub fn listed_equities(matches: &[SearchMatch]) -> Vec<ResolvedIdentity> {
    matches.iter().filter_map(listed_equity).collect()
}

/// Resolves a candidate's ticker, trying its CUSIP first and its issuer name
/// second.
///
/// A query whose call succeeds without an acceptable match, or whose attempts
/// run out, moves on to the next query. A stop observed at any point ends the
/// item as stopped.
pub async fn resolve_identity(
    pipeline: &LookupPipeline,
    provider: &dyn LookupProvider,
    candidate: Candidate,
) -> Resolution<ResolvedIdentity> {
    for query in candidate.queries() {
        match pipeline
            .call(Stage::Identity, || provider.search(query))
            .await
        {
            Ok(matches) => {
                if let Some(identity) = select_listed_equity(&matches) {
                    return Resolution::Resolved(identity);
                }
            }
            Err(UnresolvedReason::StoppedDueToThrottle) => {
                return Resolution::Unresolved(UnresolvedReason::StoppedDueToThrottle);
            }
            Err(reason) => {
                tracing::debug!(cusip = %candidate.cusip, query, %reason, "search query gave up");
            }
        }
    }

    Resolution::Unresolved(UnresolvedReason::Unresolved)
}

/// Classifies a resolved symbol into a GICS sector.
pub async fn classify_identity(
    pipeline: &LookupPipeline,
    provider: &dyn LookupProvider,
    identity: ResolvedIdentity,
) -> Resolution<GicsSector> {
    let symbol = identity.provider_symbol.as_str();
    let gate = pipeline.gate();
    match pipeline
        .call(Stage::Sector, || provider.fetch_detail(symbol, &gate))
        .await
    {
        Ok(detail) => match classify_sector(detail.sector.as_deref()) {
            Some(sector) => Resolution::Resolved(sector),
            None => Resolution::Unresolved(UnresolvedReason::SectorUnmapped),
        },
        Err(reason) => Resolution::Unresolved(reason),
    }
}

/// Whether a held ticker still trades, or the symbol that replaced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickerStatus {
    Active,
    Replaced(ResolvedIdentity),
}

/// Checks that a held ticker still has recent prices and otherwise searches
/// for its replacement by issuer name, old ticker and CUSIP in that order.
///
/// Within one query, the first acceptable match with recent prices wins; if
/// none has any, the first acceptable match is taken. A replacement equal to
/// the old ticker is reported as such, not as a change.
pub async fn verify_ticker(
    pipeline: &LookupPipeline,
    provider: &dyn LookupProvider,
    group: TickerGroup,
) -> Resolution<TickerStatus> {
    match quote_is_active(pipeline, provider, &group.ticker.provider_symbol()).await {
        Ok(true) => return Resolution::Resolved(TickerStatus::Active),
        Ok(false) => {}
        Err(reason) => return Resolution::Unresolved(reason),
    }

    for query in group.queries() {
        match find_replacement(pipeline, provider, query).await {
            Ok(Some(identity)) if identity.ticker == group.ticker => {
                return Resolution::Unresolved(UnresolvedReason::ReplacementSameAsOld);
            }
            Ok(Some(identity)) => return Resolution::Resolved(TickerStatus::Replaced(identity)),
            Ok(None) => {}
            Err(reason) => return Resolution::Unresolved(reason),
        }
    }

    Resolution::Unresolved(UnresolvedReason::Unresolved)
}

/// A quote check that gives up counts as inactive; only a stop is an error.
async fn quote_is_active(
    pipeline: &LookupPipeline,
    provider: &dyn LookupProvider,
    symbol: &str,
) -> Result<bool, UnresolvedReason> {
    let gate = pipeline.gate();
    match pipeline
        .call(Stage::Identity, || provider.has_active_quote(symbol, &gate))
        .await
    {
        Ok(active) => Ok(active),
        Err(UnresolvedReason::StoppedDueToThrottle) => Err(UnresolvedReason::StoppedDueToThrottle),
        Err(reason) => {
            tracing::debug!(symbol, %reason, "quote check gave up");
            Ok(false)
        }
    }
}

async fn find_replacement(
    pipeline: &LookupPipeline,
    provider: &dyn LookupProvider,
    query: &str,
) -> Result<Option<ResolvedIdentity>, UnresolvedReason> {
    let matches = match pipeline
        .call(Stage::Identity, || provider.search(query))
        .await
    {
        Ok(matches) => matches,
        Err(UnresolvedReason::StoppedDueToThrottle) => {
            return Err(UnresolvedReason::StoppedDueToThrottle);
        }
        Err(reason) => {
            tracing::debug!(query, %reason, "replacement search gave up");
            return Ok(None);
        }
    };

    let listed = listed_equities(&matches);
    for identity in &listed {
        if quote_is_active(pipeline, provider, &identity.provider_symbol).await? {
            return Ok(Some(identity.clone()));
        }
    }
    Ok(listed.into_iter().next())
}
