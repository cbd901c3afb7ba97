//! Core enrichment engine for secmap.
//!
//! This crate contains:
//! - Validated CUSIP, ticker and GICS sector models
//! - A shared token bucket and an adaptive controller that tunes it
//! - A bounded stage executor with per-call retry and pacing
//! - Identity and sector lookup stages behind a provider trait
//! - Idempotent batch persistence into the security map tables
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`throttling`] | Token bucket shared by every outbound call |
//! | [`metrics`] | Windowed request counters and run totals |
//! | [`controller`] | Adaptive workers, delay and rate tuning |
//! | [`executor`] | Lookup pipeline and bounded stage executor |
//! | [`stages`] | CUSIP → ticker and ticker → sector lookups |
//! | [`persist`] | Batched, de-duplicated store writes |
//! | [`run`] | One refresh run and its summary |
//! | [`ticker_refresh`] | Replacement of held tickers that stopped trading |
//! | [`sector_backfill`] | Sectors for recent holdings with none mapped |

pub mod adapters;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod executor;
pub mod http_client;
pub mod metrics;
pub mod persist;
pub mod provider;
pub mod retry;
pub mod run;
pub mod sector_backfill;
pub mod stages;
pub mod store;
pub mod throttling;
pub mod ticker_refresh;

pub use adapters::{YahooLookupProvider, YahooSession};
pub use config::{
    EnrichConfig, DEFAULT_IDENTITY_SOURCE_VERSION, DEFAULT_SECTOR_SOURCE_VERSION,
    DEFAULT_TICKER_REFRESH_SOURCE_VERSION, IDENTITY_SOURCE, SECTOR_SOURCE, TICKER_REFRESH_SOURCE,
};
pub use controller::{
    Adjustment, AdaptiveController, Bounds, ControllerConfig, ControllerSnapshot, Stage,
    StageKnobs, StageLimits,
};
pub use domain::{
    classify_sector, CanonicalSymbol, Candidate, Cusip, GicsSector, HeldIdentity, HoldingKey,
    ResolvedIdentity, TickerGroup, GICS_SECTORS,
};
pub use error::{EnrichError, ValidationError};
pub use executor::{
    LookupPipeline, PipelineGate, Resolution, StageExecutor, StageResult, UnresolvedReason,
};
pub use http_client::{HttpClient, HttpError, HttpRequest, HttpResponse, ReqwestHttpClient};
pub use metrics::{LatencySummary, MetricsSnapshot, RunMetrics, WindowCounters};
pub use persist::BatchPersister;
pub use provider::{
    CallOutcome, LookupError, LookupErrorKind, LookupFuture, LookupProvider, RequestGate,
    SearchMatch, SecurityDetail, Ungated,
};
pub use retry::{Backoff, RetryPolicy};
pub use run::{EnrichmentRun, RequestStats, RunSummary, StageCounts};
pub use sector_backfill::{SectorBackfillRun, SectorBackfillSummary};
pub use secmap_warehouse::{
    ApplyCounts, HeldIdentityRecord, HoldingKeyRecord, IdentityRow, Provenance, SectorRow,
    Warehouse, WarehouseConfig, WarehouseError,
};
pub use stages::{
    classify_identity, listed_equities, resolve_identity, select_listed_equity, verify_ticker,
    TickerStatus, LISTED_EXCHANGES,
};
pub use store::{
    ActiveSector, EnrichmentStore, SectorBackfillStore, StoreError, TickerRefreshStore,
};
pub use throttling::TokenBucket;
pub use ticker_refresh::{TickerRefreshRun, TickerRefreshSummary};
