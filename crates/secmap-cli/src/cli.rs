//! CLI argument definitions for secmap.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `refresh` | Resolve tickers and sectors for held CUSIPs and persist changes |
//! | `refresh-tickers` | Replace held tickers that no longer trade |
//! | `map-sectors` | Classify recent holdings that have no sector yet |
//! | `candidates` | List the CUSIPs a refresh would look up |
//!
//! `refresh-tickers` and `map-sectors` take every `refresh` option.
//! Every `refresh` option also reads a `YH_*` environment variable, so
//! scheduled runs can be tuned without changing the command line.
//!
//! # Examples
//!
//! ```bash
//! # Look everything up, write nothing
//! secmap refresh --dry-run --symbol-limit 200
//!
//! # Slower, gentler run
//! YH_GLOBAL_RPS=0.8 YH_SEARCH_WORKERS=1 secmap refresh
//!
//! # Re-check one ticker only
//! YH_TARGET_TICKER=FB secmap refresh-tickers --dry-run
//!
//! # Inspect the candidate set
//! secmap candidates --pretty
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use secmap_core::{Bounds, ControllerConfig, EnrichConfig, RetryPolicy, StageKnobs};

/// Security map enrichment: CUSIP → ticker → GICS sector.
#[derive(Debug, Parser)]
#[command(name = "secmap", author, version, about)]
pub struct Cli {
    /// DuckDB warehouse file. Defaults to `$SECMAP_HOME/warehouse.duckdb`.
    #[arg(long, global = true, env = "SECMAP_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the identity and sector refresh.
    Refresh(RefreshArgs),

    /// Check held tickers for recent prices and replace the ones that stopped trading.
    RefreshTickers(RefreshTickersArgs),

    /// Classify holdings of the latest report periods that have no active sector.
    MapSectors(MapSectorsArgs),

    /// List candidate CUSIPs without calling the provider.
    Candidates(CandidatesArgs),
}

/// Arguments for the `refresh` command.
#[derive(Debug, Args)]
pub struct RefreshArgs {
    /// Look everything up but write nothing.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Maximum candidates per run, 0 for no limit.
    #[arg(long, env = "YH_SYMBOL_LIMIT", default_value_t = 0)]
    pub symbol_limit: usize,

    /// Institutions whose latest filing feeds the candidate set.
    #[arg(long, env = "YH_TOP_INSTITUTIONS", default_value_t = 50)]
    pub top_institutions: usize,

    #[arg(long, env = "YH_BATCH_SIZE", default_value_t = 100)]
    pub batch_size: usize,

    #[arg(long, env = "YH_SEARCH_WORKERS", default_value_t = 2)]
    pub search_workers: usize,

    /// Defaults to two above `--search-workers`.
    #[arg(long, env = "YH_SEARCH_WORKERS_MAX")]
    pub search_workers_max: Option<usize>,

    #[arg(long, env = "YH_SEARCH_DELAY_MS", default_value_t = 180)]
    pub search_delay_ms: u64,

    #[arg(long, env = "YH_SEARCH_DELAY_MIN_MS", default_value_t = 80)]
    pub search_delay_min_ms: u64,

    #[arg(long, env = "YH_SEARCH_DELAY_MAX_MS", default_value_t = 1_200)]
    pub search_delay_max_ms: u64,

    #[arg(long, env = "YH_SEARCH_RETRY_MAX", default_value_t = 3)]
    pub search_retry_max: u32,

    #[arg(long, env = "YH_SECTOR_WORKERS", default_value_t = 3)]
    pub sector_workers: usize,

    /// Defaults to two above `--sector-workers`.
    #[arg(long, env = "YH_SECTOR_WORKERS_MAX")]
    pub sector_workers_max: Option<usize>,

    #[arg(long, env = "YH_SECTOR_DELAY_MS", default_value_t = 220)]
    pub sector_delay_ms: u64,

    #[arg(long, env = "YH_SECTOR_DELAY_MIN_MS", default_value_t = 100)]
    pub sector_delay_min_ms: u64,

    #[arg(long, env = "YH_SECTOR_DELAY_MAX_MS", default_value_t = 1_500)]
    pub sector_delay_max_ms: u64,

    #[arg(long, env = "YH_SECTOR_RETRY_MAX", default_value_t = 3)]
    pub sector_retry_max: u32,

    /// Starting global request rate, requests per second.
    #[arg(long, env = "YH_GLOBAL_RPS", default_value_t = 1.5)]
    pub global_rps: f64,

    /// Ceiling the rate recovers to. Defaults to `--global-rps`.
    #[arg(long, env = "YH_GLOBAL_RPS_MAX")]
    pub global_rps_max: Option<f64>,

    #[arg(long, env = "YH_GLOBAL_RPS_MIN", default_value_t = 0.6)]
    pub global_rps_min: f64,

    #[arg(long, env = "YH_GLOBAL_BURST", default_value_t = 3)]
    pub global_burst: u32,

    /// Calls per adaptive window.
    #[arg(long, env = "YH_ADAPT_WINDOW_REQUESTS", default_value_t = 120)]
    pub adapt_window_requests: usize,

    /// Rate-limited share above which a window counts as throttled.
    #[arg(long, env = "YH_ADAPT_429_THRESHOLD", default_value_t = 0.03)]
    pub adapt_429_threshold: f64,

    #[arg(long, env = "YH_ADAPT_DELAY_STEP_MS", default_value_t = 80)]
    pub adapt_delay_step_ms: u64,

    #[arg(long, env = "YH_ADAPT_RPS_STEP", default_value_t = 0.2)]
    pub adapt_rps_step: f64,

    #[arg(long, env = "YH_HEALTHY_WINDOWS_TO_SCALE_UP", default_value_t = 3)]
    pub healthy_windows_to_scale_up: u32,

    /// Consecutive throttled windows before the run stops admitting work.
    #[arg(long, env = "YH_MAX_CONSECUTIVE_THROTTLED_WINDOWS", default_value_t = 6)]
    pub max_consecutive_throttled_windows: u32,

    #[arg(long, env = "YH_COOLDOWN_SECONDS", default_value_t = 15)]
    pub cooldown_seconds: u64,

    #[arg(long, env = "YH_IDENTITY_SOURCE_VERSION", default_value = secmap_core::DEFAULT_IDENTITY_SOURCE_VERSION)]
    pub identity_source_version: String,

    #[arg(long, env = "YH_SECTOR_SOURCE_VERSION", default_value = secmap_core::DEFAULT_SECTOR_SOURCE_VERSION)]
    pub sector_source_version: String,
}

/// Workers may grow two above their starting count unless capped explicitly.
const WORKER_HEADROOM: usize = 2;

impl RefreshArgs {
    pub fn to_config(&self) -> EnrichConfig {
        let defaults = EnrichConfig::default();
        let controller = ControllerConfig {
            identity: StageKnobs {
                workers: Bounds::new(
                    self.search_workers,
                    1,
                    self.search_workers_max.unwrap_or(self.search_workers + WORKER_HEADROOM),
                ),
                delay: Bounds::new(
                    Duration::from_millis(self.search_delay_ms),
                    Duration::from_millis(self.search_delay_min_ms),
                    Duration::from_millis(self.search_delay_max_ms),
                ),
            },
            sector: StageKnobs {
                workers: Bounds::new(
                    self.sector_workers,
                    1,
                    self.sector_workers_max.unwrap_or(self.sector_workers + WORKER_HEADROOM),
                ),
                delay: Bounds::new(
                    Duration::from_millis(self.sector_delay_ms),
                    Duration::from_millis(self.sector_delay_min_ms),
                    Duration::from_millis(self.sector_delay_max_ms),
                ),
            },
            rate: Bounds::new(
                self.global_rps,
                self.global_rps_min,
                self.global_rps_max.unwrap_or(self.global_rps),
            ),
            burst: self.global_burst,
            window_size: self.adapt_window_requests,
            throttle_threshold: self.adapt_429_threshold,
            delay_step: Duration::from_millis(self.adapt_delay_step_ms),
            rate_step: self.adapt_rps_step,
            healthy_windows_to_scale_up: self.healthy_windows_to_scale_up,
            max_throttled_windows: self.max_consecutive_throttled_windows,
            cooldown: Duration::from_secs(self.cooldown_seconds),
        };

        EnrichConfig {
            controller,
            identity_retry: RetryPolicy::with_max_attempts(self.search_retry_max),
            sector_retry: RetryPolicy::with_max_attempts(self.sector_retry_max),
            batch_size: self.batch_size,
            top_institutions: self.top_institutions,
            item_limit: self.symbol_limit,
            dry_run: self.dry_run,
            identity_source_version: self.identity_source_version.clone(),
            sector_source_version: self.sector_source_version.clone(),
            ..defaults
        }
    }
}

/// Arguments for the `refresh-tickers` command.
#[derive(Debug, Args)]
pub struct RefreshTickersArgs {
    #[command(flatten)]
    pub common: RefreshArgs,

    /// Check only this ticker, with every CUSIP mapped to it.
    #[arg(long, env = "YH_TARGET_TICKER")]
    pub target_ticker: Option<String>,

    #[arg(long, env = "YH_TICKER_REFRESH_SOURCE_VERSION", default_value = secmap_core::DEFAULT_TICKER_REFRESH_SOURCE_VERSION)]
    pub ticker_refresh_source_version: String,
}

impl RefreshTickersArgs {
    pub fn to_config(&self) -> EnrichConfig {
        EnrichConfig {
            target_ticker: self
                .target_ticker
                .as_deref()
                .map(str::trim)
                .filter(|ticker| !ticker.is_empty())
                .map(str::to_ascii_uppercase),
            ticker_refresh_source_version: self.ticker_refresh_source_version.clone(),
            ..self.common.to_config()
        }
    }
}

/// Arguments for the `map-sectors` command.
#[derive(Debug, Args)]
pub struct MapSectorsArgs {
    #[command(flatten)]
    pub common: RefreshArgs,

    /// Most recent 13F report periods whose holdings are considered.
    #[arg(long, env = "YH_REPORT_PERIODS", default_value_t = 2)]
    pub report_periods: usize,
}

impl MapSectorsArgs {
    pub fn to_config(&self) -> EnrichConfig {
        EnrichConfig {
            report_periods: self.report_periods,
            ..self.common.to_config()
        }
    }
}

/// Arguments for the `candidates` command.
#[derive(Debug, Args)]
pub struct CandidatesArgs {
    #[arg(long, env = "YH_TOP_INSTITUTIONS", default_value_t = 50)]
    pub top_institutions: usize,

    /// Maximum candidates listed, 0 for no limit.
    #[arg(long, env = "YH_SYMBOL_LIMIT", default_value_t = 0)]
    pub limit: usize,
}
