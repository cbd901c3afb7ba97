use std::time::Duration;

use secmap_warehouse::Provenance;
use serde::Serialize;

use crate::controller::ControllerConfig;
use crate::retry::RetryPolicy;
use crate::ValidationError;

pub const IDENTITY_SOURCE: &str = "yahoo-search-cusip";
pub const SECTOR_SOURCE: &str = "yfinance";
pub const TICKER_REFRESH_SOURCE: &str = "yahoo-symbol-refresh";
pub const DEFAULT_IDENTITY_SOURCE_VERSION: &str = "yahoo-search-cusip-v1";
pub const DEFAULT_SECTOR_SOURCE_VERSION: &str = "yfinance-info-v1";
pub const DEFAULT_TICKER_REFRESH_SOURCE_VERSION: &str = "yahoo-symbol-refresh-v1";
const MAPPING_CONFIDENCE: f64 = 0.90;

/// Everything a refresh run needs besides its store and provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichConfig {
    pub controller: ControllerConfig,
    pub identity_retry: RetryPolicy,
    pub sector_retry: RetryPolicy,
    /// Random pacing added to every stage delay, lower and upper bound.
    pub pacing_jitter: (Duration, Duration),
    pub batch_size: usize,
    /// Institutions whose latest filing feeds the candidate set.
    pub top_institutions: usize,
    /// Maximum candidates per run, 0 for no limit.
    pub item_limit: usize,
    /// Look everything up but write nothing.
    pub dry_run: bool,
    pub identity_source_version: String,
    pub sector_source_version: String,
    pub ticker_refresh_source_version: String,
    /// Ticker refresh checks only this ticker when set.
    pub target_ticker: Option<String>,
    /// Most recent 13F report periods the sector back-fill looks at.
    pub report_periods: usize,
    pub failure_preview_limit: usize,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            identity_retry: RetryPolicy::default(),
            sector_retry: RetryPolicy::default(),
            pacing_jitter: (Duration::from_millis(30), Duration::from_millis(120)),
            batch_size: 100,
            top_institutions: 50,
            item_limit: 0,
            dry_run: false,
            identity_source_version: DEFAULT_IDENTITY_SOURCE_VERSION.to_string(),
            sector_source_version: DEFAULT_SECTOR_SOURCE_VERSION.to_string(),
            ticker_refresh_source_version: DEFAULT_TICKER_REFRESH_SOURCE_VERSION.to_string(),
            target_ticker: None,
            report_periods: 2,
            failure_preview_limit: 30,
        }
    }
}

impl EnrichConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.controller.validate()?;

        for (field, value) in [
            ("identity_retry_max", self.identity_retry.max_attempts as usize),
            ("sector_retry_max", self.sector_retry.max_attempts as usize),
            ("batch_size", self.batch_size),
            ("top_institutions", self.top_institutions),
            ("report_periods", self.report_periods),
        ] {
            if value == 0 {
                return Err(ValidationError::NonPositiveValue { field });
            }
        }

        let (jitter_min, jitter_max) = self.pacing_jitter;
        if jitter_min > jitter_max {
            return Err(ValidationError::InvertedBounds {
                field: "pacing_jitter",
                min: format!("{jitter_min:?}"),
                max: format!("{jitter_max:?}"),
            });
        }

        Ok(())
    }

    pub fn identity_provenance(&self) -> Provenance {
        Provenance::new(
            IDENTITY_SOURCE,
            self.identity_source_version.as_str(),
            MAPPING_CONFIDENCE,
        )
    }

    pub fn sector_provenance(&self) -> Provenance {
        Provenance::new(
            SECTOR_SOURCE,
            self.sector_source_version.as_str(),
            MAPPING_CONFIDENCE,
        )
    }

    pub fn ticker_refresh_provenance(&self) -> Provenance {
        Provenance::new(
            TICKER_REFRESH_SOURCE,
            self.ticker_refresh_source_version.as_str(),
            MAPPING_CONFIDENCE,
        )
    }
}
