use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::http_client::{HttpClient, HttpError, HttpRequest, HttpResponse};
use crate::provider::{
    CallOutcome, LookupError, LookupFuture, LookupProvider, RequestGate, SearchMatch,
    SecurityDetail,
};

const SEARCH_URL: &str = "https://query2.finance.yahoo.com/v1/finance/search";
const QUOTE_SUMMARY_URL: &str = "https://query1.finance.yahoo.com/v10/finance/quoteSummary";
const CHART_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
const COOKIE_URL: &str = "https://fc.yahoo.com";
const CRUMB_URLS: [&str; 2] = [
    "https://query1.finance.yahoo.com/v1/test/getcrumb",
    "https://query2.finance.yahoo.com/v1/test/getcrumb",
];
const REFERER: &str = "https://finance.yahoo.com/";
const SEARCH_RESULTS: usize = 10;

fn yahoo_request(url: impl Into<String>) -> HttpRequest {
    HttpRequest::get(url).with_header("referer", REFERER)
}

fn is_throttled(response: &HttpResponse) -> bool {
    response.status == 429 || response.body.to_ascii_lowercase().contains("too many requests")
}

fn outcome_of(result: &Result<HttpResponse, HttpError>) -> CallOutcome {
    match result {
        Ok(response) if response.is_success() => CallOutcome::Success,
        Ok(response) => LookupError::from_status(response.status, &response.body).outcome(),
        Err(_) => CallOutcome::Other,
    }
}

/// Sends one request through `gate`: admitted first, outcome recorded after.
async fn gated_execute(
    http_client: &dyn HttpClient,
    gate: &dyn RequestGate,
    request: HttpRequest,
) -> Result<HttpResponse, HttpError> {
    gate.admit().await;
    let started = Instant::now();
    let result = http_client.execute(request).await;
    gate.record(started.elapsed(), outcome_of(&result));
    result
}

// ============================================================================
// Yahoo session - cookie/crumb handshake
// ============================================================================

#[derive(Debug, Clone)]
struct CachedCrumb {
    value: String,
    fetched_at: Instant,
}

/// Caches the crumb Yahoo requires on quote summary and chart calls.
///
/// The crumb is bound to the session cookie set by `fc.yahoo.com`; the
/// transport's cookie store keeps that cookie, this type keeps the crumb.
/// The cache lock is held across the handshake, so concurrent callers that
/// find it empty wait for one handshake instead of each running their own.
#[derive(Debug)]
pub struct YahooSession {
    crumb: Mutex<Option<CachedCrumb>>,
    ttl: Duration,
}

impl Default for YahooSession {
    fn default() -> Self {
        Self::with_ttl(Duration::from_secs(3_600))
    }
}

impl YahooSession {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            crumb: Mutex::new(None),
            ttl,
        }
    }

    /// Cached crumb, or a fresh one from the handshake. Every handshake
    /// request goes through `gate`.
    pub async fn crumb(
        &self,
        http_client: &dyn HttpClient,
        gate: &dyn RequestGate,
    ) -> Result<String, LookupError> {
        let mut cached = self.crumb.lock().await;
        if let Some(crumb) = cached
            .as_ref()
            .filter(|crumb| crumb.fetched_at.elapsed() < self.ttl)
        {
            return Ok(crumb.value.clone());
        }

        let value = Self::handshake(http_client, gate).await?;
        tracing::debug!("yahoo crumb refreshed");
        *cached = Some(CachedCrumb {
            value: value.clone(),
            fetched_at: Instant::now(),
        });
        Ok(value)
    }

    /// Drops the cached crumb if it is still `stale`, so the next call repeats
    /// the handshake. A crumb another caller already replaced is kept.
    pub async fn invalidate(&self, stale: &str) {
        let mut cached = self.crumb.lock().await;
        if cached.as_ref().is_some_and(|crumb| crumb.value == stale) {
            *cached = None;
        }
    }

    async fn handshake(
        http_client: &dyn HttpClient,
        gate: &dyn RequestGate,
    ) -> Result<String, LookupError> {
        let cookie = gated_execute(http_client, gate, yahoo_request(COOKIE_URL))
            .await
            .map_err(|error| {
                LookupError::transport(format!("failed to fetch yahoo cookie: {error}"))
            })?;
        if is_throttled(&cookie) {
            return Err(LookupError::rate_limited(
                "yahoo rate limited while fetching cookie",
            ));
        }

        for endpoint in CRUMB_URLS {
            let Ok(response) = gated_execute(http_client, gate, yahoo_request(endpoint)).await
            else {
                continue;
            };

            if is_throttled(&response) {
                return Err(LookupError::rate_limited(
                    "yahoo rate limited while fetching crumb",
                ));
            }
            let body = response.body.trim();
            if !response.is_success() || body.contains("<html") || body.contains("<!DOCTYPE") {
                continue;
            }
            if !body.is_empty() && body.len() < 100 && !body.contains(' ') {
                return Ok(body.to_owned());
            }
        }

        Err(LookupError::upstream(
            "failed to fetch yahoo crumb from all endpoints",
        ))
    }
}

// ============================================================================
// Yahoo lookup provider
// ============================================================================

/// Yahoo Finance search, quote summary and chart endpoints behind
/// [`LookupProvider`].
pub struct YahooLookupProvider {
    http_client: Arc<dyn HttpClient>,
    session: YahooSession,
}

impl YahooLookupProvider {
    pub fn new(http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            http_client,
            session: YahooSession::default(),
        }
    }

    async fn get(&self, url: String) -> Result<HttpResponse, LookupError> {
        self.http_client
            .execute(yahoo_request(url))
            .await
            .map_err(|error| LookupError::transport(format!("yahoo transport error: {error}")))
    }

    /// GET with the session crumb appended by `url`.
    ///
    /// A 401 means the crumb went stale: the rejected request is recorded,
    /// the handshake is repeated once and the request is sent again through
    /// `gate`. The final response is left to the caller's accounting.
    async fn authenticated_get(
        &self,
        gate: &dyn RequestGate,
        url: impl Fn(&str) -> String,
    ) -> Result<HttpResponse, LookupError> {
        let crumb = self.session.crumb(self.http_client.as_ref(), gate).await?;
        let started = Instant::now();
        let response = self.get(url(&crumb)).await?;
        if response.status != 401 {
            return Ok(response);
        }

        gate.record(started.elapsed(), CallOutcome::Other);
        self.session.invalidate(&crumb).await;
        let crumb = self.session.crumb(self.http_client.as_ref(), gate).await?;
        gate.admit().await;
        self.get(url(&crumb)).await
    }

    async fn execute_search(&self, query: &str) -> Result<Vec<SearchMatch>, LookupError> {
        let url = format!(
            "{SEARCH_URL}?q={}&quotesCount={SEARCH_RESULTS}&newsCount=0",
            urlencoding::encode(query)
        );
        let response = self.get(url).await?;
        if !response.is_success() {
            return Err(LookupError::from_status(response.status, &response.body));
        }

        let parsed: YahooSearchResponse = serde_json::from_str(&response.body).map_err(|error| {
            LookupError::invalid_response(format!("failed to parse search response: {error}"))
        })?;

        Ok(parsed
            .quotes
            .into_iter()
            .filter(|quote| !quote.symbol.trim().is_empty())
            .map(|quote| SearchMatch {
                symbol: quote.symbol,
                quote_type: quote.quote_type,
                exchange: quote.exchange,
                short_name: quote.short_name,
            })
            .collect())
    }

    async fn execute_fetch_detail(
        &self,
        symbol: &str,
        gate: &dyn RequestGate,
    ) -> Result<SecurityDetail, LookupError> {
        let response = self
            .authenticated_get(gate, |crumb| {
                format!(
                    "{QUOTE_SUMMARY_URL}/{}?modules=assetProfile&crumb={}",
                    urlencoding::encode(symbol),
                    urlencoding::encode(crumb)
                )
            })
            .await?;
        if !response.is_success() {
            return Err(LookupError::from_status(response.status, &response.body));
        }

        let parsed: YahooQuoteSummaryResponse =
            serde_json::from_str(&response.body).map_err(|error| {
                LookupError::invalid_response(format!("failed to parse quote summary: {error}"))
            })?;

        let result = parsed
            .quote_summary
            .result
            .unwrap_or_default()
            .into_iter()
            .next();
        let Some(result) = result else {
            let message = parsed
                .quote_summary
                .error
                .and_then(|error| error.description)
                .unwrap_or_else(|| format!("no quote summary for {symbol}"));
            return Err(LookupError::upstream(message));
        };

        let profile = result.asset_profile.unwrap_or_default();
        Ok(SecurityDetail {
            symbol: symbol.to_owned(),
            sector: profile.sector.filter(|sector| !sector.trim().is_empty()),
            industry: profile.industry,
        })
    }

    async fn execute_has_active_quote(
        &self,
        symbol: &str,
        gate: &dyn RequestGate,
    ) -> Result<bool, LookupError> {
        let response = self
            .authenticated_get(gate, |crumb| {
                format!(
                    "{CHART_URL}/{}?range=5d&interval=1d&crumb={}",
                    urlencoding::encode(symbol),
                    urlencoding::encode(crumb)
                )
            })
            .await?;

        // Unknown and delisted symbols come back as 404 with a chart error.
        if response.status == 404 {
            if let Ok(parsed) = serde_json::from_str::<YahooChartResponse>(&response.body) {
                if parsed.chart.error.is_some() {
                    return Ok(false);
                }
            }
        }
        if !response.is_success() {
            return Err(LookupError::from_status(response.status, &response.body));
        }

        let parsed: YahooChartResponse = serde_json::from_str(&response.body).map_err(|error| {
            LookupError::invalid_response(format!("failed to parse chart response: {error}"))
        })?;
        Ok(parsed.chart.has_prices())
    }
}

impl LookupProvider for YahooLookupProvider {
    fn search<'a>(&'a self, query: &'a str) -> LookupFuture<'a, Vec<SearchMatch>> {
        Box::pin(self.execute_search(query))
    }

    fn fetch_detail<'a>(
        &'a self,
        symbol: &'a str,
        gate: &'a dyn RequestGate,
    ) -> LookupFuture<'a, SecurityDetail> {
        Box::pin(self.execute_fetch_detail(symbol, gate))
    }

    fn has_active_quote<'a>(
        &'a self,
        symbol: &'a str,
        gate: &'a dyn RequestGate,
    ) -> LookupFuture<'a, bool> {
        Box::pin(self.execute_has_active_quote(symbol, gate))
    }
}

// ============================================================================
// Yahoo API response structures
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct YahooSearchResponse {
    #[serde(default)]
    quotes: Vec<YahooSearchQuote>,
}

#[derive(Debug, Clone, Deserialize)]
struct YahooSearchQuote {
    #[serde(default)]
    symbol: String,
    #[serde(rename = "shortname")]
    short_name: Option<String>,
    exchange: Option<String>,
    #[serde(rename = "quoteType")]
    quote_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct YahooQuoteSummaryResponse {
    #[serde(rename = "quoteSummary")]
    quote_summary: YahooQuoteSummaryData,
}

#[derive(Debug, Clone, Deserialize)]
struct YahooQuoteSummaryData {
    #[serde(default)]
    result: Option<Vec<YahooQuoteSummaryResult>>,
    #[serde(default)]
    error: Option<YahooApiError>,
}

#[derive(Debug, Clone, Deserialize)]
struct YahooApiError {
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct YahooQuoteSummaryResult {
    #[serde(rename = "assetProfile", default)]
    asset_profile: Option<YahooAssetProfile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct YahooAssetProfile {
    sector: Option<String>,
    industry: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct YahooChartResponse {
    chart: YahooChartData,
}

#[derive(Debug, Clone, Deserialize)]
struct YahooChartData {
    #[serde(default)]
    result: Option<Vec<YahooChartResult>>,
    #[serde(default)]
    error: Option<YahooApiError>,
}

impl YahooChartData {
    /// At least one session in the range has a close price.
    fn has_prices(&self) -> bool {
        self.result
            .iter()
            .flatten()
            .filter_map(|result| result.indicators.as_ref())
            .flat_map(|indicators| &indicators.quote)
            .flat_map(|quote| &quote.close)
            .any(Option::is_some)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct YahooChartResult {
    #[serde(default)]
    indicators: Option<YahooChartIndicators>,
}

#[derive(Debug, Clone, Deserialize)]
struct YahooChartIndicators {
    #[serde(default)]
    quote: Vec<YahooChartQuote>,
}

#[derive(Debug, Clone, Deserialize)]
struct YahooChartQuote {
    #[serde(default)]
    close: Vec<Option<f64>>,
}
