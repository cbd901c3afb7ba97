//! Lookup provider contract.
//!
//! A provider answers two questions: which instruments match a free-text
//! query, and what is known about one symbol. Every failure carries a
//! [`LookupErrorKind`] from which the call outcome is classified.
//!
//! Some providers need extra upstream requests to serve a call, such as a
//! session handshake. Those go through a [`RequestGate`] so they are paced by
//! the same limiter and counted in the same metrics as the call itself.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed future returned by provider calls.
pub type LookupFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LookupError>> + Send + 'a>>;

/// Classified result of one attempted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    RateLimited,
    ServerError,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupErrorKind {
    /// Explicit throttling signal from the provider.
    RateLimited,
    /// 500, 502, 503 or 504 from the provider.
    ServerError,
    /// Any other non-success status.
    Upstream,
    /// Connection, timeout or body read failure.
    Transport,
    /// Response body could not be understood.
    InvalidResponse,
}

/// Structured provider error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct LookupError {
    kind: LookupErrorKind,
    message: String,
}

impl LookupError {
    pub fn new(kind: LookupErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(LookupErrorKind::RateLimited, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(LookupErrorKind::ServerError, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(LookupErrorKind::Upstream, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(LookupErrorKind::Transport, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(LookupErrorKind::InvalidResponse, message)
    }

    /// Classifies a non-success HTTP response.
    pub fn from_status(status: u16, body: &str) -> Self {
        if status == 429 || body.to_ascii_lowercase().contains("too many requests") {
            return Self::rate_limited(format!("provider returned status {status}: too many requests"));
        }
        match status {
            500 | 502 | 503 | 504 => Self::server_error(format!("provider returned status {status}")),
            _ => Self::upstream(format!("provider returned status {status}")),
        }
    }

    pub const fn kind(&self) -> LookupErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn outcome(&self) -> CallOutcome {
        match self.kind {
            LookupErrorKind::RateLimited => CallOutcome::RateLimited,
            LookupErrorKind::ServerError => CallOutcome::ServerError,
            LookupErrorKind::Upstream
            | LookupErrorKind::Transport
            | LookupErrorKind::InvalidResponse => CallOutcome::Other,
        }
    }
}

/// One instrument returned by a search query, in provider order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchMatch {
    pub symbol: String,
    pub quote_type: Option<String>,
    pub exchange: Option<String>,
    pub short_name: Option<String>,
}

impl SearchMatch {
    pub fn equity(symbol: impl Into<String>, exchange: Option<&str>) -> Self {
        Self {
            symbol: symbol.into(),
            quote_type: Some(String::from("EQUITY")),
            exchange: exchange.map(str::to_owned),
            short_name: None,
        }
    }
}

/// Attributes of one symbol. Only the raw sector feeds classification.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecurityDetail {
    pub symbol: String,
    pub sector: Option<String>,
    pub industry: Option<String>,
}

/// Admission and accounting for upstream requests a provider makes on its own.
pub trait RequestGate: Send + Sync {
    /// Waits until one more request may be sent.
    fn admit(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Records the outcome of a request admitted through [`RequestGate::admit`].
    fn record(&self, latency: Duration, outcome: CallOutcome);
}

/// Gate that admits immediately and records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ungated;

impl RequestGate for Ungated {
    fn admit(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }

    fn record(&self, _latency: Duration, _outcome: CallOutcome) {}
}

/// Rate-limited upstream consulted by every enrichment job.
///
/// Each method is one logical call. Requests beyond the first that a method
/// needs go through `gate`.
pub trait LookupProvider: Send + Sync {
    fn search<'a>(&'a self, query: &'a str) -> LookupFuture<'a, Vec<SearchMatch>>;

    fn fetch_detail<'a>(
        &'a self,
        symbol: &'a str,
        gate: &'a dyn RequestGate,
    ) -> LookupFuture<'a, SecurityDetail>;

    /// Whether `symbol` has traded in the last few sessions.
    fn has_active_quote<'a>(
        &'a self,
        symbol: &'a str,
        gate: &'a dyn RequestGate,
    ) -> LookupFuture<'a, bool>;
}
