// src/adapter.rs
//! Marketplace adapter seam.
//!
//! Each marketplace is wrapped by one [`SourceAdapter`]. The core treats them
//! identically: given a target and a page budget, an adapter returns raw
//! candidate records or a typed [`FetchError`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::geo::Target;

/// Identifier of a marketplace (lowercase, e.g. `"ebay"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Candidate record exactly as an adapter extracted it: raw marketplace text,
/// not yet validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub title: String,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub mileage: Option<String>,
    #[serde(default)]
    pub year: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub listing_url: Option<String>,
    /// Seller label as shown by the marketplace ("Trade", "Private seller"...).
    #[serde(default)]
    pub seller_type: Option<String>,
    /// Sale format label ("Auction", "Buy it now"...).
    #[serde(default)]
    pub listing_format: Option<String>,
}

/// Opaque proxy pool handle. The core passes it through to adapters unexamined.
#[derive(Clone)]
pub struct ProxyHandle(Arc<dyn Any + Send + Sync>);

impl ProxyHandle {
    pub fn new<T: Any + Send + Sync>(pool: T) -> Self {
        Self(Arc::new(pool))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProxyHandle(..)")
    }
}

/// One fetch: a target, how many result pages to walk, and an optional proxy pool.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub target: Target,
    pub page_budget: u32,
    pub proxy: Option<ProxyHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out")]
    Timeout,
    #[error("rate limited")]
    RateLimited,
    #[error("parse error: {0}")]
    Parse(String),
    #[error("malformed request: {0}")]
    Malformed(String),
}

/// Error kind without payload, as reported in outcomes and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchErrorKind {
    Network,
    Timeout,
    RateLimited,
    Parse,
    Malformed,
}

impl FetchErrorKind {
    /// Network, timeout and rate limiting are transient; everything else fails fast.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FetchErrorKind::Network | FetchErrorKind::Timeout | FetchErrorKind::RateLimited
        )
    }
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Network(_) => FetchErrorKind::Network,
            FetchError::Timeout => FetchErrorKind::Timeout,
            FetchError::RateLimited => FetchErrorKind::RateLimited,
            FetchError::Parse(_) => FetchErrorKind::Parse,
            FetchError::Malformed(_) => FetchErrorKind::Malformed,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Marketplace this adapter talks to.
    fn source(&self) -> SourceId;

    async fn fetch(&self, request: FetchRequest) -> Result<Vec<RawRecord>, FetchError>;
}

impl fmt::Debug for dyn SourceAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceAdapter({})", self.source())
    }
}

pub type DynAdapter = Arc<dyn SourceAdapter>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_ids_are_case_insensitive() {
        assert_eq!(SourceId::new(" eBay "), SourceId::new("ebay"));
        assert_eq!(SourceId::new("Gumtree").to_string(), "gumtree");
    }

    #[test]
    fn retryable_kinds() {
        assert!(FetchError::Network("reset".into()).is_retryable());
        assert!(FetchError::Timeout.is_retryable());
        assert!(FetchError::RateLimited.is_retryable());
        assert!(!FetchError::Parse("bad html".into()).is_retryable());
        assert!(!FetchError::Malformed("no postcode".into()).is_retryable());
    }

    #[test]
    fn proxy_handle_is_opaque_but_downcastable() {
        let h = ProxyHandle::new(vec!["http://10.0.0.1:8080".to_string()]);
        assert_eq!(h.downcast_ref::<Vec<String>>().map(|v| v.len()), Some(1));
        assert!(h.downcast_ref::<u32>().is_none());
    }
}
