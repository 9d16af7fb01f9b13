//! Catalog provider: ranked search and exact lookup of applications.
//!
//! The broker only depends on [`CatalogProvider`]; [`HttpCatalog`] speaks to
//! a google-play-scraper style REST service.

use crate::config::CATALOG_TIMEOUT_SECS;
use async_trait::async_trait;
use lazy_regex::regex_is_match;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors returned by catalog providers
#[derive(Error, Debug)]
pub enum CatalogError {
    /// No entry exists for the requested identifier
    #[error("application not found: {0}")]
    NotFound(String),
    /// The provider could not be reached or answered with an error
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for CatalogError {
    fn from(e: reqwest::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

/// Raw catalog entry as returned by the provider
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogHit {
    /// Application title
    pub title: String,
    /// Package identifier
    #[serde(default, alias = "id", alias = "packageName")]
    pub app_id: Option<String>,
    /// Developer name
    #[serde(default)]
    pub developer: Option<String>,
    /// Average rating
    #[serde(default)]
    pub score: Option<f64>,
    /// Icon URL
    #[serde(default)]
    pub icon: Option<String>,
    /// Store page URL
    #[serde(default)]
    pub url: Option<String>,
    /// Human-readable install count
    #[serde(default)]
    pub installs: Option<String>,
    /// Human-readable package size
    #[serde(default)]
    pub size: Option<String>,
    /// Current version
    #[serde(default)]
    pub version: Option<String>,
    /// Long description
    #[serde(default)]
    pub description: Option<String>,
}

impl CatalogHit {
    /// Package identifier, recovered from the store URL when the field is missing
    #[must_use]
    pub fn resolved_id(&self) -> Option<String> {
        self.app_id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| self.url.as_deref().and_then(id_from_store_url))
    }
}

fn id_from_store_url(url: &str) -> Option<String> {
    lazy_regex::regex_captures!(r"[?&]id=([^&#]+)", url).map(|(_, id)| id.to_string())
}

/// Immutable snapshot of one ranked hit, as shown to the user
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// Application title
    pub title: String,
    /// Package identifier (empty when the provider returned none)
    pub catalog_id: String,
    /// Developer name (empty when absent)
    pub developer: String,
    /// Average rating, `0.0` when absent
    pub rating: f64,
    /// Icon URL
    pub icon_url: Option<String>,
    /// Store page URL
    pub store_url: String,
    /// 1-based position in the rendered list
    pub index: usize,
}

impl SearchResult {
    fn from_hit(hit: &CatalogHit, index: usize) -> Self {
        Self {
            title: hit.title.clone(),
            catalog_id: hit.resolved_id().unwrap_or_default(),
            developer: hit.developer.clone().unwrap_or_default(),
            rating: hit.score.unwrap_or(0.0),
            icon_url: hit.icon.clone(),
            store_url: hit.url.clone().unwrap_or_default(),
            index,
        }
    }
}

/// Full details of one application, used for the details card
#[derive(Debug, Clone, PartialEq)]
pub struct AppDetails {
    /// Application title
    pub title: String,
    /// Package identifier
    pub catalog_id: String,
    /// Average rating
    pub rating: Option<f64>,
    /// Human-readable install count
    pub installs: Option<String>,
    /// Human-readable package size
    pub size: Option<String>,
    /// Current version
    pub version: Option<String>,
    /// Developer name
    pub developer: Option<String>,
    /// Long description
    pub description: Option<String>,
    /// Icon URL
    pub icon_url: Option<String>,
}

impl AppDetails {
    /// Build details from a provider hit, falling back to `fallback_id` for the identifier
    #[must_use]
    pub fn from_hit(hit: CatalogHit, fallback_id: &str) -> Self {
        let catalog_id = hit.resolved_id().unwrap_or_else(|| fallback_id.to_string());
        Self {
            title: hit.title,
            catalog_id,
            rating: hit.score,
            installs: hit.installs,
            size: hit.size,
            version: hit.version,
            developer: hit.developer,
            description: hit.description,
            icon_url: hit.icon,
        }
    }
}

/// Interface for catalog providers
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    /// Ranked text search, at most `limit` hits
    async fn search_by_term(&self, term: &str, limit: usize) -> Result<Vec<CatalogHit>, CatalogError>;
    /// Exact lookup by package identifier
    async fn get_by_id(&self, id: &str) -> Result<CatalogHit, CatalogError>;
}

/// Whether `text` looks like a dot-separated package identifier
///
/// # Examples
///
/// ```
/// use apk_courier::catalog::is_package_id;
/// assert!(is_package_id("com.whatsapp"));
/// assert!(!is_package_id("whatsapp messenger"));
/// ```
#[must_use]
pub fn is_package_id(text: &str) -> bool {
    regex_is_match!(r"^(?i)[a-z][a-z0-9_]*(\.[a-z0-9_]+)+$", text.trim())
}

/// Resolve free text into ranked results.
///
/// Package identifiers are tried as an exact lookup first; a failed lookup,
/// or any other text, falls back to a ranked search capped at `limit`.
///
/// # Errors
///
/// Returns `CatalogError::Unavailable` if the ranked search itself fails.
pub async fn resolve_query(
    catalog: &dyn CatalogProvider,
    text: &str,
    limit: usize,
) -> Result<Vec<SearchResult>, CatalogError> {
    let term = text.trim();
    let hits = if is_package_id(term) {
        match catalog.get_by_id(term).await {
            Ok(hit) => vec![hit],
            Err(e) => {
                debug!(query = %term, error = %e, "Exact lookup failed, falling back to search");
                catalog.search_by_term(term, limit).await?
            }
        }
    } else {
        catalog.search_by_term(term, limit).await?
    };

    Ok(hits
        .iter()
        .take(limit)
        .enumerate()
        .map(|(idx, hit)| SearchResult::from_hit(hit, idx + 1))
        .collect())
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<CatalogHit>,
}

/// Catalog provider backed by an HTTP search service
pub struct HttpCatalog {
    base_url: String,
    client: reqwest::Client,
}

impl HttpCatalog {
    /// Create a new catalog client with the default timeout
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(CATALOG_TIMEOUT_SECS))
    }

    fn with_timeout(base_url: &str, timeout: Duration) -> Self {
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(_) => reqwest::Client::new(),
        };

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn endpoint_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl CatalogProvider for HttpCatalog {
    async fn search_by_term(&self, term: &str, limit: usize) -> Result<Vec<CatalogHit>, CatalogError> {
        let url = self.endpoint_url("api/apps/");
        debug!(url = %url, term = %term, "Catalog search");

        let num = limit.to_string();
        let response = self
            .client
            .get(url)
            .query(&[("q", term), ("num", num.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Unavailable(format!("search returned {status}")));
        }

        let body: SearchResponse = response.json().await?;
        Ok(body.results)
    }

    async fn get_by_id(&self, id: &str) -> Result<CatalogHit, CatalogError> {
        let url = self.endpoint_url(&format!("api/apps/{id}"));
        debug!(url = %url, "Catalog lookup");

        let response = self.client.get(url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(CatalogError::NotFound(id.to_string())),
            status if !status.is_success() => Err(CatalogError::Unavailable(format!(
                "lookup returned {status}"
            ))),
            _ => Ok(response.json().await?),
        }
    }
}
