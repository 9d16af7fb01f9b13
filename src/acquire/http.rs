use super::{AcquiredArtifact, ArtifactSource, SourceError};
use crate::config::{get_acquire_http_timeout, ACQUIRE_MAX_REDIRECTS};
use async_trait::async_trait;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{redirect, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Tier 1: `GET {base}/download/{catalog_id}` on the download API
pub struct HttpSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSource {
    /// Create a source for the given base URL with the configured timeout
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self::with_timeout(base_url, get_acquire_http_timeout())
    }

    /// Create a source with an explicit timeout
    #[must_use]
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Self {
        let client = match reqwest::Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::limited(ACQUIRE_MAX_REDIRECTS))
            .build()
        {
            Ok(client) => client,
            Err(_) => reqwest::Client::new(),
        };

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn download_url(&self, catalog_id: &str) -> String {
        format!("{}/download/{catalog_id}", self.base_url)
    }
}

/// Extract the filename from a `Content-Disposition` header value.
///
/// Handles quoted and bare `filename=` parameters; directory components are
/// dropped so the result is always a plain file name.
///
/// # Examples
///
/// ```
/// use apk_courier::acquire::filename_from_disposition;
/// assert_eq!(
///     filename_from_disposition(r#"attachment; filename="game.xapk""#),
///     Some("game.xapk".to_string())
/// );
/// assert_eq!(filename_from_disposition("inline"), None);
/// ```
#[must_use]
pub fn filename_from_disposition(header: &str) -> Option<String> {
    let (_, raw) = lazy_regex::regex_captures!(r#"filename[^;=\n]*=\s*([^;\n]*)"#, header)?;
    let unquoted = raw.trim().trim_matches(|c| c == '"' || c == '\'');
    let name = unquoted.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    (!name.is_empty()).then(|| name.to_string())
}

#[async_trait]
impl ArtifactSource for HttpSource {
    fn name(&self) -> &'static str {
        "download-api"
    }

    async fn fetch(&self, catalog_id: &str) -> Result<AcquiredArtifact, SourceError> {
        let url = self.download_url(catalog_id);
        debug!(url = %url, "Download API request");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::Request(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(SourceError::Status(status.as_u16()));
        }

        let is_html = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("html"));
        if is_html {
            return Err(SourceError::InvalidPayload(
                "received an HTML page instead of an artifact".into(),
            ));
        }

        let file_name = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(filename_from_disposition)
            .unwrap_or_else(|| format!("{catalog_id}.apk"));

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SourceError::Request(e.to_string()))?;
        if bytes.is_empty() {
            return Err(SourceError::InvalidPayload("empty body".into()));
        }

        Ok(AcquiredArtifact::new(bytes.to_vec(), file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_disposition_parsing() {
        assert_eq!(
            filename_from_disposition("attachment; filename=com.game.xapk"),
            Some("com.game.xapk".to_string())
        );
        assert_eq!(
            filename_from_disposition("attachment; filename='wa.apk'; size=12"),
            Some("wa.apk".to_string())
        );
        assert_eq!(
            filename_from_disposition(r#"attachment; filename="../../etc/evil.apk""#),
            Some("evil.apk".to_string())
        );
        assert_eq!(filename_from_disposition("attachment; filename=\"\""), None);
        assert_eq!(filename_from_disposition("attachment"), None);
    }

    #[tokio::test]
    async fn test_fetch_uses_disposition_name() -> Result<(), SourceError> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/download/com.game"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Disposition", "attachment; filename=\"Game.xapk\"")
                    .insert_header("Content-Type", "application/octet-stream")
                    .set_body_bytes(vec![0x50, 0x4b, 0x03, 0x04]),
            )
            .mount(&server)
            .await;

        let source = HttpSource::with_timeout(&server.uri(), Duration::from_secs(5));
        let artifact = source.fetch("com.game").await?;
        assert_eq!(artifact.file_name, "Game.xapk");
        assert_eq!(artifact.size, 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_synthesizes_name() -> Result<(), SourceError> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/download/com.whatsapp"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1, 2, 3]))
            .mount(&server)
            .await;

        let source = HttpSource::with_timeout(&format!("{}/", server.uri()), Duration::from_secs(5));
        let artifact = source.fetch("com.whatsapp").await?;
        assert_eq!(artifact.file_name, "com.whatsapp.apk");
        assert_eq!(artifact.bytes, vec![1, 2, 3]);
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_rejects_non_ok_and_html() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/download/com.missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/download/com.landing"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html; charset=utf-8"),
            )
            .mount(&server)
            .await;

        let source = HttpSource::with_timeout(&server.uri(), Duration::from_secs(5));
        assert!(matches!(
            source.fetch("com.missing").await,
            Err(SourceError::Status(404))
        ));
        assert!(matches!(
            source.fetch("com.landing").await,
            Err(SourceError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_unreachable_host() {
        let source = HttpSource::with_timeout("http://127.0.0.1:9", Duration::from_secs(2));
        assert!(matches!(
            source.fetch("com.any").await,
            Err(SourceError::Request(_))
        ));
    }
}
