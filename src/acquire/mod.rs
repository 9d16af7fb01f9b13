//! Artifact acquisition: download API first, local fallback tool second.
//!
//! Neither tier failing is fatal; [`Acquirer::acquire`] only reports
//! [`AcquireError::Exhausted`] once both tiers have been tried.

mod http;
mod tool;

pub use http::{filename_from_disposition, HttpSource};
pub use tool::ToolSource;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Errors raised by a single acquisition tier
#[derive(Error, Debug)]
pub enum SourceError {
    /// Network failure or timeout
    #[error("request failed: {0}")]
    Request(String),
    /// Endpoint answered with an unexpected status
    #[error("unexpected status {0}")]
    Status(u16),
    /// Endpoint answered with something that is not an artifact
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// The fallback tool could not be started
    #[error("failed to spawn tool: {0}")]
    Spawn(#[source] std::io::Error),
    /// The fallback tool exited unsuccessfully
    #[error("tool exited with {0}")]
    ToolFailed(String),
    /// The fallback tool ran past its deadline and was killed
    #[error("tool timed out after {0}s")]
    Timeout(u64),
    /// The path printed by the tool could not be read
    #[error("artifact unreadable at {path}: {source}")]
    Unreadable {
        /// Path printed by the tool
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the acquirer as a whole
#[derive(Error, Debug)]
pub enum AcquireError {
    /// Both tiers failed; no artifact is available
    #[error("all acquisition tiers failed (primary: {primary}; fallback: {fallback})")]
    Exhausted {
        /// Tier-1 failure
        primary: SourceError,
        /// Tier-2 failure
        fallback: SourceError,
    },
}

/// Binary artifact produced by one acquisition run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredArtifact {
    /// Raw artifact bytes
    pub bytes: Vec<u8>,
    /// Suggested filename; its extension tells single file from bundle
    pub file_name: String,
    /// Size in bytes
    pub size: u64,
}

impl AcquiredArtifact {
    /// Wrap downloaded bytes under a filename
    #[must_use]
    pub fn new(bytes: Vec<u8>, file_name: impl Into<String>) -> Self {
        let size = bytes.len() as u64;
        Self {
            bytes,
            file_name: file_name.into(),
            size,
        }
    }

    /// Lowercased filename extension (`apk`, `xapk`, ...), `bin` when absent
    #[must_use]
    pub fn file_type(&self) -> String {
        std::path::Path::new(&self.file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map_or_else(|| "bin".to_string(), str::to_lowercase)
    }
}

/// One way of obtaining an artifact for a catalog identifier
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;
    /// Retrieve the artifact
    async fn fetch(&self, catalog_id: &str) -> Result<AcquiredArtifact, SourceError>;
}

/// Two-tier acquirer
#[derive(Clone)]
pub struct Acquirer {
    primary: Arc<dyn ArtifactSource>,
    fallback: Arc<dyn ArtifactSource>,
}

impl Acquirer {
    /// Create an acquirer from a primary and a fallback source
    #[must_use]
    pub fn new(primary: Arc<dyn ArtifactSource>, fallback: Arc<dyn ArtifactSource>) -> Self {
        Self { primary, fallback }
    }

    /// Retrieve the artifact for `catalog_id`, trying the fallback only if the primary fails.
    ///
    /// # Errors
    ///
    /// Returns `AcquireError::Exhausted` when both tiers fail.
    pub async fn acquire(
        &self,
        catalog_id: &str,
        display_title: &str,
    ) -> Result<AcquiredArtifact, AcquireError> {
        let primary = match self.primary.fetch(catalog_id).await {
            Ok(artifact) => {
                info!(
                    catalog_id = %catalog_id,
                    tier = self.primary.name(),
                    file_name = %artifact.file_name,
                    size = artifact.size,
                    "Artifact acquired"
                );
                return Ok(artifact);
            }
            Err(e) => e,
        };

        warn!(
            catalog_id = %catalog_id,
            title = %display_title,
            tier = self.primary.name(),
            error = %primary,
            "Primary acquisition failed, trying fallback"
        );

        match self.fallback.fetch(catalog_id).await {
            Ok(artifact) => {
                info!(
                    catalog_id = %catalog_id,
                    tier = self.fallback.name(),
                    file_name = %artifact.file_name,
                    size = artifact.size,
                    "Artifact acquired"
                );
                Ok(artifact)
            }
            Err(fallback) => {
                warn!(
                    catalog_id = %catalog_id,
                    tier = self.fallback.name(),
                    error = %fallback,
                    "Fallback acquisition failed"
                );
                Err(AcquireError::Exhausted { primary, fallback })
            }
        }
    }
}
