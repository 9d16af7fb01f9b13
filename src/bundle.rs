//! Bundle splitting for `.xapk` archives.
//!
//! An XAPK is a zip archive holding the installable APK at its root plus OBB
//! expansion files. Splitting lets the user receive the pieces directly.

use crate::utils::safe_file_stem;
use std::io::{Cursor, Read};
use std::path::Path;
use thiserror::Error;
use zip::ZipArchive;

/// Extension marking a multi-file bundle artifact
pub const BUNDLE_EXTENSION: &str = ".xapk";
/// Suffix of the primary executable entry
pub const PRIMARY_SUFFIX: &str = ".apk";
/// Marker of auxiliary expansion-data entries
pub const AUXILIARY_MARKER: &str = ".obb";
/// Largest entry extracted from a bundle, in bytes
pub const MAX_ENTRY_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Errors raised while reading a bundle
#[derive(Error, Debug)]
pub enum BundleError {
    /// The archive is corrupt or not a zip file
    #[error("archive unreadable: {0}")]
    Archive(#[from] zip::result::ZipError),
    /// An entry could not be decompressed
    #[error("entry unreadable: {0}")]
    Entry(#[from] std::io::Error),
    /// An entry is larger than the extraction limit, declared or actual
    #[error("entry {name} exceeds {limit} bytes")]
    TooLarge {
        /// Entry name inside the archive
        name: String,
        /// Limit that was exceeded
        limit: u64,
    },
}

/// One file extracted from a bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFile {
    /// File content
    pub bytes: Vec<u8>,
    /// Delivered filename
    pub file_name: String,
}

/// Result of splitting a bundle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedBundle {
    /// First root-level primary entry, renamed after the application title
    pub primary: Option<BundleFile>,
    /// Auxiliary entries in archive order, named by their base filename
    pub auxiliary: Vec<BundleFile>,
}

impl ExtractedBundle {
    /// Whether splitting produced something worth delivering instead of the raw archive
    #[must_use]
    pub fn is_deliverable(&self) -> bool {
        self.primary.is_some() && !self.auxiliary.is_empty()
    }
}

/// Whether a filename denotes a multi-file bundle
#[must_use]
pub fn is_bundle(file_name: &str) -> bool {
    file_name.to_lowercase().ends_with(BUNDLE_EXTENSION)
}

/// Split a bundle archive into its primary and auxiliary files.
///
/// # Errors
///
/// Returns `BundleError` if the archive cannot be parsed or an entry exceeds
/// [`MAX_ENTRY_BYTES`]; callers deliver the raw artifact instead.
pub fn split(artifact: &[u8], display_title: &str) -> Result<ExtractedBundle, BundleError> {
    split_with_limit(artifact, display_title, MAX_ENTRY_BYTES)
}

fn split_with_limit(
    artifact: &[u8],
    display_title: &str,
    limit: u64,
) -> Result<ExtractedBundle, BundleError> {
    let mut archive = ZipArchive::new(Cursor::new(artifact))?;
    let mut bundle = ExtractedBundle::default();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();

        if name.ends_with(PRIMARY_SUFFIX) && !name.contains('/') {
            // Later root-level duplicates are dropped
            if bundle.primary.is_none() {
                let declared = entry.size();
                let bytes = read_entry(&mut entry, declared, &name, limit)?;
                bundle.primary = Some(BundleFile {
                    bytes,
                    file_name: format!("{}{PRIMARY_SUFFIX}", safe_file_stem(display_title)),
                });
            }
        } else if name.to_lowercase().contains(AUXILIARY_MARKER) {
            let declared = entry.size();
            let bytes = read_entry(&mut entry, declared, &name, limit)?;
            let file_name = Path::new(&name)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(&name)
                .to_string();
            bundle.auxiliary.push(BundleFile { bytes, file_name });
        }
    }

    Ok(bundle)
}

/// Read one entry without trusting its declared size
fn read_entry<R: Read>(
    entry: R,
    declared: u64,
    name: &str,
    limit: u64,
) -> Result<Vec<u8>, BundleError> {
    let too_large = || BundleError::TooLarge {
        name: name.to_string(),
        limit,
    };
    if declared > limit {
        return Err(too_large());
    }

    let mut bytes = Vec::new();
    entry.take(limit.saturating_add(1)).read_to_end(&mut bytes)?;
    if u64::try_from(bytes.len()).map_or(true, |len| len > limit) {
        return Err(too_large());
    }
    Ok(bytes)
}
