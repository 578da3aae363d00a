//! Library store for playable media files.
//!
//! A flat directory of media files served to receivers over HTTP. Writers
//! never stream into a final name: new content is moved or committed with a
//! rename, so the file server and later pipeline stages only ever observe
//! complete files.

mod store;

use std::path::PathBuf;

use serde::Serialize;
pub use store::MediaLibrary;

/// Prefix of in-flight files inside the library directory.
pub(crate) const STAGING_PREFIX: &str = ".tidecast-";
/// Suffix of in-flight files inside the library directory.
pub(crate) const STAGING_SUFFIX: &str = ".partial";

/// A complete file inside the library store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaFile {
    /// File name, unique within the library
    pub name: String,
    /// Size in bytes
    pub size: u64,
}

impl MediaFile {
    /// Container format derived from the name suffix, lowercased.
    pub fn format(&self) -> Option<String> {
        file_suffix(&self.name)
    }

    /// Size rendered the way the listing endpoint reports it.
    pub fn size_label(&self) -> String {
        format_megabytes(self.size)
    }
}

/// Listing entry as exposed by the library endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibraryEntry {
    pub name: String,
    pub size: String,
}

impl From<&MediaFile> for LibraryEntry {
    fn from(file: &MediaFile) -> Self {
        Self {
            name: file.name.clone(),
            size: file.size_label(),
        }
    }
}

/// Formats a byte count as decimal megabytes with two decimals, e.g. `2.50mb`.
pub fn format_megabytes(bytes: u64) -> String {
    format!("{:.2}mb", bytes as f64 / 1_000_000.0)
}

/// Returns the lowercased suffix after the last dot, if any.
pub fn file_suffix(name: &str) -> Option<String> {
    let (stem, suffix) = name.rsplit_once('.')?;
    if stem.is_empty() || suffix.is_empty() {
        return None;
    }
    Some(suffix.to_ascii_lowercase())
}

/// Checks whether `name` ends with `.suffix`, ignoring ASCII case.
pub fn has_suffix(name: &str, suffix: &str) -> bool {
    file_suffix(name).is_some_and(|s| s.eq_ignore_ascii_case(suffix))
}

/// Errors that occur while reading or writing the library store.
#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    /// Name is empty or would escape the library directory
    #[error("Invalid media file name: {name:?}")]
    InvalidName { name: String },

    /// Requested file is not present in the library
    #[error("Media file not found: {name}")]
    NotFound { name: String },

    /// Moving or committing a file into the library failed
    #[error("Failed to place {name} into library: {source}")]
    Relocation {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// Library directory could not be read or created
    #[error("Library directory {path} unavailable: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_megabyte_formatting() {
        assert_eq!(format_megabytes(1_000_000), "1.00mb");
        assert_eq!(format_megabytes(2_500_000), "2.50mb");
        assert_eq!(format_megabytes(0), "0.00mb");
        assert_eq!(format_megabytes(1_234_567), "1.23mb");
    }

    #[test]
    fn test_file_suffix() {
        assert_eq!(file_suffix("movie.MKV").as_deref(), Some("mkv"));
        assert_eq!(file_suffix("archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(file_suffix("README"), None);
        assert_eq!(file_suffix(".hidden"), None);
        assert_eq!(file_suffix("trailing."), None);
        assert!(has_suffix("Bao.2018.720p.mkv", "mkv"));
        assert!(!has_suffix("Bao.2018.720p.mkv.txt", "mkv"));
    }

    #[test]
    fn test_listing_entry_from_media_file() {
        let file = MediaFile {
            name: "clip.mp4".to_string(),
            size: 2_500_000,
        };
        let entry = LibraryEntry::from(&file);
        assert_eq!(entry.name, "clip.mp4");
        assert_eq!(entry.size, "2.50mb");
        assert_eq!(file.format().as_deref(), Some("mp4"));
    }

    proptest! {
        #[test]
        fn megabyte_label_always_has_two_decimals(bytes in 0u64..10_000_000_000_000) {
            let label = format_megabytes(bytes);
            prop_assert!(label.ends_with("mb"));
            let number = label.trim_end_matches("mb");
            let (_, decimals) = number.split_once('.').unwrap();
            prop_assert_eq!(decimals.len(), 2);
        }
    }
}
