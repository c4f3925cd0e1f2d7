//! Collaborator contracts around the ledger: where snapshots come from,
//! who resolves coordinates, and where the finished table is published.

use std::path::PathBuf;

use async_trait::async_trait;
use caixa_core::{Coordinates, SnapshotRow};
use caixa_storage::FetchError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod archive;
mod geocoder;
mod listing;
mod snapshot;

pub use archive::{ArchiveCredentials, DryRunArchiveSink, InternetArchiveSink, IA_S3_ENDPOINT};
pub use geocoder::{NominatimGeocoder, NOMINATIM_ENDPOINT};
pub use listing::{extract_listing_key, parse_listing_html, ListingPageSource, DETAIL_BASE_URL};
pub use snapshot::{snapshot_file_name, write_snapshot_csv, CsvSnapshotSource};

pub const CRATE_NAME: &str = "caixa-adapters";

// Caixa pages and exports are often Latin-1; every byte maps to the same code point.
pub(crate) fn decode_text(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => err.into_bytes().iter().map(|&b| b as char).collect(),
    }
}

/// One region's listings as scraped at `fetched_at`, before any merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSnapshot {
    pub region: String,
    pub fetched_at: DateTime<Utc>,
    pub rows: Vec<SnapshotRow>,
    /// Rows the source could not decode at all.
    #[serde(default)]
    pub rejected_rows: usize,
}

impl RegionSnapshot {
    pub fn empty(region: &str, fetched_at: DateTime<Utc>) -> Self {
        Self {
            region: region.to_ascii_uppercase(),
            fetched_at,
            rows: Vec::new(),
            rejected_rows: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no snapshot for region {region} at {path}")]
    MissingSnapshot { region: String, path: PathBuf },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Scrape collaborator: yields the current listings of one region.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_region(&self, region: &str) -> Result<RegionSnapshot, AdapterError>;
}

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("geocoder timed out")]
    Timeout,
    #[error("geocoder unavailable: {0}")]
    Unavailable(String),
    #[error("malformed geocoder response: {0}")]
    Malformed(String),
}

/// Geocode collaborator. `Ok(None)` is a definitive "no such place";
/// errors are transient and worth retrying on a later run.
#[async_trait]
pub trait GeocodeLookup: Send + Sync {
    async fn lookup(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError>;
}

/// Descriptive metadata of the published archive item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveItem {
    pub identifier: String,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    pub identifier: String,
    pub files: Vec<String>,
    pub bytes: u64,
    pub dry_run: bool,
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive credentials missing; set IA_ACCESS_KEY and IA_SECRET_KEY")]
    MissingCredentials,
    #[error("nothing to upload")]
    NoFiles,
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Archival-upload collaborator for the finished historical table.
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    async fn upload(
        &self,
        item: &ArchiveItem,
        files: &[PathBuf],
        dry_run: bool,
    ) -> Result<UploadReport, ArchiveError>;
}
