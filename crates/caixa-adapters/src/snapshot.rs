use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use caixa_core::SnapshotRow;
use caixa_storage::write_atomic;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, warn};

use crate::{decode_text, AdapterError, RegionSnapshot, SnapshotSource};

pub fn snapshot_file_name(region: &str) -> String {
    format!("imoveis_{}.csv", region.trim().to_ascii_uppercase())
}

/// Reads the per-region snapshot files `imoveis_<REGION>.csv` from one directory.
#[derive(Debug, Clone)]
pub struct CsvSnapshotSource {
    dir: PathBuf,
}

impl CsvSnapshotSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, region: &str) -> PathBuf {
        self.dir.join(snapshot_file_name(region))
    }
}

#[async_trait]
impl SnapshotSource for CsvSnapshotSource {
    fn name(&self) -> &'static str {
        "csv-snapshots"
    }

    async fn fetch_region(&self, region: &str) -> Result<RegionSnapshot, AdapterError> {
        let path = self.path_for(region);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(AdapterError::MissingSnapshot {
                    region: region.to_string(),
                    path,
                })
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("reading snapshot {}", path.display()))
                    .into())
            }
        };

        let fetched_at = fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let mut snapshot = RegionSnapshot::empty(region, fetched_at);
        let text = decode_text(bytes);
        if text.trim().is_empty() {
            debug!(region, path = %path.display(), "snapshot file is empty");
            return Ok(snapshot);
        }

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(text.as_bytes());
        for (idx, row) in reader.deserialize::<SnapshotRow>().enumerate() {
            match row {
                Ok(row) => snapshot.rows.push(row),
                Err(err) => {
                    warn!(region, row = idx + 1, error = %err, "undecodable snapshot row skipped");
                    snapshot.rejected_rows += 1;
                }
            }
        }
        debug!(region, rows = snapshot.rows.len(), "snapshot loaded");
        Ok(snapshot)
    }
}

/// Persist a scraped snapshot as `imoveis_<REGION>.csv` under `dir`.
pub async fn write_snapshot_csv(dir: &Path, snapshot: &RegionSnapshot) -> anyhow::Result<PathBuf> {
    let path = dir.join(snapshot_file_name(&snapshot.region));
    let mut writer = csv::Writer::from_writer(Vec::new());
    if snapshot.rows.is_empty() {
        writer
            .write_record(SNAPSHOT_COLUMNS)
            .context("writing snapshot header")?;
    }
    for row in &snapshot.rows {
        writer
            .serialize(row)
            .with_context(|| format!("encoding snapshot row {}", row.key))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("flushing snapshot buffer: {}", e.error()))?;
    write_atomic(&path, &bytes).await?;
    Ok(path)
}

const SNAPSHOT_COLUMNS: [&str; 11] = [
    "key",
    "address",
    "neighborhood",
    "description",
    "price",
    "appraised_value",
    "discount",
    "sale_modality",
    "photo",
    "city",
    "region",
];
