use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use caixa_core::HistoricalRecord;
use caixa_storage::{sha256_hex, write_atomic};
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tokio::fs;

pub const PARQUET_FILE_NAME: &str = "imoveis_BR.parquet";
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub rows: usize,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ExportOutput {
    pub parquet_path: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest: ExportManifest,
}

/// Write the ledger as `imoveis_BR.parquet` plus a checksum manifest under `dir`.
pub async fn export_parquet(records: &[HistoricalRecord], dir: &Path) -> Result<ExportOutput> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let parquet_path = dir.join(PARQUET_FILE_NAME);
    let bytes = encode_parquet(records)?;
    write_atomic(&parquet_path, &bytes)
        .await
        .with_context(|| format!("writing {}", parquet_path.display()))?;

    let manifest = ExportManifest {
        schema_version: 1,
        rows: records.len(),
        files: vec![manifest_entry("imoveis_br", PARQUET_FILE_NAME, &bytes)],
    };
    let manifest_path = dir.join(MANIFEST_FILE_NAME);
    let json = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    write_atomic(&manifest_path, &json)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    tracing::info!(rows = records.len(), path = %parquet_path.display(), "parquet export written");
    Ok(ExportOutput {
        parquet_path,
        manifest_path,
        manifest,
    })
}

fn ledger_schema() -> Schema {
    let text = |name: &str, nullable: bool| ArrowField::new(name, DataType::Utf8, nullable);
    let number = |name: &str| ArrowField::new(name, DataType::Float64, true);
    Schema::new(vec![
        text("key", false),
        text("address", false),
        text("neighborhood", false),
        text("description", false),
        number("price"),
        number("appraised_value"),
        number("discount"),
        text("sale_modality", false),
        text("photo", false),
        text("city", false),
        text("region", false),
        number("latitude"),
        number("longitude"),
        text("first_seen", false),
        text("last_seen", false),
    ])
}

fn text_column<'a>(records: &'a [HistoricalRecord], f: impl Fn(&'a HistoricalRecord) -> &'a str) -> ArrayRef {
    Arc::new(StringArray::from(records.iter().map(f).collect::<Vec<_>>()))
}

fn number_column(records: &[HistoricalRecord], f: impl Fn(&HistoricalRecord) -> Option<f64>) -> ArrayRef {
    Arc::new(Float64Array::from(records.iter().map(f).collect::<Vec<_>>()))
}

fn date_column(records: &[HistoricalRecord], f: impl Fn(&HistoricalRecord) -> NaiveDate) -> ArrayRef {
    Arc::new(StringArray::from(
        records.iter().map(|r| f(r).to_string()).collect::<Vec<_>>(),
    ))
}

fn encode_parquet(records: &[HistoricalRecord]) -> Result<Vec<u8>> {
    let columns = vec![
        text_column(records, |r| r.listing.key.as_str()),
        text_column(records, |r| r.listing.address.as_str()),
        text_column(records, |r| r.listing.neighborhood.as_str()),
        text_column(records, |r| r.listing.description.as_str()),
        number_column(records, |r| r.listing.price),
        number_column(records, |r| r.listing.appraised_value),
        number_column(records, |r| r.listing.discount),
        text_column(records, |r| r.listing.sale_modality.as_str()),
        text_column(records, |r| r.listing.photo.as_str()),
        text_column(records, |r| r.listing.city.as_str()),
        text_column(records, |r| r.listing.region.as_str()),
        number_column(records, |r| r.coordinates.map(|c| c.latitude)),
        number_column(records, |r| r.coordinates.map(|c| c.longitude)),
        date_column(records, |r| r.first_seen),
        date_column(records, |r| r.last_seen),
    ];

    let schema = Arc::new(ledger_schema());
    let batch = RecordBatch::try_new(schema.clone(), columns).context("building ledger record batch")?;
    let mut writer =
        ArrowWriter::try_new(Vec::new(), schema, None).context("opening parquet writer")?;
    writer.write(&batch).context("writing ledger record batch")?;
    writer.into_inner().context("closing parquet writer")
}

fn manifest_entry(name: &str, rel_path: &str, bytes: &[u8]) -> ExportManifestFile {
    ExportManifestFile {
        name: name.to_string(),
        path: rel_path.to_string(),
        sha256: sha256_hex(bytes),
        bytes: bytes.len() as u64,
    }
}
