use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use caixa_core::{Coordinates, HistoricalRecord, NormalizedListing};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::write_atomic;

/// Column order of the persisted ledger. The header is written even for an empty ledger.
pub const LEDGER_COLUMNS: [&str; 15] = [
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
    "latitude",
    "longitude",
    "first_seen",
    "last_seen",
];

// Field order must match LEDGER_COLUMNS.
#[derive(Debug, Serialize, Deserialize)]
struct LedgerRow {
    key: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    neighborhood: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    appraised_value: Option<f64>,
    #[serde(default)]
    discount: Option<f64>,
    #[serde(default)]
    sale_modality: String,
    #[serde(default)]
    photo: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    first_seen: NaiveDate,
    last_seen: NaiveDate,
}

impl From<&HistoricalRecord> for LedgerRow {
    fn from(record: &HistoricalRecord) -> Self {
        let l = &record.listing;
        Self {
            key: l.key.clone(),
            address: l.address.clone(),
            neighborhood: l.neighborhood.clone(),
            description: l.description.clone(),
            price: l.price,
            appraised_value: l.appraised_value,
            discount: l.discount,
            sale_modality: l.sale_modality.clone(),
            photo: l.photo.clone(),
            city: l.city.clone(),
            region: l.region.clone(),
            latitude: record.coordinates.map(|c| c.latitude),
            longitude: record.coordinates.map(|c| c.longitude),
            first_seen: record.first_seen,
            last_seen: record.last_seen,
        }
    }
}

impl From<LedgerRow> for HistoricalRecord {
    fn from(row: LedgerRow) -> Self {
        let coordinates = match (row.latitude, row.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinates {
                latitude,
                longitude,
            }),
            _ => None,
        };
        Self {
            listing: NormalizedListing {
                key: row.key,
                address: row.address,
                neighborhood: row.neighborhood,
                description: row.description,
                price: row.price,
                appraised_value: row.appraised_value,
                discount: row.discount,
                sale_modality: row.sale_modality,
                photo: row.photo,
                city: row.city,
                region: row.region,
            },
            coordinates,
            first_seen: row.first_seen,
            last_seen: row.last_seen,
        }
    }
}

/// The historical ledger file: CSV, loaded at the start of a run and replaced at the end.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` on first run (file absent or zero bytes). Any unreadable row is fatal.
    pub async fn load(&self) -> anyhow::Result<Option<Vec<HistoricalRecord>>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no ledger yet; starting from an empty table");
                return Ok(None);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading ledger {}", self.path.display()))
            }
        };
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            info!(path = %self.path.display(), "ledger file is empty; starting from an empty table");
            return Ok(None);
        }

        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let mut records = Vec::new();
        for (idx, row) in reader.deserialize::<LedgerRow>().enumerate() {
            let row = row.with_context(|| {
                format!("parsing ledger {} data row {}", self.path.display(), idx + 1)
            })?;
            records.push(HistoricalRecord::from(row));
        }
        debug!(path = %self.path.display(), rows = records.len(), "ledger loaded");
        Ok(Some(records))
    }

    pub async fn save(&self, records: &[HistoricalRecord]) -> anyhow::Result<()> {
        let bytes = encode_ledger(records)?;
        write_atomic(&self.path, &bytes)
            .await
            .with_context(|| format!("replacing ledger {}", self.path.display()))?;
        info!(path = %self.path.display(), rows = records.len(), "ledger saved");
        Ok(())
    }
}

fn encode_ledger(records: &[HistoricalRecord]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer
        .write_record(LEDGER_COLUMNS)
        .context("writing ledger header")?;
    for record in records {
        writer
            .serialize(LedgerRow::from(record))
            .with_context(|| format!("encoding ledger row {}", record.key()))?;
    }
    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("flushing ledger buffer: {}", e.error()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn record(key: &str, coords: Option<Coordinates>) -> HistoricalRecord {
        HistoricalRecord {
            listing: NormalizedListing {
                key: key.into(),
                address: "Rua das Palmeiras, 123".into(),
                neighborhood: "CENTRO".into(),
                description: "Apartamento, 2 quartos".into(),
                price: Some(100000.0),
                appraised_value: None,
                discount: Some(10.5),
                sale_modality: "Venda Online".into(),
                photo: String::new(),
                city: "Porto Velho".into(),
                region: "RO".into(),
            },
            coordinates: coords,
            first_seen: day(1),
            last_seen: day(2),
        }
    }

    #[tokio::test]
    async fn absent_or_blank_ledger_loads_as_none() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("imoveis_BR.csv"));
        assert!(store.load().await.unwrap().is_none());

        std::fs::write(store.path(), b"").unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn saved_ledger_loads_back() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("imoveis_BR.csv"));
        let records = vec![
            record("A", None),
            record(
                "B",
                Some(Coordinates {
                    latitude: -8.76,
                    longitude: -63.9,
                }),
            ),
        ];
        store.save(&records).await.unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.starts_with(&LEDGER_COLUMNS.join(",")));
        assert_eq!(store.load().await.unwrap().unwrap(), records);
    }

    #[tokio::test]
    async fn empty_ledger_still_carries_full_header() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("imoveis_BR.csv"));
        store.save(&[]).await.unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(text.trim_end(), LEDGER_COLUMNS.join(","));
        assert_eq!(store.load().await.unwrap(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn corrupt_row_is_fatal() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("imoveis_BR.csv"));
        let mut text = LEDGER_COLUMNS.join(",");
        text.push_str("\nA,,,,,,,,,,RO,,,not-a-date,2024-01-01\n");
        std::fs::write(store.path(), text).unwrap();

        let err = store.load().await.unwrap_err();
        assert!(format!("{err:#}").contains("data row 1"));
    }
}
