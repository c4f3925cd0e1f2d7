use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use caixa_core::Coordinates;
use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::write_atomic;

/// A remembered geocoder answer, including "the geocoder does not know this address".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CachedGeocode {
    Found {
        latitude: f64,
        longitude: f64,
        cached_on: NaiveDate,
    },
    NotFound {
        cached_on: NaiveDate,
    },
}

impl CachedGeocode {
    pub fn from_lookup(result: Option<Coordinates>, cached_on: NaiveDate) -> Self {
        match result {
            Some(c) => CachedGeocode::Found {
                latitude: c.latitude,
                longitude: c.longitude,
                cached_on,
            },
            None => CachedGeocode::NotFound { cached_on },
        }
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        match *self {
            CachedGeocode::Found {
                latitude,
                longitude,
                ..
            } => Some(Coordinates {
                latitude,
                longitude,
            }),
            CachedGeocode::NotFound { .. } => None,
        }
    }

    /// Found entries never expire; not-found markers expire after `not_found_ttl_days`.
    pub fn is_expired(&self, today: NaiveDate, not_found_ttl_days: u64) -> bool {
        match *self {
            CachedGeocode::Found { .. } => false,
            CachedGeocode::NotFound { cached_on } => cached_on
                .checked_add_days(Days::new(not_found_ttl_days))
                .is_some_and(|expiry| today >= expiry),
        }
    }
}

/// Persistent normalized-address -> geocode map, stored as one JSON object.
#[derive(Debug)]
pub struct GeocodeCache {
    path: PathBuf,
    entries: BTreeMap<String, CachedGeocode>,
    dirty: bool,
}

impl GeocodeCache {
    /// A missing file is an empty cache. An unreadable one is discarded with a warning.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let entries = match fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(|b| b.is_ascii_whitespace()) => BTreeMap::new(),
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "geocode cache unreadable; starting empty");
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading geocode cache {}", path.display()))
            }
        };
        debug!(path = %path.display(), entries = entries.len(), "geocode cache opened");
        Ok(Self {
            path,
            entries,
            dirty: false,
        })
    }

    pub fn in_memory(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Case, punctuation and spacing differences map to the same key.
    pub fn normalize_key(address: &str) -> String {
        address
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn get(&self, address: &str) -> Option<&CachedGeocode> {
        self.entries.get(&Self::normalize_key(address))
    }

    pub fn insert(&mut self, address: &str, entry: CachedGeocode) {
        self.entries.insert(Self::normalize_key(address), entry);
        self.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the cache if anything changed since it was opened or last saved.
    pub async fn save(&mut self) -> anyhow::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let bytes = serde_json::to_vec_pretty(&self.entries).context("serializing geocode cache")?;
        write_atomic(&self.path, &bytes)
            .await
            .with_context(|| format!("replacing geocode cache {}", self.path.display()))?;
        self.dirty = false;
        debug!(path = %self.path.display(), entries = self.entries.len(), "geocode cache saved");
        Ok(())
    }
}
