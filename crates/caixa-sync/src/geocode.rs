use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use caixa_adapters::{GeocodeError, GeocodeLookup};
use caixa_core::{Coordinates, DataQualityIssue};
use caixa_storage::{CachedGeocode, GeocodeCache, MinIntervalLimiter};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::ledger::Ledger;

pub const DEFAULT_GEOCODE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_NOT_FOUND_TTL_DAYS: u64 = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeocodeStats {
    /// Records without coordinates when the pass started.
    pub candidates: usize,
    pub cache_hits: usize,
    /// Calls made to the external geocoder.
    pub lookups: usize,
    pub resolved: usize,
    pub not_found: usize,
    pub failed: usize,
    /// Candidates with nothing to geocode, or left over after a stop request.
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct GeocodePass {
    pub stats: GeocodeStats,
    pub issues: Vec<DataQualityIssue>,
    pub stopped_early: bool,
}

/// Cache-first coordinate resolution in front of a scarce external geocoder.
pub struct GeocodeGate {
    cache: GeocodeCache,
    lookup: Arc<dyn GeocodeLookup>,
    limiter: MinIntervalLimiter,
    not_found_ttl_days: u64,
    today: NaiveDate,
    stop: Arc<AtomicBool>,
    stats: GeocodeStats,
}

impl GeocodeGate {
    pub fn new(
        cache: GeocodeCache,
        lookup: Arc<dyn GeocodeLookup>,
        min_interval: Duration,
        today: NaiveDate,
    ) -> Self {
        Self {
            cache,
            lookup,
            limiter: MinIntervalLimiter::new(min_interval),
            not_found_ttl_days: DEFAULT_NOT_FOUND_TTL_DAYS,
            today,
            stop: Arc::new(AtomicBool::new(false)),
            stats: GeocodeStats::default(),
        }
    }

    pub fn with_not_found_ttl_days(mut self, days: u64) -> Self {
        self.not_found_ttl_days = days;
        self
    }

    /// Share a stop flag; once set, the pass finishes the current record and returns.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn stats(&self) -> GeocodeStats {
        self.stats
    }

    pub fn cache(&self) -> &GeocodeCache {
        &self.cache
    }

    /// Resolve one address, consulting the cache first.
    ///
    /// `Ok(None)` means the geocoder does not know the address (now or within
    /// the not-found TTL). Errors are transient and are not cached.
    pub async fn resolve(&mut self, address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        if let Some(entry) = self.cache.get(address) {
            if !entry.is_expired(self.today, self.not_found_ttl_days) {
                self.stats.cache_hits += 1;
                let hit = entry.coordinates();
                if hit.is_none() {
                    self.stats.not_found += 1;
                }
                debug!(address, found = hit.is_some(), "geocode cache hit");
                return Ok(hit);
            }
            debug!(address, "not-found marker expired; asking again");
        }

        self.limiter.wait().await;
        self.stats.lookups += 1;
        match self.lookup.lookup(address).await {
            Ok(result) => {
                self.cache
                    .insert(address, CachedGeocode::from_lookup(result, self.today));
                if result.is_none() {
                    self.stats.not_found += 1;
                }
                Ok(result)
            }
            Err(err) => {
                self.stats.failed += 1;
                Err(err)
            }
        }
    }

    /// Fill in coordinates for every record that has none, then persist the cache.
    ///
    /// Populated coordinates are never touched, and a failed lookup leaves
    /// the record as it was.
    pub async fn resolve_coordinates(&mut self, ledger: &mut Ledger) -> anyhow::Result<GeocodePass> {
        let span = info_span!("geocode", today = %self.today);
        async {
            let mut issues = Vec::new();
            let mut stopped_early = false;

            for record in ledger.iter_mut().filter(|r| r.coordinates.is_none()) {
                self.stats.candidates += 1;
                if stopped_early || self.stop.load(Ordering::Relaxed) {
                    stopped_early = true;
                    self.stats.skipped += 1;
                    continue;
                }
                let Some(address) = record.listing.geocode_address() else {
                    self.stats.skipped += 1;
                    continue;
                };

                match self.resolve(&address).await {
                    Ok(Some(coordinates)) => {
                        record.coordinates = Some(coordinates);
                        self.stats.resolved += 1;
                    }
                    Ok(None) => {
                        debug!(key = record.key(), address = %address, "address not found");
                    }
                    Err(err) => {
                        warn!(key = record.key(), address = %address, error = %err, "geocoding failed; will retry next run");
                        issues.push(DataQualityIssue::GeocodeFailed {
                            key: record.key().to_string(),
                            address,
                            reason: err.to_string(),
                        });
                    }
                }
            }

            if stopped_early {
                warn!("geocode pass stopped before finishing");
            }
            self.cache
                .save()
                .await
                .context("saving geocode cache after pass")?;

            let stats = self.stats;
            info!(
                candidates = stats.candidates,
                cache_hits = stats.cache_hits,
                lookups = stats.lookups,
                resolved = stats.resolved,
                not_found = stats.not_found,
                failed = stats.failed,
                skipped = stats.skipped,
                "geocode pass finished"
            );
            Ok::<_, anyhow::Error>(GeocodePass {
                stats,
                issues,
                stopped_early,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{merge, DuplicateKeyPolicy};
    use async_trait::async_trait;
    use caixa_core::NormalizedListing;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeGeocoder {
        known: HashMap<String, Coordinates>,
        failing: Vec<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GeocodeLookup for FakeGeocoder {
        async fn lookup(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.iter().any(|a| a == address) {
                return Err(GeocodeError::Timeout);
            }
            Ok(self.known.get(address).copied())
        }
    }

    const PV: Coordinates = Coordinates {
        latitude: -8.76,
        longitude: -63.9,
    };

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn gate(fake: Arc<FakeGeocoder>, today: NaiveDate) -> GeocodeGate {
        let dir = std::env::temp_dir().join("caixa-geocode-unused.json");
        GeocodeGate::new(GeocodeCache::in_memory(dir), fake, Duration::ZERO, today)
    }

    #[tokio::test]
    async fn second_resolve_of_same_address_hits_cache() {
        let fake = Arc::new(FakeGeocoder {
            known: HashMap::from([("Rua A, Porto Velho".to_string(), PV)]),
            ..Default::default()
        });
        let mut gate = gate(fake.clone(), day(1));

        assert_eq!(gate.resolve("Rua A, Porto Velho").await.unwrap(), Some(PV));
        assert_eq!(gate.resolve("rua a  porto velho").await.unwrap(), Some(PV));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
        assert_eq!(gate.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn not_found_marker_prevents_second_call_until_it_expires() {
        let fake = Arc::new(FakeGeocoder::default());
        let mut gate = gate(fake.clone(), day(1)).with_not_found_ttl_days(3);

        assert_eq!(gate.resolve("Nowhere").await.unwrap(), None);
        assert_eq!(gate.resolve("Nowhere").await.unwrap(), None);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);

        gate.today = day(4);
        assert_eq!(gate.resolve("Nowhere").await.unwrap(), None);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transient_failures_are_not_cached() {
        let fake = Arc::new(FakeGeocoder {
            failing: vec!["Flaky".to_string()],
            ..Default::default()
        });
        let mut gate = gate(fake.clone(), day(1));

        assert!(gate.resolve("Flaky").await.is_err());
        assert!(gate.resolve("Flaky").await.is_err());
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
        assert!(gate.cache().is_empty());
    }

    fn record(key: &str, address: &str) -> NormalizedListing {
        NormalizedListing {
            key: key.into(),
            address: address.into(),
            city: "Porto Velho".into(),
            region: "RO".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn pass_fills_nulls_keeps_existing_and_survives_failures() {
        let dir = tempdir().unwrap();
        let cache_path = dir.path().join("geocode_cache.json");
        let fake = Arc::new(FakeGeocoder {
            known: HashMap::from([("Rua A, Porto Velho, RO".to_string(), PV)]),
            failing: vec!["Rua B, Porto Velho, RO".to_string()],
            ..Default::default()
        });

        let mut ledger = merge(
            None,
            &[
                record("1", "Rua A"),
                record("2", "Rua B"),
                record("3", "Rua C"),
                record("4", "Rua D"),
            ],
            day(1),
            DuplicateKeyPolicy::FirstWins,
        )
        .ledger;
        let preset = Coordinates {
            latitude: 1.0,
            longitude: 2.0,
        };
        for r in ledger.iter_mut().filter(|r| r.key() == "4") {
            r.coordinates = Some(preset);
        }

        let cache = GeocodeCache::open(&cache_path).await.unwrap();
        let mut gate = GeocodeGate::new(cache, fake.clone(), Duration::ZERO, day(1));
        let pass = gate.resolve_coordinates(&mut ledger).await.unwrap();

        assert_eq!(ledger.get("1").unwrap().coordinates, Some(PV));
        assert_eq!(ledger.get("2").unwrap().coordinates, None);
        assert_eq!(ledger.get("3").unwrap().coordinates, None);
        assert_eq!(ledger.get("4").unwrap().coordinates, Some(preset));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 3);
        assert_eq!(pass.stats.candidates, 3);
        assert_eq!(pass.stats.resolved, 1);
        assert_eq!(pass.stats.not_found, 1);
        assert_eq!(pass.stats.failed, 1);
        assert_eq!(pass.issues.len(), 1);
        assert!(!pass.stopped_early);

        let reopened = GeocodeCache::open(&cache_path).await.unwrap();
        assert_eq!(reopened.len(), 2);
    }

    #[tokio::test]
    async fn stop_flag_ends_the_pass_between_records() {
        let fake = Arc::new(FakeGeocoder::default());
        let stop = Arc::new(AtomicBool::new(true));
        let mut ledger = merge(
            None,
            &[record("1", "Rua A"), record("2", "Rua B")],
            day(1),
            DuplicateKeyPolicy::FirstWins,
        )
        .ledger;

        let dir = tempdir().unwrap();
        let mut gate = GeocodeGate::new(
            GeocodeCache::in_memory(dir.path().join("c.json")),
            fake.clone(),
            Duration::ZERO,
            day(1),
        )
        .with_stop_flag(stop);
        let pass = gate.resolve_coordinates(&mut ledger).await.unwrap();

        assert!(pass.stopped_early);
        assert_eq!(pass.stats.skipped, 2);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }
}
