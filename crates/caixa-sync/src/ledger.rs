//! The historical ledger and its per-run merge.
//!
//! One record per identity key, never deleted. A merge stamps every key of
//! the incoming batch with the run date and leaves every other key alone,
//! so a key whose `last_seen` stops advancing is how a delisted property
//! shows up.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};

use caixa_core::{DataQualityIssue, HistoricalRecord, NormalizedListing};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// What to do when one batch carries the same identity key twice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateKeyPolicy {
    #[default]
    FirstWins,
    LastWins,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ledger {
    records: BTreeMap<String, HistoricalRecord>,
}

/// Fold a second persisted row for the same key into `kept`: the widest
/// first/last-seen span survives, listing fields come from the most recently
/// seen row, and populated coordinates are never dropped.
fn collapse_duplicate(kept: &mut HistoricalRecord, other: HistoricalRecord) {
    let first_seen = kept.first_seen.min(other.first_seen);
    let last_seen = kept.last_seen.max(other.last_seen);
    let coordinates = if other.last_seen > kept.last_seen {
        let fallback = kept.coordinates;
        kept.listing = other.listing;
        other.coordinates.or(fallback)
    } else {
        kept.coordinates.or(other.coordinates)
    };
    kept.first_seen = first_seen;
    kept.last_seen = last_seen;
    kept.coordinates = coordinates;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    /// Keys seen for the first time.
    pub inserted: usize,
    /// Known keys observed again.
    pub refreshed: usize,
    /// Known keys absent from this batch.
    pub dormant: usize,
    /// Incoming rows dropped for a missing or malformed key.
    pub skipped: usize,
    /// Incoming rows whose key already appeared earlier in the batch.
    pub duplicates: usize,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub ledger: Ledger,
    pub stats: MergeStats,
    pub issues: Vec<DataQualityIssue>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from persisted rows, repairing what can be repaired.
    ///
    /// Rows with `first_seen > last_seen` get their dates swapped. When a key
    /// appears more than once, the row with the latest `last_seen` is kept.
    pub fn from_records(records: Vec<HistoricalRecord>) -> (Self, Vec<DataQualityIssue>) {
        let mut ledger = Self::new();
        let mut issues = Vec::new();

        for mut record in records {
            if record.first_seen > record.last_seen {
                warn!(key = record.key(), first_seen = %record.first_seen, last_seen = %record.last_seen, "inverted ledger dates swapped");
                std::mem::swap(&mut record.first_seen, &mut record.last_seen);
                issues.push(DataQualityIssue::InvertedDates {
                    key: record.key().to_string(),
                });
            }

            match ledger.records.entry(record.key().to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
                Entry::Occupied(mut slot) => {
                    warn!(key = record.key(), region = record.region(), "duplicate key in persisted ledger");
                    issues.push(DataQualityIssue::DuplicateKey {
                        region: record.region().to_string(),
                        key: record.key().to_string(),
                    });
                    collapse_duplicate(slot.get_mut(), record);
                }
            }
        }
        (ledger, issues)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&HistoricalRecord> {
        self.records.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoricalRecord> {
        self.records.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut HistoricalRecord> {
        self.records.values_mut()
    }

    /// Records in persisted order: region, city, neighborhood, key.
    pub fn sorted_records(&self) -> Vec<HistoricalRecord> {
        let mut records: Vec<_> = self.records.values().cloned().collect();
        records.sort_by(|a, b| {
            (
                &a.listing.region,
                &a.listing.city,
                &a.listing.neighborhood,
                &a.listing.key,
            )
                .cmp(&(
                    &b.listing.region,
                    &b.listing.city,
                    &b.listing.neighborhood,
                    &b.listing.key,
                ))
        });
        records
    }
}

/// Merge one run's normalized rows, across all regions, into the ledger.
///
/// `existing` is `None` on the first run. The input ledger is consumed and
/// the returned one is complete, so callers persist it in one replacement.
pub fn merge(
    existing: Option<Ledger>,
    batch: &[NormalizedListing],
    run_date: NaiveDate,
    policy: DuplicateKeyPolicy,
) -> MergeOutcome {
    let mut ledger = existing.unwrap_or_default();
    let mut stats = MergeStats::default();
    let mut issues = Vec::new();

    let staged = stage_batch(batch, policy, &mut stats, &mut issues);

    for (key, listing) in staged {
        let mut listing = listing.clone();
        listing.key.clone_from(&key);
        match ledger.records.get_mut(&key) {
            Some(record) => {
                if run_date >= record.last_seen {
                    record.listing = listing;
                    record.last_seen = run_date;
                }
                if run_date < record.first_seen {
                    record.first_seen = run_date;
                }
                stats.refreshed += 1;
            }
            None => {
                ledger
                    .records
                    .insert(key, HistoricalRecord::first_observed(listing, run_date));
                stats.inserted += 1;
            }
        }
    }
    stats.dormant = ledger.len() - stats.inserted - stats.refreshed;

    debug!(
        run_date = %run_date,
        inserted = stats.inserted,
        refreshed = stats.refreshed,
        dormant = stats.dormant,
        skipped = stats.skipped,
        duplicates = stats.duplicates,
        "ledger merged"
    );
    MergeOutcome {
        ledger,
        stats,
        issues,
    }
}

// Validates keys and collapses duplicates so each key reaches the ledger once.
fn stage_batch<'a>(
    batch: &'a [NormalizedListing],
    policy: DuplicateKeyPolicy,
    stats: &mut MergeStats,
    issues: &mut Vec<DataQualityIssue>,
) -> BTreeMap<String, &'a NormalizedListing> {
    let mut staged: BTreeMap<String, &NormalizedListing> = BTreeMap::new();
    let mut positions: HashMap<&str, usize> = HashMap::new();

    for listing in batch {
        let position = positions.entry(listing.region.as_str()).or_default();
        *position += 1;

        let key = listing.key.trim();
        if key.is_empty() {
            warn!(region = %listing.region, position = *position, "row without identity key skipped");
            issues.push(DataQualityIssue::MissingKey {
                region: listing.region.clone(),
                position: *position,
            });
            stats.skipped += 1;
            continue;
        }
        if key.chars().any(char::is_control) {
            warn!(region = %listing.region, key = ?key, "row with malformed identity key skipped");
            issues.push(DataQualityIssue::MalformedKey {
                region: listing.region.clone(),
                key: key.to_string(),
            });
            stats.skipped += 1;
            continue;
        }
        if listing.city.is_empty() || listing.region.is_empty() {
            warn!(key, "listing has no city or region");
            issues.push(DataQualityIssue::MissingLocation {
                key: key.to_string(),
            });
        }

        match staged.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(listing);
            }
            Entry::Occupied(mut slot) => {
                warn!(key, region = %listing.region, ?policy, "identity key repeated in batch");
                issues.push(DataQualityIssue::DuplicateKey {
                    region: listing.region.clone(),
                    key: key.to_string(),
                });
                stats.duplicates += 1;
                if policy == DuplicateKeyPolicy::LastWins {
                    slot.insert(listing);
                }
            }
        }
    }
    staged
}

#[cfg(test)]
mod tests {
    use super::*;
    use caixa_core::Coordinates;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn listing(key: &str, price: Option<f64>) -> NormalizedListing {
        NormalizedListing {
            key: key.to_string(),
            address: format!("Rua {key}, 1"),
            city: "Porto Velho".into(),
            region: "RO".into(),
            price,
            ..Default::default()
        }
    }

    fn keys(ledger: &Ledger) -> Vec<&str> {
        ledger.iter().map(|r| r.key()).collect()
    }

    #[test]
    fn first_run_creates_one_record_per_key() {
        let run = date(2024, 1, 1);
        let batch = vec![listing("A", None), listing("B", None), listing("C", None)];
        let out = merge(None, &batch, run, DuplicateKeyPolicy::FirstWins);

        assert_eq!(out.ledger.len(), 3);
        for record in out.ledger.iter() {
            assert_eq!(record.first_seen, run);
            assert_eq!(record.last_seen, run);
            assert!(record.coordinates.is_none());
        }
        assert_eq!(out.stats.inserted, 3);
        assert!(out.issues.is_empty());
    }

    #[test]
    fn rerun_advances_seen_keys_and_leaves_the_rest() {
        let day1 = date(2024, 1, 1);
        let day2 = date(2024, 1, 2);
        let first = merge(
            None,
            &[listing("A", Some(100.0)), listing("B", Some(50.0))],
            day1,
            DuplicateKeyPolicy::FirstWins,
        );
        let b_before = first.ledger.get("B").cloned().unwrap();

        let second = merge(
            Some(first.ledger),
            &[listing("A", Some(90.0)), listing("D", None)],
            day2,
            DuplicateKeyPolicy::FirstWins,
        );
        let ledger = &second.ledger;
        assert_eq!(keys(ledger), vec!["A", "B", "D"]);

        let a = ledger.get("A").unwrap();
        assert_eq!((a.first_seen, a.last_seen), (day1, day2));
        assert_eq!(a.listing.price, Some(90.0));

        let d = ledger.get("D").unwrap();
        assert_eq!((d.first_seen, d.last_seen), (day2, day2));

        assert_eq!(ledger.get("B"), Some(&b_before));
        assert!(!ledger.get("B").unwrap().is_active(day2));
        assert_eq!(
            second.stats,
            MergeStats {
                inserted: 1,
                refreshed: 1,
                dormant: 1,
                skipped: 0,
                duplicates: 0,
            }
        );
    }

    #[test]
    fn merging_the_same_batch_twice_is_idempotent() {
        let run = date(2024, 2, 10);
        let batch = vec![listing("A", Some(1.0)), listing("B", None)];
        let once = merge(None, &batch, run, DuplicateKeyPolicy::FirstWins).ledger;
        let twice = merge(Some(once.clone()), &batch, run, DuplicateKeyPolicy::FirstWins).ledger;
        assert_eq!(once, twice);
    }

    #[test]
    fn coordinates_survive_a_refresh() {
        let day1 = date(2024, 1, 1);
        let mut ledger = merge(None, &[listing("A", None)], day1, DuplicateKeyPolicy::FirstWins).ledger;
        let coords = Coordinates {
            latitude: -8.76,
            longitude: -63.9,
        };
        ledger.iter_mut().for_each(|r| r.coordinates = Some(coords));

        let out = merge(
            Some(ledger),
            &[listing("A", Some(10.0))],
            date(2024, 1, 5),
            DuplicateKeyPolicy::FirstWins,
        );
        assert_eq!(out.ledger.get("A").unwrap().coordinates, Some(coords));
    }

    #[test]
    fn rows_without_usable_keys_are_skipped_with_issues() {
        let run = date(2024, 1, 1);
        let batch = vec![listing("", None), listing("bad\u{7}key", None), listing("OK", None)];
        let out = merge(None, &batch, run, DuplicateKeyPolicy::FirstWins);

        assert_eq!(keys(&out.ledger), vec!["OK"]);
        assert_eq!(out.stats.skipped, 2);
        assert!(out.issues.contains(&DataQualityIssue::MissingKey {
            region: "RO".into(),
            position: 1,
        }));
        assert!(matches!(out.issues[1], DataQualityIssue::MalformedKey { .. }));
    }

    #[test]
    fn duplicate_keys_follow_the_policy_and_are_flagged() {
        let run = date(2024, 1, 1);
        let batch = vec![listing("A", Some(1.0)), listing("A", Some(2.0))];

        let first = merge(None, &batch, run, DuplicateKeyPolicy::FirstWins);
        assert_eq!(first.ledger.len(), 1);
        assert_eq!(first.ledger.get("A").unwrap().listing.price, Some(1.0));
        assert_eq!(first.stats.duplicates, 1);
        assert_eq!(
            first.issues,
            vec![DataQualityIssue::DuplicateKey {
                region: "RO".into(),
                key: "A".into(),
            }]
        );

        let last = merge(None, &batch, run, DuplicateKeyPolicy::LastWins);
        assert_eq!(last.ledger.get("A").unwrap().listing.price, Some(2.0));
        assert_eq!(last.stats.duplicates, 1);
    }

    #[test]
    fn empty_batch_leaves_every_region_untouched() {
        let run = date(2024, 1, 1);
        let mut sp = listing("S", None);
        sp.region = "SP".into();
        let ledger = merge(None, &[listing("A", None), sp], run, DuplicateKeyPolicy::FirstWins).ledger;

        let out = merge(Some(ledger.clone()), &[], date(2024, 1, 2), DuplicateKeyPolicy::FirstWins);
        assert_eq!(out.ledger, ledger);
        assert_eq!(out.stats.dormant, 2);
    }

    #[test]
    fn back_dated_run_never_moves_last_seen_backwards() {
        let ledger = merge(
            None,
            &[listing("A", Some(200.0))],
            date(2024, 3, 1),
            DuplicateKeyPolicy::FirstWins,
        )
        .ledger;
        let out = merge(
            Some(ledger),
            &[listing("A", Some(100.0))],
            date(2024, 2, 1),
            DuplicateKeyPolicy::FirstWins,
        );
        let a = out.ledger.get("A").unwrap();
        assert_eq!(a.first_seen, date(2024, 2, 1));
        assert_eq!(a.last_seen, date(2024, 3, 1));
        assert_eq!(a.listing.price, Some(200.0));
    }

    #[test]
    fn missing_location_is_flagged_but_kept() {
        let mut row = listing("A", None);
        row.city.clear();
        let out = merge(None, &[row], date(2024, 1, 1), DuplicateKeyPolicy::FirstWins);
        assert_eq!(out.ledger.len(), 1);
        assert_eq!(
            out.issues,
            vec![DataQualityIssue::MissingLocation { key: "A".into() }]
        );
    }

    #[test]
    fn loading_repairs_inverted_dates_and_duplicate_keys() {
        let located = Coordinates {
            latitude: 1.0,
            longitude: 2.0,
        };
        let older = HistoricalRecord {
            listing: listing("A", Some(1.0)),
            coordinates: Some(located),
            first_seen: date(2024, 1, 1),
            last_seen: date(2024, 1, 2),
        };
        let newer = HistoricalRecord {
            listing: listing("A", Some(2.0)),
            coordinates: None,
            first_seen: date(2024, 1, 3),
            last_seen: date(2024, 1, 9),
        };
        let inverted = HistoricalRecord {
            listing: listing("B", None),
            coordinates: None,
            first_seen: date(2024, 1, 5),
            last_seen: date(2024, 1, 3),
        };

        let (ledger, issues) = Ledger::from_records(vec![older, inverted, newer]);
        assert_eq!(ledger.len(), 2);
        let a = ledger.get("A").unwrap();
        assert_eq!(a.listing.price, Some(2.0));
        assert_eq!((a.first_seen, a.last_seen), (date(2024, 1, 1), date(2024, 1, 9)));
        assert_eq!(a.coordinates, Some(located));
        let b = ledger.get("B").unwrap();
        assert_eq!((b.first_seen, b.last_seen), (date(2024, 1, 3), date(2024, 1, 5)));
        assert_eq!(issues.len(), 2);
    }

    #[test]
    fn sorted_records_order_by_location_then_key() {
        let mut x = listing("2", None);
        x.region = "AC".into();
        let mut y = listing("1", None);
        y.region = "AC".into();
        let out = merge(
            None,
            &[listing("0", None), x, y],
            date(2024, 1, 1),
            DuplicateKeyPolicy::FirstWins,
        );
        let order: Vec<_> = out
            .ledger
            .sorted_records()
            .into_iter()
            .map(|r| r.listing.key)
            .collect();
        assert_eq!(order, vec!["1", "2", "0"]);
    }
}
