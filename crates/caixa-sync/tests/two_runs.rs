use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use caixa_adapters::{CsvSnapshotSource, DryRunArchiveSink, GeocodeError, GeocodeLookup};
use caixa_core::{Coordinates, DataQualityIssue};
use caixa_storage::{GeocodeCache, LedgerStore};
use caixa_sync::{Ledger, Pipeline, PipelineConfig};
use chrono::NaiveDate;
use tempfile::tempdir;

#[derive(Default)]
struct CountingGeocoder {
    known: HashMap<String, Coordinates>,
    calls: AtomicUsize,
}

#[async_trait]
impl GeocodeLookup for CountingGeocoder {
    async fn lookup(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.known.get(address).copied())
    }
}

const PALMEIRAS: Coordinates = Coordinates {
    latitude: -8.7612,
    longitude: -63.9004,
};

fn fixtures(day: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/snapshots")
        .join(day)
}

fn date(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
}

fn config(root: &Path, geocode: bool) -> PipelineConfig {
    PipelineConfig {
        ledger_path: root.join("imoveis_BR.csv"),
        snapshot_dir: root.join("snapshots"),
        geocode_cache_path: root.join("geocode_cache.json"),
        artifacts_dir: root.join("artifacts"),
        reports_dir: root.join("reports"),
        export_dir: root.join("export"),
        regions: vec!["RO".into(), "SP".into()],
        geocode,
        geocode_interval_ms: 0,
        ..PipelineConfig::default()
    }
}

fn pipeline(root: &Path, day: &str, geocode: bool, geocoder: Arc<CountingGeocoder>) -> Pipeline {
    Pipeline::with_collaborators(
        config(root, geocode),
        Arc::new(CsvSnapshotSource::new(fixtures(day))),
        geocoder,
        Arc::new(DryRunArchiveSink),
    )
}

async fn load(root: &Path) -> Ledger {
    let records = LedgerStore::new(root.join("imoveis_BR.csv"))
        .load()
        .await
        .unwrap()
        .expect("ledger written");
    let (ledger, issues) = Ledger::from_records(records);
    assert!(issues.is_empty());
    ledger
}

#[tokio::test]
async fn two_consecutive_runs_track_first_and_last_seen() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let geocoder = Arc::new(CountingGeocoder {
        known: HashMap::from([(
            "Rua das Palmeiras, 123, CENTRO, Porto Velho, RO".to_string(),
            PALMEIRAS,
        )]),
        ..Default::default()
    });

    let first = pipeline(root, "2024-01-01", false, geocoder.clone())
        .run_for(date(1))
        .await
        .unwrap();
    assert_eq!(first.merge.inserted, 3);
    assert_eq!(first.regions_fetched, 2);
    // "N/D" appraised value on the SP listing
    assert_eq!(first.issues, 1);

    let ledger = load(root).await;
    assert_eq!(ledger.len(), 3);
    let sp = ledger.get("8555500002001").unwrap();
    assert_eq!(sp.listing.price, Some(1234.56));
    assert_eq!(sp.listing.discount, Some(10.5));
    assert_eq!(sp.listing.appraised_value, None);
    assert_eq!(sp.listing.neighborhood, "CONSOLAÇÃO");

    let second = pipeline(root, "2024-01-02", true, geocoder.clone())
        .run_for(date(2))
        .await
        .unwrap();
    assert_eq!(second.merge.inserted, 1);
    assert_eq!(second.merge.refreshed, 1);
    assert_eq!(second.merge.dormant, 2);
    assert_eq!(second.merge.skipped, 1);
    assert_eq!(second.merge.duplicates, 1);

    let ledger = load(root).await;
    assert_eq!(ledger.len(), 4);

    let a = ledger.get("1444400001001").unwrap();
    assert_eq!((a.first_seen, a.last_seen), (date(1), date(2)));
    assert_eq!(a.listing.price, Some(95_000.0));
    assert_eq!(a.coordinates, Some(PALMEIRAS));

    let b = ledger.get("1444400001002").unwrap();
    assert_eq!((b.first_seen, b.last_seen), (date(1), date(1)));
    assert_eq!(b.coordinates, None);

    let d = ledger.get("1444400001003").unwrap();
    assert_eq!((d.first_seen, d.last_seen), (date(2), date(2)));

    // The SP snapshot of day two is empty; its record survives untouched.
    let sp = ledger.get("8555500002001").unwrap();
    assert_eq!(sp.last_seen, date(1));

    let geo = second.geocode.unwrap();
    assert_eq!(geo.candidates, 4);
    assert_eq!(geo.lookups, 4);
    assert_eq!(geo.resolved, 1);
    assert_eq!(geo.not_found, 3);

    let issues: Vec<DataQualityIssue> = serde_json::from_slice(
        &std::fs::read(Path::new(&second.reports_dir).join("issues.json")).unwrap(),
    )
    .unwrap();
    assert!(issues
        .iter()
        .any(|i| matches!(i, DataQualityIssue::MissingKey { region, position: 3 } if region == "RO")));
    assert!(issues.iter().any(|i| matches!(
        i,
        DataQualityIssue::DuplicateKey { key, .. } if key == "1444400001001"
    )));

    let cache = GeocodeCache::open(root.join("geocode_cache.json")).await.unwrap();
    assert_eq!(cache.len(), 4);
}

#[tokio::test]
async fn geocode_rerun_uses_the_cache_only() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let geocoder = Arc::new(CountingGeocoder::default());

    pipeline(root, "2024-01-01", true, geocoder.clone())
        .run_for(date(1))
        .await
        .unwrap();
    assert_eq!(geocoder.calls.load(Ordering::SeqCst), 3);

    let rerun = PipelineConfig {
        run_date: Some(date(1)),
        ..config(root, true)
    };
    let pass = Pipeline::with_collaborators(
        rerun,
        Arc::new(CsvSnapshotSource::new(fixtures("2024-01-01"))),
        geocoder.clone(),
        Arc::new(DryRunArchiveSink),
    )
    .geocode_only()
    .await
    .unwrap();
    assert_eq!(geocoder.calls.load(Ordering::SeqCst), 3);
    assert_eq!(pass.stats.cache_hits, 3);
    assert_eq!(pass.stats.lookups, 0);
}

#[tokio::test]
async fn rerunning_the_same_day_changes_nothing() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let geocoder = Arc::new(CountingGeocoder::default());

    pipeline(root, "2024-01-01", false, geocoder.clone())
        .run_for(date(1))
        .await
        .unwrap();
    let once = std::fs::read(root.join("imoveis_BR.csv")).unwrap();

    pipeline(root, "2024-01-01", false, geocoder)
        .run_for(date(1))
        .await
        .unwrap();
    let twice = std::fs::read(root.join("imoveis_BR.csv")).unwrap();
    assert_eq!(once, twice);
}
