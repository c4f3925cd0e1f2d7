use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use caixa_adapters::{
    write_snapshot_csv, ArchiveCredentials, ArchiveSink, CsvSnapshotSource, GeocodeLookup,
    InternetArchiveSink, ListingPageSource, NominatimGeocoder, SnapshotSource, UploadReport,
};
use caixa_core::{normalize_financial_fields, DataQualityIssue, NormalizedListing};
use caixa_storage::{
    write_atomic, ArtifactStore, GeocodeCache, HttpClientConfig, HttpFetcher, LedgerStore,
};
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::export::export_parquet;
use crate::geocode::{GeocodeGate, GeocodePass, GeocodeStats};
use crate::ledger::{merge, Ledger, MergeStats};
use crate::report::{render_markdown, summarize, LedgerSummary};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub regions_fetched: usize,
    pub regions_failed: Vec<String>,
    pub rows_seen: usize,
    pub merge: MergeStats,
    pub geocode: Option<GeocodeStats>,
    pub issues: usize,
    pub ledger_path: String,
    pub reports_dir: String,
}

#[derive(Debug, Clone)]
pub struct ReportOutput {
    pub run_id: Uuid,
    pub dir: PathBuf,
    pub summary: LedgerSummary,
}

struct FetchedBatch {
    rows: Vec<NormalizedListing>,
    regions_fetched: usize,
    regions_failed: Vec<String>,
}

/// One ledger, its collaborators, and the guard that keeps runs from overlapping.
#[derive(Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    source: Arc<dyn SnapshotSource>,
    geocoder: Arc<dyn GeocodeLookup>,
    archive: Arc<dyn ArchiveSink>,
    persist_snapshots: bool,
    run_lock: Arc<Mutex<()>>,
    stop: Arc<AtomicBool>,
}

impl Pipeline {
    /// Wire the real collaborators: listing scraper (or the CSV snapshots when
    /// `skip_download` is set), Nominatim, and the Internet Archive.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.http_timeout_secs);
        let listing_http = HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let geocoder_http = HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: Some(config.geocoder_user_agent.clone()),
            ..Default::default()
        })?;

        let (source, persist_snapshots): (Arc<dyn SnapshotSource>, bool) = if config.skip_download {
            (Arc::new(CsvSnapshotSource::new(&config.snapshot_dir)), false)
        } else {
            let scraper = ListingPageSource::new(listing_http.clone(), &config.listing_url_template)
                .with_artifacts(ArtifactStore::new(&config.artifacts_dir));
            (Arc::new(scraper), true)
        };
        let geocoder = Arc::new(NominatimGeocoder::with_endpoint(
            geocoder_http,
            &config.geocoder_endpoint,
        ));
        let archive = Arc::new(InternetArchiveSink::new(
            listing_http,
            ArchiveCredentials::from_env(),
        ));

        let mut pipeline = Self::with_collaborators(config, source, geocoder, archive);
        pipeline.persist_snapshots = persist_snapshots;
        Ok(pipeline)
    }

    pub fn with_collaborators(
        config: PipelineConfig,
        source: Arc<dyn SnapshotSource>,
        geocoder: Arc<dyn GeocodeLookup>,
        archive: Arc<dyn ArchiveSink>,
    ) -> Self {
        Self {
            config,
            source,
            geocoder,
            archive,
            persist_snapshots: false,
            run_lock: Arc::new(Mutex::new(())),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Flag checked between geocode lookups; setting it ends the pass early.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Set the stop flag on Ctrl-C.
    pub fn install_ctrl_c_stop(&self) {
        let stop = self.stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; finishing the current record");
                stop.store(true, Ordering::Relaxed);
            }
        });
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        self.run_for(self.config.effective_run_date()).await
    }

    /// Fetch, normalize, merge, optionally geocode, then replace the ledger and write reports.
    pub async fn run_for(&self, run_date: NaiveDate) -> Result<RunSummary> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| anyhow!("another run is already in progress"))?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        async move {
            info!(source = self.source.name(), regions = self.config.regions.len(), "run started");
            let mut issues = Vec::new();

            let fetched = self.fetch_regions(&mut issues).await;
            let existing = self.load_ledger(&mut issues).await?;
            let outcome = merge(existing, &fetched.rows, run_date, self.config.duplicate_policy);
            issues.extend(outcome.issues);
            let mut ledger = outcome.ledger;

            let geocode = if self.config.geocode {
                let pass = self.geocode_pass(&mut ledger, run_date).await?;
                issues.extend(pass.issues);
                Some(pass.stats)
            } else {
                None
            };

            self.ledger_store()
                .save(&ledger.sorted_records())
                .await
                .context("replacing ledger")?;

            let summary = summarize(ledger.iter(), run_date);
            let reports_dir = self.config.reports_dir.join(run_id.to_string());
            let run = RunSummary {
                run_id,
                run_date,
                started_at,
                finished_at: Utc::now(),
                regions_fetched: fetched.regions_fetched,
                regions_failed: fetched.regions_failed,
                rows_seen: fetched.rows.len(),
                merge: outcome.stats,
                geocode,
                issues: issues.len(),
                ledger_path: self.config.ledger_path.display().to_string(),
                reports_dir: reports_dir.display().to_string(),
            };
            write_reports(&reports_dir, &summary, Some(&run), &issues).await?;

            info!(
                records = ledger.len(),
                inserted = run.merge.inserted,
                refreshed = run.merge.refreshed,
                issues = run.issues,
                "run finished"
            );
            Ok::<_, anyhow::Error>(run)
        }
        .instrument(info_span!("run", %run_id, %run_date))
        .await
    }

    /// Geocode the persisted ledger without fetching anything.
    pub async fn geocode_only(&self) -> Result<GeocodePass> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| anyhow!("another run is already in progress"))?;
        let run_date = self.config.effective_run_date();
        let mut issues = Vec::new();
        let mut ledger = self.load_ledger(&mut issues).await?.unwrap_or_default();
        if ledger.is_empty() {
            info!("ledger is empty; nothing to geocode");
        }

        let mut pass = self.geocode_pass(&mut ledger, run_date).await?;
        self.ledger_store()
            .save(&ledger.sorted_records())
            .await
            .context("replacing ledger")?;
        issues.append(&mut pass.issues);
        pass.issues = issues;
        Ok(pass)
    }

    /// Summarize the persisted ledger into a fresh report directory.
    pub async fn report(&self) -> Result<ReportOutput> {
        let run_id = Uuid::new_v4();
        let run_date = self.config.effective_run_date();
        let mut issues = Vec::new();
        let ledger = self.load_ledger(&mut issues).await?.unwrap_or_default();

        let summary = summarize(ledger.iter(), run_date);
        let dir = self.config.reports_dir.join(run_id.to_string());
        write_reports(&dir, &summary, None, &issues).await?;
        Ok(ReportOutput { run_id, dir, summary })
    }

    /// Export the ledger to parquet and hand ledger, parquet and manifest to the archive sink.
    pub async fn publish(&self, dry_run: bool) -> Result<UploadReport> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| anyhow!("another run is already in progress"))?;
        let item = self.config.archive_item();
        if item.identifier.trim().is_empty() {
            bail!("archive identifier is empty");
        }

        let mut issues = Vec::new();
        let Some(ledger) = self.load_ledger(&mut issues).await? else {
            bail!(
                "no ledger at {}; run the pipeline first",
                self.config.ledger_path.display()
            );
        };
        let export = export_parquet(&ledger.sorted_records(), &self.config.export_dir).await?;
        let files = vec![
            self.config.ledger_path.clone(),
            export.parquet_path,
            export.manifest_path,
        ];
        let report = self
            .archive
            .upload(&item, &files, dry_run)
            .await
            .with_context(|| format!("publishing {}", item.identifier))?;
        info!(identifier = %report.identifier, files = report.files.len(), bytes = report.bytes, dry_run, "published");
        Ok(report)
    }

    /// A scheduler that triggers `run_for` with the trigger's date, when enabled.
    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.schedule_cron.clone();
        let pipeline = self.clone();
        let job = Job::new_async(&cron, move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run_for(Local::now().date_naive()).await {
                    Ok(run) => info!(run_id = %run.run_id, "scheduled run finished"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    fn ledger_store(&self) -> LedgerStore {
        LedgerStore::new(&self.config.ledger_path)
    }

    async fn fetch_regions(&self, issues: &mut Vec<DataQualityIssue>) -> FetchedBatch {
        let mut batch = FetchedBatch {
            rows: Vec::new(),
            regions_fetched: 0,
            regions_failed: Vec::new(),
        };

        for region in &self.config.regions {
            let snapshot = match self.source.fetch_region(region).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(region = %region, error = %err, "region snapshot unavailable; skipping");
                    issues.push(DataQualityIssue::SnapshotUnavailable {
                        region: region.clone(),
                        reason: err.to_string(),
                    });
                    batch.regions_failed.push(region.clone());
                    continue;
                }
            };
            batch.regions_fetched += 1;

            if self.persist_snapshots {
                if let Err(err) = write_snapshot_csv(&self.config.snapshot_dir, &snapshot).await {
                    warn!(region = %region, error = %format!("{err:#}"), "could not keep snapshot csv");
                }
            }
            if snapshot.rejected_rows > 0 {
                warn!(region = %region, rejected = snapshot.rejected_rows, "snapshot had undecodable rows");
            }

            for row in &snapshot.rows {
                let (mut listing, row_issues) = normalize_financial_fields(row);
                if listing.region.is_empty() {
                    listing.region.clone_from(&snapshot.region);
                }
                for issue in &row_issues {
                    warn!(region = %region, %issue, "data quality");
                }
                issues.extend(row_issues);
                batch.rows.push(listing);
            }
            info!(region = %region, rows = snapshot.rows.len(), "region fetched");
        }
        batch
    }

    async fn load_ledger(&self, issues: &mut Vec<DataQualityIssue>) -> Result<Option<Ledger>> {
        let store = self.ledger_store();
        let Some(records) = store
            .load()
            .await
            .with_context(|| format!("loading ledger {}", store.path().display()))?
        else {
            info!(path = %store.path().display(), "no ledger yet; starting empty");
            return Ok(None);
        };
        let (ledger, load_issues) = Ledger::from_records(records);
        issues.extend(load_issues);
        Ok(Some(ledger))
    }

    async fn geocode_pass(&self, ledger: &mut Ledger, today: NaiveDate) -> Result<GeocodePass> {
        let cache = GeocodeCache::open(&self.config.geocode_cache_path).await?;
        let mut gate = GeocodeGate::new(
            cache,
            self.geocoder.clone(),
            self.config.geocode_interval(),
            today,
        )
        .with_not_found_ttl_days(self.config.not_found_ttl_days)
        .with_stop_flag(self.stop.clone());
        gate.resolve_coordinates(ledger).await
    }
}

async fn write_reports(
    dir: &Path,
    summary: &LedgerSummary,
    run: Option<&RunSummary>,
    issues: &[DataQualityIssue],
) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    write_atomic(&dir.join("summary.md"), render_markdown(summary).as_bytes())
        .await
        .context("writing summary.md")?;

    let summary_json = serde_json::to_vec_pretty(&serde_json::json!({
        "run": run,
        "summary": summary,
    }))
    .context("serializing summary")?;
    write_atomic(&dir.join("summary.json"), &summary_json)
        .await
        .context("writing summary.json")?;

    let issues_json = serde_json::to_vec_pretty(issues).context("serializing issues")?;
    write_atomic(&dir.join("issues.json"), &issues_json)
        .await
        .context("writing issues.json")?;
    Ok(())
}
