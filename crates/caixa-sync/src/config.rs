use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use caixa_adapters::ArchiveItem;
use caixa_core::REGION_CODES;
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::geocode::{DEFAULT_GEOCODE_INTERVAL, DEFAULT_NOT_FOUND_TTL_DAYS};
use crate::ledger::DuplicateKeyPolicy;

pub const DEFAULT_LISTING_URL_TEMPLATE: &str =
    "https://venda-imoveis.caixa.gov.br/listaweb/Lista_imoveis_{region}.htm";

/// Everything a run needs, passed in explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub ledger_path: PathBuf,
    pub snapshot_dir: PathBuf,
    pub geocode_cache_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub export_dir: PathBuf,
    /// Fixed run date; today (local time) when unset.
    pub run_date: Option<NaiveDate>,
    pub regions: Vec<String>,
    /// Read the per-region CSV snapshots instead of scraping.
    pub skip_download: bool,
    pub geocode: bool,
    pub geocode_interval_ms: u64,
    pub not_found_ttl_days: u64,
    pub duplicate_policy: DuplicateKeyPolicy,
    pub user_agent: String,
    pub geocoder_user_agent: String,
    pub http_timeout_secs: u64,
    pub listing_url_template: String,
    pub geocoder_endpoint: String,
    pub archive_identifier: String,
    pub archive_title: String,
    pub archive_description: String,
    pub scheduler_enabled: bool,
    /// Six-field cron expression (seconds first).
    pub schedule_cron: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let data = PathBuf::from("data");
        Self {
            ledger_path: data.join("imoveis_BR.csv"),
            snapshot_dir: data.join("snapshots"),
            geocode_cache_path: data.join("geocode_cache.json"),
            artifacts_dir: PathBuf::from("artifacts"),
            reports_dir: PathBuf::from("reports"),
            export_dir: data.join("export"),
            run_date: None,
            regions: REGION_CODES.iter().map(|r| r.to_string()).collect(),
            skip_download: false,
            geocode: false,
            geocode_interval_ms: DEFAULT_GEOCODE_INTERVAL.as_millis() as u64,
            not_found_ttl_days: DEFAULT_NOT_FOUND_TTL_DAYS,
            duplicate_policy: DuplicateKeyPolicy::FirstWins,
            user_agent: "caixa-ledger/0.1".to_string(),
            geocoder_user_agent: "caixa-ledger/0.1 (geocoding)".to_string(),
            http_timeout_secs: 30,
            listing_url_template: DEFAULT_LISTING_URL_TEMPLATE.to_string(),
            geocoder_endpoint: caixa_adapters::NOMINATIM_ENDPOINT.to_string(),
            archive_identifier: "imoveis-caixa-br".to_string(),
            archive_title: "Imóveis Caixa: histórico de leilões".to_string(),
            archive_description: "Historical ledger of Caixa property auction listings with first and last seen dates.".to_string(),
            scheduler_enabled: false,
            schedule_cron: "0 0 6 * * *".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden per variable by `CAIXA_*` environment variables.
    ///
    /// A variable that is set but cannot be parsed is an error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let text = |name: &str| var(name).filter(|v| !v.trim().is_empty());
        let path = |name: &str| text(name).map(PathBuf::from);
        let flag = |name: &str| -> Result<Option<bool>> {
            text(name)
                .map(|v| match v.trim().to_ascii_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => Ok(true),
                    "0" | "false" | "no" | "off" => Ok(false),
                    other => bail!("{name}={other:?} is not a boolean"),
                })
                .transpose()
        };
        let number = |name: &str| -> Result<Option<u64>> {
            text(name)
                .map(|v| {
                    v.trim()
                        .parse::<u64>()
                        .with_context(|| format!("{name}={v:?} is not a whole number"))
                })
                .transpose()
        };

        if let Some(v) = path("CAIXA_LEDGER_PATH") {
            config.ledger_path = v;
        }
        if let Some(v) = path("CAIXA_SNAPSHOT_DIR") {
            config.snapshot_dir = v;
        }
        if let Some(v) = path("CAIXA_GEOCODE_CACHE") {
            config.geocode_cache_path = v;
        }
        if let Some(v) = path("CAIXA_ARTIFACTS_DIR") {
            config.artifacts_dir = v;
        }
        if let Some(v) = path("CAIXA_REPORTS_DIR") {
            config.reports_dir = v;
        }
        if let Some(v) = path("CAIXA_EXPORT_DIR") {
            config.export_dir = v;
        }
        if let Some(v) = text("CAIXA_RUN_DATE") {
            let date = v
                .trim()
                .parse::<NaiveDate>()
                .with_context(|| format!("CAIXA_RUN_DATE={v:?} is not a YYYY-MM-DD date"))?;
            config.run_date = Some(date);
        }
        if let Some(v) = text("CAIXA_REGIONS") {
            config.regions = v
                .split(',')
                .map(|r| r.trim().to_ascii_uppercase())
                .filter(|r| !r.is_empty())
                .collect();
        }
        if let Some(v) = flag("CAIXA_SKIP_DOWNLOAD")? {
            config.skip_download = v;
        }
        if let Some(v) = flag("CAIXA_GEOCODE")? {
            config.geocode = v;
        }
        if let Some(v) = number("CAIXA_GEOCODE_INTERVAL_MS")? {
            config.geocode_interval_ms = v;
        }
        if let Some(v) = number("CAIXA_NOT_FOUND_TTL_DAYS")? {
            config.not_found_ttl_days = v;
        }
        if let Some(v) = text("CAIXA_DUPLICATE_POLICY") {
            match v.trim() {
                "last_wins" | "last-wins" => config.duplicate_policy = DuplicateKeyPolicy::LastWins,
                "first_wins" | "first-wins" => config.duplicate_policy = DuplicateKeyPolicy::FirstWins,
                other => bail!("CAIXA_DUPLICATE_POLICY={other:?} is not first_wins or last_wins"),
            }
        }
        if let Some(v) = text("CAIXA_USER_AGENT") {
            config.user_agent = v;
        }
        if let Some(v) = text("CAIXA_GEOCODER_USER_AGENT") {
            config.geocoder_user_agent = v;
        }
        if let Some(v) = number("CAIXA_HTTP_TIMEOUT_SECS")? {
            config.http_timeout_secs = v;
        }
        if let Some(v) = text("CAIXA_LISTING_URL") {
            config.listing_url_template = v;
        }
        if let Some(v) = text("CAIXA_GEOCODER_ENDPOINT") {
            config.geocoder_endpoint = v;
        }
        if let Some(v) = text("CAIXA_ARCHIVE_IDENTIFIER") {
            config.archive_identifier = v;
        }
        if let Some(v) = flag("CAIXA_SCHEDULER_ENABLED")? {
            config.scheduler_enabled = v;
        }
        if let Some(v) = text("CAIXA_SCHEDULE_CRON") {
            config.schedule_cron = v;
        }
        Ok(config)
    }

    /// Environment first, then the YAML file on top; only keys present in the file override.
    pub fn load(overlay: Option<&Path>) -> Result<Self> {
        let config = Self::from_env().context("reading CAIXA_* environment")?;
        let config = match overlay {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                config
                    .with_yaml_overlay(&text)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => config,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_yaml_overlay(self, yaml: &str) -> Result<Self> {
        let overlay: Value = serde_yaml::from_str(yaml)?;
        let overlay = match overlay {
            Value::Null => return Ok(self),
            Value::Mapping(map) => map,
            _ => bail!("config overlay must be a mapping"),
        };
        let mut base = serde_yaml::to_value(&self)?;
        if let Value::Mapping(fields) = &mut base {
            for (key, value) in overlay {
                fields.insert(key, value);
            }
        }
        Ok(serde_yaml::from_value(base)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.regions.is_empty() {
            bail!("no regions configured");
        }
        for region in &self.regions {
            if !REGION_CODES.contains(&region.as_str()) {
                bail!("unknown region code {region:?}");
            }
        }
        if !self.listing_url_template.contains("{region}") {
            bail!("listing_url_template must contain {{region}}");
        }
        Ok(())
    }

    pub fn effective_run_date(&self) -> NaiveDate {
        self.run_date.unwrap_or_else(|| Local::now().date_naive())
    }

    pub fn geocode_interval(&self) -> Duration {
        Duration::from_millis(self.geocode_interval_ms)
    }

    pub fn archive_item(&self) -> ArchiveItem {
        ArchiveItem {
            identifier: self.archive_identifier.clone(),
            title: self.archive_title.clone(),
            description: self.archive_description.clone(),
        }
    }
}
