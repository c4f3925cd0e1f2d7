//! Consolidation engine: ledger merge, geocode gate, summaries, export,
//! and the pipeline that runs them once per scrape cycle.

mod config;
mod export;
mod geocode;
mod ledger;
mod pipeline;
mod report;

pub use config::{PipelineConfig, DEFAULT_LISTING_URL_TEMPLATE};
pub use export::{
    export_parquet, ExportManifest, ExportManifestFile, ExportOutput, MANIFEST_FILE_NAME,
    PARQUET_FILE_NAME,
};
pub use geocode::{
    GeocodeGate, GeocodePass, GeocodeStats, DEFAULT_GEOCODE_INTERVAL, DEFAULT_NOT_FOUND_TTL_DAYS,
};
pub use ledger::{merge, DuplicateKeyPolicy, Ledger, MergeOutcome, MergeStats};
pub use pipeline::{Pipeline, ReportOutput, RunSummary};
pub use report::{render_markdown, summarize, LedgerSummary, RegionSummary};

pub const CRATE_NAME: &str = "caixa-sync";
