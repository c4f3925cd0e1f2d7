use std::collections::BTreeMap;

use caixa_core::{format_brl, HistoricalRecord};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSummary {
    pub region: String,
    pub count: usize,
    pub active: usize,
    /// Mean over records with a price; `None` when no record has one.
    pub mean_price: Option<f64>,
    pub geocoded: usize,
    pub coverage_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub run_date: NaiveDate,
    pub total: usize,
    pub active: usize,
    pub geocoded: usize,
    pub coverage_percent: Option<f64>,
    pub regions: Vec<RegionSummary>,
}

#[derive(Default)]
struct RegionAccumulator {
    count: usize,
    active: usize,
    price_sum: f64,
    priced: usize,
    geocoded: usize,
}

/// Aggregate the ledger per region. Empty groups report `None`, never NaN.
pub fn summarize<'a>(
    records: impl IntoIterator<Item = &'a HistoricalRecord>,
    run_date: NaiveDate,
) -> LedgerSummary {
    let mut groups: BTreeMap<&str, RegionAccumulator> = BTreeMap::new();
    for record in records {
        let group = groups.entry(record.region()).or_default();
        group.count += 1;
        if record.is_active(run_date) {
            group.active += 1;
        }
        if let Some(price) = record.listing.price.filter(|p| p.is_finite()) {
            group.price_sum += price;
            group.priced += 1;
        }
        if record.coordinates.is_some() {
            group.geocoded += 1;
        }
    }

    let regions: Vec<RegionSummary> = groups
        .into_iter()
        .map(|(region, acc)| RegionSummary {
            region: if region.is_empty() { "??" } else { region }.to_string(),
            count: acc.count,
            active: acc.active,
            mean_price: ratio(acc.price_sum, acc.priced),
            geocoded: acc.geocoded,
            coverage_percent: percent(acc.geocoded, acc.count),
        })
        .collect();

    let total = regions.iter().map(|r| r.count).sum();
    let geocoded = regions.iter().map(|r| r.geocoded).sum();
    LedgerSummary {
        run_date,
        total,
        active: regions.iter().map(|r| r.active).sum(),
        geocoded,
        coverage_percent: percent(geocoded, total),
        regions,
    }
}

fn ratio(sum: f64, n: usize) -> Option<f64> {
    (n > 0).then(|| sum / n as f64)
}

fn percent(part: usize, whole: usize) -> Option<f64> {
    ratio(part as f64 * 100.0, whole)
}

fn fmt_percent(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.1}%"))
}

pub fn render_markdown(summary: &LedgerSummary) -> String {
    let mut lines = vec![
        "# Caixa property ledger".to_string(),
        String::new(),
        format!("- Run date: {}", summary.run_date),
        format!("- Listings tracked: {}", summary.total),
        format!("- Active this run: {}", summary.active),
        format!(
            "- Geocoded: {} ({})",
            summary.geocoded,
            fmt_percent(summary.coverage_percent)
        ),
        String::new(),
        "## Regions".to_string(),
        String::new(),
    ];
    if summary.regions.is_empty() {
        lines.push("_No listings yet._".to_string());
    } else {
        lines.push("| Region | Listings | Active | Mean price | Geocoded |".to_string());
        lines.push("|---|---:|---:|---:|---:|".to_string());
        for r in &summary.regions {
            lines.push(format!(
                "| {} | {} | {} | {} | {} ({}) |",
                r.region,
                r.count,
                r.active,
                format_brl(r.mean_price),
                r.geocoded,
                fmt_percent(r.coverage_percent)
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}
