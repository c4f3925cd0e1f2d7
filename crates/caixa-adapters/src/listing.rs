use async_trait::async_trait;
use caixa_core::SnapshotRow;
use caixa_storage::{ArtifactStore, HttpFetcher};
use chrono::Utc;
use scraper::{ElementRef, Html, Selector};
use tracing::{info, warn};

use crate::{decode_text, AdapterError, RegionSnapshot, SnapshotSource};

pub const DETAIL_BASE_URL: &str =
    "https://venda-imoveis.caixa.gov.br/sistema/detalhe-imovel.asp?hdnOrigem=index&hdnimovel=";

const LISTING_COLUMNS: usize = 11;

/// Scrapes the public per-region listing page (`Lista_imoveis_<REGION>.htm`).
#[derive(Debug, Clone)]
pub struct ListingPageSource {
    http: HttpFetcher,
    /// URL template; `{region}` is replaced by the upper-case region code.
    url_template: String,
    artifacts: Option<ArtifactStore>,
}

impl ListingPageSource {
    pub fn new(http: HttpFetcher, url_template: impl Into<String>) -> Self {
        Self {
            http,
            url_template: url_template.into(),
            artifacts: None,
        }
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn url_for(&self, region: &str) -> String {
        self.url_template
            .replace("{region}", &region.trim().to_ascii_uppercase())
    }
}

#[async_trait]
impl SnapshotSource for ListingPageSource {
    fn name(&self) -> &'static str {
        "listing-page"
    }

    async fn fetch_region(&self, region: &str) -> Result<RegionSnapshot, AdapterError> {
        let url = self.url_for(region);
        let fetched_at = Utc::now();
        let page = self.http.fetch_bytes(&url).await?;

        if let Some(store) = &self.artifacts {
            // Raw pages are a convenience for re-parsing; losing one is not worth failing the region.
            if let Err(err) = store.store_bytes(fetched_at, region, "htm", &page.body).await {
                warn!(region, error = %err, "could not keep raw listing page");
            }
        }

        let html = decode_text(page.body);
        let mut snapshot = RegionSnapshot::empty(region, fetched_at);
        snapshot.rows = parse_listing_html(&html, region)?;
        info!(region, rows = snapshot.rows.len(), url = %page.final_url, "listing page parsed");
        Ok(snapshot)
    }
}

/// Parse the listing table. Rows with fewer than eleven cells (headers, banners) are ignored.
pub fn parse_listing_html(html: &str, region: &str) -> Result<Vec<SnapshotRow>, AdapterError> {
    let document = Html::parse_document(html);
    let row_sel = selector("table tr")?;
    let cell_sel = selector("td")?;
    let link_sel = selector("a[href]")?;
    let region = region.trim().to_ascii_uppercase();

    let mut rows = Vec::new();
    for tr in document.select(&row_sel) {
        let cells: Vec<ElementRef<'_>> = tr.select(&cell_sel).collect();
        if cells.len() < LISTING_COLUMNS {
            continue;
        }

        let key = cells[0]
            .select(&link_sel)
            .filter_map(|a| a.value().attr("href"))
            .find_map(extract_listing_key)
            .unwrap_or_default();
        let text = |idx: usize| cell_text(cells[idx]);
        let row_region = text(10);

        rows.push(SnapshotRow {
            key,
            address: text(1),
            neighborhood: text(2),
            description: text(3),
            price: text(4),
            appraised_value: text(5),
            discount: text(6),
            sale_modality: text(7),
            photo: text(8),
            city: text(9),
            region: if row_region.is_empty() {
                region.clone()
            } else {
                row_region
            },
        });
    }
    Ok(rows)
}

/// The listing id is the `hdnimovel` query value; other links fall back to the
/// href stripped of the detail-page prefix.
pub fn extract_listing_key(href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    if let Some((_, tail)) = href.split_once("hdnimovel=") {
        let id = tail.split('&').next().unwrap_or_default().trim();
        return (!id.is_empty()).then(|| id.to_string());
    }
    let stripped = href.strip_prefix(DETAIL_BASE_URL).unwrap_or(href).trim();
    (!stripped.is_empty()).then(|| stripped.to_string())
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
