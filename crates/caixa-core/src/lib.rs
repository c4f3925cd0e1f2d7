//! Core domain model for the Caixa property-auction ledger.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

mod normalize;

pub use normalize::{
    format_brl, normalize_financial_fields, parse_currency, parse_percentage,
    parse_percentage_as, PercentForm,
};

pub const CRATE_NAME: &str = "caixa-core";

/// Federative-unit codes published by the listing site, one snapshot each.
pub const REGION_CODES: [&str; 27] = [
    "AC", "AM", "AL", "AP", "BA", "CE", "DF", "ES", "GO", "MA", "MT", "MS", "MG", "PA", "PB",
    "PR", "PE", "PI", "RJ", "RN", "RS", "RO", "RR", "SC", "SP", "SE", "TO",
];

/// One scraped listing for one region, financial fields still locale-formatted.
///
/// Field aliases accept the upstream Portuguese column names so snapshot
/// files written by older scrapers load unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRow {
    #[serde(alias = "link", default)]
    pub key: String,
    #[serde(alias = "endereco", default)]
    pub address: String,
    #[serde(alias = "bairro", default)]
    pub neighborhood: String,
    #[serde(alias = "descricao", default)]
    pub description: String,
    #[serde(alias = "preco", default)]
    pub price: String,
    #[serde(alias = "avaliacao", default)]
    pub appraised_value: String,
    #[serde(alias = "desconto", default)]
    pub discount: String,
    #[serde(alias = "modalidade", default)]
    pub sale_modality: String,
    #[serde(alias = "foto", default)]
    pub photo: String,
    #[serde(alias = "cidade", default)]
    pub city: String,
    #[serde(alias = "estado", default)]
    pub region: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Snapshot row with numeric financial fields. `None` means absent or unparsable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub key: String,
    pub address: String,
    pub neighborhood: String,
    pub description: String,
    pub price: Option<f64>,
    pub appraised_value: Option<f64>,
    /// Discount magnitude in percent (`10.5` for "10,5%").
    pub discount: Option<f64>,
    pub sale_modality: String,
    pub photo: String,
    pub city: String,
    pub region: String,
}

impl NormalizedListing {
    /// Free-form address handed to the geocoder, `None` when every part is blank.
    pub fn geocode_address(&self) -> Option<String> {
        let parts = [
            self.address.as_str(),
            self.neighborhood.as_str(),
            self.city.as_str(),
            self.region.as_str(),
        ];
        let joined = parts
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(", ");
        if joined.is_empty() {
            None
        } else {
            Some(joined)
        }
    }
}

/// One row per identity key ever observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalRecord {
    pub listing: NormalizedListing,
    pub coordinates: Option<Coordinates>,
    pub first_seen: NaiveDate,
    pub last_seen: NaiveDate,
}

impl HistoricalRecord {
    pub fn first_observed(listing: NormalizedListing, run_date: NaiveDate) -> Self {
        Self {
            listing,
            coordinates: None,
            first_seen: run_date,
            last_seen: run_date,
        }
    }

    pub fn key(&self) -> &str {
        &self.listing.key
    }

    pub fn region(&self) -> &str {
        &self.listing.region
    }

    /// A record is active when the run being reported on re-observed it.
    pub fn is_active(&self, run_date: NaiveDate) -> bool {
        self.last_seen == run_date
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinancialField {
    Price,
    AppraisedValue,
    Discount,
}

impl fmt::Display for FinancialField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FinancialField::Price => "price",
            FinancialField::AppraisedValue => "appraised_value",
            FinancialField::Discount => "discount",
        };
        f.write_str(name)
    }
}

/// Recoverable problems found while consolidating a run. None of them abort the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataQualityIssue {
    MissingKey { region: String, position: usize },
    MalformedKey { region: String, key: String },
    DuplicateKey { region: String, key: String },
    UnparsableAmount { key: String, field: FinancialField, raw: String },
    MissingLocation { key: String },
    InvertedDates { key: String },
    SnapshotUnavailable { region: String, reason: String },
    GeocodeFailed { key: String, address: String, reason: String },
}

impl fmt::Display for DataQualityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataQualityIssue::MissingKey { region, position } => {
                write!(f, "row {position} of region {region} has no identity key")
            }
            DataQualityIssue::MalformedKey { region, key } => {
                write!(f, "malformed identity key {key:?} in region {region}")
            }
            DataQualityIssue::DuplicateKey { region, key } => {
                write!(f, "identity key {key} repeated in region {region}")
            }
            DataQualityIssue::UnparsableAmount { key, field, raw } => {
                write!(f, "listing {key}: cannot parse {field} from {raw:?}")
            }
            DataQualityIssue::MissingLocation { key } => {
                write!(f, "listing {key} has no city or region")
            }
            DataQualityIssue::InvertedDates { key } => {
                write!(f, "listing {key} had first_seen after last_seen")
            }
            DataQualityIssue::SnapshotUnavailable { region, reason } => {
                write!(f, "snapshot for region {region} unavailable: {reason}")
            }
            DataQualityIssue::GeocodeFailed {
                key,
                address,
                reason,
            } => write!(f, "geocoding {key} ({address}) failed: {reason}"),
        }
    }
}
