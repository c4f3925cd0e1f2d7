use async_trait::async_trait;
use caixa_core::Coordinates;
use caixa_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use tracing::debug;

use crate::{GeocodeError, GeocodeLookup};

pub const NOMINATIM_ENDPOINT: &str = "https://nominatim.openstreetmap.org";

/// Forward geocoding against a Nominatim instance, restricted to Brazil.
///
/// Spacing between calls is the caller's job; the public instance allows one
/// request per second and requires an identifying user agent on the fetcher.
#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    http: HttpFetcher,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

impl NominatimGeocoder {
    pub fn new(http: HttpFetcher) -> Self {
        Self::with_endpoint(http, NOMINATIM_ENDPOINT)
    }

    pub fn with_endpoint(http: HttpFetcher, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl GeocodeLookup for NominatimGeocoder {
    async fn lookup(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let url = format!("{}/search", self.endpoint);
        let places: Vec<NominatimPlace> = self
            .http
            .get_json(
                &url,
                &[
                    ("q", address),
                    ("format", "json"),
                    ("limit", "1"),
                    ("countrycodes", "br"),
                ],
            )
            .await
            .map_err(classify_fetch_error)?;

        let Some(place) = places.into_iter().next() else {
            debug!(address, "nominatim has no match");
            return Ok(None);
        };
        parse_place(&place).map(Some)
    }
}

fn parse_place(place: &NominatimPlace) -> Result<Coordinates, GeocodeError> {
    let latitude: f64 = place
        .lat
        .trim()
        .parse()
        .map_err(|_| GeocodeError::Malformed(format!("latitude {:?}", place.lat)))?;
    let longitude: f64 = place
        .lon
        .trim()
        .parse()
        .map_err(|_| GeocodeError::Malformed(format!("longitude {:?}", place.lon)))?;
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(GeocodeError::Malformed(format!(
            "coordinates out of range ({latitude}, {longitude})"
        )));
    }
    Ok(Coordinates {
        latitude,
        longitude,
    })
}

fn classify_fetch_error(err: FetchError) -> GeocodeError {
    if err.is_timeout() {
        return GeocodeError::Timeout;
    }
    match err {
        FetchError::Decode { message, .. } => GeocodeError::Malformed(message),
        other => GeocodeError::Unavailable(other.to_string()),
    }
}
