//! Place name → coordinates.

use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeocodeError {
    #[error("Could not find coordinates for city: {0}")]
    NotFound(String),

    #[error("Geocoding request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid geocoder response: {0}")]
    Response(String),
}

pub type GeocodeResult<T> = Result<T, GeocodeError>;

#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub display_name: Option<String>,
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Best match for a free-text place name; no match is [`GeocodeError::NotFound`].
    async fn locate(&self, place: &str) -> GeocodeResult<Location>;
}

/// OpenStreetMap Nominatim search API.
pub struct NominatimGeocoder {
    client: Client,
    url: String,
}

impl NominatimGeocoder {
    pub fn new(url: &str, user_agent: &str) -> GeocodeResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn locate(&self, place: &str) -> GeocodeResult<Location> {
        debug!("Geocoding '{}' via {}", place, self.url);
        let body = self
            .client
            .get(&self.url)
            .query(&[("q", place), ("format", "json"), ("limit", "1")])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let location = parse_search_response(&body, place)?;
        info!(
            "Latitude: {}, Longitude: {}",
            location.latitude, location.longitude
        );
        Ok(location)
    }
}

#[derive(Debug, Deserialize)]
struct Place {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: Option<String>,
}

/// First hit of a Nominatim `format=json` search result.
pub fn parse_search_response(body: &str, place: &str) -> GeocodeResult<Location> {
    let places: Vec<Place> =
        serde_json::from_str(body).map_err(|e| GeocodeError::Response(e.to_string()))?;
    let first = places
        .into_iter()
        .next()
        .ok_or_else(|| GeocodeError::NotFound(place.to_string()))?;

    let coordinate = |value: &str| {
        value
            .parse::<f64>()
            .map_err(|_| GeocodeError::Response(format!("non-numeric coordinate '{}'", value)))
    };
    Ok(Location {
        latitude: coordinate(&first.lat)?,
        longitude: coordinate(&first.lon)?,
        display_name: first.display_name,
    })
}
