//! Nominatim (OpenStreetMap) geocoding provider.
//!
//! Public Nominatim asks for at most one request per second; the service
//! layer enforces that through the provider's `min_delay`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::GeocodingProvider;
use crate::error::{ImportError, Result};
use crate::models::GeocodeResult;

const DEFAULT_BASE_URL: &str = "https://nominatim.openstreetmap.org";
const USER_AGENT: &str = "geocatalog/0.4 (+https://github.com/geocatalog/geocatalog)";

/// Confidence assigned when Nominatim reports no importance score.
const DEFAULT_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
    display_name: String,
    #[serde(default)]
    importance: Option<f64>,
}

pub struct NominatimProvider {
    client: reqwest::Client,
    base_url: String,
}

impl NominatimProvider {
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ImportError::Fetch {
                url: base_url.to_string(),
                message: format!("failed to build geocoding client: {}", e),
                attempts: 0,
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GeocodingProvider for NominatimProvider {
    fn name(&self) -> &str {
        "nominatim"
    }

    fn min_delay(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn geocode(&self, address: &str) -> Result<Option<GeocodeResult>> {
        let url = format!(
            "{}/search?q={}&format=json&limit=1",
            self.base_url,
            urlencoding::encode(address)
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ImportError::Fetch {
                url: url.clone(),
                message: e.to_string(),
                attempts: 1,
            })?;

        if !response.status().is_success() {
            return Err(ImportError::Fetch {
                url,
                message: format!("HTTP {}", response.status().as_u16()),
                attempts: 1,
            });
        }

        let places: Vec<NominatimPlace> =
            response.json().await.map_err(|e| ImportError::Fetch {
                url,
                message: format!("invalid geocoding response: {}", e),
                attempts: 1,
            })?;

        let Some(place) = places.into_iter().next() else {
            return Ok(None);
        };
        let (Ok(latitude), Ok(longitude)) = (place.lat.parse::<f64>(), place.lon.parse::<f64>())
        else {
            return Ok(None);
        };

        Ok(Some(GeocodeResult {
            latitude,
            longitude,
            confidence: place
                .importance
                .map(|i| i.clamp(0.0, 1.0))
                .unwrap_or(DEFAULT_CONFIDENCE),
            provider: self.name().to_string(),
            normalized_address: place.display_name,
        }))
    }
}
