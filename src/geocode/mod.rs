//! Address geocoding with caching, provider fallback, and rate limiting.
//!
//! Providers are tried in priority order; the first success is cached and
//! reused for every later occurrence of the same address text. A provider
//! error or miss falls through to the next provider; exhausting the chain
//! records a per-address failure without failing the import.

mod nominatim;

pub use nominatim::NominatimProvider;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::Result;
use crate::models::{GeocodeResult, GeocodeSummary};
use crate::repository::LocationCacheRepository;

/// A pluggable geocoding backend.
#[async_trait]
pub trait GeocodingProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Minimum spacing between calls to this provider.
    fn min_delay(&self) -> Duration;

    /// `Ok(None)` means the provider answered but found no match.
    async fn geocode(&self, address: &str) -> Result<Option<GeocodeResult>>;
}

/// Per-provider minimum-delay limiter. Waits out the remainder of the
/// provider's spacing window before each call.
#[derive(Clone, Default)]
struct ProviderRateLimiter {
    last_call: Arc<Mutex<HashMap<String, Instant>>>,
}

impl ProviderRateLimiter {
    async fn acquire(&self, provider: &str, min_delay: Duration) {
        let wait = {
            let mut last_call = self.last_call.lock().await;
            let now = Instant::now();
            let wait = match last_call.get(provider) {
                Some(last) => min_delay.saturating_sub(now.duration_since(*last)),
                None => Duration::ZERO,
            };
            last_call.insert(provider.to_string(), now + wait);
            wait
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Resolution of one address within a batch.
#[derive(Debug, Clone)]
pub enum Resolution {
    Cached(GeocodeResult),
    Fresh(GeocodeResult),
    Unresolved,
}

/// Cache-first geocoding over an ordered provider chain.
pub struct GeocodingService {
    cache: LocationCacheRepository,
    providers: Vec<Arc<dyn GeocodingProvider>>,
    limiter: ProviderRateLimiter,
}

impl GeocodingService {
    pub fn new(
        cache: LocationCacheRepository,
        providers: Vec<Arc<dyn GeocodingProvider>>,
    ) -> Self {
        Self {
            cache,
            providers,
            limiter: ProviderRateLimiter::default(),
        }
    }

    /// Resolve one address: cache first, then each provider in order.
    pub async fn resolve(&self, address: &str) -> Result<Resolution> {
        if let Some(cached) = self.cache.get(address).await? {
            return Ok(Resolution::Cached(cached));
        }

        for provider in &self.providers {
            self.limiter.acquire(provider.name(), provider.min_delay()).await;
            match provider.geocode(address).await {
                Ok(Some(result)) => {
                    self.cache.put(address, &result).await?;
                    return Ok(Resolution::Fresh(result));
                }
                Ok(None) => {
                    tracing::debug!(address, provider = provider.name(), "no geocoding match");
                }
                Err(e) => {
                    tracing::warn!(address, provider = provider.name(), error = %e, "provider failed");
                }
            }
        }
        Ok(Resolution::Unresolved)
    }

    /// Geocode a batch of addresses, deduplicated before any provider call.
    /// Returns results per distinct address plus the batch summary;
    /// `successful` includes cache hits, `cached` counts them separately.
    pub async fn geocode_batch(
        &self,
        addresses: &[String],
    ) -> Result<(HashMap<String, GeocodeResult>, GeocodeSummary)> {
        let mut distinct: Vec<&String> = Vec::new();
        {
            let mut seen = std::collections::HashSet::new();
            for address in addresses {
                if seen.insert(address.as_str()) {
                    distinct.push(address);
                }
            }
        }

        let mut results = HashMap::new();
        let mut summary = GeocodeSummary {
            total: distinct.len() as u64,
            ..GeocodeSummary::default()
        };

        for address in distinct {
            match self.resolve(address).await? {
                Resolution::Cached(result) => {
                    summary.successful += 1;
                    summary.cached += 1;
                    results.insert(address.clone(), result);
                }
                Resolution::Fresh(result) => {
                    summary.successful += 1;
                    results.insert(address.clone(), result);
                }
                Resolution::Unresolved => {
                    summary.failed += 1;
                }
            }
        }

        Ok((results, summary))
    }
}
