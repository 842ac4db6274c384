//! Persistent address-to-geocode memoization.
//!
//! Keyed by the original input address text. Entries are shared across all
//! imports and reused indefinitely unless explicitly cleared.

use diesel::prelude::*;

use super::pool::{run_blocking, SqlitePool};
use super::records::LocationCacheRecord;
use crate::error::Result;
use crate::models::GeocodeResult;
use crate::schema::location_cache;

impl From<LocationCacheRecord> for GeocodeResult {
    fn from(record: LocationCacheRecord) -> Self {
        GeocodeResult {
            latitude: record.latitude,
            longitude: record.longitude,
            confidence: record.confidence,
            provider: record.provider,
            normalized_address: record.normalized_address,
        }
    }
}

/// Repository for the shared location cache.
#[derive(Clone)]
pub struct LocationCacheRepository {
    pool: SqlitePool,
}

impl LocationCacheRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Cache lookup; a hit atomically bumps the hit counter.
    pub async fn get(&self, address: &str) -> Result<Option<GeocodeResult>> {
        let address = address.to_string();
        let record = run_blocking(self.pool.clone(), move |conn| {
            let record = location_cache::table
                .find(&address)
                .first::<LocationCacheRecord>(conn)
                .optional()?;
            if record.is_some() {
                diesel::update(location_cache::table.find(&address))
                    .set(location_cache::hits.eq(location_cache::hits + 1))
                    .execute(conn)?;
            }
            Ok(record)
        })
        .await?;
        Ok(record.map(GeocodeResult::from))
    }

    /// Store a resolved address. Concurrent writers for the same address
    /// keep the first entry (insert-or-ignore).
    pub async fn put(&self, address: &str, result: &GeocodeResult) -> Result<()> {
        let address = address.to_string();
        let result = result.clone();
        let now = chrono::Utc::now().to_rfc3339();
        run_blocking(self.pool.clone(), move |conn| {
            diesel::insert_or_ignore_into(location_cache::table)
                .values((
                    location_cache::address.eq(&address),
                    location_cache::latitude.eq(result.latitude),
                    location_cache::longitude.eq(result.longitude),
                    location_cache::confidence.eq(result.confidence),
                    location_cache::provider.eq(&result.provider),
                    location_cache::normalized_address.eq(&result.normalized_address),
                    location_cache::hits.eq(0),
                    location_cache::created_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Explicitly clear the cache. The only invalidation path.
    pub async fn clear(&self) -> Result<usize> {
        let deleted = run_blocking(self.pool.clone(), move |conn| {
            let rows = diesel::delete(location_cache::table).execute(conn)?;
            Ok(rows)
        })
        .await?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::setup_test_db;

    fn sample_result() -> GeocodeResult {
        GeocodeResult {
            latitude: 40.7,
            longitude: -74.0,
            confidence: 0.8,
            provider: "nominatim".into(),
            normalized_address: "1 Main St, New York".into(),
        }
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let (pool, _dir) = setup_test_db().await;
        let repo = LocationCacheRepository::new(pool);

        assert!(repo.get("1 main st").await.unwrap().is_none());
        repo.put("1 main st", &sample_result()).await.unwrap();

        let cached = repo.get("1 main st").await.unwrap().unwrap();
        assert_eq!(cached.latitude, 40.7);
        assert_eq!(cached.provider, "nominatim");
    }

    #[tokio::test]
    async fn test_put_is_insert_or_ignore() {
        let (pool, _dir) = setup_test_db().await;
        let repo = LocationCacheRepository::new(pool);

        repo.put("x", &sample_result()).await.unwrap();
        let mut second = sample_result();
        second.latitude = 0.0;
        repo.put("x", &second).await.unwrap();

        // First write wins.
        let cached = repo.get("x").await.unwrap().unwrap();
        assert_eq!(cached.latitude, 40.7);
    }

    #[tokio::test]
    async fn test_clear() {
        let (pool, _dir) = setup_test_db().await;
        let repo = LocationCacheRepository::new(pool);

        repo.put("a", &sample_result()).await.unwrap();
        repo.put("b", &sample_result()).await.unwrap();
        assert_eq!(repo.clear().await.unwrap(), 2);
        assert!(repo.get("a").await.unwrap().is_none());
    }
}
