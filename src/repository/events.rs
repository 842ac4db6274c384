//! Repository for materialized events.

use std::collections::HashSet;

use diesel::prelude::*;

use super::pool::{run_blocking, SqlitePool};
use super::records::EventRecord;
use super::parse_datetime;
use crate::error::Result;
use crate::models::{Event, GeocodeResult, ValidationStatus};
use crate::schema::events;

impl From<EventRecord> for Event {
    fn from(record: EventRecord) -> Self {
        Event {
            id: record.id,
            dataset_id: record.dataset_id,
            import_file_id: record.import_file_id,
            import_job_id: record.import_job_id,
            data: serde_json::from_str(&record.data).unwrap_or_default(),
            validation_status: ValidationStatus::from_str(&record.validation_status)
                .unwrap_or(ValidationStatus::Pending),
            transform_notes: serde_json::from_str(&record.transform_notes).unwrap_or_default(),
            row_hash: record.row_hash,
            address: record.address,
            geocode: record
                .geocode
                .as_deref()
                .and_then(|g| serde_json::from_str(g).ok()),
            created_at: parse_datetime(&record.created_at),
        }
    }
}

/// Repository for [`Event`] documents.
#[derive(Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a batch of events in one transaction.
    pub async fn insert_batch(&self, batch: Vec<Event>) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let inserted = run_blocking(self.pool.clone(), move |conn| {
            conn.transaction(|conn| {
                let mut count = 0;
                for event in &batch {
                    let data = serde_json::to_string(&event.data)
                        .unwrap_or_else(|_| "{}".to_string());
                    let notes = serde_json::to_string(&event.transform_notes)
                        .unwrap_or_else(|_| "[]".to_string());
                    let geocode = event
                        .geocode
                        .as_ref()
                        .and_then(|g| serde_json::to_string(g).ok());
                    count += diesel::insert_into(events::table)
                        .values((
                            events::id.eq(&event.id),
                            events::dataset_id.eq(&event.dataset_id),
                            events::import_file_id.eq(&event.import_file_id),
                            events::import_job_id.eq(&event.import_job_id),
                            events::data.eq(&data),
                            events::validation_status.eq(event.validation_status.as_str()),
                            events::transform_notes.eq(&notes),
                            events::row_hash.eq(&event.row_hash),
                            events::address.eq(&event.address),
                            events::geocode.eq(&geocode),
                            events::created_at.eq(event.created_at.to_rfc3339()),
                        ))
                        .execute(conn)?;
                }
                Ok(count)
            })
        })
        .await?;
        Ok(inserted)
    }

    /// Which of the given row hashes already exist in a dataset. Drives
    /// the external phase of deduplication.
    pub async fn existing_row_hashes(
        &self,
        dataset_id: &str,
        hashes: &[String],
    ) -> Result<HashSet<String>> {
        if hashes.is_empty() {
            return Ok(HashSet::new());
        }
        let dataset_id = dataset_id.to_string();
        let hashes = hashes.to_vec();
        let found = run_blocking(self.pool.clone(), move |conn| {
            events::table
                .filter(events::dataset_id.eq(&dataset_id))
                .filter(events::row_hash.eq_any(&hashes))
                .select(events::row_hash)
                .load::<String>(conn)
        })
        .await?;
        Ok(found.into_iter().collect())
    }

    /// Events created by a job that carry an address but no geocode yet.
    pub async fn ungeocoded_for_job(&self, import_job_id: &str) -> Result<Vec<Event>> {
        let import_job_id = import_job_id.to_string();
        let records = run_blocking(self.pool.clone(), move |conn| {
            events::table
                .filter(events::import_job_id.eq(&import_job_id))
                .filter(events::address.is_not_null())
                .filter(events::geocode.is_null())
                .load::<EventRecord>(conn)
        })
        .await?;
        Ok(records.into_iter().map(Event::from).collect())
    }

    /// Attach a geocode result to an event.
    pub async fn set_geocode(&self, event_id: &str, result: &GeocodeResult) -> Result<()> {
        let event_id = event_id.to_string();
        let json = serde_json::to_string(result).unwrap_or_else(|_| "{}".to_string());
        run_blocking(self.pool.clone(), move |conn| {
            diesel::update(events::table.find(&event_id))
                .set(events::geocode.eq(Some(&json)))
                .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Number of events created by one job.
    pub async fn count_for_job(&self, import_job_id: &str) -> Result<i64> {
        let import_job_id = import_job_id.to_string();
        let count = run_blocking(self.pool.clone(), move |conn| {
            events::table
                .filter(events::import_job_id.eq(&import_job_id))
                .count()
                .first::<i64>(conn)
        })
        .await?;
        Ok(count)
    }
}
