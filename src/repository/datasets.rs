//! Repository for datasets and their approved schema versions.

use diesel::prelude::*;

use super::pool::{run_blocking, SqlitePool};
use super::records::{DatasetRecord, SchemaVersionRecord};
use super::parse_datetime;
use crate::error::Result;
use crate::models::{DataSchema, Dataset, SchemaVersion};
use crate::schema::{datasets, schema_versions};

impl From<DatasetRecord> for Dataset {
    fn from(record: DatasetRecord) -> Self {
        Dataset {
            id: record.id,
            catalog_id: record.catalog_id,
            name: record.name,
            config: serde_json::from_str(&record.config).unwrap_or_default(),
            id_strategy: serde_json::from_str(&record.id_strategy).unwrap_or_default(),
            transformations: serde_json::from_str(&record.transformations).unwrap_or_default(),
            address_field: record.address_field,
            current_schema_version: record.current_schema_version.map(|v| v.max(0) as u32),
            created_at: parse_datetime(&record.created_at),
            updated_at: parse_datetime(&record.updated_at),
        }
    }
}

impl From<SchemaVersionRecord> for SchemaVersion {
    fn from(record: SchemaVersionRecord) -> Self {
        SchemaVersion {
            dataset_id: record.dataset_id,
            version: record.version.max(0) as u32,
            schema: serde_json::from_str::<DataSchema>(&record.fields).unwrap_or_default(),
            approved_by: record.approved_by,
            created_at: parse_datetime(&record.created_at),
        }
    }
}

/// Repository for [`Dataset`] and [`SchemaVersion`] documents.
#[derive(Clone)]
pub struct DatasetRepository {
    pool: SqlitePool,
}

impl DatasetRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new dataset.
    pub async fn create(&self, dataset: &Dataset) -> Result<()> {
        let dataset = dataset.clone();
        let config = serde_json::to_string(&dataset.config).unwrap_or_else(|_| "{}".to_string());
        let strategy =
            serde_json::to_string(&dataset.id_strategy).unwrap_or_else(|_| "{}".to_string());
        let transformations =
            serde_json::to_string(&dataset.transformations).unwrap_or_else(|_| "[]".to_string());

        run_blocking(self.pool.clone(), move |conn| {
            diesel::insert_into(datasets::table)
                .values((
                    datasets::id.eq(&dataset.id),
                    datasets::catalog_id.eq(&dataset.catalog_id),
                    datasets::name.eq(&dataset.name),
                    datasets::config.eq(&config),
                    datasets::id_strategy.eq(&strategy),
                    datasets::transformations.eq(&transformations),
                    datasets::address_field.eq(&dataset.address_field),
                    datasets::current_schema_version
                        .eq(dataset.current_schema_version.map(|v| v as i32)),
                    datasets::created_at.eq(dataset.created_at.to_rfc3339()),
                    datasets::updated_at.eq(dataset.updated_at.to_rfc3339()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Get a dataset by id.
    pub async fn get(&self, id: &str) -> Result<Option<Dataset>> {
        let id = id.to_string();
        let record = run_blocking(self.pool.clone(), move |conn| {
            datasets::table
                .find(&id)
                .first::<DatasetRecord>(conn)
                .optional()
        })
        .await?;
        Ok(record.map(Dataset::from))
    }

    /// Find a dataset by catalog and name (sheet mapping fallback).
    pub async fn find_by_name(&self, catalog_id: &str, name: &str) -> Result<Option<Dataset>> {
        let catalog_id = catalog_id.to_string();
        let name = name.to_string();
        let record = run_blocking(self.pool.clone(), move |conn| {
            datasets::table
                .filter(datasets::catalog_id.eq(&catalog_id))
                .filter(datasets::name.eq(&name))
                .first::<DatasetRecord>(conn)
                .optional()
        })
        .await?;
        Ok(record.map(Dataset::from))
    }

    /// Append an immutable schema version and point the dataset at it.
    /// Returns the new version number.
    pub async fn create_schema_version(
        &self,
        dataset_id: &str,
        schema: &DataSchema,
        approved_by: Option<&str>,
    ) -> Result<u32> {
        let dataset_id = dataset_id.to_string();
        let fields = serde_json::to_string(schema).unwrap_or_else(|_| "{}".to_string());
        let approved_by = approved_by.map(|s| s.to_string());
        let now = chrono::Utc::now().to_rfc3339();

        let version = run_blocking(self.pool.clone(), move |conn| {
            conn.transaction(|conn| {
                let latest: Option<i32> = schema_versions::table
                    .filter(schema_versions::dataset_id.eq(&dataset_id))
                    .select(diesel::dsl::max(schema_versions::version))
                    .first(conn)?;
                let next = latest.unwrap_or(0) + 1;

                diesel::insert_into(schema_versions::table)
                    .values((
                        schema_versions::dataset_id.eq(&dataset_id),
                        schema_versions::version.eq(next),
                        schema_versions::fields.eq(&fields),
                        schema_versions::approved_by.eq(&approved_by),
                        schema_versions::created_at.eq(&now),
                    ))
                    .execute(conn)?;

                diesel::update(datasets::table.find(&dataset_id))
                    .set((
                        datasets::current_schema_version.eq(Some(next)),
                        datasets::updated_at.eq(&now),
                    ))
                    .execute(conn)?;

                Ok(next)
            })
        })
        .await?;
        Ok(version.max(0) as u32)
    }

    /// Latest approved schema for a dataset, if any.
    pub async fn latest_schema(&self, dataset_id: &str) -> Result<Option<SchemaVersion>> {
        let dataset_id = dataset_id.to_string();
        let record = run_blocking(self.pool.clone(), move |conn| {
            schema_versions::table
                .filter(schema_versions::dataset_id.eq(&dataset_id))
                .order(schema_versions::version.desc())
                .first::<SchemaVersionRecord>(conn)
                .optional()
        })
        .await?;
        Ok(record.map(SchemaVersion::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldDef, FieldType};
    use crate::repository::test_support::setup_test_db;

    fn schema_with(field: &str) -> DataSchema {
        let mut schema = DataSchema::default();
        schema.fields.insert(
            field.to_string(),
            FieldDef {
                field_type: FieldType::String,
                required: true,
            },
        );
        schema
    }

    #[tokio::test]
    async fn test_schema_versions_are_sequential() {
        let (pool, _dir) = setup_test_db().await;
        let repo = DatasetRepository::new(pool);

        let dataset = Dataset::new("catalog-1".into(), "crimes".into());
        repo.create(&dataset).await.unwrap();

        let v1 = repo
            .create_schema_version(&dataset.id, &schema_with("title"), None)
            .await
            .unwrap();
        let v2 = repo
            .create_schema_version(&dataset.id, &schema_with("title2"), Some("admin"))
            .await
            .unwrap();
        assert_eq!((v1, v2), (1, 2));

        let latest = repo.latest_schema(&dataset.id).await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.approved_by.as_deref(), Some("admin"));
        assert!(latest.schema.fields.contains_key("title2"));

        let fetched = repo.get(&dataset.id).await.unwrap().unwrap();
        assert_eq!(fetched.current_schema_version, Some(2));
    }

    #[tokio::test]
    async fn test_find_by_name() {
        let (pool, _dir) = setup_test_db().await;
        let repo = DatasetRepository::new(pool);

        let dataset = Dataset::new("catalog-1".into(), "permits".into());
        repo.create(&dataset).await.unwrap();

        assert!(repo
            .find_by_name("catalog-1", "permits")
            .await
            .unwrap()
            .is_some());
        assert!(repo
            .find_by_name("catalog-1", "missing")
            .await
            .unwrap()
            .is_none());
    }
}
