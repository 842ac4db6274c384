//! Repository for fetched/uploaded source artifacts.

use diesel::prelude::*;

use super::pool::{run_blocking, SqlitePool};
use super::records::ImportFileRecord;
use super::{parse_datetime, parse_datetime_opt};
use crate::error::Result;
use crate::models::{FileMetadata, FileOrigin, FileStatus, ImportFile};
use crate::schema::import_files;

impl From<ImportFileRecord> for ImportFile {
    fn from(record: ImportFileRecord) -> Self {
        ImportFile {
            id: record.id,
            catalog_id: record.catalog_id,
            origin: FileOrigin::from_str(&record.origin).unwrap_or(FileOrigin::Upload),
            status: FileStatus::from_str(&record.status).unwrap_or(FileStatus::Failed),
            content_hash: record.content_hash,
            mime_type: record.mime_type,
            size_bytes: record.size_bytes.max(0) as u64,
            storage_path: record.storage_path,
            scheduled_import_id: record.scheduled_import_id,
            is_duplicate: record.is_duplicate != 0,
            metadata: serde_json::from_str::<FileMetadata>(&record.metadata).unwrap_or_default(),
            error: record.error,
            created_at: parse_datetime(&record.created_at),
            updated_at: parse_datetime_opt(Some(record.updated_at)).unwrap_or_default(),
        }
    }
}

/// Repository for [`ImportFile`] documents.
#[derive(Clone)]
pub struct ImportFileRepository {
    pool: SqlitePool,
}

impl ImportFileRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new import file.
    pub async fn create(&self, file: &ImportFile) -> Result<()> {
        let file = file.clone();
        let metadata = serde_json::to_string(&file.metadata).unwrap_or_else(|_| "{}".to_string());

        run_blocking(self.pool.clone(), move |conn| {
            diesel::insert_into(import_files::table)
                .values((
                    import_files::id.eq(&file.id),
                    import_files::catalog_id.eq(&file.catalog_id),
                    import_files::origin.eq(file.origin.as_str()),
                    import_files::status.eq(file.status.as_str()),
                    import_files::content_hash.eq(&file.content_hash),
                    import_files::mime_type.eq(&file.mime_type),
                    import_files::size_bytes.eq(file.size_bytes as i64),
                    import_files::storage_path.eq(&file.storage_path),
                    import_files::scheduled_import_id.eq(&file.scheduled_import_id),
                    import_files::is_duplicate.eq(file.is_duplicate as i32),
                    import_files::metadata.eq(&metadata),
                    import_files::error.eq(&file.error),
                    import_files::created_at.eq(file.created_at.to_rfc3339()),
                    import_files::updated_at.eq(file.updated_at.to_rfc3339()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Get an import file by id.
    pub async fn get(&self, id: &str) -> Result<Option<ImportFile>> {
        let id = id.to_string();
        let record = run_blocking(self.pool.clone(), move |conn| {
            import_files::table
                .find(&id)
                .first::<ImportFileRecord>(conn)
                .optional()
        })
        .await?;
        Ok(record.map(ImportFile::from))
    }

    /// Move a file to a new lifecycle status.
    pub async fn set_status(&self, id: &str, status: FileStatus) -> Result<()> {
        let id = id.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        run_blocking(self.pool.clone(), move |conn| {
            diesel::update(import_files::table.find(&id))
                .set((
                    import_files::status.eq(status.as_str()),
                    import_files::updated_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Mark a file failed with an error message.
    pub async fn fail(&self, id: &str, error: &str) -> Result<()> {
        let id = id.to_string();
        let error = error.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        run_blocking(self.pool.clone(), move |conn| {
            diesel::update(import_files::table.find(&id))
                .set((
                    import_files::status.eq(FileStatus::Failed.as_str()),
                    import_files::error.eq(Some(&error)),
                    import_files::updated_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Find a prior completed import of the same content under a catalog.
    /// This is the duplicate short-circuit for repeated fetches.
    pub async fn find_completed_by_hash(
        &self,
        catalog_id: &str,
        content_hash: &str,
    ) -> Result<Option<ImportFile>> {
        let catalog_id = catalog_id.to_string();
        let content_hash = content_hash.to_string();
        let record = run_blocking(self.pool.clone(), move |conn| {
            import_files::table
                .filter(import_files::catalog_id.eq(&catalog_id))
                .filter(import_files::content_hash.eq(&content_hash))
                .filter(import_files::status.eq(FileStatus::Completed.as_str()))
                .order(import_files::created_at.desc())
                .first::<ImportFileRecord>(conn)
                .optional()
        })
        .await?;
        Ok(record.map(ImportFile::from))
    }

    /// Flag a file as having been re-fetched with unchanged content. The
    /// row keeps its id and completed status; only the duplicate marker and
    /// the audit timestamp move.
    pub async fn mark_duplicate(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        run_blocking(self.pool.clone(), move |conn| {
            diesel::update(import_files::table.find(&id))
                .set((
                    import_files::is_duplicate.eq(1),
                    import_files::updated_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Replace the metadata blob (audit fields only).
    pub async fn set_metadata(&self, id: &str, metadata: &FileMetadata) -> Result<()> {
        let id = id.to_string();
        let metadata = serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_string());
        let now = chrono::Utc::now().to_rfc3339();
        run_blocking(self.pool.clone(), move |conn| {
            diesel::update(import_files::table.find(&id))
                .set((
                    import_files::metadata.eq(&metadata),
                    import_files::updated_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::setup_test_db;

    fn sample_file() -> ImportFile {
        ImportFile::new(
            "catalog-1".into(),
            FileOrigin::Url,
            "deadbeef".into(),
            "text/csv".into(),
            1024,
            "blobs/deadbeef".into(),
        )
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (pool, _dir) = setup_test_db().await;
        let repo = ImportFileRepository::new(pool);

        let file = sample_file();
        repo.create(&file).await.unwrap();

        let fetched = repo.get(&file.id).await.unwrap().unwrap();
        assert_eq!(fetched.content_hash, "deadbeef");
        assert_eq!(fetched.status, FileStatus::Pending);
        assert_eq!(fetched.size_bytes, 1024);
    }

    #[tokio::test]
    async fn test_duplicate_lookup_requires_completed() {
        let (pool, _dir) = setup_test_db().await;
        let repo = ImportFileRepository::new(pool);

        let file = sample_file();
        repo.create(&file).await.unwrap();

        // Pending file is not a duplicate candidate.
        assert!(repo
            .find_completed_by_hash("catalog-1", "deadbeef")
            .await
            .unwrap()
            .is_none());

        repo.set_status(&file.id, FileStatus::Completed).await.unwrap();
        let found = repo
            .find_completed_by_hash("catalog-1", "deadbeef")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, file.id);

        // Other catalogs never match.
        assert!(repo
            .find_completed_by_hash("catalog-2", "deadbeef")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_mark_duplicate_keeps_id_and_status() {
        let (pool, _dir) = setup_test_db().await;
        let repo = ImportFileRepository::new(pool);

        let file = sample_file();
        repo.create(&file).await.unwrap();
        repo.set_status(&file.id, FileStatus::Completed).await.unwrap();

        repo.mark_duplicate(&file.id).await.unwrap();

        let fetched = repo.get(&file.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, file.id);
        assert!(fetched.is_duplicate);
        assert_eq!(fetched.status, FileStatus::Completed);
    }

    #[tokio::test]
    async fn test_fail_records_error() {
        let (pool, _dir) = setup_test_db().await;
        let repo = ImportFileRepository::new(pool);

        let file = sample_file();
        repo.create(&file).await.unwrap();
        repo.fail(&file.id, "parse error: bad header").await.unwrap();

        let fetched = repo.get(&file.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, FileStatus::Failed);
        assert!(fetched.error.unwrap().contains("bad header"));
    }
}
