use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use thiserror::Error;
use tracing::{debug, warn};

use crate::render::FileRef;
use crate::slack::SlackApi;

diesel::table! {
    files (file_id) {
        file_id -> Text,
        cached -> Double,
        name -> Text,
        mimetype -> Text,
        title -> Text,
        file_data -> Binary,
    }
}

const CREATE_FILES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS files(
    file_id   TEXT PRIMARY KEY,
    cached    DOUBLE NOT NULL,
    name      TEXT NOT NULL,
    mimetype  TEXT NOT NULL,
    title     TEXT NOT NULL,
    file_data BLOB NOT NULL
)
"#;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Migration error: {0}")]
    Migration(String),
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = files)]
struct DbCachedFile {
    file_id: String,
    cached: f64,
    name: String,
    mimetype: String,
    title: String,
    file_data: Vec<u8>,
}

/// Metadata row without the payload, for cache listings.
#[derive(Debug, Clone, Queryable)]
pub struct CachedFileInfo {
    pub file_id: String,
    pub cached: f64,
    pub name: String,
    pub mimetype: String,
    pub title: String,
}

fn establish_connection(path: &str) -> Result<SqliteConnection, CacheError> {
    SqliteConnection::establish(path).map_err(|e| CacheError::Connection(e.to_string()))
}

/// Durable per-workspace store of downloaded attachment bytes, keyed by the
/// remote file ID. Writes are replace-by-key; nothing here ever deletes.
pub struct FileCache {
    db_path: Arc<String>,
}

impl FileCache {
    /// Open or create the store, creating the schema if absent.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let db_path = Arc::new(path.as_ref().to_string_lossy().into_owned());
        let for_migration = db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&for_migration)?;
            diesel::sql_query(CREATE_FILES_TABLE)
                .execute(&mut conn)
                .map(|_| ())
                .map_err(|e| CacheError::Migration(e.to_string()))
        })
        .await
        .map_err(|e| CacheError::Query(format!("database task failed: {e}")))??;

        Ok(Self { db_path })
    }

    pub async fn get(&self, file_id: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.read(file_id, None).await
    }

    /// Cached bytes only when the entry was written at or after `min_ts`;
    /// older entries report absent so the caller re-downloads.
    pub async fn get_if_fresh(
        &self,
        file_id: &str,
        min_ts: f64,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        self.read(file_id, Some(min_ts)).await
    }

    async fn read(
        &self,
        file_id: &str,
        min_ts: Option<f64>,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let file_id = file_id.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            let row = files::table
                .filter(files::file_id.eq(&file_id))
                .select((files::cached, files::file_data))
                .first::<(f64, Vec<u8>)>(&mut conn)
                .optional()
                .map_err(|e| CacheError::Query(e.to_string()))?;

            Ok(match row {
                Some((cached_at, bytes)) => {
                    if min_ts.is_none_or(|min_ts| cached_at >= min_ts) {
                        Some(bytes)
                    } else {
                        None
                    }
                }
                None => None,
            })
        })
        .await
        .map_err(|e| CacheError::Query(format!("database task failed: {e}")))?
    }

    /// Store bytes under the file ID, replacing any previous entry, and hand
    /// them back so the caller can stream them onward without a re-read.
    pub async fn put(
        &self,
        file_id: &str,
        bytes: &[u8],
        name: &str,
        mimetype: &str,
        title: Option<&str>,
    ) -> Result<Vec<u8>, CacheError> {
        let row = DbCachedFile {
            file_id: file_id.to_string(),
            cached: now_ts(),
            name: name.to_string(),
            mimetype: mimetype.to_string(),
            title: title.unwrap_or(name).to_string(),
            file_data: bytes.to_vec(),
        };
        let returned = row.file_data.clone();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            diesel::replace_into(files::table)
                .values(&row)
                .execute(&mut conn)
                .map(|_| ())
                .map_err(|e| CacheError::Query(e.to_string()))
        })
        .await
        .map_err(|e| CacheError::Query(format!("database task failed: {e}")))??;

        Ok(returned)
    }

    /// Metadata of every cached file, most recently cached first.
    pub async fn list(&self) -> Result<Vec<CachedFileInfo>, CacheError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            files::table
                .order(files::cached.desc())
                .select((
                    files::file_id,
                    files::cached,
                    files::name,
                    files::mimetype,
                    files::title,
                ))
                .load::<CachedFileInfo>(&mut conn)
                .map_err(|e| CacheError::Query(e.to_string()))
        })
        .await
        .map_err(|e| CacheError::Query(format!("database task failed: {e}")))?
    }

    /// Fetch-or-download used by the display worker. Network failures report
    /// "file unavailable" (`None`) rather than an error; only the local
    /// display decides what that means.
    pub async fn fetch_file(&self, api: &dyn SlackApi, file: &FileRef) -> Option<Vec<u8>> {
        if file.is_tombstone() {
            return self.read_or_warn(&file.id, None).await;
        }

        let metadata = match api.file_metadata(&file.id).await {
            Ok(metadata) => metadata,
            Err(err) => {
                debug!("metadata fetch failed for file {}: {err}", file.id);
                return self.read_or_warn(&file.id, None).await;
            }
        };

        if let Some(bytes) = self.read_or_warn(&file.id, Some(metadata.created)).await {
            return Some(bytes);
        }

        let bytes = match api.download(&metadata.url_private).await {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!("download failed for file {}: {err}", file.id);
                return None;
            }
        };

        match self
            .put(
                &file.id,
                &bytes,
                &metadata.name,
                &metadata.mimetype,
                metadata.title.as_deref(),
            )
            .await
        {
            Ok(stored) => Some(stored),
            Err(err) => {
                // The download succeeded; a failed cache write must not
                // prevent display.
                warn!("cache write failed for file {}: {err}", file.id);
                Some(bytes)
            }
        }
    }

    async fn read_or_warn(&self, file_id: &str, min_ts: Option<f64>) -> Option<Vec<u8>> {
        let result = match min_ts {
            Some(min_ts) => self.get_if_fresh(file_id, min_ts).await,
            None => self.get(file_id).await,
        };
        match result {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("cache read failed for file {file_id}: {err}");
                None
            }
        }
    }
}

fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}
