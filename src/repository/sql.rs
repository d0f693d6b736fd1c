//! SQL repository.
//!
//! Uses sqlx's `Any` driver so the same code serves SQLite (small mirrors,
//! tests) and Postgres (production). Three tables:
//!
//! ```sql
//! nrtm_sources       -- one row per (source, label) mirror
//! nrtm_notifications -- audit trail of processed notification files
//! rpsl_objects       -- current objects, keyed (source_id, class, pkey)
//! ```
//!
//! RPSL objects are stored as their serialized JSON (class, primary key and
//! ordered attributes); the class and primary key are lifted into columns
//! for the uniqueness constraint and lookups.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, Row, Transaction};

use super::{Repository, RepositoryError, RepositoryTx};
use crate::notification::{FileHeader, NotificationFile};
use crate::retry::{retry, RetryConfig};
use crate::rpsl::RpslObject;
use crate::source::{now_millis, NotificationHistoryEntry, NrtmSource};

// sqlx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn backend(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Backend(e.to_string())
}

pub struct SqlRepository {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlRepository {
    /// Connect with startup-mode retry (fails fast if the URL is wrong)
    /// and create the schema if it does not exist.
    pub async fn connect(connection_string: &str) -> Result<Self, RepositoryError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");
        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| RepositoryError::Connection(e.to_string()))
        })
        .await?;

        let repo = Self { pool, is_sqlite };
        repo.init_schema().await?;
        Ok(repo)
    }

    async fn init_schema(&self) -> Result<(), RepositoryError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS nrtm_sources (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    source TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    notification_url TEXT NOT NULL,
                    label TEXT NOT NULL DEFAULT '',
                    created INTEGER NOT NULL,
                    UNIQUE (source, label),
                    UNIQUE (notification_url, label)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS nrtm_notifications (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    source_id INTEGER NOT NULL,
                    version INTEGER NOT NULL,
                    created INTEGER NOT NULL,
                    payload TEXT NOT NULL
                )
                "#,
                r#"
                CREATE INDEX IF NOT EXISTS idx_notifications_source_version
                    ON nrtm_notifications (source_id, version)
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS rpsl_objects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    source_id INTEGER NOT NULL,
                    object_class TEXT NOT NULL,
                    primary_key TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    file_version INTEGER NOT NULL,
                    created INTEGER NOT NULL,
                    UNIQUE (source_id, object_class, primary_key)
                )
                "#,
            ]
        } else {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS nrtm_sources (
                    id BIGSERIAL PRIMARY KEY,
                    source TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    version BIGINT NOT NULL,
                    notification_url TEXT NOT NULL,
                    label TEXT NOT NULL DEFAULT '',
                    created BIGINT NOT NULL,
                    UNIQUE (source, label),
                    UNIQUE (notification_url, label)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS nrtm_notifications (
                    id BIGSERIAL PRIMARY KEY,
                    source_id BIGINT NOT NULL,
                    version BIGINT NOT NULL,
                    created BIGINT NOT NULL,
                    payload TEXT NOT NULL
                )
                "#,
                r#"
                CREATE INDEX IF NOT EXISTS idx_notifications_source_version
                    ON nrtm_notifications (source_id, version)
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS rpsl_objects (
                    id BIGSERIAL PRIMARY KEY,
                    source_id BIGINT NOT NULL,
                    object_class TEXT NOT NULL,
                    primary_key TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    file_version BIGINT NOT NULL,
                    created BIGINT NOT NULL,
                    UNIQUE (source_id, object_class, primary_key)
                )
                "#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(backend)
            })
            .await?;
        }
        Ok(())
    }
}

fn row_to_source(row: &AnyRow) -> Result<NrtmSource, RepositoryError> {
    Ok(NrtmSource {
        id: row.try_get::<i64, _>("id").map_err(backend)?,
        source: row.try_get::<String, _>("source").map_err(backend)?,
        session_id: row.try_get::<String, _>("session_id").map_err(backend)?,
        version: row.try_get::<i64, _>("version").map_err(backend)? as u32,
        notification_url: row
            .try_get::<String, _>("notification_url")
            .map_err(backend)?,
        label: row.try_get::<String, _>("label").map_err(backend)?,
        created: row.try_get::<i64, _>("created").map_err(backend)?,
    })
}

fn notification_payload(notification: &NotificationFile) -> Result<String, RepositoryError> {
    serde_json::to_string(notification).map_err(|e| RepositoryError::Backend(e.to_string()))
}

fn object_payload(object: &RpslObject) -> Result<String, RepositoryError> {
    serde_json::to_string(object).map_err(|e| RepositoryError::Backend(e.to_string()))
}

const SOURCE_COLUMNS: &str = "id, source, session_id, version, notification_url, label, created";

#[async_trait]
impl Repository for SqlRepository {
    async fn save_new_source(
        &self,
        mut source: NrtmSource,
        notification: &NotificationFile,
    ) -> Result<NrtmSource, RepositoryError> {
        let payload = notification_payload(notification)?;
        let row = sqlx::query(
            r#"
            INSERT INTO nrtm_sources (source, session_id, version, notification_url, label, created)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&source.source)
        .bind(&source.session_id)
        .bind(source.version as i64)
        .bind(&source.notification_url)
        .bind(&source.label)
        .bind(source.created)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        source.id = row.try_get::<i64, _>(0).map_err(backend)?;

        sqlx::query(
            r#"
            INSERT INTO nrtm_notifications (source_id, version, created, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(source.id)
        .bind(source.version as i64)
        .bind(now_millis())
        .bind(&payload)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(source)
    }

    async fn get_source_by_name_and_label(
        &self,
        name: &str,
        label: &str,
    ) -> Result<Option<NrtmSource>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM nrtm_sources WHERE source = $1 AND label = $2"
        ))
        .bind(name)
        .bind(label)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(row_to_source).transpose()
    }

    async fn get_source_by_url_and_label(
        &self,
        url: &str,
        label: &str,
    ) -> Result<Option<NrtmSource>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM nrtm_sources WHERE notification_url = $1 AND label = $2"
        ))
        .bind(url)
        .bind(label)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(row_to_source).transpose()
    }

    async fn list_sources(&self) -> Result<Vec<NrtmSource>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM nrtm_sources ORDER BY source, label"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(row_to_source).collect()
    }

    async fn get_notification_history(
        &self,
        source: &NrtmSource,
        from: u32,
        to: u32,
    ) -> Result<Vec<NotificationHistoryEntry>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT source_id, version, created, payload
            FROM nrtm_notifications
            WHERE source_id = $1 AND version BETWEEN $2 AND $3
            ORDER BY version DESC
            "#,
        )
        .bind(source.id)
        .bind(from as i64)
        .bind(to as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter()
            .map(|row| {
                Ok(NotificationHistoryEntry {
                    source_id: row.try_get::<i64, _>("source_id").map_err(backend)?,
                    version: row.try_get::<i64, _>("version").map_err(backend)? as u32,
                    created: row.try_get::<i64, _>("created").map_err(backend)?,
                    payload: row.try_get::<String, _>("payload").map_err(backend)?,
                })
            })
            .collect()
    }

    async fn update_source(&self, source: &NrtmSource) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE nrtm_sources SET label = $1 WHERE id = $2")
            .bind(&source.label)
            .bind(source.id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn RepositoryTx>, RepositoryError> {
        let tx = self.pool.begin().await.map_err(backend)?;
        Ok(Box::new(SqlTx { tx }))
    }
}

struct SqlTx {
    tx: Transaction<'static, Any>,
}

#[async_trait]
impl RepositoryTx for SqlTx {
    async fn save_source(
        &mut self,
        source: &NrtmSource,
        notification: &NotificationFile,
    ) -> Result<(), RepositoryError> {
        let payload = notification_payload(notification)?;
        let result = sqlx::query("UPDATE nrtm_sources SET version = $1 WHERE id = $2")
            .bind(source.version as i64)
            .bind(source.id)
            .execute(&mut *self.tx)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        sqlx::query(
            r#"
            INSERT INTO nrtm_notifications (source_id, version, created, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(source.id)
        .bind(source.version as i64)
        .bind(now_millis())
        .bind(&payload)
        .execute(&mut *self.tx)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn save_snapshot_objects(
        &mut self,
        source: &NrtmSource,
        objects: Vec<RpslObject>,
        header: &FileHeader,
    ) -> Result<(), RepositoryError> {
        for object in &objects {
            self.upsert_object(source, object, header).await?;
        }
        Ok(())
    }

    async fn add_modify_object(
        &mut self,
        source: &NrtmSource,
        object: RpslObject,
        header: &FileHeader,
    ) -> Result<(), RepositoryError> {
        self.upsert_object(source, &object, header).await
    }

    async fn delete_object(
        &mut self,
        source: &NrtmSource,
        object_class: &str,
        primary_key: &str,
        _header: &FileHeader,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            DELETE FROM rpsl_objects
            WHERE source_id = $1 AND object_class = $2 AND primary_key = $3
            "#,
        )
        .bind(source.id)
        .bind(object_class.to_ascii_lowercase())
        .bind(primary_key)
        .execute(&mut *self.tx)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        self.tx.commit().await.map_err(backend)
    }

    async fn rollback(self: Box<Self>) -> Result<(), RepositoryError> {
        self.tx.rollback().await.map_err(backend)
    }
}

impl SqlTx {
    async fn upsert_object(
        &mut self,
        source: &NrtmSource,
        object: &RpslObject,
        header: &FileHeader,
    ) -> Result<(), RepositoryError> {
        let payload = object_payload(object)?;
        sqlx::query(
            r#"
            INSERT INTO rpsl_objects
                (source_id, object_class, primary_key, payload, file_version, created)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (source_id, object_class, primary_key)
            DO UPDATE SET payload = excluded.payload,
                          file_version = excluded.file_version,
                          created = excluded.created
            "#,
        )
        .bind(source.id)
        .bind(&object.class)
        .bind(&object.primary_key)
        .bind(&payload)
        .bind(header.version as i64)
        .bind(now_millis())
        .execute(&mut *self.tx)
        .await
        .map_err(backend)?;
        Ok(())
    }
}
