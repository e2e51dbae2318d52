use async_trait::async_trait;
use proto::DatabaseError;
use sqlx::sqlite::SqlitePool;
use tracing::{debug, info};

use crate::Datastore;

/// SQLite datastore connection
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to the database named by `db_url` and verify it answers.
    ///
    /// Accepts `sqlite:` URLs as-is and plain filesystem paths (with `~`
    /// expansion, parent directory created on demand).
    pub async fn connect(db_url: &str) -> Result<Self, DatabaseError> {
        let (url, file) = normalize_url(db_url)?;

        if let Some(path) = file
            && let Some(parent) = std::path::Path::new(&path).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        }

        debug!(url = %url, "Connecting to datastore");
        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.ping().await?;
        info!("SQLite datastore connected: {url}");
        Ok(store)
    }
}

#[async_trait]
impl Datastore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        debug!("SQLite datastore closed");
    }
}

/// Turns a configured connection string into an sqlx SQLite URL, plus the
/// database file path when the input was a plain path.
fn normalize_url(raw: &str) -> Result<(String, Option<String>), DatabaseError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(DatabaseError::InvalidUrl("empty connection string".into()));
    }
    if raw.starts_with("sqlite:") {
        return Ok((raw.to_string(), None));
    }
    if let Some((scheme, _)) = raw.split_once("://") {
        return Err(DatabaseError::InvalidUrl(format!(
            "unsupported scheme '{scheme}'"
        )));
    }

    let path = if let Some(rest) = raw.strip_prefix('~') {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{home}{rest}")
    } else {
        raw.to_string()
    };
    Ok((format!("sqlite:{path}?mode=rwc"), Some(path)))
}
