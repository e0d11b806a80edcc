use crate::error::SyncError;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::{Path, PathBuf};

const DEFAULT_SESSION_DB_FILENAME: &str = "session.db";
const SESSION_DB_ENV: &str = "MARKET_SYNC_SESSION_DB";

fn resolve_session_db_path() -> PathBuf {
    std::env::var(SESSION_DB_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_SESSION_DB_FILENAME))
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), SyncError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn initialize_pool_from_path(path: &Path) -> Result<SqlitePool, SyncError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let connect_options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);

    let pool = SqlitePool::connect_with(connect_options).await?;
    run_migrations(&pool).await?;

    Ok(pool)
}

pub async fn initialize_pool() -> Result<SqlitePool, SyncError> {
    let db_path = resolve_session_db_path();
    initialize_pool_from_path(&db_path).await
}
