use crate::error::SyncError;
use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::SqlitePool;
use std::collections::HashMap;

pub const AUTH_TOKEN_KEY: &str = "auth_token";

/// Read-only view of the host's persistent session storage.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>, SyncError>;

    async fn auth_token(&self) -> Result<Option<String>, SyncError> {
        let token = self.read(AUTH_TOKEN_KEY).await?;
        Ok(token
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()))
    }
}

pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn read(&self, key: &str) -> Result<Option<String>, SyncError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM session_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn with_token(token: &str) -> Self {
        let store = Self::default();
        store
            .values
            .write()
            .insert(AUTH_TOKEN_KEY.to_string(), token.to_string());
        store
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn read(&self, key: &str) -> Result<Option<String>, SyncError> {
        Ok(self.values.read().get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::run_migrations;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        // one connection, otherwise every pooled connection gets its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should initialize");
        run_migrations(&pool)
            .await
            .expect("migrations should apply to in-memory sqlite");
        pool
    }

    #[tokio::test]
    async fn reads_auth_token_from_sqlite_store() {
        let pool = memory_pool().await;
        sqlx::query("INSERT INTO session_store (key, value, updated_at_ms) VALUES (?, ?, ?)")
            .bind(AUTH_TOKEN_KEY)
            .bind("  tok-123 ")
            .bind(0_i64)
            .execute(&pool)
            .await
            .expect("seed row should insert");

        let store = SqliteSessionStore::new(pool);
        let token = store.auth_token().await.expect("read should succeed");
        assert_eq!(token.as_deref(), Some("tok-123"));
    }

    #[tokio::test]
    async fn missing_or_blank_token_reads_as_none() {
        let store = SqliteSessionStore::new(memory_pool().await);
        assert_eq!(store.auth_token().await.expect("read"), None);

        let blank = MemorySessionStore::with_token("   ");
        assert_eq!(blank.auth_token().await.expect("read"), None);
    }
}
