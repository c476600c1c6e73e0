use sqlx::{
    Row,
    SqlitePool,
};

use crate::utils::db::get_db_pool;
use crate::utils::error::DbError;

pub async fn get_setting_with_pool(key: &str, pool: &SqlitePool) -> Result<Option<String>, DbError> {
    let mut conn = pool.acquire().await?;
    let result = sqlx::query("SELECT value FROM settings WHERE key = ?1")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(result.map(|row| row.get("value")))
}

pub async fn set_setting_with_pool(key: &str, value: &str, pool: &SqlitePool) -> Result<(), DbError> {
    let mut conn = pool.acquire().await?;
    sqlx::query(
        "INSERT INTO settings (key, value, updated_at)
         VALUES (?1, ?2, CURRENT_TIMESTAMP)
         ON CONFLICT(key) DO UPDATE SET
         value = excluded.value,
         updated_at = CURRENT_TIMESTAMP",
    )
    .bind(key)
    .bind(value)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn get_setting(key: &str) -> Result<Option<String>, DbError> {
    let pool = get_db_pool().await.map_err(DbError::ConnectionFailed)?;
    get_setting_with_pool(key, &pool).await
}

pub async fn set_setting(key: &str, value: &str) -> Result<(), DbError> {
    let pool = get_db_pool().await.map_err(DbError::ConnectionFailed)?;
    set_setting_with_pool(key, value, &pool).await
}

#[cfg(test)]
mod tests {
    use sqlx::SqlitePool;

    use super::*;
    use crate::utils::db::create_db_table;

    async fn create_test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_db_table(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let pool = create_test_pool().await;

        set_setting_with_pool("device_uuid", "abc-123", &pool)
            .await
            .unwrap();

        let value = get_setting_with_pool("device_uuid", &pool).await.unwrap();
        assert_eq!(value, Some("abc-123".to_string()));
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let pool = create_test_pool().await;

        set_setting_with_pool("api_key", "old", &pool).await.unwrap();
        set_setting_with_pool("api_key", "new", &pool).await.unwrap();

        let value = get_setting_with_pool("api_key", &pool).await.unwrap();
        assert_eq!(value, Some("new".to_string()));
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let pool = create_test_pool().await;
        let value = get_setting_with_pool("nope", &pool).await.unwrap();
        assert_eq!(value, None);
    }
}
