use log::debug;
use sqlx::{
    Row,
    SqlitePool,
};

use crate::models::snapshot::{
    StateSnapshot,
    SNAPSHOT_TYPE_TARGET,
};
use crate::utils::error::DbError;

/// Replace the persisted target snapshot in a single transaction. The
/// delete+insert keeps at most one `target` row and makes the swap atomic.
pub async fn save_target_snapshot_with_pool(
    state_json: &str, state_hash: &str, pool: &SqlitePool,
) -> Result<(), DbError> {
    let mut transaction = pool.begin().await?;

    sqlx::query("DELETE FROM state_snapshot WHERE type = ?1")
        .bind(SNAPSHOT_TYPE_TARGET)
        .execute(&mut *transaction)
        .await
        .map_err(|e| DbError::QueryFailed(format!("Failed to clear target snapshot: {e}")))?;

    sqlx::query(
        "INSERT INTO state_snapshot (type, state, state_hash, created_at)
         VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)",
    )
    .bind(SNAPSHOT_TYPE_TARGET)
    .bind(state_json)
    .bind(state_hash)
    .execute(&mut *transaction)
    .await
    .map_err(|e| DbError::QueryFailed(format!("Failed to insert target snapshot: {e}")))?;

    transaction.commit().await?;
    debug!("Persisted target snapshot with hash {state_hash}");
    Ok(())
}

pub async fn load_target_snapshot_with_pool(
    pool: &SqlitePool,
) -> Result<Option<StateSnapshot>, DbError> {
    let mut conn = pool.acquire().await?;
    let row = sqlx::query(
        "SELECT type, state, state_hash, created_at FROM state_snapshot WHERE type = ?1",
    )
    .bind(SNAPSHOT_TYPE_TARGET)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|row| StateSnapshot {
        snapshot_type: row.get("type"),
        state: row.get("state"),
        state_hash: row.get("state_hash"),
        created_at: row.get("created_at"),
    }))
}
