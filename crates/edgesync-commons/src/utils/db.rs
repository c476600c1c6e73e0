use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::{
    error,
    info,
};
use sqlx::SqlitePool;
use tokio::sync::OnceCell;

use crate::utils::config_dir::get_db_file_path;

pub static DB_POOL: OnceCell<Arc<SqlitePool>> = OnceCell::const_new();

pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    if !db_file_exists() {
        create_db_file()?;
    }

    let pool = get_db_pool().await.map_err(|e| e.to_string())?;
    create_db_table(&pool).await?;

    Ok(())
}

pub async fn get_db_pool() -> Result<Arc<SqlitePool>, String> {
    DB_POOL
        .get_or_try_init(|| async {
            let db_path = get_db_file_path().map_err(|e| {
                error!("Failed to get DB file path: {e}");
                e
            })?;
            let db_path_str = db_path.to_str().ok_or("Invalid DB path")?;
            info!("Database file path: {db_path_str}");
            let pool = SqlitePool::connect(db_path_str).await.map_err(|e| {
                error!("Failed to connect to DB: {e}");
                e.to_string()
            })?;
            Ok(Arc::new(pool))
        })
        .await
        .map(Arc::clone)
}

pub async fn create_db_table(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    info!("Creating database tables.");
    let mut conn = pool.acquire().await.map_err(|e| {
        error!("Failed to acquire connection: {e}");
        e
    })?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS state_snapshot (
            type TEXT NOT NULL,
            state TEXT NOT NULL,
            state_hash TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        error!("Failed to create state_snapshot table: {e}");
        e
    })?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS sensors (
            uuid TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            protocol TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            poll_interval INTEGER NOT NULL DEFAULT 1000,
            connection TEXT NOT NULL,
            data_points TEXT NOT NULL,
            metadata TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        error!("Failed to create sensors table: {e}");
        e
    })?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS sensor_outputs (
            protocol TEXT PRIMARY KEY,
            socket_path TEXT NOT NULL,
            data_format TEXT NOT NULL DEFAULT 'json',
            delimiter TEXT,
            include_timestamp INTEGER NOT NULL DEFAULT 0,
            include_device_name INTEGER NOT NULL DEFAULT 0,
            logging TEXT
        )",
    )
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        error!("Failed to create sensor_outputs table: {e}");
        e
    })?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS offline_reports (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue TEXT NOT NULL,
            report TEXT NOT NULL,
            queued_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        error!("Failed to create offline_reports table: {e}");
        e
    })?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        error!("Failed to create settings table: {e}");
        e
    })?;

    info!("Database tables created successfully.");
    Ok(())
}

fn db_file_exists() -> bool {
    match get_db_file_path() {
        Ok(db_path) => db_path.exists(),
        Err(_) => false,
    }
}

fn create_db_file() -> Result<(), std::io::Error> {
    let db_path = get_db_file_path().map_err(std::io::Error::other)?;

    let db_dir = Path::new(&db_path)
        .parent()
        .ok_or_else(|| std::io::Error::other("Failed to get db directory"))?;

    if !db_dir.exists() {
        fs::create_dir_all(db_dir)?;
    }

    fs::File::create(db_path)?;

    Ok(())
}
