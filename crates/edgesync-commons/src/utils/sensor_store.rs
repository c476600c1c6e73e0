use log::error;
use sqlx::{
    Row,
    SqlitePool,
};
use uuid::Uuid;

use crate::models::sensor::{
    Protocol,
    Sensor,
    SensorOutput,
};
use crate::utils::error::DbError;

pub async fn upsert_sensor_with_pool(sensor: &Sensor, pool: &SqlitePool) -> Result<(), DbError> {
    let connection = serde_json::to_string(&sensor.connection)?;
    let data_points = serde_json::to_string(&sensor.data_points)?;
    let metadata = sensor
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let mut conn = pool.acquire().await?;
    sqlx::query(
        "INSERT INTO sensors
             (uuid, name, protocol, enabled, poll_interval, connection, data_points, metadata,
              created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)
         ON CONFLICT(uuid) DO UPDATE SET
             name = excluded.name,
             protocol = excluded.protocol,
             enabled = excluded.enabled,
             poll_interval = excluded.poll_interval,
             connection = excluded.connection,
             data_points = excluded.data_points,
             metadata = excluded.metadata,
             updated_at = CURRENT_TIMESTAMP",
    )
    .bind(sensor.uuid.to_string())
    .bind(&sensor.name)
    .bind(sensor.protocol.as_str())
    .bind(sensor.enabled)
    .bind(sensor.poll_interval as i64)
    .bind(connection)
    .bind(data_points)
    .bind(metadata)
    .execute(&mut *conn)
    .await
    .map_err(|e| DbError::QueryFailed(format!("Failed to upsert sensor: {e}")))?;

    Ok(())
}

pub async fn delete_sensor_with_pool(uuid: Uuid, pool: &SqlitePool) -> Result<(), DbError> {
    let mut conn = pool.acquire().await?;
    sqlx::query("DELETE FROM sensors WHERE uuid = ?1")
        .bind(uuid.to_string())
        .execute(&mut *conn)
        .await
        .map_err(|e| DbError::QueryFailed(format!("Failed to delete sensor: {e}")))?;
    Ok(())
}

pub async fn list_sensors_with_pool(pool: &SqlitePool) -> Result<Vec<Sensor>, DbError> {
    let mut conn = pool.acquire().await?;
    let rows = sqlx::query(
        "SELECT uuid, name, protocol, enabled, poll_interval, connection, data_points, metadata
         FROM sensors ORDER BY created_at, uuid",
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut sensors = Vec::with_capacity(rows.len());
    for row in rows {
        match sensor_from_row(&row) {
            Ok(sensor) => sensors.push(sensor),
            Err(e) => error!("Skipping undecodable sensor row: {e}"),
        }
    }
    Ok(sensors)
}

fn sensor_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Sensor, DbError> {
    let uuid: String = row.get("uuid");
    let uuid = Uuid::parse_str(&uuid)
        .map_err(|e| DbError::DataDecodeFailed(format!("bad sensor uuid {uuid}: {e}")))?;

    let protocol: String = row.get("protocol");
    let protocol = Protocol::parse(&protocol)
        .ok_or_else(|| DbError::DataDecodeFailed(format!("unknown protocol: {protocol}")))?;

    let connection: String = row.get("connection");
    let data_points: String = row.get("data_points");
    let metadata: Option<String> = row.get("metadata");

    Ok(Sensor {
        uuid,
        name: row.get("name"),
        protocol,
        enabled: row.get("enabled"),
        poll_interval: row.get::<i64, _>("poll_interval") as u64,
        connection: serde_json::from_str(&connection)?,
        data_points: serde_json::from_str(&data_points)?,
        metadata: metadata.map(|m| serde_json::from_str(&m)).transpose()?,
    })
}

pub async fn upsert_sensor_output_with_pool(
    output: &SensorOutput, pool: &SqlitePool,
) -> Result<(), DbError> {
    let logging = output
        .logging
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let mut conn = pool.acquire().await?;
    sqlx::query(
        "INSERT INTO sensor_outputs
             (protocol, socket_path, data_format, delimiter, include_timestamp,
              include_device_name, logging)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(protocol) DO UPDATE SET
             socket_path = excluded.socket_path,
             data_format = excluded.data_format,
             delimiter = excluded.delimiter,
             include_timestamp = excluded.include_timestamp,
             include_device_name = excluded.include_device_name,
             logging = excluded.logging",
    )
    .bind(output.protocol.as_str())
    .bind(&output.socket_path)
    .bind(&output.data_format)
    .bind(&output.delimiter)
    .bind(output.include_timestamp)
    .bind(output.include_device_name)
    .bind(logging)
    .execute(&mut *conn)
    .await
    .map_err(|e| DbError::QueryFailed(format!("Failed to upsert sensor output: {e}")))?;

    Ok(())
}

pub async fn get_sensor_output_with_pool(
    protocol: Protocol, pool: &SqlitePool,
) -> Result<Option<SensorOutput>, DbError> {
    let mut conn = pool.acquire().await?;
    let row = sqlx::query(
        "SELECT protocol, socket_path, data_format, delimiter, include_timestamp,
                include_device_name, logging
         FROM sensor_outputs WHERE protocol = ?1",
    )
    .bind(protocol.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    row.map(|row| {
        let logging: Option<String> = row.get("logging");
        Ok(SensorOutput {
            protocol,
            socket_path: row.get("socket_path"),
            data_format: row.get("data_format"),
            delimiter: row.get("delimiter"),
            include_timestamp: row.get("include_timestamp"),
            include_device_name: row.get("include_device_name"),
            logging: logging.map(|l| serde_json::from_str(&l)).transpose()?,
        })
    })
    .transpose()
}
