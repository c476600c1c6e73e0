use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use edgesync_commons::models::report::{
    DeviceStateReport,
    QueuedReport,
};
use log::{
    debug,
    error,
    info,
    warn,
};
use sqlx::{
    Row,
    SqlitePool,
};
use tokio::sync::Mutex;

use crate::error::SyncError;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Bounded durable FIFO of reports awaiting retry. On overflow the oldest
/// entries are dropped; when storage itself fails, reports are held in a
/// bounded in-memory overflow so a full disk does not lose the freshest
/// data immediately.
pub struct OfflineQueue {
    pool: Arc<SqlitePool>,
    name: String,
    capacity: usize,
    overflow: Mutex<VecDeque<QueuedReport>>,
}

impl OfflineQueue {
    pub fn new(pool: Arc<SqlitePool>, name: &str, capacity: usize) -> Self {
        Self {
            pool,
            name: name.to_string(),
            capacity,
            overflow: Mutex::new(VecDeque::new()),
        }
    }

    /// Count the persisted backlog left over from a previous run.
    pub async fn init(&self) -> Result<usize, SyncError> {
        let count = self.durable_len().await?;
        if count > 0 {
            info!("Offline queue '{}' restored {count} queued report(s)", self.name);
        }
        Ok(count)
    }

    /// Append a report. Never fails: a storage error is logged and the
    /// report parked in memory instead.
    pub async fn enqueue(&self, report: DeviceStateReport) {
        let queued = QueuedReport {
            report,
            queued_at: Utc::now(),
        };

        match self.enqueue_durable(&queued).await {
            Ok(dropped) => {
                if dropped > 0 {
                    warn!(
                        "Offline queue '{}' over capacity; dropped {dropped} oldest report(s)",
                        self.name
                    );
                }
            }
            Err(e) => {
                error!("Failed to persist queued report, holding in memory: {e}");
                let mut overflow = self.overflow.lock().await;
                while overflow.len() >= self.capacity {
                    overflow.pop_front();
                }
                overflow.push_back(queued);
            }
        }
    }

    async fn enqueue_durable(&self, queued: &QueuedReport) -> Result<u64, SyncError> {
        let payload =
            serde_json::to_string(queued).map_err(|e| SyncError::Storage(e.to_string()))?;

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        sqlx::query("INSERT INTO offline_reports (queue, report) VALUES (?1, ?2)")
            .bind(&self.name)
            .bind(payload)
            .execute(&mut *conn)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        let evicted = sqlx::query(
            "DELETE FROM offline_reports WHERE queue = ?1 AND id NOT IN (
                 SELECT id FROM offline_reports WHERE queue = ?1 ORDER BY id DESC LIMIT ?2
             )",
        )
        .bind(&self.name)
        .bind(self.capacity as i64)
        .execute(&mut *conn)
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

        Ok(evicted.rows_affected())
    }

    /// Drain in FIFO order through `send`, giving each entry up to
    /// `max_retries` attempts. A failing entry stops the drain unless
    /// `continue_on_error` is set; storage errors abort it. Returns the
    /// number of reports successfully drained.
    pub async fn flush<F, Fut>(
        &self, send: F, max_retries: u32, continue_on_error: bool,
    ) -> Result<usize, SyncError>
    where
        F: Fn(DeviceStateReport) -> Fut,
        Fut: Future<Output = Result<(), SyncError>>,
    {
        let rows = sqlx::query(
            "SELECT id, report FROM offline_reports WHERE queue = ?1 ORDER BY id ASC",
        )
        .bind(&self.name)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?;

        let mut drained = 0usize;
        let attempts = max_retries.max(1);

        for row in rows {
            let id: i64 = row.get("id");
            let payload: String = row.get("report");

            let queued: QueuedReport = match serde_json::from_str(&payload) {
                Ok(queued) => queued,
                Err(e) => {
                    warn!("Dropping undecodable queued report {id}: {e}");
                    self.delete_row(id).await?;
                    continue;
                }
            };

            let mut sent = false;
            for attempt in 1..=attempts {
                match send(queued.report.clone()).await {
                    Ok(()) => {
                        sent = true;
                        break;
                    }
                    Err(e) => {
                        debug!("Queued report {id} attempt {attempt}/{attempts} failed: {e}")
                    }
                }
            }

            if sent {
                self.delete_row(id).await?;
                drained += 1;
            } else if !continue_on_error {
                debug!("Stopping queue drain at report {id}");
                return Ok(drained);
            }
        }

        // Memory-parked reports drain after the durable backlog.
        let mut overflow = self.overflow.lock().await;
        while let Some(queued) = overflow.front().cloned() {
            let mut sent = false;
            for _ in 0..attempts {
                if send(queued.report.clone()).await.is_ok() {
                    sent = true;
                    break;
                }
            }
            if sent {
                overflow.pop_front();
                drained += 1;
            } else if !continue_on_error {
                break;
            } else {
                overflow.pop_front();
            }
        }

        Ok(drained)
    }

    async fn delete_row(&self, id: i64) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM offline_reports WHERE id = ?1")
            .bind(id)
            .execute(self.pool.as_ref())
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn durable_len(&self) -> Result<usize, SyncError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM offline_reports WHERE queue = ?1")
            .bind(&self.name)
            .fetch_one(self.pool.as_ref())
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        let n: i64 = row.get("n");
        Ok(n as usize)
    }

    pub async fn len(&self) -> usize {
        let overflow = self.overflow.lock().await.len();
        self.durable_len().await.unwrap_or(0) + overflow
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
