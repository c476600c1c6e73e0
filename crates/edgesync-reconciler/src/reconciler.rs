use std::sync::atomic::{
    AtomicU64,
    Ordering,
};
use std::sync::Arc;

use edgesync_commons::models::device_state::{
    DeviceState,
    TargetState,
};
use edgesync_commons::utils::canonical::{
    canonical_json,
    content_hash,
};
use edgesync_commons::utils::state_snapshot::{
    load_target_snapshot_with_pool,
    save_target_snapshot_with_pool,
};
use futures::FutureExt;
use log::{
    debug,
    error,
    info,
};
use sqlx::SqlitePool;
use std::panic::AssertUnwindSafe;
use tokio::sync::{
    Mutex,
    RwLock,
};

use crate::config_manager::ConfigManager;
use crate::container_manager::ContainerManager;
use crate::drivers::{
    ContainerRuntimeDriver,
    ProtocolAdapterDriver,
};
use crate::error::ReconcileError;
use crate::events::{
    EventBus,
    ReconcilerEvent,
};

/// Top-level orchestrator: exclusive owner of target-state persistence,
/// dispatching reconcile cycles to the container and config managers.
pub struct StateReconciler {
    pool: Arc<SqlitePool>,
    containers: ContainerManager,
    config: ConfigManager,
    events: EventBus,
    target: RwLock<Option<TargetState>>,
    last_saved_hash: RwLock<Option<String>>,
    current_version: AtomicU64,
    reconciling: Mutex<bool>,
}

impl StateReconciler {
    /// Load the persisted target snapshot (if any), prime the managers and
    /// the applied version from it.
    pub async fn new(
        pool: Arc<SqlitePool>, runtime: Arc<dyn ContainerRuntimeDriver>,
        adapter: Arc<dyn ProtocolAdapterDriver>,
    ) -> Result<Self, ReconcileError> {
        let events = EventBus::default();
        let reconciler = Self {
            containers: ContainerManager::new(runtime, events.clone()),
            config: ConfigManager::new(adapter, pool.clone(), events.clone()),
            events,
            pool,
            target: RwLock::new(None),
            last_saved_hash: RwLock::new(None),
            current_version: AtomicU64::new(0),
            reconciling: Mutex::new(false),
        };

        if let Some(snapshot) = load_target_snapshot_with_pool(&reconciler.pool).await? {
            match serde_json::from_str::<TargetState>(&snapshot.state) {
                Ok(target) => {
                    info!(
                        "Loaded persisted target state (version {})",
                        target.version
                    );
                    reconciler
                        .current_version
                        .store(target.version, Ordering::SeqCst);
                    reconciler.containers.set_target(target.state.apps.clone()).await;
                    reconciler.config.set_target(target.state.config.clone()).await;
                    *reconciler.target.write().await = Some(target);
                    *reconciler.last_saved_hash.write().await = Some(snapshot.state_hash);
                }
                Err(e) => error!("Discarding undecodable target snapshot: {e}"),
            }
        }

        Ok(reconciler)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Version of the last applied target state. Survives restart via the
    /// persisted snapshot.
    pub fn current_version(&self) -> u64 {
        self.current_version.load(Ordering::SeqCst)
    }

    pub async fn target_state(&self) -> Option<TargetState> {
        self.target.read().await.clone()
    }

    /// Accept a new target state: persist it when its content hash differs
    /// from the last saved one, then reconcile. A persistence failure is
    /// logged and the in-memory target still applies.
    pub async fn set_target(&self, target: TargetState) -> Result<(), ReconcileError> {
        let hash = content_hash(&target)?;
        let changed = {
            let last = self.last_saved_hash.read().await;
            last.as_deref() != Some(hash.as_str())
        };

        if changed {
            let encoded = canonical_json(&target)?;
            match save_target_snapshot_with_pool(&encoded, &hash, &self.pool).await {
                Ok(()) => {
                    let mut last = self.last_saved_hash.write().await;
                    *last = Some(hash);
                }
                Err(e) => {
                    error!("Failed to persist target state, applying in memory only: {e}");
                }
            }
        } else {
            debug!("Target state hash unchanged; skipping persistence");
        }

        self.current_version.store(target.version, Ordering::SeqCst);
        self.containers.set_target(target.state.apps.clone()).await;
        self.config.set_target(target.state.config.clone()).await;
        {
            let mut current = self.target.write().await;
            *current = Some(target.clone());
        }

        if changed {
            self.events.emit(ReconcilerEvent::TargetStateChanged {
                version: target.version,
            });
        }

        self.reconcile().await
    }

    /// One reconcile cycle, single-flight: a call arriving while another
    /// cycle runs logs and returns immediately. Containers are applied
    /// before config so protocol-adapter containers are up before their
    /// sensors are configured.
    pub async fn reconcile(&self) -> Result<(), ReconcileError> {
        {
            let mut flag = self.reconciling.lock().await;
            if *flag {
                info!("Reconciliation already in progress; skipping");
                return Ok(());
            }
            *flag = true;
        }

        let result = AssertUnwindSafe(self.run_reconcile()).catch_unwind().await;

        {
            let mut flag = self.reconciling.lock().await;
            *flag = false;
        }

        match result {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!("Reconcile cycle panicked: {panic:?}");
                Err(ReconcileError::Panicked)
            }
        }
    }

    async fn run_reconcile(&self) -> Result<(), ReconcileError> {
        if let Err(e) = self.containers.reconcile().await {
            error!("Container reconcile failed: {e}");
            return Err(e);
        }

        if let Err(e) = self.config.reconcile().await {
            error!("Config reconcile failed: {e}");
            return Err(e);
        }

        let version = self.current_version();
        debug!("Reconciliation complete at version {version}");
        self.events
            .emit(ReconcilerEvent::ReconciliationComplete { version });
        Ok(())
    }

    /// Observed device state: the runtime's app tree composed with the
    /// last applied config. Never persisted.
    pub async fn current_state(&self) -> Result<DeviceState, ReconcileError> {
        let apps = self.containers.get_current_state().await?;
        let config = self.config.current_config().await?;
        Ok(DeviceState { apps, config })
    }
}
