use std::collections::BTreeMap;
use std::sync::Arc;

use edgesync_commons::models::device_state::App;
use log::{
    debug,
    error,
    info,
};
use tokio::sync::RwLock;

use crate::drivers::{
    ContainerAction,
    ContainerRuntimeDriver,
};
use crate::error::ReconcileError;
use crate::events::{
    EventBus,
    ReconcilerEvent,
};

/// Owns the `apps` sub-tree: diffs the target against the runtime's
/// observed state and drives the runtime toward the target.
pub struct ContainerManager {
    driver: Arc<dyn ContainerRuntimeDriver>,
    events: EventBus,
    target: RwLock<BTreeMap<i64, App>>,
}

impl ContainerManager {
    pub fn new(driver: Arc<dyn ContainerRuntimeDriver>, events: EventBus) -> Self {
        Self {
            driver,
            events,
            target: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn set_target(&self, apps: BTreeMap<i64, App>) {
        let mut target = self.target.write().await;
        *target = apps;
    }

    /// One reconcile cycle. A single action failure is logged and retried
    /// on the next cycle; it does not abort the remaining services.
    pub async fn reconcile(&self) -> Result<(), ReconcileError> {
        let target = self.target.read().await.clone();
        let current = self
            .driver
            .get_current_state()
            .await
            .map_err(|e| ReconcileError::Runtime(e.to_string()))?;

        let actions = plan_actions(&target, &current);
        if actions.is_empty() {
            debug!("Container state matches target; nothing to do");
            self.events.emit(ReconcilerEvent::StateApplied);
            return Ok(());
        }

        info!("Applying {} container action(s)", actions.len());
        let mut failed = 0usize;
        for action in &actions {
            if let Err(e) = self.driver.apply_action(action).await {
                failed += 1;
                error!(
                    "Container action {} for service {} failed: {e}",
                    action.kind(),
                    action.service_id()
                );
            }
        }

        if failed > 0 {
            info!(
                "{failed}/{} container action(s) failed; they will be retried next cycle",
                actions.len()
            );
        }

        self.events.emit(ReconcilerEvent::StateApplied);
        Ok(())
    }

    pub async fn get_current_state(&self) -> Result<BTreeMap<i64, App>, ReconcileError> {
        self.driver
            .get_current_state()
            .await
            .map_err(|e| ReconcileError::Runtime(e.to_string()))
    }
}

/// Per-service diff: create for unseen services, recreate when the
/// configuration changed, remove for services no longer targeted. Equality
/// excludes the runtime fields `container_id` and `status`. Removals are
/// ordered after creates so an id change never leaves a window of absence.
pub fn plan_actions(
    target: &BTreeMap<i64, App>, current: &BTreeMap<i64, App>,
) -> Vec<ContainerAction> {
    let mut actions = Vec::new();
    let mut removals = Vec::new();

    for (app_id, target_app) in target {
        let current_services = current
            .get(app_id)
            .map(|app| app.services.as_slice())
            .unwrap_or(&[]);

        for service in &target_app.services {
            match current_services
                .iter()
                .find(|s| s.service_id == service.service_id)
            {
                None => actions.push(ContainerAction::Create {
                    app_id: *app_id,
                    app_name: target_app.name.clone(),
                    service: service.clone(),
                }),
                Some(running) if !running.config_equals(service) => {
                    actions.push(ContainerAction::Recreate {
                        app_id: *app_id,
                        app_name: target_app.name.clone(),
                        service: service.clone(),
                    })
                }
                Some(_) => {}
            }
        }
    }

    for (app_id, current_app) in current {
        let target_services = target
            .get(app_id)
            .map(|app| app.services.as_slice())
            .unwrap_or(&[]);

        for service in &current_app.services {
            if !target_services
                .iter()
                .any(|s| s.service_id == service.service_id)
            {
                removals.push(ContainerAction::Remove {
                    app_id: *app_id,
                    service: service.clone(),
                });
            }
        }
    }

    actions.extend(removals);
    actions
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use edgesync_commons::models::device_state::{
        Service,
        ServiceConfig,
    };

    use super::*;

    struct FakeRuntime {
        current: Mutex<BTreeMap<i64, App>>,
        applied: Mutex<Vec<String>>,
        fail_service: Option<i64>,
    }

    impl FakeRuntime {
        fn new(current: BTreeMap<i64, App>) -> Self {
            Self {
                current: Mutex::new(current),
                applied: Mutex::new(Vec::new()),
                fail_service: None,
            }
        }

        fn failing_on(mut self, service_id: i64) -> Self {
            self.fail_service = Some(service_id);
            self
        }
    }

    #[async_trait]
    impl ContainerRuntimeDriver for FakeRuntime {
        async fn get_current_state(&self) -> anyhow::Result<BTreeMap<i64, App>> {
            Ok(self.current.lock().unwrap().clone())
        }

        async fn apply_action(&self, action: &ContainerAction) -> anyhow::Result<()> {
            if self.fail_service == Some(action.service_id()) {
                anyhow::bail!("runtime unavailable for service {}", action.service_id());
            }
            self.applied
                .lock()
                .unwrap()
                .push(format!("{}:{}", action.kind(), action.service_id()));
            Ok(())
        }
    }

    fn service(id: i64, image: &str) -> Service {
        Service {
            service_id: id,
            service_name: format!("svc-{id}"),
            config: ServiceConfig {
                image: image.to_string(),
                ..ServiceConfig::default()
            },
            ..Service::default()
        }
    }

    fn app(name: &str, services: Vec<Service>) -> App {
        App {
            name: name.to_string(),
            services,
        }
    }

    #[test]
    fn test_plan_creates_unseen_services() {
        let target = BTreeMap::from([(1, app("edge", vec![service(10, "a:1"), service(11, "b:1")]))]);
        let current = BTreeMap::new();

        let actions = plan_actions(&target, &current);
        assert_eq!(actions.len(), 2);
        assert!(actions.iter().all(|a| a.kind() == "create"));
    }

    #[test]
    fn test_plan_recreates_on_config_change() {
        let target = BTreeMap::from([(1, app("edge", vec![service(10, "a:2")]))]);
        let current = BTreeMap::from([(1, app("edge", vec![service(10, "a:1")]))]);

        let actions = plan_actions(&target, &current);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind(), "recreate");
    }

    #[test]
    fn test_plan_ignores_runtime_field_churn() {
        let mut running = service(10, "a:1");
        running.container_id = Some("c0ffee".to_string());
        running.status = Some("running".to_string());

        let target = BTreeMap::from([(1, app("edge", vec![service(10, "a:1")]))]);
        let current = BTreeMap::from([(1, app("edge", vec![running]))]);

        assert!(
            plan_actions(&target, &current).is_empty(),
            "container_id/status alone must not trigger a recreate"
        );
    }

    #[test]
    fn test_plan_orders_removals_last() {
        let target = BTreeMap::from([(1, app("edge", vec![service(20, "a:1")]))]);
        let current = BTreeMap::from([(1, app("edge", vec![service(10, "a:1")]))]);

        let actions = plan_actions(&target, &current);
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].kind(), "create");
        assert_eq!(actions[1].kind(), "remove");
    }

    #[test]
    fn test_plan_removes_whole_untargeted_app() {
        let target = BTreeMap::new();
        let current = BTreeMap::from([(3, app("old", vec![service(30, "x:1")]))]);

        let actions = plan_actions(&target, &current);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind(), "remove");
    }

    #[tokio::test]
    async fn test_reconcile_applies_plan_and_emits() {
        let driver = Arc::new(FakeRuntime::new(BTreeMap::new()));
        let events = EventBus::new(8);
        let mut rx = events.subscribe();
        let manager = ContainerManager::new(driver.clone(), events);

        manager
            .set_target(BTreeMap::from([(1, app("edge", vec![service(10, "a:1")]))]))
            .await;
        manager.reconcile().await.unwrap();

        assert_eq!(*driver.applied.lock().unwrap(), vec!["create:10"]);
        assert_eq!(rx.recv().await.unwrap(), ReconcilerEvent::StateApplied);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_cycle() {
        let driver =
            Arc::new(FakeRuntime::new(BTreeMap::new()).failing_on(10));
        let manager = ContainerManager::new(driver.clone(), EventBus::new(8));

        manager
            .set_target(BTreeMap::from([(
                1,
                app("edge", vec![service(10, "a:1"), service(11, "b:1")]),
            )]))
            .await;

        let result = manager.reconcile().await;
        assert!(result.is_ok(), "independent service failures are tolerated");
        assert_eq!(
            *driver.applied.lock().unwrap(),
            vec!["create:11"],
            "the healthy service is still applied"
        );
    }
}
