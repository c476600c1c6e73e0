use std::sync::atomic::{
    AtomicBool,
    Ordering,
};
use std::sync::Arc;
use std::time::{
    Duration,
    Instant,
};

use edgesync_commons::models::device_info_model::DeviceInfo;
use edgesync_commons::models::device_state::TargetState;
use edgesync_commons::models::report::{
    DeviceStateReport,
    SystemMetrics,
};
use edgesync_commons::utils::canonical::structurally_equal;
use edgesync_commons::utils::device_info::DeviceInfoAccessor;
use edgesync_metrics::{
    primary_ipv4,
    SystemMetricsSource,
};
use edgesync_reconciler::{
    ReconcilerEvent,
    StateReconciler,
};
use log::{
    debug,
    error,
    info,
    warn,
};
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::{
    Mutex,
    Notify,
    RwLock,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::{
    BreakerOptions,
    CircuitBreaker,
};
use crate::error::SyncError;
use crate::http::{
    HttpClient,
    HttpResponse,
    ReqwestClient,
    RequestOptions,
};
use crate::monitor::{
    ConnectionEvent,
    ConnectionMonitor,
    MonitorOptions,
    SyncOp,
};
use crate::mqtt::{
    state_topic,
    MqttManager,
    QOS_AT_LEAST_ONCE,
};
use crate::queue::{
    OfflineQueue,
    DEFAULT_QUEUE_CAPACITY,
};
use crate::report::{
    report_diff,
    strip_for_queue,
};
use crate::retry::{
    BackoffConfig,
    MAX_BACKOFF_ATTEMPT,
};
use crate::single_flight::SingleFlight;

pub const API_KEY_HEADER: &str = "X-Device-API-Key";

/// Grace given to in-flight operations during shutdown.
const STOP_GRACE: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct SyncOptions {
    pub cloud_api_endpoint: String,
    pub poll_interval: Duration,
    pub report_interval: Duration,
    pub metrics_interval: Duration,
    pub api_timeout: Duration,
    pub queue_capacity: usize,
    pub backoff: BackoffConfig,
    pub breaker: BreakerOptions,
    pub monitor: MonitorOptions,
}

impl SyncOptions {
    pub fn new(cloud_api_endpoint: impl Into<String>) -> Self {
        Self {
            cloud_api_endpoint: cloud_api_endpoint.into(),
            poll_interval: Duration::from_secs(60),
            report_interval: Duration::from_secs(10),
            metrics_interval: Duration::from_secs(300),
            api_timeout: Duration::from_secs(30),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            backoff: BackoffConfig::default(),
            breaker: BreakerOptions::default(),
            monitor: MonitorOptions::default(),
        }
    }
}

/// Builds an HTTP client from fresh device info. Swappable so tests can
/// inject a scripted transport.
pub type HttpClientFactory =
    dyn Fn(&str, &DeviceInfo, Duration) -> Result<Arc<dyn HttpClient>, SyncError> + Send + Sync;

#[derive(Default)]
struct SyncState {
    etag: Option<String>,
    current_version: u64,
    poll_errors: u32,
    report_errors: u32,
    last_report: Option<DeviceStateReport>,
    last_report_time: Option<Instant>,
    last_metrics_time: Option<Instant>,
    sent_os_version: Option<String>,
    sent_agent_version: Option<String>,
    sent_local_ip: Option<String>,
}

#[derive(Default)]
struct RuntimeHandles {
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

enum ReportOutcome {
    Sent,
    Skipped,
}

/// The cloud sync engine: polls the cloud for target-state changes,
/// reports observed state back (diffed against the last send), prefers
/// MQTT with HTTP fallback, and queues failed reports for later drains.
pub struct CloudSync {
    options: SyncOptions,
    device_info: Arc<dyn DeviceInfoAccessor>,
    reconciler: Arc<StateReconciler>,
    metrics: Arc<dyn SystemMetricsSource>,
    mqtt: Option<Arc<dyn MqttManager>>,
    http: RwLock<Arc<dyn HttpClient>>,
    http_factory: Box<HttpClientFactory>,
    monitor: ConnectionMonitor,
    queue: OfflineQueue,
    poll_breaker: CircuitBreaker,
    report_breaker: CircuitBreaker,
    poll_lock: SingleFlight,
    report_lock: SingleFlight,
    state: Mutex<SyncState>,
    polling: AtomicBool,
    reporting: AtomicBool,
    runtime: Mutex<RuntimeHandles>,
    report_trigger: Notify,
}

impl CloudSync {
    pub async fn new(
        options: SyncOptions, pool: Arc<SqlitePool>, device_info: Arc<dyn DeviceInfoAccessor>,
        reconciler: Arc<StateReconciler>, metrics: Arc<dyn SystemMetricsSource>,
        mqtt: Option<Arc<dyn MqttManager>>,
    ) -> Result<Arc<Self>, SyncError> {
        let factory: Box<HttpClientFactory> = Box::new(|endpoint, info, timeout| {
            ReqwestClient::from_device_info(endpoint, info, timeout)
                .map(|client| Arc::new(client) as Arc<dyn HttpClient>)
        });
        Self::with_http_factory(options, pool, device_info, reconciler, metrics, mqtt, factory)
            .await
    }

    pub async fn with_http_factory(
        options: SyncOptions, pool: Arc<SqlitePool>, device_info: Arc<dyn DeviceInfoAccessor>,
        reconciler: Arc<StateReconciler>, metrics: Arc<dyn SystemMetricsSource>,
        mqtt: Option<Arc<dyn MqttManager>>, http_factory: Box<HttpClientFactory>,
    ) -> Result<Arc<Self>, SyncError> {
        if options.cloud_api_endpoint.trim().is_empty() {
            return Err(SyncError::NotConfigured(
                "cloud API endpoint is required".to_string(),
            ));
        }

        let info = device_info
            .get_device_info()
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        let http = http_factory(&options.cloud_api_endpoint, &info, options.api_timeout)?;

        let queue = OfflineQueue::new(pool, "device-reports", options.queue_capacity);
        queue.init().await?;

        let sync = Arc::new(Self {
            monitor: ConnectionMonitor::new(options.monitor.clone()),
            poll_breaker: CircuitBreaker::new("poll", options.breaker.clone()),
            report_breaker: CircuitBreaker::new("report", options.breaker.clone()),
            poll_lock: SingleFlight::new(),
            report_lock: SingleFlight::new(),
            state: Mutex::new(SyncState {
                current_version: reconciler.current_version(),
                ..SyncState::default()
            }),
            polling: AtomicBool::new(false),
            reporting: AtomicBool::new(false),
            runtime: Mutex::new(RuntimeHandles::default()),
            report_trigger: Notify::new(),
            http: RwLock::new(http),
            http_factory,
            options,
            device_info,
            reconciler,
            metrics,
            mqtt,
            queue,
        });

        Ok(sync)
    }

    pub fn connection_monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub async fn current_version(&self) -> u64 {
        self.state.lock().await.current_version
    }

    pub async fn queued_reports(&self) -> usize {
        self.queue.len().await
    }

    /// Spawn the poll and report loops plus the event listeners
    /// (reconciliation completion and MQTT reconnect both schedule an
    /// early report). Idempotent while running.
    pub async fn start(self: Arc<Self>) {
        let mut runtime = self.runtime.lock().await;
        if runtime.cancel.is_some() {
            debug!("Cloud sync already running");
            return;
        }

        info!(
            "Starting cloud sync against {}",
            self.options.cloud_api_endpoint
        );
        self.polling.store(true, Ordering::SeqCst);
        self.reporting.store(true, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        {
            let sync = self.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                sync.poll_loop(cancel).await;
            }));
        }
        {
            let sync = self.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                sync.report_loop(cancel).await;
            }));
        }
        {
            let sync = self.clone();
            let cancel = cancel.clone();
            let mut events = self.reconciler.events().subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = events.recv() => match event {
                            Ok(ReconcilerEvent::ReconciliationComplete { .. }) => {
                                debug!("Reconciliation complete; scheduling report");
                                sync.report_trigger.notify_one();
                            }
                            Ok(_) => {}
                            Err(_) => break,
                        }
                    }
                }
            }));
        }
        {
            let sync = self.clone();
            let cancel = cancel.clone();
            let mut transitions = self.monitor.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = transitions.recv() => match event {
                            Ok(ConnectionEvent::Online) => {
                                debug!("Connection recovered; scheduling report");
                                sync.report_trigger.notify_one();
                            }
                            Ok(_) => {}
                            Err(_) => break,
                        }
                    }
                }
            }));
        }
        if let Some(mqtt) = &self.mqtt {
            let sync = self.clone();
            let cancel = cancel.clone();
            let mut reconnects = mqtt.subscribe_reconnect();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = reconnects.recv() => match event {
                            Ok(()) => {
                                debug!("MQTT reconnected; scheduling report to resync broker");
                                sync.report_trigger.notify_one();
                            }
                            Err(_) => break,
                        }
                    }
                }
            }));
        }

        runtime.cancel = Some(cancel);
        runtime.tasks = tasks;
    }

    /// Idempotent shutdown: cancel the loop timers first so no new
    /// iteration starts, clear the flags, give in-flight operations a
    /// short grace period, then detach every listener this component
    /// registered (and only those) by aborting its own tasks.
    pub async fn stop(&self) {
        let (cancel, tasks) = {
            let mut runtime = self.runtime.lock().await;
            (runtime.cancel.take(), std::mem::take(&mut runtime.tasks))
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.polling.store(false, Ordering::SeqCst);
        self.reporting.store(false, Ordering::SeqCst);

        if tasks.is_empty() {
            return;
        }

        tokio::time::sleep(STOP_GRACE).await;
        for task in tasks {
            task.abort();
        }
        info!("Cloud sync stopped");
    }

    /// Rebuild the HTTP client from freshly read device info. Called after
    /// provisioning or when TLS material changes; the API key itself is
    /// re-read per request and needs no rebuild.
    pub async fn update_http_client(&self) -> Result<(), SyncError> {
        let info = self
            .device_info
            .get_device_info()
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        let client = (self.http_factory)(
            &self.options.cloud_api_endpoint,
            &info,
            self.options.api_timeout,
        )?;
        *self.http.write().await = client;
        info!("HTTP client rebuilt from fresh device info");
        Ok(())
    }

    async fn poll_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            if !self.polling.load(Ordering::SeqCst) {
                break;
            }
            delay = self.poll_tick().await;
        }
        debug!("Poll loop exited");
    }

    async fn report_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut delay = self.options.report_interval;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = self.report_trigger.notified() => {}
            }
            if !self.reporting.load(Ordering::SeqCst) {
                break;
            }
            delay = self.report_tick().await;
        }
        debug!("Report loop exited");
    }

    /// One poll iteration; returns the delay until the next one.
    async fn poll_tick(&self) -> Duration {
        if self.poll_breaker.is_open() {
            let wait = self.poll_breaker.cooldown_remaining() + Duration::from_secs(1);
            info!("Poll circuit open; next attempt in {}s", wait.as_secs());
            return wait;
        }

        let _guard = match self.poll_lock.try_enter() {
            Some(guard) => guard,
            None => {
                info!("Poll already in flight; skipping this tick");
                return self.options.poll_interval;
            }
        };

        match self.poll_once().await {
            Ok(()) => {
                self.state.lock().await.poll_errors = 0;
                self.poll_breaker.record_success();
                self.monitor.mark_success(SyncOp::Poll);
                self.options.poll_interval
            }
            Err(error) => self.handle_poll_failure(error).await,
        }
    }

    async fn poll_once(&self) -> Result<(), SyncError> {
        let info = self
            .device_info
            .get_device_info()
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        if !info.provisioned || info.uuid.is_empty() {
            debug!("Device not provisioned; skipping poll");
            return Ok(());
        }

        let url = format!(
            "{}/device/{}/state",
            self.options.cloud_api_endpoint, info.uuid
        );
        let mut opts = RequestOptions::default();
        if let Some(key) = &info.device_api_key {
            opts = opts.with_header(API_KEY_HEADER, key);
        }
        {
            let state = self.state.lock().await;
            if let Some(etag) = &state.etag {
                opts = opts.with_header("If-None-Match", etag);
            }
        }

        let http = self.http.read().await.clone();
        let response = http.get(&url, opts).await?;

        match response.status {
            304 => {
                debug!("Target state unchanged (304)");
                Ok(())
            }
            200 => self.handle_poll_response(&info, &response).await,
            status => Err(SyncError::from_status(status, response.retry_after())),
        }
    }

    async fn handle_poll_response(
        &self, info: &DeviceInfo, response: &HttpResponse,
    ) -> Result<(), SyncError> {
        let body: Value = response.json()?;
        let device_entry = body.get(info.uuid.as_str()).cloned().ok_or_else(|| {
            SyncError::Decode(format!("response missing entry for device {}", info.uuid))
        })?;
        let target: TargetState =
            serde_json::from_value(device_entry).map_err(|e| SyncError::Decode(e.to_string()))?;

        {
            let mut state = self.state.lock().await;
            if let Some(etag) = response.header("etag") {
                state.etag = Some(etag.to_string());
            }
            // Unconditional: version tracking must survive a lost ETag
            // cache or an unchanged state body.
            state.current_version = target.version;
        }

        let unchanged = match self.reconciler.target_state().await {
            Some(current) => structurally_equal(&current.state, &target.state),
            None => false,
        };

        if unchanged {
            debug!("Polled target matches applied state; no reconcile needed");
            return Ok(());
        }

        info!("New target state at version {}", target.version);
        self.reconciler
            .set_target(target)
            .await
            .map_err(|e| SyncError::Apply(e.to_string()))?;
        Ok(())
    }

    async fn handle_poll_failure(&self, error: SyncError) -> Duration {
        error!("Poll failed: {error}");

        if error.is_auth() {
            warn!("Poll authentication rejected; refreshing credentials");
            if let Err(e) = self.update_http_client().await {
                error!("Credential refresh failed: {e}");
            }
        } else if self.poll_breaker.record_failure() {
            warn!(
                "Poll circuit tripped open for {}s",
                self.options.breaker.cooldown.as_secs()
            );
        }
        self.monitor.mark_failure(SyncOp::Poll);

        let errors = {
            let mut state = self.state.lock().await;
            state.poll_errors = (state.poll_errors + 1).min(MAX_BACKOFF_ATTEMPT);
            state.poll_errors
        };

        if let Some(retry_after) = error.retry_after() {
            return retry_after;
        }
        self.options.backoff.delay(errors)
    }

    /// One report iteration; returns the delay until the next one.
    async fn report_tick(&self) -> Duration {
        if self.report_breaker.is_open() {
            let wait = self.report_breaker.cooldown_remaining() + Duration::from_secs(1);
            info!("Report circuit open; next attempt in {}s", wait.as_secs());
            return wait;
        }

        let _guard = match self.report_lock.try_enter() {
            Some(guard) => guard,
            None => {
                info!("Report already in flight; skipping this tick");
                return self.options.report_interval;
            }
        };

        {
            let state = self.state.lock().await;
            if let Some(last) = state.last_report_time {
                let elapsed = last.elapsed();
                if elapsed < self.options.report_interval {
                    return self.options.report_interval - elapsed;
                }
            }
        }

        match self.report_once().await {
            Ok(ReportOutcome::Sent) => {
                self.state.lock().await.report_errors = 0;
                self.report_breaker.record_success();
                self.monitor.mark_success(SyncOp::Report);
                self.options.report_interval
            }
            Ok(ReportOutcome::Skipped) => self.options.report_interval,
            Err(error) => self.handle_report_failure(error).await,
        }
    }

    async fn report_once(&self) -> Result<ReportOutcome, SyncError> {
        let info = self
            .device_info
            .get_device_info()
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        if !info.provisioned || info.uuid.is_empty() {
            debug!("Device not provisioned; skipping report");
            return Ok(ReportOutcome::Skipped);
        }

        let device_state = match self.reconciler.current_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!("Cannot synthesize current state: {e}");
                return Ok(ReportOutcome::Skipped);
            }
        };

        let (include_metrics, version, sent_os, sent_agent, sent_ip) = {
            let state = self.state.lock().await;
            let due = match state.last_metrics_time {
                None => true,
                Some(at) => at.elapsed() >= self.options.metrics_interval,
            };
            (
                due,
                state.current_version,
                state.sent_os_version.clone(),
                state.sent_agent_version.clone(),
                state.sent_local_ip.clone(),
            )
        };

        let mut report = DeviceStateReport {
            apps: Some(device_state.apps.clone()),
            config: Some(
                serde_json::to_value(&device_state.config)
                    .map_err(|e| SyncError::Decode(e.to_string()))?,
            ),
            is_online: self.monitor.is_online(),
            version,
            ..DeviceStateReport::default()
        };

        // Static identity fields ride along only when their value changed
        // since the last time they were sent.
        if info.os_version.is_some() && info.os_version != sent_os {
            report.os_version = info.os_version.clone();
        }
        if info.agent_version.is_some() && info.agent_version != sent_agent {
            report.agent_version = info.agent_version.clone();
        }

        if include_metrics {
            let metrics = self.metrics.get_system_metrics().await;
            let local_ip = metrics
                .network_interfaces
                .as_deref()
                .and_then(primary_ipv4);
            if local_ip.is_some() && local_ip != sent_ip {
                report.local_ip = local_ip;
            }
            report.metrics = metrics;
        }

        let mut state_only = report.clone();
        state_only.metrics = SystemMetrics::default();

        let diff = {
            let state = self.state.lock().await;
            report_diff(state.last_report.as_ref(), &state_only)
        };

        if diff.is_empty() && !include_metrics {
            debug!("Nothing changed since last report; skipping send");
            return Ok(ReportOutcome::Skipped);
        }

        match self.send_report(&report, &info).await {
            Ok(()) => {
                {
                    let mut state = self.state.lock().await;
                    state.last_report = Some(state_only);
                    state.last_report_time = Some(Instant::now());
                    if include_metrics {
                        state.last_metrics_time = Some(Instant::now());
                    }
                    if report.os_version.is_some() {
                        state.sent_os_version = report.os_version.clone();
                    }
                    if report.agent_version.is_some() {
                        state.sent_agent_version = report.agent_version.clone();
                    }
                    if report.local_ip.is_some() {
                        state.sent_local_ip = report.local_ip.clone();
                    }
                }

                if !self.queue.is_empty().await {
                    self.drain_queue(&info).await;
                }
                Ok(ReportOutcome::Sent)
            }
            Err(error) => {
                self.queue.enqueue(strip_for_queue(&report)).await;
                Err(error)
            }
        }
    }

    async fn drain_queue(&self, info: &DeviceInfo) {
        let send = |report: DeviceStateReport| {
            let info = info.clone();
            async move { self.send_report(&report, &info).await }
        };

        match self.queue.flush(send, 1, false).await {
            Ok(0) => {}
            Ok(drained) => info!("Drained {drained} queued report(s)"),
            Err(e) => warn!("Offline queue drain aborted: {e}"),
        }
    }

    async fn handle_report_failure(&self, error: SyncError) -> Duration {
        error!("Report failed: {error}");

        if error.is_auth() {
            warn!("Report authentication rejected; refreshing credentials");
            if let Err(e) = self.update_http_client().await {
                error!("Credential refresh failed: {e}");
            }
        } else if self.report_breaker.record_failure() {
            warn!(
                "Report circuit tripped open for {}s",
                self.options.breaker.cooldown.as_secs()
            );
        }
        self.monitor.mark_failure(SyncOp::Report);

        let errors = {
            let mut state = self.state.lock().await;
            state.report_errors = (state.report_errors + 1).min(MAX_BACKOFF_ATTEMPT);
            state.report_errors
        };

        if let Some(retry_after) = error.retry_after() {
            return retry_after;
        }
        self.options.backoff.delay(errors)
    }

    /// Dual-path transport: MQTT when the manager reports connected (a
    /// publish failure falls through to HTTP); a disconnected manager is
    /// skipped outright rather than wasting a publish attempt.
    async fn send_report(&self, report: &DeviceStateReport, info: &DeviceInfo) -> Result<(), SyncError> {
        let wire = report.to_wire(&info.uuid);
        let payload = serde_json::to_vec(&wire).map_err(|e| SyncError::Decode(e.to_string()))?;

        if let Some(mqtt) = &self.mqtt {
            if mqtt.is_connected() {
                let topic = state_topic(&info.uuid);
                match mqtt
                    .publish_no_queue(&topic, &payload, QOS_AT_LEAST_ONCE)
                    .await
                {
                    Ok(()) => {
                        debug!("Report published over MQTT");
                        return Ok(());
                    }
                    Err(e) => warn!("MQTT publish failed, falling back to HTTP: {e}"),
                }
            } else {
                debug!("MQTT disconnected; reporting over HTTP");
            }
        }

        let url = format!("{}/device/state", self.options.cloud_api_endpoint);
        let mut opts = RequestOptions::default()
            .compressed()
            .with_header("Content-Type", "application/json");
        if let Some(key) = &info.device_api_key {
            opts = opts.with_header(API_KEY_HEADER, key);
        }

        let http = self.http.read().await.clone();
        let response = http.patch(&url, payload, opts).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(SyncError::from_status(response.status, response.retry_after()))
        }
    }

    pub async fn is_running(&self) -> bool {
        self.runtime.lock().await.cancel.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{
        BTreeMap,
        VecDeque,
    };
    use std::sync::atomic::AtomicBool as StdAtomicBool;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use edgesync_commons::models::device_state::App;
    use edgesync_commons::models::sensor::Sensor;
    use edgesync_commons::utils::db::create_db_table;
    use edgesync_commons::utils::error::DbError;
    use edgesync_reconciler::drivers::{
        ContainerAction,
        ContainerRuntimeDriver,
        ProtocolAdapterDriver,
    };
    use serde_json::json;
    use tokio::sync::broadcast;
    use uuid::Uuid;

    use super::*;

    #[derive(Clone, Debug)]
    struct RecordedRequest {
        method: &'static str,
        url: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    impl RecordedRequest {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }
    }

    struct FakeHttp {
        responses: StdMutex<VecDeque<Result<HttpResponse, SyncError>>>,
        requests: StdMutex<Vec<RecordedRequest>>,
    }

    impl FakeHttp {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                responses: StdMutex::new(VecDeque::new()),
                requests: StdMutex::new(Vec::new()),
            })
        }

        fn push(&self, response: Result<HttpResponse, SyncError>) {
            self.responses.lock().unwrap().push_back(response);
        }

        fn requests(&self) -> Vec<RecordedRequest> {
            self.requests.lock().unwrap().clone()
        }

        fn record_and_next(
            &self, method: &'static str, url: &str, opts: &RequestOptions, body: Vec<u8>,
        ) -> Result<HttpResponse, SyncError> {
            self.requests.lock().unwrap().push(RecordedRequest {
                method,
                url: url.to_string(),
                headers: opts.headers.clone(),
                body,
            });
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(HttpResponse::new(200, Vec::new(), b"{}".to_vec())))
        }
    }

    #[async_trait]
    impl HttpClient for FakeHttp {
        async fn get(&self, url: &str, opts: RequestOptions) -> Result<HttpResponse, SyncError> {
            self.record_and_next("GET", url, &opts, Vec::new())
        }

        async fn post(
            &self, url: &str, body: Vec<u8>, opts: RequestOptions,
        ) -> Result<HttpResponse, SyncError> {
            self.record_and_next("POST", url, &opts, body)
        }

        async fn patch(
            &self, url: &str, body: Vec<u8>, opts: RequestOptions,
        ) -> Result<HttpResponse, SyncError> {
            self.record_and_next("PATCH", url, &opts, body)
        }
    }

    struct FakeMqtt {
        connected: StdAtomicBool,
        fail_publish: StdAtomicBool,
        published: StdMutex<Vec<String>>,
        reconnects: broadcast::Sender<()>,
    }

    impl FakeMqtt {
        fn new(connected: bool) -> Arc<Self> {
            let (reconnects, _) = broadcast::channel(4);
            Arc::new(Self {
                connected: StdAtomicBool::new(connected),
                fail_publish: StdAtomicBool::new(false),
                published: StdMutex::new(Vec::new()),
                reconnects,
            })
        }
    }

    #[async_trait]
    impl MqttManager for FakeMqtt {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn publish_no_queue(
            &self, topic: &str, _payload: &[u8], _qos: u8,
        ) -> anyhow::Result<()> {
            if self.fail_publish.load(Ordering::SeqCst) {
                anyhow::bail!("publish timed out");
            }
            self.published.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        fn subscribe_reconnect(&self) -> broadcast::Receiver<()> {
            self.reconnects.subscribe()
        }
    }

    struct FakeMetrics {
        metrics: SystemMetrics,
    }

    #[async_trait]
    impl SystemMetricsSource for FakeMetrics {
        async fn get_system_metrics(&self) -> SystemMetrics {
            self.metrics.clone()
        }
    }

    struct FakeDeviceInfo {
        info: StdMutex<DeviceInfo>,
    }

    #[async_trait]
    impl DeviceInfoAccessor for FakeDeviceInfo {
        async fn get_device_info(&self) -> Result<DeviceInfo, DbError> {
            Ok(self.info.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    struct FakeRuntime {
        current: StdMutex<BTreeMap<i64, App>>,
        actions: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ContainerRuntimeDriver for FakeRuntime {
        async fn get_current_state(&self) -> anyhow::Result<BTreeMap<i64, App>> {
            Ok(self.current.lock().unwrap().clone())
        }

        async fn apply_action(&self, action: &ContainerAction) -> anyhow::Result<()> {
            self.actions
                .lock()
                .unwrap()
                .push(format!("{}:{}", action.kind(), action.service_id()));
            if let ContainerAction::Create { app_id, app_name, service }
            | ContainerAction::Recreate { app_id, app_name, service } = action
            {
                let mut current = self.current.lock().unwrap();
                let app = current.entry(*app_id).or_insert_with(|| App {
                    name: app_name.clone(),
                    services: Vec::new(),
                });
                app.services.retain(|s| s.service_id != service.service_id);
                app.services.push(service.clone());
            }
            Ok(())
        }
    }

    struct FakeAdapter;

    #[async_trait]
    impl ProtocolAdapterDriver for FakeAdapter {
        async fn apply_sensor_config(&self, _sensor: &Sensor) -> anyhow::Result<()> {
            Ok(())
        }

        async fn remove_sensor_config(&self, _uuid: Uuid) -> anyhow::Result<()> {
            Ok(())
        }

        async fn get_all_device_statuses(
            &self,
        ) -> anyhow::Result<BTreeMap<String, BTreeMap<Uuid, String>>> {
            Ok(BTreeMap::new())
        }
    }

    struct Harness {
        sync: Arc<CloudSync>,
        http: Arc<FakeHttp>,
        mqtt: Arc<FakeMqtt>,
        runtime: Arc<FakeRuntime>,
        reconciler: Arc<StateReconciler>,
        factory_calls: Arc<AtomicUsize>,
    }

    fn test_options() -> SyncOptions {
        let mut options = SyncOptions::new("https://cloud.example.com/api");
        options.report_interval = Duration::ZERO;
        options.metrics_interval = Duration::from_secs(3600);
        options.backoff = BackoffConfig {
            jitter_ratio: 0.0,
            ..BackoffConfig::default()
        };
        options
    }

    async fn harness_with(options: SyncOptions, mqtt_connected: bool) -> Harness {
        let pool = Arc::new(SqlitePool::connect("sqlite::memory:").await.unwrap());
        create_db_table(&pool).await.unwrap();

        let runtime = Arc::new(FakeRuntime::default());
        let reconciler = Arc::new(
            StateReconciler::new(pool.clone(), runtime.clone(), Arc::new(FakeAdapter))
                .await
                .unwrap(),
        );

        let device_info = Arc::new(FakeDeviceInfo {
            info: StdMutex::new(DeviceInfo {
                uuid: "dev-1".to_string(),
                device_api_key: Some("key-1".to_string()),
                os_version: Some("edge-os 6.1".to_string()),
                agent_version: Some("0.1.0".to_string()),
                provisioned: true,
                api_tls_config: None,
            }),
        });

        let http = FakeHttp::new();
        let factory_calls = Arc::new(AtomicUsize::new(0));
        let factory_http = http.clone();
        let factory_counter = factory_calls.clone();
        let factory: Box<HttpClientFactory> = Box::new(move |_, _, _| {
            factory_counter.fetch_add(1, Ordering::SeqCst);
            Ok(factory_http.clone() as Arc<dyn HttpClient>)
        });

        let mqtt = FakeMqtt::new(mqtt_connected);
        let metrics = Arc::new(FakeMetrics {
            metrics: SystemMetrics {
                cpu_usage: Some(7.5),
                memory_usage: Some(512),
                memory_total: Some(2048),
                uptime: Some(3600),
                network_interfaces: Some(vec![
                    edgesync_commons::models::report::NetworkInterfaceInfo {
                        name: "eth0".to_string(),
                        ipv4: Some("192.168.7.2".to_string()),
                    },
                ]),
                ..SystemMetrics::default()
            },
        });

        let sync = CloudSync::with_http_factory(
            options,
            pool,
            device_info,
            reconciler.clone(),
            metrics,
            Some(mqtt.clone() as Arc<dyn MqttManager>),
            factory,
        )
        .await
        .unwrap();

        Harness {
            sync,
            http,
            mqtt,
            runtime,
            reconciler,
            factory_calls,
        }
    }

    fn poll_response(version: u64, etag: &str) -> HttpResponse {
        let body = json!({
            "dev-1": {
                "version": version,
                "apps": {
                    "1": {
                        "name": "edge",
                        "services": [{
                            "serviceId": 10,
                            "serviceName": "api",
                            "config": {"image": format!("api:{version}")}
                        }]
                    }
                },
                "config": {"sensors": []}
            }
        });
        HttpResponse::new(
            200,
            vec![("ETag".to_string(), etag.to_string())],
            body.to_string().into_bytes(),
        )
    }

    #[tokio::test]
    async fn test_poll_applies_target_and_caches_etag() {
        let harness = harness_with(test_options(), false).await;

        harness.http.push(Ok(poll_response(1, "\"v1\"")));
        let delay = harness.sync.poll_tick().await;

        assert_eq!(delay, harness.sync.options.poll_interval);
        assert_eq!(harness.sync.current_version().await, 1);
        assert_eq!(*harness.runtime.actions.lock().unwrap(), vec!["create:10"]);

        let requests = harness.http.requests();
        assert_eq!(requests[0].method, "GET");
        assert_eq!(
            requests[0].url,
            "https://cloud.example.com/api/device/dev-1/state"
        );
        assert_eq!(requests[0].header("X-Device-API-Key"), Some("key-1"));
        assert_eq!(
            requests[0].header("If-None-Match"),
            None,
            "no ETag known on the first poll"
        );

        harness
            .http
            .push(Ok(HttpResponse::new(304, Vec::new(), Vec::new())));
        harness.sync.poll_tick().await;

        let requests = harness.http.requests();
        assert_eq!(
            requests[1].header("If-None-Match"),
            Some("\"v1\""),
            "second poll quotes the cached ETag"
        );
        assert_eq!(
            *harness.runtime.actions.lock().unwrap(),
            vec!["create:10"],
            "a 304 must not re-apply anything"
        );
    }

    #[tokio::test]
    async fn test_poll_updates_version_even_when_state_unchanged() {
        let harness = harness_with(test_options(), false).await;

        harness.http.push(Ok(poll_response(1, "\"v1\"")));
        harness.sync.poll_tick().await;

        // Same state content, new version stamp.
        let body = json!({
            "dev-1": {
                "version": 2,
                "apps": {
                    "1": {
                        "name": "edge",
                        "services": [{
                            "serviceId": 10,
                            "serviceName": "api",
                            "config": {"image": "api:1"}
                        }]
                    }
                },
                "config": {"sensors": []}
            }
        });
        harness.http.push(Ok(HttpResponse::new(
            200,
            vec![("ETag".to_string(), "\"v2\"".to_string())],
            body.to_string().into_bytes(),
        )));
        harness.sync.poll_tick().await;

        assert_eq!(
            harness.sync.current_version().await,
            2,
            "version tracking is unconditional"
        );
        assert_eq!(
            harness.reconciler.current_version(),
            1,
            "an unchanged state body does not re-apply the target"
        );
    }

    #[tokio::test]
    async fn test_poll_failures_back_off_and_trip_breaker() {
        let mut options = test_options();
        options.breaker.failure_threshold = 2;
        let harness = harness_with(options, false).await;

        harness
            .http
            .push(Err(SyncError::Network("connection reset".to_string())));
        let delay = harness.sync.poll_tick().await;
        assert_eq!(delay, Duration::from_secs(15), "first failure backs off at base");

        harness
            .http
            .push(Err(SyncError::Network("connection reset".to_string())));
        let delay = harness.sync.poll_tick().await;
        assert_eq!(delay, Duration::from_secs(30), "second failure doubles");

        let requests_before = harness.http.requests().len();
        let delay = harness.sync.poll_tick().await;
        assert!(
            delay > harness.sync.options.breaker.cooldown - Duration::from_secs(5),
            "open circuit schedules at cooldown remaining + 1s"
        );
        assert_eq!(
            harness.http.requests().len(),
            requests_before,
            "no request is issued while the circuit is open"
        );
    }

    #[tokio::test]
    async fn test_auth_failure_refreshes_credentials_without_tripping() {
        let harness = harness_with(test_options(), false).await;
        assert_eq!(harness.factory_calls.load(Ordering::SeqCst), 1);

        harness
            .http
            .push(Ok(HttpResponse::new(401, Vec::new(), Vec::new())));
        harness.sync.poll_tick().await;

        assert_eq!(
            harness.factory_calls.load(Ordering::SeqCst),
            2,
            "auth failure rebuilds the HTTP client"
        );
        assert_eq!(
            harness.sync.poll_breaker.failure_count(),
            0,
            "auth failures do not feed the circuit breaker"
        );
    }

    #[tokio::test]
    async fn test_report_prefers_mqtt_when_connected() {
        let harness = harness_with(test_options(), true).await;

        let delay = harness.sync.report_tick().await;
        assert_eq!(delay, harness.sync.options.report_interval);

        assert_eq!(
            *harness.mqtt.published.lock().unwrap(),
            vec!["iot/device/dev-1/state"],
            "connected MQTT carries the report"
        );
        assert!(
            harness.http.requests().is_empty(),
            "no HTTP fallback when MQTT succeeded"
        );
    }

    #[tokio::test]
    async fn test_report_skips_mqtt_when_disconnected() {
        let harness = harness_with(test_options(), false).await;

        harness.sync.report_tick().await;

        assert!(
            harness.mqtt.published.lock().unwrap().is_empty(),
            "disconnected MQTT is not even attempted"
        );
        let requests = harness.http.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "PATCH");
        assert_eq!(requests[0].url, "https://cloud.example.com/api/device/state");
        assert_eq!(requests[0].header("X-Device-API-Key"), Some("key-1"));
    }

    #[tokio::test]
    async fn test_report_falls_back_to_http_on_publish_failure() {
        let harness = harness_with(test_options(), true).await;
        harness.mqtt.fail_publish.store(true, Ordering::SeqCst);

        harness.sync.report_tick().await;

        assert!(harness.mqtt.published.lock().unwrap().is_empty());
        assert_eq!(
            harness.http.requests().len(),
            1,
            "publish failure falls through to HTTP"
        );
    }

    #[tokio::test]
    async fn test_static_fields_sent_once_until_changed() {
        let mut options = test_options();
        options.metrics_interval = Duration::ZERO;
        let harness = harness_with(options, false).await;

        harness.sync.report_tick().await;
        harness.sync.report_tick().await;

        let requests = harness.http.requests();
        assert_eq!(requests.len(), 2, "metrics cadence forces both sends");

        let first: Value = serde_json::from_slice(&requests[0].body).unwrap();
        let second: Value = serde_json::from_slice(&requests[1].body).unwrap();
        assert_eq!(first["dev-1"]["os_version"], "edge-os 6.1");
        assert_eq!(first["dev-1"]["agent_version"], "0.1.0");
        assert_eq!(first["dev-1"]["local_ip"], "192.168.7.2");
        assert!(
            second["dev-1"].get("os_version").is_none(),
            "unchanged static fields are omitted from later reports"
        );
        assert!(second["dev-1"].get("agent_version").is_none());
        assert!(second["dev-1"].get("local_ip").is_none());
        assert!(
            second["dev-1"].get("cpu_usage").is_some(),
            "metrics still ride along"
        );
    }

    #[tokio::test]
    async fn test_unchanged_state_skips_send() {
        let harness = harness_with(test_options(), false).await;

        harness.sync.report_tick().await;
        assert_eq!(harness.http.requests().len(), 1);

        // Runtime churn only: new container id and status.
        harness.http.push(Ok(poll_response(1, "\"v1\"")));
        harness.sync.poll_tick().await;
        {
            let mut current = harness.runtime.current.lock().unwrap();
            for app in current.values_mut() {
                for service in &mut app.services {
                    service.container_id = Some("fresh-container".to_string());
                    service.status = Some("running".to_string());
                }
            }
        }
        let before = harness.http.requests().len();
        harness.http.push(Ok(poll_response(1, "\"v1\"")));
        harness.sync.poll_tick().await;

        // State-only diff sees the new app tree once, sends it, and then
        // pure runtime churn stops producing sends.
        harness.sync.report_tick().await;
        let after_first = harness.http.requests().len();
        harness.sync.report_tick().await;

        assert_eq!(
            harness.http.requests().len(),
            after_first,
            "no new PATCH for a byte-identical state-only report"
        );
        assert!(after_first > before);
    }

    #[tokio::test]
    async fn test_report_failure_queues_stripped_copy_then_drains() {
        let harness = harness_with(test_options(), false).await;

        harness
            .http
            .push(Ok(HttpResponse::new(503, Vec::new(), Vec::new())));
        let delay = harness.sync.report_tick().await;
        assert_eq!(delay, Duration::from_secs(15), "failed report backs off");
        assert_eq!(harness.sync.queued_reports().await, 1);

        // Next cycle: live report succeeds, then the queued one drains.
        harness.sync.report_tick().await;
        assert_eq!(harness.sync.queued_reports().await, 0, "queue drained after recovery");

        let requests = harness.http.requests();
        assert_eq!(
            requests.len(),
            3,
            "failed send, live send, then the drained queue entry"
        );
    }

    #[tokio::test]
    async fn test_rate_limit_skips_early_report() {
        let mut options = test_options();
        options.report_interval = Duration::from_secs(10);
        let harness = harness_with(options, false).await;

        harness.sync.report_tick().await;
        assert_eq!(harness.http.requests().len(), 1);

        let delay = harness.sync.report_tick().await;
        assert!(
            delay <= Duration::from_secs(10),
            "early tick reschedules for the remaining window"
        );
        assert_eq!(
            harness.http.requests().len(),
            1,
            "rate limit suppressed the early report"
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_restartable() {
        let harness = harness_with(test_options(), false).await;

        harness.sync.clone().start().await;
        assert!(harness.sync.is_running().await);

        harness.sync.stop().await;
        assert!(!harness.sync.is_running().await);
        harness.sync.stop().await;

        harness.sync.clone().start().await;
        assert!(harness.sync.is_running().await, "stop() leaves restart possible");
        harness.sync.stop().await;
    }

    #[tokio::test]
    async fn test_missing_endpoint_refuses_to_construct() {
        let pool = Arc::new(SqlitePool::connect("sqlite::memory:").await.unwrap());
        create_db_table(&pool).await.unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        let reconciler = Arc::new(
            StateReconciler::new(pool.clone(), runtime, Arc::new(FakeAdapter))
                .await
                .unwrap(),
        );
        let device_info = Arc::new(FakeDeviceInfo {
            info: StdMutex::new(DeviceInfo::default()),
        });
        let metrics = Arc::new(FakeMetrics {
            metrics: SystemMetrics::default(),
        });

        let result = CloudSync::new(
            SyncOptions::new(""),
            pool,
            device_info,
            reconciler,
            metrics,
            None,
        )
        .await;

        assert!(matches!(result, Err(SyncError::NotConfigured(_))));
    }
}
