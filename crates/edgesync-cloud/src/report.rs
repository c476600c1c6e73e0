use edgesync_commons::models::report::DeviceStateReport;
use log::info;
use serde_json::{
    Map,
    Value,
};

/// Strip the runtime fields `containerId` and `status` from every service
/// in an `apps` tree. Those two churn constantly without the state having
/// meaningfully changed; leaving them in the diff would turn the report
/// stream into a firehose of equivalent states. They remain present in
/// the payload actually sent.
pub fn normalize_apps(apps: &Value) -> Value {
    let mut normalized = apps.clone();
    if let Value::Object(app_map) = &mut normalized {
        for app in app_map.values_mut() {
            if let Some(Value::Array(services)) = app.get_mut("services") {
                for service in services {
                    if let Value::Object(service_map) = service {
                        service_map.remove("containerId");
                        service_map.remove("status");
                    }
                }
            }
        }
    }
    normalized
}

/// Key-wise diff of the current state-only report against the last
/// successfully sent one. `apps` compares deeply after runtime-field
/// normalization; every other key compares by plain JSON equality. An
/// empty result means nothing worth sending changed.
pub fn report_diff(
    last: Option<&DeviceStateReport>, current: &DeviceStateReport,
) -> Map<String, Value> {
    let current_value = match serde_json::to_value(current) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let last_value = match last.map(serde_json::to_value) {
        Some(Ok(Value::Object(map))) => Some(map),
        _ => None,
    };

    let mut diff = Map::new();
    for (key, value) in &current_value {
        let previous = last_value.as_ref().and_then(|map| map.get(key));
        let unchanged = match (key.as_str(), previous) {
            ("apps", Some(previous)) => normalize_apps(value) == normalize_apps(previous),
            (_, Some(previous)) => value == previous,
            (_, None) => false,
        };
        if !unchanged {
            diff.insert(key.clone(), value.clone());
        }
    }
    diff
}

/// Compact a failed report before it goes to the offline queue: drop the
/// per-service environment and labels (verbose, recovered by the next
/// live report) and the process list (only the latest sample matters).
pub fn strip_for_queue(report: &DeviceStateReport) -> DeviceStateReport {
    let before = serde_json::to_vec(report).map(|b| b.len()).unwrap_or(0);

    let mut stripped = report.clone();
    if let Some(apps) = &mut stripped.apps {
        for app in apps.values_mut() {
            for service in &mut app.services {
                service.config.environment.clear();
                service.config.labels.clear();
            }
        }
    }
    stripped.metrics.top_processes = None;

    let after = serde_json::to_vec(&stripped).map(|b| b.len()).unwrap_or(0);
    info!("Stripped queued report from {before} to {after} bytes");
    stripped
}
