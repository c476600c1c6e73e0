use std::net::IpAddr;

use async_trait::async_trait;
use edgesync_commons::models::report::{
    NetworkInterfaceInfo,
    SystemMetrics,
    TopProcess,
};
use log::warn;
use sysinfo::{
    Components,
    Disks,
    Networks,
    System,
};

pub const TOP_PROCESS_COUNT: usize = 5;

/// Source of sampled system metrics. Sampling never fails the caller;
/// whatever cannot be read is simply absent from the result.
#[async_trait]
pub trait SystemMetricsSource: Send + Sync {
    async fn get_system_metrics(&self) -> SystemMetrics;
}

/// sysinfo-backed probe. CPU usage needs two samples a short interval
/// apart, so collection runs on the blocking pool.
#[derive(Default)]
pub struct SystemMetricsProbe;

impl SystemMetricsProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SystemMetricsSource for SystemMetricsProbe {
    async fn get_system_metrics(&self) -> SystemMetrics {
        match tokio::task::spawn_blocking(collect_metrics).await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!("Metrics sampling task failed: {e}");
                SystemMetrics::default()
            }
        }
    }
}

fn collect_metrics() -> SystemMetrics {
    let mut sys = System::new_all();
    sys.refresh_all();
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_usage();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

    let (storage_usage, storage_total) = disk_usage();

    SystemMetrics {
        cpu_usage: Some(sys.global_cpu_usage()),
        memory_usage: Some(sys.used_memory()),
        memory_total: Some(sys.total_memory()),
        storage_usage,
        storage_total,
        cpu_temp: cpu_temperature(),
        uptime: Some(System::uptime()),
        top_processes: Some(top_processes(&sys)),
        network_interfaces: Some(network_interfaces()),
    }
}

fn disk_usage() -> (Option<u64>, Option<u64>) {
    let disks = Disks::new_with_refreshed_list();
    if disks.list().is_empty() {
        return (None, None);
    }

    let total: u64 = disks.list().iter().map(|d| d.total_space()).sum();
    let available: u64 = disks.list().iter().map(|d| d.available_space()).sum();
    (Some(total.saturating_sub(available)), Some(total))
}

fn cpu_temperature() -> Option<f32> {
    let components = Components::new_with_refreshed_list();
    components
        .list()
        .iter()
        .find(|c| {
            let label = c.label().to_lowercase();
            label.contains("cpu") || label.contains("core") || label.contains("package")
        })
        .or_else(|| components.list().first())
        .map(|c| c.temperature())
}

fn top_processes(sys: &System) -> Vec<TopProcess> {
    let mut processes: Vec<TopProcess> = sys
        .processes()
        .iter()
        .map(|(pid, process)| TopProcess {
            pid: pid.as_u32(),
            name: process.name().to_string_lossy().into_owned(),
            cpu_usage: process.cpu_usage(),
            memory: process.memory(),
        })
        .collect();

    processes.sort_by(|a, b| {
        b.cpu_usage
            .partial_cmp(&a.cpu_usage)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    processes.truncate(TOP_PROCESS_COUNT);
    processes
}

fn network_interfaces() -> Vec<NetworkInterfaceInfo> {
    let networks = Networks::new_with_refreshed_list();
    let mut interfaces: Vec<NetworkInterfaceInfo> = networks
        .iter()
        .map(|(name, data)| {
            let ipv4 = data
                .ip_networks()
                .iter()
                .find_map(|network| match network.addr {
                    IpAddr::V4(addr) if !addr.is_loopback() => Some(addr.to_string()),
                    _ => None,
                });
            NetworkInterfaceInfo {
                name: name.clone(),
                ipv4,
            }
        })
        .collect();

    interfaces.sort_by(|a, b| a.name.cmp(&b.name));
    interfaces
}

/// First non-loopback IPv4 across the sampled interfaces, used by the
/// report loop as the device's `local_ip`.
pub fn primary_ipv4(interfaces: &[NetworkInterfaceInfo]) -> Option<String> {
    interfaces
        .iter()
        .filter(|i| !i.name.starts_with("veth") && !i.name.starts_with("docker"))
        .find_map(|i| i.ipv4.clone())
        .or_else(|| interfaces.iter().find_map(|i| i.ipv4.clone()))
}
