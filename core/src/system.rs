//! Host inventory and heartbeat metrics collection via sysinfo.

use sysinfo::{Networks, System};

use crate::protocol::{SystemInfo, SystemMetrics};

/// Static host facts for registration and heartbeats.
pub fn collect_info() -> SystemInfo {
    SystemInfo {
        hostname: System::host_name().unwrap_or_else(|| "unknown".into()),
        os: System::name().unwrap_or_else(|| std::env::consts::OS.into()),
        arch: std::env::consts::ARCH.into(),
        ips: list_ips(),
    }
}

/// Point-in-time metrics attached to heartbeat payloads.
pub fn collect_metrics() -> SystemMetrics {
    let mut sys = System::new();
    sys.refresh_memory();
    let load = System::load_average();

    SystemMetrics {
        memory_total: sys.total_memory(),
        memory_used: sys.used_memory(),
        load_avg: vec![load.one, load.five, load.fifteen],
        uptime: System::uptime(),
    }
}

fn list_ips() -> Vec<String> {
    let networks = Networks::new_with_refreshed_list();
    let mut ips: Vec<String> = networks
        .values()
        .flat_map(|data| data.ip_networks().iter())
        .filter(|ip| ip.addr.is_ipv4() && !ip.addr.is_loopback())
        .map(|ip| ip.addr.to_string())
        .collect();
    ips.sort();
    ips.dedup();
    ips
}
