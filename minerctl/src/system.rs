//! Host facts sent to the backend when a job is claimed.

use miner_model::{CpuDetails, NetworkDetails, OsDetails, SystemDetails};
use sysinfo::{Networks, System};

/// Snapshot the machine. Blocking; call from `spawn_blocking`.
pub fn snapshot() -> SystemDetails {
    let mut sys = System::new();
    sys.refresh_cpu_all();
    sys.refresh_memory();

    SystemDetails {
        cpu: cpu_details(&sys),
        // sysinfo has no GPU support.
        graphics: Vec::new(),
        network: network_details(&Networks::new_with_refreshed_list()),
        os: os_details(),
        memory_total: sys.total_memory(),
    }
}

fn cpu_details(sys: &System) -> CpuDetails {
    let cpus = sys.cpus();
    let (brand, manufacturer, speed) = cpus
        .first()
        .map(|cpu| {
            (
                cpu.brand().trim().to_string(),
                cpu.vendor_id().to_string(),
                cpu.frequency(),
            )
        })
        .unwrap_or_default();

    CpuDetails {
        brand,
        cores: cpus.len(),
        manufacturer,
        physical_cores: System::physical_core_count(),
        speed,
    }
}

fn network_details(networks: &Networks) -> Vec<NetworkDetails> {
    let mut details: Vec<NetworkDetails> = networks
        .list()
        .iter()
        .filter(|(_, data)| !data.mac_address().is_unspecified())
        .map(|(iface, data)| NetworkDetails {
            iface: iface.clone(),
            ip4: data
                .ip_networks()
                .iter()
                .find(|net| net.addr.is_ipv4())
                .map(|net| net.addr.to_string()),
            mac: data.mac_address().to_string(),
        })
        .collect();
    details.sort_by(|a, b| a.iface.cmp(&b.iface));
    details
}

fn os_details() -> OsDetails {
    OsDetails {
        distro: System::long_os_version()
            .or_else(System::name)
            .unwrap_or_else(|| "unknown".to_string()),
        platform: std::env::consts::OS.to_string(),
        release: System::kernel_version()
            .or_else(System::os_version)
            .unwrap_or_default(),
    }
}
