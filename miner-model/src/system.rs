//! Machine facts reported to the backend when a job starts.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemDetails {
    pub cpu: CpuDetails,
    pub graphics: Vec<GpuDetails>,
    pub network: Vec<NetworkDetails>,
    pub os: OsDetails,
    /// Total memory in bytes.
    pub memory_total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuDetails {
    pub brand: String,
    pub cores: usize,
    pub manufacturer: String,
    pub physical_cores: Option<usize>,
    /// Clock speed in MHz.
    pub speed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuDetails {
    pub model: String,
    pub vram: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkDetails {
    pub iface: String,
    pub ip4: Option<String>,
    pub mac: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OsDetails {
    pub distro: String,
    pub platform: String,
    pub release: String,
}
