//! Host utilization probes for the connect payload (§3 ConnectConfig, §6).

use serde::Serialize;

/// `utilization` object sent as part of the connect payload.
#[derive(Debug, Clone, Serialize)]
pub struct Utilization {
    pub metadata_version: u32,
    pub logical_processors: usize,
    pub total_ram_mib: u64,
    pub hostname: String,
    pub full_hostname: String,
    pub ip_address: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_id: Option<String>,
}

const METADATA_VERSION: u32 = 5;

impl Utilization {
    /// Probes the local host for CPU count, hostname, and (best-effort) RAM.
    /// Never fails: any probe that is unavailable falls back to a
    /// conservative placeholder rather than erroring the connect attempt.
    #[must_use]
    pub fn probe() -> Self {
        let hostname = hostname_probe();
        Self {
            metadata_version: METADATA_VERSION,
            logical_processors: num_cpus::get(),
            total_ram_mib: total_ram_mib_probe(),
            hostname: hostname.clone(),
            full_hostname: hostname,
            ip_address: Vec::new(),
            boot_id: None,
        }
    }
}

fn hostname_probe() -> String {
    env_or(&["HOSTNAME", "COMPUTERNAME"], "unknown-host")
}

fn env_or(names: &[&str], fallback: &str) -> String {
    for name in names {
        if let Ok(value) = std::env::var(name) {
            if !value.is_empty() {
                return value;
            }
        }
    }
    fallback.to_string()
}

fn total_ram_mib_probe() -> u64 {
    // No portable stdlib API for total RAM; a real agent would shell out to
    // /proc/meminfo on Linux or a platform API elsewhere. Reporting 0 here is
    // truthful about "unknown" without failing the connect attempt.
    0
}
