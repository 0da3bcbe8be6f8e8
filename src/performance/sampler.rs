//! Runtime sampling thread: periodically measures process CPU time and
//! resident memory and feeds them into the harvest processor as forced
//! metrics (§9 "Runtime sampling thread", §10.5).

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::domain_types::RunId;
use crate::processor::{DataSender, Telemetry};
use crate::time_provider::SharedTimeProvider;

const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

/// One process-level reading. `cpu_user_seconds` and `resident_bytes` are
/// `None` on platforms where the corresponding counter could not be read.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessSample {
    pub cpu_user_seconds: Option<f64>,
    pub resident_bytes: Option<f64>,
}

/// Samples this process's CPU time and resident set size.
///
/// Reads `/proc/self/stat` and `/proc/self/statm` on Linux. On any other
/// platform, or if the proc files are unreadable, returns a sample with
/// both fields `None` rather than failing — the caller is expected to
/// simply skip emitting metrics for an absent field.
#[must_use]
pub fn sample_process() -> ProcessSample {
    #[cfg(target_os = "linux")]
    {
        linux::sample_process()
    }
    #[cfg(not(target_os = "linux"))]
    {
        ProcessSample::default()
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::ProcessSample;

    pub fn sample_process() -> ProcessSample {
        ProcessSample {
            cpu_user_seconds: read_cpu_user_seconds(),
            resident_bytes: read_resident_bytes(),
        }
    }

    // The kernel's USER_HZ and page size are fixed at boot and practically
    // universal on every Linux distribution this agent targets; avoiding an
    // `sysconf` FFI call keeps this module free of unsafe code.
    const CLOCK_TICKS_PER_SECOND: f64 = 100.0;
    const PAGE_SIZE_BYTES: f64 = 4096.0;

    fn read_cpu_user_seconds() -> Option<f64> {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        let after_comm = stat.rsplit_once(')')?.1;
        let fields: Vec<&str> = after_comm.split_whitespace().collect();
        // utime is field 14 overall; fields[] here starts at field 3 (state).
        let utime_ticks: u64 = fields.get(11)?.parse().ok()?;
        Some(utime_ticks as f64 / CLOCK_TICKS_PER_SECOND)
    }

    fn read_resident_bytes() -> Option<f64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages as f64 * PAGE_SIZE_BYTES)
    }
}

/// Samples process metrics on a fixed cadence and forwards them to the
/// harvest processor's `dataIn` channel as [`Telemetry::ForcedMetric`]
/// entries. Disables itself cleanly (stops emitting that metric, keeps
/// running for the other) when a counter is unavailable.
pub struct RuntimeSampler {
    time: SharedTimeProvider,
    interval: Duration,
}

impl RuntimeSampler {
    #[must_use]
    pub fn new(time: SharedTimeProvider) -> Self {
        Self {
            time,
            interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs forever, sampling and forwarding metrics on `sender`. Intended to
    /// be driven inside `tokio::spawn` alongside the harvest processor.
    #[instrument(skip(self, sender), fields(run_id = %run_id))]
    pub async fn run(&self, run_id: RunId, sender: DataSender, mut shutdown: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                () = self.time.sleep(self.interval) => {
                    self.tick(&sender).await;
                }
                _ = shutdown.recv() => {
                    debug!("runtime sampler stopping");
                    return;
                }
            }
        }
    }

    async fn tick(&self, sender: &DataSender) {
        let sample = sample_process();
        if let Some(cpu) = sample.cpu_user_seconds {
            sender
                .send(Telemetry::ForcedMetric {
                    name: "CPU/User Time".to_string(),
                    value: cpu,
                })
                .await;
        } else {
            warn!("CPU time counter unavailable on this platform, skipping");
        }
        if let Some(resident) = sample.resident_bytes {
            sender
                .send(Telemetry::ForcedMetric {
                    name: "Memory/Physical".to_string(),
                    value: resident,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_process_never_panics() {
        let sample = sample_process();
        let _ = sample.cpu_user_seconds;
        let _ = sample.resident_bytes;
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn sample_process_reads_real_counters_on_linux() {
        let sample = sample_process();
        assert!(sample.cpu_user_seconds.is_some());
        assert!(sample.resident_bytes.is_some());
    }
}
