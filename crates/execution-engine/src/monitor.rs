//! Background CPU and memory sampling for a running container

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::runtime::ContainerRuntime;

/// `cpu_delta / system_delta x online_cpus x 100`, or 0 when either delta is empty
pub fn cpu_percent(cpu_delta: u64, system_delta: u64, online_cpus: u64) -> f64 {
    if cpu_delta == 0 || system_delta == 0 {
        return 0.0;
    }
    (cpu_delta as f64 / system_delta as f64) * online_cpus.max(1) as f64 * 100.0
}

/// Highest readings seen over a container's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourcePeaks {
    pub samples: u32,
    pub peak_cpu_percent: f64,
    pub peak_memory_bytes: u64,
}

/// Samples a container at a fixed interval until the first failed stats read
pub struct ResourceMonitor {
    peaks: Arc<Mutex<ResourcePeaks>>,
    handle: JoinHandle<()>,
}

impl ResourceMonitor {
    pub fn spawn(
        runtime: Arc<dyn ContainerRuntime>,
        container_id: String,
        interval: Duration,
    ) -> Self {
        let peaks = Arc::new(Mutex::new(ResourcePeaks::default()));
        let shared = peaks.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match runtime.stats(&container_id).await {
                    Ok(sample) => {
                        if let Ok(mut peaks) = shared.lock() {
                            peaks.samples += 1;
                            peaks.peak_cpu_percent = peaks.peak_cpu_percent.max(sample.cpu_percent);
                            peaks.peak_memory_bytes =
                                peaks.peak_memory_bytes.max(sample.memory_bytes);
                        }
                    }
                    Err(e) => {
                        // stats stop answering once the container is gone
                        debug!(container_id = %container_id, "Resource monitor stopped: {}", e);
                        break;
                    }
                }
            }
        });

        Self { peaks, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop sampling and return what was seen
    pub fn finish(self) -> ResourcePeaks {
        self.handle.abort();
        let peaks = self.peaks.lock().map(|p| *p).unwrap_or_default();
        peaks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_percent() {
        assert_eq!(cpu_percent(0, 100, 4), 0.0);
        assert_eq!(cpu_percent(50, 0, 4), 0.0);
        assert_eq!(cpu_percent(25, 100, 2), 50.0);
        assert_eq!(cpu_percent(25, 100, 0), 25.0);
    }
}
