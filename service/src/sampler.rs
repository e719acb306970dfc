//! On-demand CPU / memory / uptime sampling for a live child.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::runner::ProcessHandle;

/// The sampled process has already exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("process is not running")]
pub struct ProcessGone;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub uptime_secs: u64,
}

impl std::fmt::Display for UsageSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let memory_mb = self.memory_bytes as f64 / 1024.0 / 1024.0;
        let hours = self.uptime_secs / 3600;
        let minutes = (self.uptime_secs % 3600) / 60;
        writeln!(f, "CPU: {:.1}%", self.cpu_percent)?;
        writeln!(f, "Memory: {memory_mb:.1} MB")?;
        write!(f, "Uptime: {hours}h {minutes}m")
    }
}

/// Delta-based sampler. A single CPU reading is meaningless, so every sample
/// takes two readings `interval` apart.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSampler {
    interval: Duration,
}

impl ResourceSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn sample(&self, handle: &ProcessHandle) -> Result<UsageSample, ProcessGone> {
        if !handle.is_alive() {
            return Err(ProcessGone);
        }
        let pid = Pid::from_u32(handle.pid());
        let refresh = ProcessRefreshKind::nothing().with_cpu().with_memory();

        let mut system = System::new();
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, refresh);
        if system.process(pid).is_none() {
            return Err(ProcessGone);
        }

        tokio::time::sleep(self.interval).await;
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, refresh);

        // Exited during the window: the numbers would describe a corpse.
        if !handle.is_alive() {
            return Err(ProcessGone);
        }
        let process = system.process(pid).ok_or(ProcessGone)?;

        Ok(UsageSample {
            cpu_percent: process.cpu_usage().max(0.0),
            memory_bytes: process.memory(),
            uptime_secs: handle.uptime().as_secs(),
        })
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn interval_never_below_platform_minimum() {
        let sampler = ResourceSampler::new(Duration::ZERO);
        assert!(sampler.interval() >= sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    }

    #[test]
    fn display_matches_operator_format() {
        let sample = UsageSample {
            cpu_percent: 12.345,
            memory_bytes: 50 * 1024 * 1024,
            uptime_secs: 3 * 3600 + 25 * 60 + 9,
        };
        assert_eq!(
            sample.to_string(),
            "CPU: 12.3%\nMemory: 50.0 MB\nUptime: 3h 25m"
        );
    }
}
