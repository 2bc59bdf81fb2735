//! Performance monitor.
//!
//! Samples CPU utilization (per-core tick deltas from `/proc/stat`),
//! resident memory, and network latency (a timed TCP round trip to the
//! configured server, bounded at one second) on a one-second cadence, then
//! aggregates the run into a textual report on [`PerformanceMonitor::stop`].
//!
//! Samples are ephemeral: they live in memory for the duration of one
//! monitoring run and die with the report.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::memory::MemoryStats;

/// One sampling tick.
#[derive(Debug, Clone, Copy)]
pub struct PerfSample {
    /// Overall CPU utilization in percent, averaged across cores
    pub cpu_percent: f64,
    /// Resident set size (bytes)
    pub memory_bytes: u64,
    /// Round-trip latency to the probe target, when the probe succeeded
    pub latency: Option<Duration>,
}

/// Aggregate of one monitoring run.
#[derive(Debug, Clone)]
pub struct PerfReport {
    /// Wall-clock duration of the run
    pub duration: Duration,
    /// Number of samples collected
    pub sample_count: usize,
    /// Average CPU utilization (percent)
    pub avg_cpu_percent: f64,
    /// Average resident memory (bytes)
    pub avg_memory_bytes: u64,
    /// Average probe latency, when any probe succeeded
    pub avg_latency: Option<Duration>,
    /// Probe target, when one was configured
    pub target: Option<String>,
}

impl PerfReport {
    fn from_samples(samples: &[PerfSample], duration: Duration, target: Option<String>) -> Self {
        let count = samples.len();
        let avg_cpu_percent = if count > 0 {
            samples.iter().map(|s| s.cpu_percent).sum::<f64>() / count as f64
        } else {
            0.0
        };
        let avg_memory_bytes = if count > 0 {
            samples.iter().map(|s| s.memory_bytes).sum::<u64>() / count as u64
        } else {
            0
        };

        let latencies: Vec<Duration> = samples.iter().filter_map(|s| s.latency).collect();
        let avg_latency = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<Duration>() / latencies.len() as u32)
        };

        Self {
            duration,
            sample_count: count,
            avg_cpu_percent,
            avg_memory_bytes,
            avg_latency,
            target,
        }
    }

    /// Render the report for the host's diagnostics surface.
    pub fn format(&self) -> String {
        let latency = match self.avg_latency {
            Some(latency) => format!("{:.1} ms", latency.as_secs_f64() * 1000.0),
            None => "n/a".to_string(),
        };
        let probe = self.target.as_deref().unwrap_or("none");

        format!(
            r#"Performance Report
==================
Duration: {:.1} s ({} samples)

CPU:     avg {:.1}%
Memory:  avg {}
Latency: avg {} (probe: {})
"#,
            self.duration.as_secs_f64(),
            self.sample_count,
            self.avg_cpu_percent,
            format_bytes(self.avg_memory_bytes),
            latency,
            probe,
        )
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Per-core CPU accounting from `/proc/stat`.
///
/// Utilization is the busy-tick share of total ticks since the previous
/// sample; the first sample (no delta yet) reads as zero.
#[derive(Default)]
struct CpuTracker {
    previous: Option<Vec<(u64, u64)>>,
}

impl CpuTracker {
    fn sample(&mut self) -> f64 {
        let current = read_core_ticks();
        if current.is_empty() {
            return 0.0;
        }

        let percent = match &self.previous {
            Some(previous) if previous.len() == current.len() => {
                let mut per_core = Vec::with_capacity(current.len());
                for ((busy0, total0), (busy1, total1)) in previous.iter().zip(&current) {
                    let busy = busy1.saturating_sub(*busy0) as f64;
                    let total = total1.saturating_sub(*total0) as f64;
                    if total > 0.0 {
                        per_core.push((busy / total) * 100.0);
                    }
                }
                if per_core.is_empty() {
                    0.0
                } else {
                    per_core.iter().sum::<f64>() / per_core.len() as f64
                }
            }
            _ => 0.0,
        };

        self.previous = Some(current);
        percent.clamp(0.0, 100.0)
    }
}

/// `(busy, total)` tick counters per core.
#[cfg(target_os = "linux")]
fn read_core_ticks() -> Vec<(u64, u64)> {
    let Ok(stat) = std::fs::read_to_string("/proc/stat") else {
        return Vec::new();
    };

    stat.lines()
        .filter(|line| line.starts_with("cpu") && !line.starts_with("cpu "))
        .filter_map(|line| {
            let ticks: Vec<u64> = line
                .split_whitespace()
                .skip(1)
                .filter_map(|v| v.parse().ok())
                .collect();
            // user nice system idle iowait irq softirq steal ...
            if ticks.len() < 4 {
                return None;
            }
            let idle = ticks[3] + ticks.get(4).copied().unwrap_or(0);
            let total: u64 = ticks.iter().sum();
            Some((total - idle, total))
        })
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn read_core_ticks() -> Vec<(u64, u64)> {
    Vec::new()
}

/// Probe the target with a timed TCP connect.
async fn probe_latency(host: &str, port: u16, timeout: Duration) -> Option<Duration> {
    let started = Instant::now();
    let dial = tokio::net::TcpStream::connect((host, port));
    match tokio::time::timeout(timeout, dial).await {
        Ok(Ok(_stream)) => Some(started.elapsed()),
        _ => None,
    }
}

/// Periodic CPU / memory / latency sampler.
pub struct PerformanceMonitor {
    target: Option<(String, u16)>,
    cadence: Duration,
    probe_timeout: Duration,
    samples: Arc<Mutex<Vec<PerfSample>>>,
    started_at: Mutex<Option<Instant>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PerformanceMonitor {
    /// Create a monitor probing `target` for latency, sampling once a
    /// second.
    pub fn new(target: Option<(String, u16)>) -> Self {
        Self::with_cadence(
            target,
            Duration::from_secs(1),
            Duration::from_millis(crate::PROBE_TIMEOUT_MS),
        )
    }

    /// Create a monitor with explicit cadence and probe timeout.
    pub fn with_cadence(
        target: Option<(String, u16)>,
        cadence: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            target,
            cadence,
            probe_timeout,
            samples: Arc::new(Mutex::new(Vec::new())),
            started_at: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Begin sampling. A second call while running is a no-op.
    pub fn start(&self) {
        let mut slot = self.task.lock();
        if slot.is_some() {
            return;
        }

        *self.started_at.lock() = Some(Instant::now());
        self.samples.lock().clear();

        let samples = Arc::clone(&self.samples);
        let target = self.target.clone();
        let cadence = self.cadence;
        let probe_timeout = self.probe_timeout;

        let handle = tokio::spawn(async move {
            let mut cpu = CpuTracker::default();
            let mut ticker = tokio::time::interval(cadence);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                let cpu_percent = cpu.sample();
                let memory_bytes = MemoryStats::sample().physical_memory_used;
                let latency = match &target {
                    Some((host, port)) => probe_latency(host, *port, probe_timeout).await,
                    None => None,
                };

                samples.lock().push(PerfSample {
                    cpu_percent,
                    memory_bytes,
                    latency,
                });
            }
        });
        *slot = Some(handle);
    }

    /// Whether the sampling task is running.
    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Samples collected in the current run.
    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }

    /// Cancel sampling and aggregate the run.
    ///
    /// Returns `None` when the monitor was never started. The timer is
    /// cancelled deterministically; no tick fires after this returns.
    pub fn stop(&self) -> Option<PerfReport> {
        let handle = self.task.lock().take()?;
        handle.abort();

        let started = self.started_at.lock().take()?;
        let samples = std::mem::take(&mut *self.samples.lock());
        let target = self
            .target
            .as_ref()
            .map(|(host, port)| format!("{host}:{port}"));

        let report = PerfReport::from_samples(&samples, started.elapsed(), target);
        tracing::debug!(
            samples = report.sample_count,
            avg_cpu = report.avg_cpu_percent,
            "performance monitor stopped"
        );
        Some(report)
    }
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}
