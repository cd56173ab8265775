//! Host metrics collection
//!
//! The MCP layer only depends on [`MetricsCollector`]; [`SystemCollector`]
//! is the production implementation backed by the `sysinfo` crate.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

use crate::{Error, Result};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub count: usize,
    pub model_name: String,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
    pub used_percent: f64,
}

/// A single CPU + memory sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
}

impl MetricsSnapshot {
    /// Human-readable rendering used in tool results
    pub fn format_text(&self) -> String {
        format!(
            "CPU: {} ({} cores), {:.1}% usage\nMemory: {:.1} GB used / {:.1} GB total ({:.1}%), {:.1} GB available",
            if self.cpu.model_name.is_empty() {
                "unknown"
            } else {
                &self.cpu.model_name
            },
            self.cpu.count,
            self.cpu.usage_percent,
            self.memory.used_bytes as f64 / GIB,
            self.memory.total_bytes as f64 / GIB,
            self.memory.used_percent,
            self.memory.available_bytes as f64 / GIB,
        )
    }
}

/// Source of metric snapshots. Must be safe to call from many sessions at once.
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    async fn collect(&self) -> Result<MetricsSnapshot>;
}

struct HostState {
    system: System,
    /// A CPU baseline refresh happened
    primed: bool,
}

/// Collector reading the local host through `sysinfo`.
///
/// Refreshes block, so they run on the blocking pool.
pub struct SystemCollector {
    state: Arc<Mutex<HostState>>,
}

impl Default for SystemCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemCollector {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        Self {
            state: Arc::new(Mutex::new(HostState {
                system,
                primed: false,
            })),
        }
    }
}

#[async_trait]
impl MetricsCollector for SystemCollector {
    async fn collect(&self) -> Result<MetricsSnapshot> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(Error::Collector(
                "host metrics are not supported on this platform".to_string(),
            ));
        }

        let state = self.state.clone();
        tokio::task::spawn_blocking(move || sample(&mut state.lock()))
            .await
            .map_err(|e| Error::Collector(format!("sampling task failed: {}", e)))?
    }
}

fn sample(state: &mut HostState) -> Result<MetricsSnapshot> {
    // CPU usage is a delta between two refreshes; the first call has none yet.
    // Callers queue on the lock, so none of them reads before the baseline exists.
    if !state.primed {
        state.system.refresh_cpu_usage();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        state.primed = true;
    }

    let start = Instant::now();
    let sys = &mut state.system;
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpus = sys.cpus();
    if cpus.is_empty() {
        return Err(Error::Collector("no CPU information available".to_string()));
    }
    let model_name = cpus[0].brand().trim().to_string();
    let usage_percent = f64::from(sys.global_cpu_usage()).clamp(0.0, 100.0);

    let total_bytes = sys.total_memory();
    let available_bytes = sys.available_memory();
    let used_bytes = sys.used_memory().min(total_bytes);
    let used_percent = if total_bytes == 0 {
        0.0
    } else {
        used_bytes as f64 / total_bytes as f64 * 100.0
    };

    let snapshot = MetricsSnapshot {
        cpu: CpuInfo {
            count: cpus.len(),
            model_name,
            usage_percent,
        },
        memory: MemoryInfo {
            total_bytes,
            available_bytes,
            used_bytes,
            used_percent,
        },
    };

    tracing::debug!(
        duration_us = start.elapsed().as_micros() as u64,
        cpu_count = snapshot.cpu.count,
        cpu_usage = snapshot.cpu.usage_percent,
        memory_used_percent = snapshot.memory.used_percent,
        "Collected host metrics"
    );

    Ok(snapshot)
}

/// Collector returning a fixed snapshot. Useful for tests and demos.
pub struct StaticCollector {
    snapshot: MetricsSnapshot,
}

impl StaticCollector {
    pub fn new(snapshot: MetricsSnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl MetricsCollector for StaticCollector {
    async fn collect(&self) -> Result<MetricsSnapshot> {
        Ok(self.snapshot.clone())
    }
}
