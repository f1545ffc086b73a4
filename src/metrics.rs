//! In-process counters, periodically snapshotted to CBOR by the metric
//! save task (spec §5 task 4). Grounded on `examples/original_source/src/main.c`'s
//! `update_metrics`/`save_metrics` (the `libmcu/metrics` counter names
//! mirrored below), re-expressed as plain atomics behind one process-wide
//! registry rather than a global C enum table.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

macro_rules! counters {
    ($($name:ident),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum Counter {
            $($name),+
        }

        impl Counter {
            fn as_str(&self) -> &'static str {
                match self {
                    $(Counter::$name => stringify!($name)),+
                }
            }
        }
    };
}

counters! {
    RunnerDispatchCount,
    RunnerOverrunCount,
    PilotTickCount,
    PilotWatchdogTimeoutCount,
    NetMgrConnectCount,
    NetMgrDisconnectCount,
    NetMgrPingFailureCount,
    NTPSyncCount,
    WdtCount,
    HeartbeatCount,
    ClockDriftExceededCount,
}

static COUNTERS: Lazy<RwLock<BTreeMap<&'static str, AtomicU64>>> = Lazy::new(|| RwLock::new(BTreeMap::new()));
static GAUGES: Lazy<RwLock<BTreeMap<&'static str, AtomicI64>>> = Lazy::new(|| RwLock::new(BTreeMap::new()));
static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

pub fn increase(counter: Counter) {
    let key = counter.as_str();
    if let Some(slot) = COUNTERS.read().get(key) {
        slot.fetch_add(1, Ordering::Relaxed);
        return;
    }
    COUNTERS.write().entry(key).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::Relaxed);
}

pub fn set_gauge(name: &'static str, value: i64) {
    if let Some(slot) = GAUGES.read().get(name) {
        slot.store(value, Ordering::Relaxed);
        return;
    }
    GAUGES.write().entry(name).or_insert_with(|| AtomicI64::new(0)).store(value, Ordering::Relaxed);
}

pub fn uptime_secs() -> u64 {
    PROCESS_START.elapsed().as_secs()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub uptime_secs: u64,
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
}

pub fn snapshot() -> MetricSnapshot {
    set_gauge("uptime_secs", uptime_secs() as i64);
    let counters = COUNTERS.read().iter().map(|(k, v)| (k.to_string(), v.load(Ordering::Relaxed))).collect();
    let gauges = GAUGES.read().iter().map(|(k, v)| (k.to_string(), v.load(Ordering::Relaxed))).collect();
    MetricSnapshot { uptime_secs: uptime_secs(), counters, gauges }
}

pub fn reset() {
    for slot in COUNTERS.read().values() {
        slot.store(0, Ordering::Relaxed);
    }
}

/// Directory of CBOR-encoded blobs keyed by monotonically increasing ID,
/// one blob per save interval, retained up to `max_len` files (spec §6
/// "Metric filesystem layout", default 720 = 30 days at the 1 h reference
/// cadence; this crate's task runs on its own configured period instead).
pub struct MetricFs {
    dir: PathBuf,
    max_len: usize,
}

impl MetricFs {
    pub fn new(dir: impl AsRef<Path>, max_len: usize) -> Self {
        Self { dir: dir.as_ref().to_path_buf(), max_len }
    }

    pub async fn write_snapshot(&self, snapshot: &MetricSnapshot) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let path = self.dir.join(format!("{id}.cbor"));

        let mut buf = Vec::new();
        ciborium::into_writer(snapshot, &mut buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        tokio::fs::write(&path, &buf).await?;

        self.enforce_retention().await?;
        Ok(path)
    }

    async fn enforce_retention(&self) -> std::io::Result<()> {
        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            if entry.path().extension().and_then(|e| e.to_str()) == Some("cbor") {
                entries.push(entry.path());
            }
        }
        entries.sort();

        while entries.len() > self.max_len {
            let oldest = entries.remove(0);
            if let Err(e) = tokio::fs::remove_file(&oldest).await {
                warn!(path = ?oldest, error = %e, "failed to prune old metric blob");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increase_accumulates_per_counter() {
        reset();
        increase(Counter::RunnerDispatchCount);
        increase(Counter::RunnerDispatchCount);
        let snap = snapshot();
        assert_eq!(snap.counters.get("RunnerDispatchCount"), Some(&2));
    }

    #[tokio::test]
    async fn write_snapshot_prunes_beyond_max_len() {
        let dir = std::env::temp_dir().join(format!("evse-metrics-test-{}", uptime_secs()));
        let fs = MetricFs::new(&dir, 2);

        for i in 0..4 {
            let mut snap = snapshot();
            snap.uptime_secs = i;
            fs.write_snapshot(&snap).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        }

        let mut read_dir = tokio::fs::read_dir(&dir).await.unwrap();
        let mut count = 0;
        while read_dir.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert!(count <= 2);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
