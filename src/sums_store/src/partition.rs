use async_trait::async_trait;
use log::warn;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use sums_lib::{SumsError, SumsResult};

/// Point-in-time usage of one partition. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageSnapshot {
    pub percent_used: f64,
    pub free_bytes: u64,
    pub total_bytes: u64,
}

impl UsageSnapshot {
    pub fn from_counts(total_bytes: u64, used_bytes: u64, free_bytes: u64) -> Self {
        let denom = used_bytes + free_bytes;
        let percent_used = if denom == 0 {
            0.0
        } else {
            used_bytes as f64 * 100.0 / denom as f64
        };
        Self {
            percent_used,
            free_bytes,
            total_bytes,
        }
    }
}

#[async_trait]
pub trait UsageProbe: Send + Sync {
    async fn probe(&self, partition: &Path) -> SumsResult<UsageSnapshot>;
}

/// Filesystem probe backed by statvfs(3), run on the blocking pool.
pub struct StatvfsProbe;

fn statvfs_usage(path: &Path) -> SumsResult<UsageSnapshot> {
    let stats = fs2::statvfs(path).map_err(|e| {
        SumsError::IoError(format!("statvfs {} failed: {}", path.display(), e))
    })?;
    let total = stats.total_space();
    let used = total.saturating_sub(stats.free_space());
    Ok(UsageSnapshot::from_counts(total, used, stats.available_space()))
}

#[async_trait]
impl UsageProbe for StatvfsProbe {
    async fn probe(&self, partition: &Path) -> SumsResult<UsageSnapshot> {
        let path = partition.to_path_buf();
        tokio::task::spawn_blocking(move || statvfs_usage(&path))
            .await
            .map_err(|e| SumsError::Internal(format!("probe task join failed: {}", e)))?
    }
}

/// Runs a probe under a hard timeout. A hung filesystem yields `ProbeTimeout`
/// instead of stalling the caller; the blocking task is abandoned.
pub async fn probe_with_timeout(
    probe: &dyn UsageProbe,
    partition: &Path,
    timeout: Duration,
) -> SumsResult<UsageSnapshot> {
    match tokio::time::timeout(timeout, probe.probe(partition)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                "UsageProbe: probe of {} timed out after {:?}",
                partition.display(),
                timeout
            );
            Err(SumsError::ProbeTimeout(format!(
                "{} did not answer within {:?}",
                partition.display(),
                timeout
            )))
        }
    }
}

/// Scripted readings per partition. Each probe pops the next reading and the
/// last one repeats. A partition scripted as hung never answers; an unknown
/// partition is an I/O error.
#[derive(Default)]
pub struct ScriptedUsageProbe {
    readings: Mutex<HashMap<PathBuf, VecDeque<Option<UsageSnapshot>>>>,
}

impl ScriptedUsageProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, partition: impl Into<PathBuf>, readings: Vec<UsageSnapshot>) {
        if let Ok(mut map) = self.readings.lock() {
            map.insert(partition.into(), readings.into_iter().map(Some).collect());
        }
    }

    pub fn set_free(&self, partition: impl Into<PathBuf>, free_bytes: u64, total_bytes: u64) {
        let used = total_bytes.saturating_sub(free_bytes);
        self.script(
            partition,
            vec![UsageSnapshot::from_counts(total_bytes, used, free_bytes)],
        );
    }

    pub fn set_percent(&self, partition: impl Into<PathBuf>, percents: &[f64]) {
        let readings = percents
            .iter()
            .map(|p| UsageSnapshot {
                percent_used: *p,
                free_bytes: 0,
                total_bytes: 0,
            })
            .collect();
        self.script(partition, readings);
    }

    pub fn hang(&self, partition: impl Into<PathBuf>) {
        if let Ok(mut map) = self.readings.lock() {
            map.insert(partition.into(), VecDeque::from(vec![None]));
        }
    }

    fn next_reading(&self, partition: &Path) -> SumsResult<Option<UsageSnapshot>> {
        let mut map = self
            .readings
            .lock()
            .map_err(|e| SumsError::Internal(format!("probe script lock poisoned: {}", e)))?;
        let queue = map.get_mut(partition).ok_or_else(|| {
            SumsError::IoError(format!("no such partition: {}", partition.display()))
        })?;
        let reading = if queue.len() > 1 {
            queue.pop_front().flatten()
        } else {
            queue.front().copied().flatten()
        };
        Ok(reading)
    }
}

#[async_trait]
impl UsageProbe for ScriptedUsageProbe {
    async fn probe(&self, partition: &Path) -> SumsResult<UsageSnapshot> {
        match self.next_reading(partition)? {
            Some(reading) => Ok(reading),
            None => {
                std::future::pending::<()>().await;
                Err(SumsError::Internal("unreachable probe".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_statvfs_probe_on_tempdir() {
        let dir = tempfile::TempDir::new().unwrap();
        let usage = StatvfsProbe.probe(dir.path()).await.unwrap();
        assert!(usage.total_bytes > 0);
        assert!(usage.percent_used >= 0.0 && usage.percent_used <= 100.0);
    }

    #[tokio::test]
    async fn test_statvfs_missing_path() {
        let err = StatvfsProbe
            .probe(Path::new("/definitely/not/a/partition"))
            .await
            .unwrap_err();
        assert!(matches!(err, SumsError::IoError(_)));
    }

    #[tokio::test]
    async fn test_hung_probe_times_out() {
        let probe = ScriptedUsageProbe::new();
        probe.hang("/SUM1");
        let err = probe_with_timeout(&probe, Path::new("/SUM1"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_scripted_readings_advance_then_repeat() {
        let probe = ScriptedUsageProbe::new();
        probe.set_percent("/SUM1", &[96.0, 91.0]);
        let p = Path::new("/SUM1");
        assert_eq!(probe.probe(p).await.unwrap().percent_used, 96.0);
        assert_eq!(probe.probe(p).await.unwrap().percent_used, 91.0);
        assert_eq!(probe.probe(p).await.unwrap().percent_used, 91.0);
    }
}
