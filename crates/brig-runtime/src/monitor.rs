//! cgroup v2 resource accounting.
//!
//! | File             | Used for                                         |
//! |------------------|--------------------------------------------------|
//! | `memory.peak`    | peak memory (falls back to `memory.current`)     |
//! | `memory.current` | resident memory                                  |
//! | `cpu.stat`       | `usage_usec`, cumulative CPU time                |

use crate::RuntimeError;
use brig_schema::UsageStats;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reads accounting files of one container's cgroup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupReader {
    dir: PathBuf,
}

impl CgroupReader {
    /// `<cgroup_root>/<parent>/<id>`.
    pub fn new(cgroup_root: &Path, parent: &str, id: &str) -> Self {
        Self {
            dir: cgroup_root.join(parent.trim_matches('/')).join(id),
        }
    }

    pub fn for_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn read_file(&self, name: &str) -> Result<String, RuntimeError> {
        let path = self.dir.join(name);
        fs::read_to_string(&path).map_err(|e| RuntimeError::Accounting {
            path,
            reason: e.to_string(),
        })
    }

    fn read_u64(&self, name: &str) -> Result<u64, RuntimeError> {
        let content = self.read_file(name)?;
        content
            .trim()
            .parse::<u64>()
            .map_err(|e| RuntimeError::Accounting {
                path: self.dir.join(name),
                reason: e.to_string(),
            })
    }

    pub fn memory_current(&self) -> Result<u64, RuntimeError> {
        self.read_u64("memory.current")
    }

    /// `memory.peak` needs Linux 5.19; older kernels only have `memory.current`.
    pub fn memory_peak(&self) -> Result<u64, RuntimeError> {
        match self.read_u64("memory.peak") {
            Ok(peak) => Ok(peak),
            Err(_) => self.memory_current(),
        }
    }

    pub fn cpu_nanos(&self) -> Result<u64, RuntimeError> {
        let content = self.read_file("cpu.stat")?;
        parse_cpu_usage_usec(&content)
            .map(|usec| usec.saturating_mul(1_000))
            .ok_or_else(|| RuntimeError::Accounting {
                path: self.dir.join("cpu.stat"),
                reason: "usage_usec not found".to_owned(),
            })
    }

    /// One snapshot. Fails as soon as any file is missing or unreadable.
    pub fn read(&self) -> Result<UsageStats, RuntimeError> {
        let memory_bytes = self.memory_current()?;
        let peak_memory_bytes = self.memory_peak()?.max(memory_bytes);
        let cpu_nanos = self.cpu_nanos()?;
        Ok(UsageStats {
            peak_memory_bytes,
            memory_bytes,
            cpu_nanos,
        })
    }
}

fn parse_cpu_usage_usec(content: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some("usage_usec"), Some(value)) => value.parse().ok(),
            _ => None,
        }
    })
}

/// Background poller for the duration of one Run/Exec.
///
/// Keeps the maximum memory seen and the latest CPU counter; a failed read
/// keeps the previous snapshot. The latest value is published through a watch
/// channel so readers never wait on the sampler.
pub struct UsageSampler {
    token: CancellationToken,
    rx: watch::Receiver<Option<UsageStats>>,
    handle: Option<JoinHandle<()>>,
}

impl UsageSampler {
    /// Start polling. `seed` is folded in first so the result never drops
    /// below a previously published snapshot.
    pub fn spawn(reader: CgroupReader, interval: Duration, seed: Option<UsageStats>) -> Self {
        let token = CancellationToken::new();
        let (tx, rx) = watch::channel(seed);
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = task_token.cancelled() => break,
                    _ = ticker.tick() => sample(&reader, &tx),
                }
            }
            // Final read so short commands still report something.
            sample(&reader, &tx);
            debug!("usage sampler for {} stopped", reader.path().display());
        });

        Self {
            token,
            rx,
            handle: Some(handle),
        }
    }

    /// Cancel the task, wait for it and return the final snapshot.
    pub async fn stop(mut self) -> Option<UsageStats> {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                debug!("usage sampler task ended abnormally: {e}");
            }
        }
        let latest = *self.rx.borrow();
        latest
    }
}

impl Drop for UsageSampler {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn sample(reader: &CgroupReader, tx: &watch::Sender<Option<UsageStats>>) {
    if let Ok(stats) = reader.read() {
        tx.send_modify(|current| {
            *current = Some(match *current {
                Some(prev) => prev.merge(stats),
                None => stats,
            });
        });
    }
}
