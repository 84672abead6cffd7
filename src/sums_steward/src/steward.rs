use fs2::FileExt;
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sums_lib::*;
use sums_store::dates::effective_now;
use sums_store::store_db::{self, with_conn, DbHandle, ExpiredSu};
use sums_store::{probe_with_timeout, StatvfsProbe, SumsStoreDb, UsageProbe};
use tokio::runtime::Runtime;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct StewardRunOptions {
    pub config_path: PathBuf,
    pub once: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrubState {
    /// Below high-water, or back under low-water after a scrub.
    Idle,
    /// Scrubbing another chunk next cycle.
    Continue,
    /// Over the watermark but nothing left to reclaim.
    Blocked,
}

/// What one scrub cycle did on one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrubReport {
    pub partition: String,
    pub usage: Option<f64>,
    pub removed: usize,
    pub disabled: bool,
    pub state: ScrubState,
}

/// Knobs shared by every scrubber of a steward.
#[derive(Clone)]
pub struct ScrubContext {
    pub config: StewardConfig,
    pub probe: Arc<dyn UsageProbe>,
    pub db: DbHandle,
}

impl ScrubContext {
    fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.config.probe_timeout_ms)
    }
}

/// Watermark state machine for a single partition.
pub struct Scrubber {
    partition: String,
    state: ScrubState,
    prev_usage: f64,
}

impl Scrubber {
    pub fn new(partition: &str) -> Self {
        Self {
            partition: store_db::normalize_partition(partition),
            state: ScrubState::Idle,
            prev_usage: 0.0,
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn state(&self) -> ScrubState {
        self.state
    }

    async fn measure(&self, ctx: &ScrubContext) -> SumsResult<f64> {
        let usage = probe_with_timeout(
            ctx.probe.as_ref(),
            Path::new(&self.partition),
            ctx.probe_timeout(),
        )
        .await?;
        Ok(usage.percent_used)
    }

    async fn candidates(&self, ctx: &ScrubContext, limit: usize) -> SumsResult<Vec<ExpiredSu>> {
        let partition = self.partition.clone();
        let now = effective_now();
        with_conn(&ctx.db, move |conn| {
            store_db::expired_candidates(conn, &partition, &now, limit)
        })
        .await
    }

    /// Runs one cycle. A failed probe skips the partition; store errors are
    /// returned with the state left as it was.
    pub async fn scrub_once(&mut self, ctx: &ScrubContext) -> SumsResult<ScrubReport> {
        let mut report = ScrubReport {
            partition: self.partition.clone(),
            usage: None,
            removed: 0,
            disabled: false,
            state: self.state,
        };
        let usage = match self.measure(ctx).await {
            Ok(usage) => usage,
            Err(e) => {
                warn!("Scrubber[{}]: usage probe failed, skipping cycle: {}", self.partition, e);
                return Ok(report);
            }
        };
        report.usage = Some(usage);
        let high = ctx.config.high_water;

        if self.state == ScrubState::Blocked && usage > self.prev_usage {
            info!(
                "Scrubber[{}]: usage grew {:.2}% -> {:.2}% while blocked, rescanning",
                self.partition, self.prev_usage, usage
            );
            self.state = ScrubState::Continue;
        }

        if (self.state == ScrubState::Idle && usage > high) || self.state == ScrubState::Continue {
            let candidates = self.candidates(ctx, ctx.config.chunk_size).await?;
            let removed = self.remove_dirs(candidates).await;
            if removed.is_empty() {
                report.disabled = self.block(ctx, usage).await?;
            } else {
                report.removed = removed.len();
                with_conn(&ctx.db, move |conn| store_db::delete_reclaimed(conn, &removed)).await?;
                let after = match self.measure(ctx).await {
                    Ok(after) => after,
                    Err(e) => {
                        warn!("Scrubber[{}]: remeasure failed: {}", self.partition, e);
                        usage
                    }
                };
                report.usage = Some(after);
                self.state = if after > ctx.config.low_water {
                    ScrubState::Continue
                } else {
                    ScrubState::Idle
                };
                info!(
                    "Scrubber[{}]: reclaimed {} storage units, usage {:.2}% -> {:.2}%, now {:?}",
                    self.partition, report.removed, usage, after, self.state
                );
                self.prev_usage = after;
            }
        } else {
            if self.state == ScrubState::Blocked && !self.candidates(ctx, 1).await?.is_empty() {
                info!("Scrubber[{}]: new candidates expired, unblocking", self.partition);
                self.state = ScrubState::Continue;
            }
            self.prev_usage = usage;
        }

        report.state = self.state;
        Ok(report)
    }

    async fn block(&mut self, ctx: &ScrubContext, usage: f64) -> SumsResult<bool> {
        self.state = ScrubState::Blocked;
        self.prev_usage = usage;
        if usage <= ctx.config.high_water {
            info!("Scrubber[{}]: nothing to reclaim at {:.2}%", self.partition, usage);
            return Ok(false);
        }
        let partition = self.partition.clone();
        with_conn(&ctx.db, move |conn| store_db::disable_partition(conn, &partition)).await?;
        warn!(
            "Scrubber[{}]: nothing to reclaim at {:.2}%, partition disabled for allocation",
            self.partition, usage
        );
        Ok(true)
    }

    /// Removes the directories of `candidates` and returns the ones that are
    /// gone afterwards.
    async fn remove_dirs(&self, candidates: Vec<ExpiredSu>) -> Vec<ExpiredSu> {
        let mut removed = Vec::with_capacity(candidates.len());
        for su in candidates {
            match tokio::fs::remove_dir_all(&su.wd).await {
                Ok(()) => {
                    debug!("Scrubber[{}]: removed {}", self.partition, su.wd);
                    removed.push(su);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("Scrubber[{}]: {} already gone", self.partition, su.wd);
                    removed.push(su);
                }
                Err(e) => {
                    warn!("Scrubber[{}]: remove {} failed! {}", self.partition, su.wd, e);
                }
            }
        }
        removed
    }
}

/// Exclusive hold on the steward lock file, released on drop.
pub struct StewardLock {
    file: File,
    path: PathBuf,
}

impl StewardLock {
    pub fn acquire(path: &Path) -> SumsResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                warn!("StewardLock: open {} failed! {}", path.display(), e);
                SumsError::IoError(e.to_string())
            })?;
        file.try_lock_exclusive().map_err(|e| {
            warn!("StewardLock: lock {} failed! {}", path.display(), e);
            SumsError::IoError(format!(
                "{} is held by another steward: {}",
                path.display(),
                e
            ))
        })?;
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for StewardLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("StewardLock: unlock {} failed! {}", self.path.display(), e);
        }
    }
}

pub struct Steward {
    ctx: ScrubContext,
    scrubbers: Vec<Scrubber>,
}

impl Steward {
    pub fn new(config: StewardConfig, probe: Arc<dyn UsageProbe>, db: DbHandle) -> Self {
        Self {
            ctx: ScrubContext { config, probe, db },
            scrubbers: Vec::new(),
        }
    }

    pub fn scrubbers(&self) -> &[Scrubber] {
        &self.scrubbers
    }

    /// Syncs the scrubber list with the monitored partitions. Partitions seen
    /// before keep their state.
    pub async fn refresh_partitions(&mut self) -> SumsResult<()> {
        let sets = self.ctx.config.partition_sets.clone();
        let rows = with_conn(&self.ctx.db, move |conn| {
            store_db::monitored_partitions(conn, &sets)
        })
        .await?;
        let mut previous = std::mem::take(&mut self.scrubbers);
        for row in rows {
            let name = store_db::normalize_partition(&row.name);
            let scrubber = match previous.iter().position(|s| s.partition == name) {
                Some(idx) => previous.swap_remove(idx),
                None => {
                    info!("Steward: monitoring {} (set {})", name, row.set_prime);
                    Scrubber::new(&name)
                }
            };
            self.scrubbers.push(scrubber);
        }
        for dropped in previous {
            info!("Steward: no longer monitoring {}", dropped.partition);
        }
        Ok(())
    }

    /// Scrubs every monitored partition concurrently and waits for all of
    /// them.
    pub async fn run_cycle(&mut self) -> SumsResult<Vec<ScrubReport>> {
        self.refresh_partitions().await?;
        let ctx = &self.ctx;
        let results = join_all(self.scrubbers.iter_mut().map(|s| s.scrub_once(ctx))).await;
        let mut reports = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => warn!("Steward: scrub failed! {}", e),
            }
        }
        Ok(reports)
    }

    /// Runs cycles every `scrub_interval_secs` until shutdown. A cycle in
    /// progress is always finished.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SumsResult<()> {
        let interval = Duration::from_secs(self.ctx.config.scrub_interval_secs);
        info!(
            "Steward: started, interval {}s, high {}%, low {}%",
            interval.as_secs(),
            self.ctx.config.high_water,
            self.ctx.config.low_water
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_cycle().await {
                warn!("Steward: cycle failed! {}", e);
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("Steward: stopped");
        Ok(())
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Steward: install SIGTERM handler failed: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

pub fn run_steward(options: StewardRunOptions) -> SumsResult<()> {
    let config = SumsConfig::load(&options.config_path)?;
    let _lock = StewardLock::acquire(&config.steward.lock_file)?;
    let store = SumsStoreDb::init(&config)?;
    let db = store.connect_handle()?;
    let runtime = Runtime::new().map_err(|e| SumsError::Internal(e.to_string()))?;
    runtime.block_on(async move {
        let mut steward = Steward::new(config.steward.clone(), Arc::new(StatvfsProbe), db);
        if options.once {
            for report in steward.run_cycle().await? {
                info!("Steward: {:?}", report);
            }
            return Ok(());
        }

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("Steward: signal received, finishing current cycle");
            tx.send_replace(true);
        });
        steward.run(rx).await.map_err(|e| {
            error!("Steward: failed: {}", e);
            e
        })
    })
}
