use crate::dates::{effective_after_days, put_effective_date, PROVISIONAL_TTL_DAYS};
use crate::partition::{probe_with_timeout, UsageProbe};
use crate::store_db::{self, with_conn, CommitRecord, DbHandle, SEQ_DS_INDEX};
use crate::undo::{UndoAction, UndoLog};
use chrono::Local;
use futures::future::join_all;
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sums_lib::*;

pub const SU_DIR_MODE: u32 = 0o2775;

#[derive(Debug, Clone)]
pub struct AllocEngineConfig {
    pub multi_partition_sets: bool,
    pub tape_enabled: bool,
    pub probe_timeout: Duration,
    pub chmown_helper: Option<PathBuf>,
}

impl From<&DaemonConfig> for AllocEngineConfig {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            multi_partition_sets: config.multi_partition_sets,
            tape_enabled: config.tape_enabled,
            probe_timeout: Duration::from_millis(config.alloc_probe_timeout_ms),
            chmown_helper: config.chmown_helper.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub sunum: Sunum,
    pub sudir: PathBuf,
}

/// Parameters of one put call, shared by every SU in the batch.
#[derive(Debug, Clone)]
pub struct PutBatch<'a> {
    pub session_id: u64,
    pub username: &'a str,
    pub series: &'a str,
    pub retention: i64,
    pub archive_type: ArchiveType,
}

pub struct AllocEngine {
    probe: Arc<dyn UsageProbe>,
    config: AllocEngineConfig,
}

impl AllocEngine {
    pub fn new(probe: Arc<dyn UsageProbe>, config: AllocEngineConfig) -> Self {
        Self { probe, config }
    }

    pub fn tape_enabled(&self) -> bool {
        self.config.tape_enabled
    }

    /// Partitions of `set` with at least `numbytes` free. Partitions whose
    /// probe fails or times out are left out.
    async fn partitions_with_space(&self, partitions: Vec<String>, numbytes: u64) -> Vec<String> {
        let timeout = self.config.probe_timeout;
        let probes = partitions.into_iter().map(|partition| {
            let probe = self.probe.clone();
            async move {
                let result = probe_with_timeout(probe.as_ref(), Path::new(&partition), timeout).await;
                (partition, result)
            }
        });

        let mut fitting = Vec::new();
        for (partition, result) in join_all(probes).await {
            match result {
                Ok(usage) if usage.free_bytes >= numbytes => fitting.push(partition),
                Ok(usage) => {
                    debug!(
                        "AllocEngine: {} has {} bytes free, need {}",
                        partition, usage.free_bytes, numbytes
                    );
                }
                Err(e) => {
                    warn!("AllocEngine: excluding {} from allocation: {}", partition, e);
                }
            }
        }
        fitting
    }

    pub async fn alloc(
        &self,
        db: &DbHandle,
        session_id: u64,
        sunum: Option<Sunum>,
        sugroup: i64,
        numbytes: u64,
        undo: &mut UndoLog,
    ) -> SumsResult<Allocation> {
        store_db::column_bytes(numbytes)?;
        let effective_date = effective_after_days(Local::now(), PROVISIONAL_TTL_DAYS)?;
        let multi_set = self.config.multi_partition_sets;
        let (sunum, partitions) = with_conn(db, move |conn| {
            store_db::write_tx(conn, |tx| {
                let sunum = match sunum {
                    Some(v) => v,
                    None => store_db::next_seq(tx, SEQ_DS_INDEX)?,
                };
                let set = if multi_set {
                    store_db::group_set(tx, sugroup)?.unwrap_or(0)
                } else {
                    0
                };
                let partitions = store_db::enabled_partitions(tx, set)?;
                Ok((sunum, partitions))
            })
        })
        .await?;

        if partitions.is_empty() {
            return Err(SumsError::NoSpace(format!(
                "no enabled partition for storage group {}",
                sugroup
            )));
        }

        let fitting = self.partitions_with_space(partitions, numbytes).await;
        let partition = fitting
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| {
                SumsError::NoSpace(format!("no partition has {} bytes free", numbytes))
            })?;

        let sudir = Path::new(&partition).join(su_dir_name(sunum));
        std::fs::DirBuilder::new()
            .mode(SU_DIR_MODE)
            .create(&sudir)
            .map_err(|e| {
                SumsError::IoError(format!("create su dir {} failed: {}", sudir.display(), e))
            })?;
        undo.push(UndoAction::RemoveDir(sudir.clone()));
        // umask strips the setgid bit from the create mode
        if let Err(e) =
            std::fs::set_permissions(&sudir, std::fs::Permissions::from_mode(SU_DIR_MODE))
        {
            warn!("AllocEngine: chmod {} failed: {}", sudir.display(), e);
        }

        let wd = sudir.to_string_lossy().to_string();
        let row_wd = wd.clone();
        with_conn(db, move |conn| {
            store_db::write_tx(conn, |tx| {
                store_db::insert_provisional(
                    tx,
                    &row_wd,
                    session_id,
                    numbytes,
                    &effective_date,
                    sugroup,
                    sunum,
                )
            })
        })
        .await?;

        info!(
            "AllocEngine: session {} allocated {} at {} ({} bytes)",
            HexId(session_id),
            HexId(sunum),
            wd,
            numbytes
        );
        Ok(Allocation { sunum, sudir })
    }

    /// Commits `entries` in one write transaction and records how to revert
    /// them in `undo`.
    pub async fn put(
        &self,
        db: &DbHandle,
        entries: &[SuDirEntry],
        batch: PutBatch<'_>,
        undo: &mut UndoLog,
    ) -> SumsResult<()> {
        let effective_date = put_effective_date(Local::now(), batch.retention)?;
        let partitions = with_conn(db, |conn| store_db::all_partitions(conn)).await?;
        for entry in entries {
            let parent = entry
                .path
                .parent()
                .map(|p| store_db::normalize_partition(&p.to_string_lossy()))
                .unwrap_or_default();
            if !partitions.iter().any(|p| *p == parent) {
                return Err(SumsError::BadRequest(format!(
                    "{} is not in a registered partition",
                    entry.path.display()
                )));
            }
        }

        if let Some(helper) = &self.config.chmown_helper {
            for entry in entries {
                run_chmown(helper, &entry.path).await?;
            }
        }

        let paths: Vec<PathBuf> = entries.iter().map(|e| e.path.clone()).collect();
        let sizes = tokio::task::spawn_blocking(move || {
            paths
                .iter()
                .map(|p| {
                    dir_size(p).map_err(|e| {
                        SumsError::IoError(format!("size of {} failed: {}", p.display(), e))
                    })
                })
                .collect::<SumsResult<Vec<u64>>>()
        })
        .await
        .map_err(|e| SumsError::Internal(format!("size task join failed: {}", e)))??;

        let status = ArchiveType::final_status(self.config.tape_enabled);
        let substatus = batch.archive_type.substatus(self.config.tape_enabled);
        let records: Vec<CommitRecord> = entries
            .iter()
            .zip(sizes)
            .map(|(entry, bytes)| CommitRecord {
                sunum: entry.sunum,
                wd: store_db::normalize_partition(&entry.path.to_string_lossy()),
                bytes,
                series: batch.series.to_string(),
                session_id: batch.session_id,
                username: batch.username.to_string(),
                status,
                substatus,
                effective_date: effective_date.clone(),
            })
            .collect();

        let count = records.len();
        let committed: Vec<Sunum> = records.iter().map(|r| r.sunum).collect();
        with_conn(db, move |conn| store_db::commit_batch(conn, &records)).await?;
        for sunum in committed {
            undo.push(UndoAction::RevertPut {
                sunum,
                session_id: batch.session_id,
            });
        }
        info!(
            "AllocEngine: session {} committed {} storage units to {}",
            HexId(batch.session_id),
            count,
            batch.series
        );
        Ok(())
    }
}

/// Total size of the regular files below `root`. Symlinks are counted as
/// links, never followed.
pub fn dir_size(root: &Path) -> std::io::Result<u64> {
    let meta = std::fs::symlink_metadata(root)?;
    if !meta.is_dir() {
        return Ok(if meta.is_file() { meta.len() } else { 0 });
    }

    let mut total = 0u64;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                total += entry.metadata()?.len();
            }
        }
    }
    Ok(total)
}

/// Hands ownership of a finished SU directory to the archive account through
/// the configured privileged helper.
async fn run_chmown(helper: &Path, sudir: &Path) -> SumsResult<()> {
    debug!("AllocEngine: {} {}", helper.display(), sudir.display());
    let status = tokio::process::Command::new(helper)
        .arg(sudir)
        .status()
        .await
        .map_err(|e| {
            SumsError::IoError(format!("run {} failed: {}", helper.display(), e))
        })?;
    if !status.success() {
        return Err(SumsError::IoError(format!(
            "{} {} exited with {}",
            helper.display(),
            sudir.display(),
            status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::ScriptedUsageProbe;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Fixture {
        root: TempDir,
        db: DbHandle,
        small: PathBuf,
        large: PathBuf,
        probe: Arc<ScriptedUsageProbe>,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let small = root.path().join("SUM1");
        let large = root.path().join("SUM2");
        std::fs::create_dir(&small).unwrap();
        std::fs::create_dir(&large).unwrap();

        let conn = store_db::open_connection(&root.path().join("sums.db")).unwrap();
        store_db::init_schema(&conn).unwrap();
        store_db::seed(
            &conn,
            &[
                PartitionSeed {
                    name: small.to_string_lossy().to_string(),
                    set: 0,
                },
                PartitionSeed {
                    name: large.to_string_lossy().to_string(),
                    set: 0,
                },
            ],
            &[GroupSeed {
                group_id: 7,
                set: 1,
            }],
        )
        .unwrap();

        let probe = Arc::new(ScriptedUsageProbe::new());
        probe.set_free(&small, 500, 10_000);
        probe.set_free(&large, 2000, 10_000);
        Fixture {
            root,
            db: Arc::new(Mutex::new(conn)),
            small,
            large,
            probe,
        }
    }

    fn engine(f: &Fixture, tape_enabled: bool) -> AllocEngine {
        AllocEngine::new(
            f.probe.clone(),
            AllocEngineConfig {
                multi_partition_sets: false,
                tape_enabled,
                probe_timeout: Duration::from_millis(200),
                chmown_helper: None,
            },
        )
    }

    #[tokio::test]
    async fn test_alloc_picks_partition_with_space() {
        let f = fixture();
        let engine = engine(&f, false);
        for _ in 0..10 {
            let mut undo = UndoLog::new();
            let a = engine.alloc(&f.db, 1, None, 0, 1000, &mut undo).await.unwrap();
            assert_eq!(a.sudir.parent().unwrap(), f.large.as_path());
            assert_eq!(a.sudir.file_name().unwrap().to_string_lossy(), format!("D{}", a.sunum));
            assert_eq!(undo.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_alloc_excludes_hung_partition() {
        let f = fixture();
        f.probe.hang(&f.large);
        let engine = engine(&f, false);
        let mut undo = UndoLog::new();
        let err = engine
            .alloc(&f.db, 1, None, 0, 1000, &mut undo)
            .await
            .unwrap_err();
        assert!(matches!(err, SumsError::NoSpace(_)));
        assert!(undo.is_empty());

        let a = engine.alloc(&f.db, 1, None, 0, 100, &mut undo).await.unwrap();
        assert_eq!(a.sudir.parent().unwrap(), f.small.as_path());
    }

    #[tokio::test]
    async fn test_alloc_given_sunum_and_mode() {
        let f = fixture();
        let engine = engine(&f, false);
        let mut undo = UndoLog::new();
        let a = engine
            .alloc(&f.db, 3, Some(0x2a), 7, 10, &mut undo)
            .await
            .unwrap();
        assert_eq!(a.sunum, 0x2a);
        let mode = std::fs::metadata(&a.sudir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o775);

        let conn = f.db.lock().unwrap();
        let (status, group): (i64, i64) = conn
            .query_row(
                "SELECT status, group_id FROM sum_partn_alloc WHERE ds_index = 42",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, PA_STATUS_PROVISIONAL);
        assert_eq!(group, 7);
    }

    #[tokio::test]
    async fn test_multi_set_maps_group() {
        let f = fixture();
        let engine = AllocEngine::new(
            f.probe.clone(),
            AllocEngineConfig {
                multi_partition_sets: true,
                tape_enabled: false,
                probe_timeout: Duration::from_millis(200),
                chmown_helper: None,
            },
        );
        let mut undo = UndoLog::new();
        // group 7 maps to set 1, which has no partitions
        let err = engine.alloc(&f.db, 1, None, 7, 10, &mut undo).await.unwrap_err();
        assert!(matches!(err, SumsError::NoSpace(_)));
        // unmapped group falls back to set 0
        assert!(engine.alloc(&f.db, 1, None, 99, 10, &mut undo).await.is_ok());
    }

    #[tokio::test]
    async fn test_put_records_tree_size() {
        let f = fixture();
        let engine = engine(&f, false);
        let mut undo = UndoLog::new();
        let a = engine.alloc(&f.db, 1, None, 0, 1000, &mut undo).await.unwrap();
        std::fs::write(a.sudir.join("a.fits"), vec![0u8; 300]).unwrap();
        std::fs::create_dir(a.sudir.join("sub")).unwrap();
        std::fs::write(a.sudir.join("sub/b.fits"), vec![0u8; 45]).unwrap();
        std::os::unix::fs::symlink("/etc/passwd", a.sudir.join("link")).unwrap();

        let entries = vec![SuDirEntry {
            sunum: a.sunum,
            path: a.sudir.clone(),
        }];
        engine
            .put(
                &f.db,
                &entries,
                PutBatch {
                    session_id: 1,
                    username: "tester",
                    series: "hmi.M_45s",
                    retention: -5,
                    archive_type: ArchiveType::TemporaryArchive,
                },
                &mut undo,
            )
            .await
            .unwrap();
        assert_eq!(undo.len(), 2);

        let conn = f.db.lock().unwrap();
        let info = &store_db::fetch_infos(&conn, &[a.sunum]).unwrap()[0];
        assert_eq!(info.bytes, HexId(345));
        assert_eq!(info.pa_status, PA_STATUS_DELETE_PENDING);
        assert_eq!(info.pa_substatus, PA_SUBSTATUS_NOARCHIVE);
        assert_eq!(info.owning_series, "hmi.M_45s");
        assert_eq!(info.username, "tester");
        let expected = effective_after_days(Local::now(), 5).unwrap();
        assert_eq!(&info.effective_date[..8], &expected[..8]);
    }

    #[tokio::test]
    async fn test_put_rejects_unregistered_parent() {
        let f = fixture();
        let engine = engine(&f, true);
        let other = f.root.path().join("elsewhere/D1");
        std::fs::create_dir_all(&other).unwrap();
        let err = engine
            .put(
                &f.db,
                &[SuDirEntry {
                    sunum: 1,
                    path: other,
                }],
                PutBatch {
                    session_id: 1,
                    username: "tester",
                    series: "s",
                    retention: 2,
                    archive_type: ArchiveType::PermanentArchive,
                },
                &mut UndoLog::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SumsError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_out_of_range_requests_are_rejected() {
        let f = fixture();
        let engine = engine(&f, false);
        let mut undo = UndoLog::new();
        let err = engine
            .alloc(&f.db, 1, None, 0, u64::MAX, &mut undo)
            .await
            .unwrap_err();
        assert!(matches!(err, SumsError::BadRequest(_)));
        assert!(undo.is_empty());

        let a = engine.alloc(&f.db, 1, None, 0, 10, &mut undo).await.unwrap();
        let err = engine
            .put(
                &f.db,
                &[SuDirEntry {
                    sunum: a.sunum,
                    path: a.sudir.clone(),
                }],
                PutBatch {
                    session_id: 1,
                    username: "tester",
                    series: "s",
                    retention: 1_000_000_000_000,
                    archive_type: ArchiveType::TemporaryArchive,
                },
                &mut undo,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SumsError::BadRequest(_)));
        assert_eq!(undo.len(), 1);
        let conn = f.db.lock().unwrap();
        assert!(conn.is_autocommit());
        assert_eq!(store_db::fetch_infos(&conn, &[a.sunum]).unwrap()[0], SuInfo::placeholder(a.sunum));
    }

    #[tokio::test]
    async fn test_unwind_reverts_alloc_and_put() {
        let f = fixture();
        let engine = engine(&f, false);
        let mut undo = UndoLog::new();
        let a = engine.alloc(&f.db, 4, None, 0, 10, &mut undo).await.unwrap();
        engine
            .put(
                &f.db,
                &[SuDirEntry {
                    sunum: a.sunum,
                    path: a.sudir.clone(),
                }],
                PutBatch {
                    session_id: 4,
                    username: "tester",
                    series: "s",
                    retention: 3,
                    archive_type: ArchiveType::TemporaryArchive,
                },
                &mut undo,
            )
            .await
            .unwrap();

        assert_eq!(undo.unwind(&f.db).await, 0);
        assert!(!a.sudir.exists());
        let conn = f.db.lock().unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM sum_partn_alloc", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 0);
        assert_eq!(store_db::fetch_infos(&conn, &[a.sunum]).unwrap()[0], SuInfo::placeholder(a.sunum));
    }

    #[test]
    fn test_dir_size_of_file_and_missing() {
        let root = TempDir::new().unwrap();
        let file = root.path().join("x");
        std::fs::write(&file, b"abc").unwrap();
        assert_eq!(dir_size(&file).unwrap(), 3);
        assert!(dir_size(&root.path().join("missing")).is_err());
    }
}
