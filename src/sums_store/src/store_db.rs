use crate::dates::timestamp_now;
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use sums_lib::*;

pub const SEQ_DS_INDEX: &str = "sum_ds_index_seq";
pub const SEQ_SESSION: &str = "sum_seq";

/// A pooled connection. Statements run on it from `spawn_blocking`.
pub type DbHandle = Arc<Mutex<Connection>>;

/// Runs `f` against the pooled connection on the blocking pool.
pub async fn with_conn<T, F>(handle: &DbHandle, f: F) -> SumsResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> SumsResult<T> + Send + 'static,
{
    let conn = handle.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = match conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("SumsStoreDb: connection lock poisoned, resetting connection");
                conn.clear_poison();
                let guard = poisoned.into_inner();
                reset(&guard)?;
                guard
            }
        };
        f(&mut guard)
    })
    .await
    .map_err(|e| SumsError::Internal(format!("db task join failed: {}", e)))?
}

fn db_err(what: &str, e: rusqlite::Error) -> SumsError {
    warn!("SumsStoreDb: {} failed! {}", what, e);
    SumsError::DbError(e.to_string())
}

pub fn open_connection(db_path: &Path) -> SumsResult<Connection> {
    debug!("SumsStoreDb: open db path: {}", db_path.display());
    let conn = Connection::open(db_path).map_err(|e| db_err("open db", e))?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA busy_timeout=5000;",
    )
    .map_err(|e| db_err("set pragmas", e))?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> SumsResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sum_main (
            ds_index INTEGER PRIMARY KEY,
            online_loc TEXT NOT NULL,
            online_status TEXT NOT NULL DEFAULT 'N',
            archive_status TEXT NOT NULL DEFAULT 'N',
            offsite_ack TEXT NOT NULL DEFAULT 'N',
            history_comment TEXT NOT NULL DEFAULT '',
            owning_series TEXT NOT NULL DEFAULT '',
            storage_group INTEGER NOT NULL DEFAULT 0,
            storage_set INTEGER NOT NULL DEFAULT 0,
            bytes INTEGER NOT NULL DEFAULT 0,
            create_sumid INTEGER NOT NULL DEFAULT 0,
            creat_date TEXT NOT NULL,
            access_date TEXT NOT NULL,
            username TEXT NOT NULL DEFAULT '',
            arch_tape TEXT,
            arch_tape_fn INTEGER,
            arch_tape_date TEXT,
            safe_tape TEXT,
            safe_tape_fn INTEGER,
            safe_tape_date TEXT
        );
        CREATE INDEX IF NOT EXISTS sum_main_series_idx ON sum_main (owning_series);

        CREATE TABLE IF NOT EXISTS sum_partn_alloc (
            wd TEXT NOT NULL,
            sumid INTEGER NOT NULL,
            status INTEGER NOT NULL,
            bytes INTEGER NOT NULL DEFAULT 0,
            effective_date TEXT NOT NULL,
            archive_substatus INTEGER NOT NULL DEFAULT 0,
            group_id INTEGER NOT NULL DEFAULT 0,
            safe_id INTEGER NOT NULL DEFAULT 0,
            ds_index INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS sum_partn_alloc_ds_idx ON sum_partn_alloc (ds_index);
        CREATE INDEX IF NOT EXISTS sum_partn_alloc_wd_idx ON sum_partn_alloc (wd);
        CREATE INDEX IF NOT EXISTS sum_partn_alloc_sumid_idx ON sum_partn_alloc (sumid);

        CREATE TABLE IF NOT EXISTS sum_partn_avail (
            partn_name TEXT PRIMARY KEY,
            pds_set_num INTEGER NOT NULL DEFAULT 0,
            pds_set_prime INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS sum_arch_group (
            group_id INTEGER PRIMARY KEY,
            sum_set INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS sum_open (
            sumid INTEGER PRIMARY KEY,
            open_date TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sum_seq (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );",
    )
    .map_err(|e| db_err("create tables", e))
}

/// Inserts configured partitions and groups that are not present yet.
/// Existing rows keep their values, including a steward-disabled set number.
pub fn seed(conn: &Connection, partitions: &[PartitionSeed], groups: &[GroupSeed]) -> SumsResult<()> {
    for partition in partitions {
        let name = normalize_partition(&partition.name);
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO sum_partn_avail (partn_name, pds_set_num, pds_set_prime)
                 VALUES (?1, ?2, ?2)",
                params![name, partition.set],
            )
            .map_err(|e| db_err("seed partition", e))?;
        if inserted > 0 {
            info!("SumsStoreDb: seeded partition {} in set {}", name, partition.set);
        }
    }
    for group in groups {
        conn.execute(
            "INSERT OR IGNORE INTO sum_arch_group (group_id, sum_set) VALUES (?1, ?2)",
            params![group.group_id, group.set],
        )
        .map_err(|e| db_err("seed group", e))?;
    }
    Ok(())
}

/// Owner of the database location. Creates the schema once, then hands out
/// connections for the pools and the steward.
#[derive(Debug, Clone)]
pub struct SumsStoreDb {
    db_path: PathBuf,
}

impl SumsStoreDb {
    /// Creates the tables and applies the configured seeds.
    pub fn init(config: &SumsConfig) -> SumsResult<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SumsError::IoError(format!(
                        "create db dir {} failed: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        let conn = open_connection(&config.db_path)?;
        init_schema(&conn)?;
        seed(&conn, &config.partitions, &config.groups)?;
        drop(conn);
        Ok(Self {
            db_path: config.db_path.clone(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn connect(&self) -> SumsResult<Connection> {
        open_connection(&self.db_path)
    }

    pub fn connect_handle(&self) -> SumsResult<DbHandle> {
        Ok(Arc::new(Mutex::new(self.connect()?)))
    }
}

pub fn normalize_partition(name: &str) -> String {
    let trimmed = name.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Draws the next value of a durable sequence in a single statement.
pub fn next_seq(conn: &Connection, name: &str) -> SumsResult<u64> {
    conn.execute(
        "INSERT OR IGNORE INTO sum_seq (name, value) VALUES (?1, 0)",
        params![name],
    )
    .map_err(|e| db_err("init sequence", e))?;
    let value: i64 = conn
        .query_row(
            "UPDATE sum_seq SET value = value + 1 WHERE name = ?1 RETURNING value",
            params![name],
            |row| row.get(0),
        )
        .map_err(|e| db_err("advance sequence", e))?;
    Ok(value as u64)
}

/// Runs `f` in its own `BEGIN IMMEDIATE` transaction. The write lock is held
/// for this statement batch only, never across client round-trips.
pub fn write_tx<T, F>(conn: &mut Connection, f: F) -> SumsResult<T>
where
    F: FnOnce(&Connection) -> SumsResult<T>,
{
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| db_err("begin immediate", e))?;
    let value = f(&tx)?;
    tx.commit().map_err(|e| db_err("commit", e))?;
    Ok(value)
}

/// Ends a transaction left open by an interrupted task, so a pooled handle
/// always starts out in autocommit.
pub fn reset(conn: &Connection) -> SumsResult<()> {
    if conn.is_autocommit() {
        return Ok(());
    }
    warn!("SumsStoreDb: rolling back a transaction left open on a pooled connection");
    conn.execute_batch("ROLLBACK")
        .map_err(|e| db_err("rollback", e))
}

pub fn ping(conn: &Connection) -> SumsResult<()> {
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        .map_err(|e| db_err("ping", e))?;
    Ok(())
}

pub fn insert_open(conn: &Connection, session_id: u64) -> SumsResult<()> {
    conn.execute(
        "INSERT INTO sum_open (sumid, open_date) VALUES (?1, ?2)",
        params![session_id as i64, timestamp_now()],
    )
    .map_err(|e| db_err("insert sum_open", e))?;
    Ok(())
}

/// Drops the session's unfinished placement rows and its open marker.
pub fn close_session(conn: &Connection, session_id: u64) -> SumsResult<usize> {
    let removed = conn
        .execute(
            "DELETE FROM sum_partn_alloc WHERE sumid = ?1 AND status IN (?2, ?3)",
            params![session_id as i64, PA_STATUS_PROVISIONAL, PA_STATUS_UNLABELED_8],
        )
        .map_err(|e| db_err("delete session placements", e))?;
    conn.execute(
        "DELETE FROM sum_open WHERE sumid = ?1",
        params![session_id as i64],
    )
    .map_err(|e| db_err("delete sum_open", e))?;
    Ok(removed)
}

fn unique_ids(sunums: &[Sunum]) -> Vec<Sunum> {
    let mut seen = std::collections::HashSet::new();
    sunums.iter().copied().filter(|s| seen.insert(*s)).collect()
}

/// One entry per requested id, in request order. Duplicates resolve to the
/// same record and unknown ids to the placeholder.
pub fn fetch_infos(conn: &Connection, sunums: &[Sunum]) -> SumsResult<Vec<SuInfo>> {
    let mut stmt = conn
        .prepare(
            "SELECT T1.ds_index, T1.online_loc, T1.online_status, T1.archive_status,
                    T1.offsite_ack, T1.history_comment, T1.owning_series, T1.storage_group,
                    T1.bytes, T1.creat_date, T1.username,
                    COALESCE(T1.arch_tape, 'N/A'), COALESCE(T1.arch_tape_fn, 0),
                    COALESCE(T1.arch_tape_date, '1958-01-01 00:00:00'),
                    COALESCE(T1.safe_tape, 'N/A'), COALESCE(T1.safe_tape_fn, 0),
                    COALESCE(T1.safe_tape_date, '1958-01-01 00:00:00'),
                    COALESCE(T2.effective_date, '195801010000'),
                    COALESCE(T2.status, 0), COALESCE(T2.archive_substatus, 0)
             FROM sum_main AS T1 LEFT OUTER JOIN sum_partn_alloc AS T2
                  ON (T1.ds_index = T2.ds_index)
             WHERE T1.ds_index = ?1
             ORDER BY CASE WHEN T2.status = 2 THEN 1 ELSE 0 END
             LIMIT 1",
        )
        .map_err(|e| db_err("prepare info", e))?;

    let mut found: HashMap<Sunum, SuInfo> = HashMap::new();
    for sunum in unique_ids(sunums) {
        let info = stmt
            .query_row(params![sunum as i64], |row| {
                Ok(SuInfo {
                    sunum: HexId(row.get::<_, i64>(0)? as u64),
                    online_loc: row.get(1)?,
                    online_status: row.get(2)?,
                    archive_status: row.get(3)?,
                    offsite_ack: row.get(4)?,
                    history_comment: row.get(5)?,
                    owning_series: row.get(6)?,
                    storage_group: row.get(7)?,
                    bytes: HexId(row.get::<_, i64>(8)? as u64),
                    creat_date: row.get(9)?,
                    username: row.get(10)?,
                    arch_tape: row.get(11)?,
                    arch_tape_fn: row.get(12)?,
                    arch_tape_date: row.get(13)?,
                    safe_tape: row.get(14)?,
                    safe_tape_fn: row.get(15)?,
                    safe_tape_date: row.get(16)?,
                    effective_date: row.get(17)?,
                    pa_status: row.get(18)?,
                    pa_substatus: row.get(19)?,
                })
            })
            .optional()
            .map_err(|e| db_err("query info", e))?;
        if let Some(info) = info {
            found.insert(sunum, info);
        }
    }

    Ok(sunums
        .iter()
        .map(|s| {
            found
                .get(s)
                .cloned()
                .unwrap_or_else(|| SuInfo::placeholder(*s))
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuLocation {
    pub online_loc: String,
    pub online: bool,
    pub archived: bool,
}

/// Online location and flags for each known id.
pub fn fetch_locations(
    conn: &Connection,
    sunums: &[Sunum],
) -> SumsResult<HashMap<Sunum, SuLocation>> {
    let mut stmt = conn
        .prepare(
            "SELECT online_loc, online_status, archive_status FROM sum_main WHERE ds_index = ?1",
        )
        .map_err(|e| db_err("prepare get", e))?;
    let mut found = HashMap::new();
    for sunum in unique_ids(sunums) {
        let loc = stmt
            .query_row(params![sunum as i64], |row| {
                let online: String = row.get(1)?;
                let archived: String = row.get(2)?;
                Ok(SuLocation {
                    online_loc: row.get(0)?,
                    online: online.eq_ignore_ascii_case("Y"),
                    archived: archived.eq_ignore_ascii_case("Y"),
                })
            })
            .optional()
            .map_err(|e| db_err("query get", e))?;
        if let Some(loc) = loc {
            found.insert(sunum, loc);
        }
    }
    Ok(found)
}

/// Prior values of a placement row that a request changed in place. Restored
/// when the session rolls back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementSnapshot {
    pub rowid: i64,
    pub status: i64,
    pub effective_date: String,
    pub substatus: i64,
}

fn read_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlacementSnapshot> {
    Ok(PlacementSnapshot {
        rowid: row.get(0)?,
        status: row.get(1)?,
        effective_date: row.get(2)?,
        substatus: row.get(3)?,
    })
}

/// Extends the TTL of the placement rows of `sunums`. With `extend_only`
/// the new date never moves an existing TTL backwards. Status-8 rows are left
/// alone. Returns the rows as they were before.
pub fn touch(
    conn: &Connection,
    sunums: &[Sunum],
    effective_date: &str,
    extend_only: bool,
) -> SumsResult<Vec<PlacementSnapshot>> {
    let sql = if extend_only {
        "UPDATE sum_partn_alloc SET effective_date = MAX(effective_date, ?1)
         WHERE ds_index = ?2 AND status != ?3"
    } else {
        "UPDATE sum_partn_alloc SET effective_date = ?1
         WHERE ds_index = ?2 AND status != ?3"
    };
    let mut before = conn
        .prepare(
            "SELECT rowid, status, effective_date, archive_substatus FROM sum_partn_alloc
             WHERE ds_index = ?1 AND status != ?2",
        )
        .map_err(|e| db_err("prepare touch snapshot", e))?;
    let mut stmt = conn.prepare(sql).map_err(|e| db_err("prepare touch", e))?;
    let mut access = conn
        .prepare("UPDATE sum_main SET access_date = ?1 WHERE ds_index = ?2")
        .map_err(|e| db_err("prepare access touch", e))?;
    let now = timestamp_now();
    let mut snapshots = Vec::new();
    for sunum in unique_ids(sunums) {
        let rows = before
            .query_map(params![sunum as i64, PA_STATUS_UNLABELED_8], read_snapshot)
            .map_err(|e| db_err("query touch snapshot", e))?;
        for row in rows {
            snapshots.push(row.map_err(|e| db_err("read touch snapshot", e))?);
        }
        stmt.execute(params![effective_date, sunum as i64, PA_STATUS_UNLABELED_8])
            .map_err(|e| db_err("touch placement", e))?;
        access
            .execute(params![now, sunum as i64])
            .map_err(|e| db_err("touch access date", e))?;
    }
    Ok(snapshots)
}

/// Puts placement rows back to the values in `snapshots`.
pub fn restore_placements(conn: &Connection, snapshots: &[PlacementSnapshot]) -> SumsResult<()> {
    let mut stmt = conn
        .prepare(
            "UPDATE sum_partn_alloc SET status = ?1, effective_date = ?2, archive_substatus = ?3
             WHERE rowid = ?4",
        )
        .map_err(|e| db_err("prepare restore placement", e))?;
    for snap in snapshots {
        stmt.execute(params![snap.status, snap.effective_date, snap.substatus, snap.rowid])
            .map_err(|e| db_err("restore placement", e))?;
    }
    Ok(())
}

/// Group-to-set mapping, `None` when the group is not registered.
pub fn group_set(conn: &Connection, group_id: i64) -> SumsResult<Option<i64>> {
    conn.query_row(
        "SELECT sum_set FROM sum_arch_group WHERE group_id = ?1",
        params![group_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| db_err("query group set", e))
}

pub fn enabled_partitions(conn: &Connection, set: i64) -> SumsResult<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT partn_name FROM sum_partn_avail WHERE pds_set_num = ?1 ORDER BY partn_name")
        .map_err(|e| db_err("prepare partitions", e))?;
    let rows = stmt
        .query_map(params![set], |row| row.get::<_, String>(0))
        .map_err(|e| db_err("query partitions", e))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| db_err("read partitions", e))
}

/// Every registered partition, disabled ones included.
pub fn all_partitions(conn: &Connection) -> SumsResult<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT partn_name FROM sum_partn_avail ORDER BY partn_name")
        .map_err(|e| db_err("prepare partitions", e))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| db_err("query partitions", e))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| db_err("read partitions", e))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRow {
    pub name: String,
    pub set_num: i64,
    pub set_prime: i64,
}

/// Partitions whose permanent set is in `sets`, or all partitions when `sets`
/// is empty.
pub fn monitored_partitions(conn: &Connection, sets: &[i64]) -> SumsResult<Vec<PartitionRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT partn_name, pds_set_num, pds_set_prime FROM sum_partn_avail ORDER BY partn_name",
        )
        .map_err(|e| db_err("prepare monitored partitions", e))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(PartitionRow {
                name: row.get(0)?,
                set_num: row.get(1)?,
                set_prime: row.get(2)?,
            })
        })
        .map_err(|e| db_err("query monitored partitions", e))?;
    let rows = rows
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| db_err("read monitored partitions", e))?;
    Ok(rows
        .into_iter()
        .filter(|p| sets.is_empty() || sets.contains(&p.set_prime))
        .collect())
}

pub fn disable_partition(conn: &Connection, partition: &str) -> SumsResult<()> {
    conn.execute(
        "UPDATE sum_partn_avail SET pds_set_num = -1 WHERE partn_name = ?1",
        params![partition],
    )
    .map_err(|e| db_err("disable partition", e))?;
    Ok(())
}

/// Byte counts are stored as signed 64-bit integers.
pub fn column_bytes(numbytes: u64) -> SumsResult<i64> {
    i64::try_from(numbytes)
        .map_err(|_| SumsError::BadRequest(format!("numbytes {} is out of range", numbytes)))
}

pub fn insert_provisional(
    conn: &Connection,
    wd: &str,
    session_id: u64,
    numbytes: u64,
    effective_date: &str,
    group_id: i64,
    sunum: Sunum,
) -> SumsResult<()> {
    let bytes = column_bytes(numbytes)?;
    conn.execute(
        "INSERT INTO sum_partn_alloc
            (wd, sumid, status, bytes, effective_date, archive_substatus, group_id, safe_id, ds_index)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, 0, ?7)",
        params![
            wd,
            session_id as i64,
            PA_STATUS_PROVISIONAL,
            bytes,
            effective_date,
            group_id,
            sunum as i64
        ],
    )
    .map_err(|e| db_err("insert provisional placement", e))?;
    Ok(())
}

/// Everything put writes for one SU.
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub sunum: Sunum,
    pub wd: String,
    pub bytes: u64,
    pub series: String,
    pub session_id: u64,
    pub username: String,
    pub status: i64,
    pub substatus: i64,
    pub effective_date: String,
}

fn commit_one(conn: &Connection, record: &CommitRecord) -> SumsResult<()> {
    let group_id: i64 = conn
        .query_row(
            "SELECT group_id FROM sum_partn_alloc WHERE wd = ?1 LIMIT 1",
            params![record.wd],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| db_err("resolve storage group", e))?
        .unwrap_or(0);
    let storage_set = group_set(conn, group_id)?.unwrap_or(0);
    let now = timestamp_now();

    conn.execute(
        "INSERT INTO sum_main
            (ds_index, online_loc, online_status, archive_status, offsite_ack, history_comment,
             owning_series, storage_group, storage_set, bytes, create_sumid, creat_date,
             access_date, username)
         VALUES (?1, ?2, 'Y', 'N', 'N', '', ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?9)",
        params![
            record.sunum as i64,
            record.wd,
            record.series,
            group_id,
            storage_set,
            record.bytes as i64,
            record.session_id as i64,
            now,
            record.username
        ],
    )
    .map_err(|e| db_err("insert sum_main", e))?;

    conn.execute(
        "DELETE FROM sum_partn_alloc WHERE ds_index = ?1 AND status IN (?2, ?3)",
        params![
            record.sunum as i64,
            PA_STATUS_PROVISIONAL,
            PA_STATUS_DELETE_PENDING
        ],
    )
    .map_err(|e| db_err("delete stale placements", e))?;

    conn.execute(
        "INSERT INTO sum_partn_alloc
            (wd, sumid, status, bytes, effective_date, archive_substatus, group_id, safe_id, ds_index)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)",
        params![
            record.wd,
            record.session_id as i64,
            record.status,
            record.bytes as i64,
            record.effective_date,
            record.substatus,
            group_id,
            record.sunum as i64
        ],
    )
    .map_err(|e| db_err("insert final placement", e))?;
    Ok(())
}

/// Writes all records or none of them, in one write transaction.
pub fn commit_batch(conn: &mut Connection, records: &[CommitRecord]) -> SumsResult<()> {
    write_tx(conn, |tx| {
        for record in records {
            if let Err(err) = commit_one(tx, record) {
                warn!(
                    "SumsStoreDb: put of {} failed, reverting batch of {}",
                    HexId(record.sunum),
                    records.len()
                );
                return Err(err);
            }
        }
        Ok(())
    })
}

/// Undoes a committed put of `sunum` by `session_id`. Rows other sessions
/// wrote for the same SU are kept.
pub fn revert_put(conn: &Connection, sunum: Sunum, session_id: u64) -> SumsResult<()> {
    let removed = conn
        .execute(
            "DELETE FROM sum_main WHERE ds_index = ?1 AND create_sumid = ?2",
            params![sunum as i64, session_id as i64],
        )
        .map_err(|e| db_err("revert sum_main", e))?;
    if removed == 0 {
        return Ok(());
    }
    conn.execute(
        "DELETE FROM sum_partn_alloc WHERE ds_index = ?1 AND sumid = ?2 AND status != ?3",
        params![sunum as i64, session_id as i64, PA_STATUS_PROVISIONAL],
    )
    .map_err(|e| db_err("revert placement", e))?;
    Ok(())
}

/// Marks every placement of the series as expired and delete-pending.
/// Returns the rows as they were before.
pub fn delete_series(conn: &Connection, series: &str) -> SumsResult<Vec<PlacementSnapshot>> {
    let selector = "ds_index IN (SELECT ds_index FROM sum_main WHERE lower(owning_series) = lower(?1))";
    let snapshots = {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT rowid, status, effective_date, archive_substatus FROM sum_partn_alloc
                 WHERE {}",
                selector
            ))
            .map_err(|e| db_err("prepare series snapshot", e))?;
        let rows = stmt
            .query_map(params![series], read_snapshot)
            .map_err(|e| db_err("query series snapshot", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| db_err("read series snapshot", e))?
    };
    conn.execute(
        &format!(
            "UPDATE sum_partn_alloc SET status = ?2, effective_date = ?3, archive_substatus = ?4
             WHERE {}",
            selector
        ),
        params![
            series,
            PA_STATUS_DELETE_PENDING,
            EXPIRED_EFFECTIVE_DATE,
            PA_SUBSTATUS_TEMPORARY_ARCHIVE
        ],
    )
    .map_err(|e| db_err("delete series", e))?;
    Ok(snapshots)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredSu {
    pub sunum: Sunum,
    pub wd: String,
}

/// Expired delete-pending placements below `partition`, ordered by `wd`.
pub fn expired_candidates(
    conn: &Connection,
    partition: &str,
    now: &str,
    limit: usize,
) -> SumsResult<Vec<ExpiredSu>> {
    // exact, case-sensitive prefix: `_` and `%` in paths are literal
    let prefix = format!("{}/", normalize_partition(partition));
    let prefix_len = prefix.chars().count() as i64;
    let mut stmt = conn
        .prepare(
            "SELECT ds_index, wd FROM sum_partn_alloc
             WHERE effective_date < ?1 AND status = ?2 AND substr(wd, 1, ?3) = ?4
             ORDER BY wd LIMIT ?5",
        )
        .map_err(|e| db_err("prepare candidates", e))?;
    let rows = stmt
        .query_map(
            params![now, PA_STATUS_DELETE_PENDING, prefix_len, prefix, limit as i64],
            |row| {
                Ok(ExpiredSu {
                    sunum: row.get::<_, i64>(0)? as u64,
                    wd: row.get(1)?,
                })
            },
        )
        .map_err(|e| db_err("query candidates", e))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| db_err("read candidates", e))
}

/// Deletes placement and directory records of reclaimed SUs in one
/// transaction.
pub fn delete_reclaimed(conn: &mut Connection, reclaimed: &[ExpiredSu]) -> SumsResult<()> {
    write_tx(conn, |tx| {
        for su in reclaimed {
            tx.execute(
                "DELETE FROM sum_partn_alloc WHERE ds_index = ?1 AND wd = ?2 AND status = ?3",
                params![su.sunum as i64, su.wd, PA_STATUS_DELETE_PENDING],
            )
            .map_err(|e| db_err("delete reclaimed placement", e))?;
            tx.execute(
                "DELETE FROM sum_main WHERE ds_index = ?1",
                params![su.sunum as i64],
            )
            .map_err(|e| db_err("delete reclaimed sum_main", e))?;
        }
        Ok(())
    })
}
