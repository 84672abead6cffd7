use crate::store_db::{self, with_conn, DbHandle, PlacementSnapshot};
use log::{info, warn};
use std::path::PathBuf;
use sums_lib::{HexId, Sunum, SumsResult};

/// Compensation for a side effect a session made before it decided whether
/// to commit. Every request commits its own rows, so rolling back a session
/// means running these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoAction {
    RemoveDir(PathBuf),
    /// Drops the rows a put wrote for an SU.
    RevertPut { sunum: Sunum, session_id: u64 },
    /// Puts placement rows changed in place back to their prior values.
    RestorePlacements(Vec<PlacementSnapshot>),
}

impl UndoAction {
    async fn run(&self, db: &DbHandle) -> SumsResult<()> {
        match self {
            UndoAction::RemoveDir(dir) => match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => {
                    info!("UndoLog: removed {}", dir.display());
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
            UndoAction::RevertPut { sunum, session_id } => {
                let (sunum, session_id) = (*sunum, *session_id);
                with_conn(db, move |conn| {
                    store_db::write_tx(conn, |tx| store_db::revert_put(tx, sunum, session_id))
                })
                .await?;
                info!("UndoLog: reverted put of {}", HexId(sunum));
                Ok(())
            }
            UndoAction::RestorePlacements(snapshots) => {
                let snapshots = snapshots.clone();
                let restored = snapshots.len();
                with_conn(db, move |conn| {
                    store_db::write_tx(conn, |tx| store_db::restore_placements(tx, &snapshots))
                })
                .await?;
                info!("UndoLog: restored {} placement rows", restored);
                Ok(())
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct UndoLog {
    actions: Vec<UndoAction>,
}

impl UndoLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: UndoAction) {
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Forgets all actions once the session commits.
    pub fn discard(&mut self) {
        self.actions.clear();
    }

    /// Runs every action, newest first. Failures are logged and do not stop
    /// the remaining actions. Returns the number of failed actions.
    pub async fn unwind(&mut self, db: &DbHandle) -> usize {
        let mut failed = 0;
        while let Some(action) = self.actions.pop() {
            if let Err(e) = action.run(db).await {
                warn!("UndoLog: {:?} failed! {}", action, e);
                failed += 1;
            }
        }
        failed
    }
}
