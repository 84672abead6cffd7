use crate::session::Session;
use crate::sumsd::ServerContext;
use crate::tape::DeferredGet;
use chrono::Local;
use log::{debug, info};
use sums_lib::*;
use sums_store::dates::touch_effective_date;
use sums_store::store_db::{self, with_conn, DbHandle};
use sums_store::{PutBatch, UndoAction, UndoLog};

fn ids(sus: &[HexId]) -> Vec<Sunum> {
    sus.iter().map(|s| s.value()).collect()
}

/// Runs one request against an open session. `open` is handled by the
/// connection loop before a session exists.
pub async fn handle(
    ctx: &ServerContext,
    session: &mut Session,
    request: SumsRequest,
) -> SumsResult<SumsResponse> {
    let db = session.handle();
    match request {
        SumsRequest::Open => Err(SumsError::SessionOpened(format!(
            "session {} is already open",
            HexId(session.id)
        ))),
        SumsRequest::Close { .. } => {
            let id = session.id;
            let removed = with_conn(&db, move |conn| {
                store_db::write_tx(conn, |tx| store_db::close_session(tx, id))
            })
            .await?;
            debug!(
                "SumsSession[{}]: close dropped {} unfinished placements",
                HexId(id),
                removed
            );
            session.closed = true;
            Ok(SumsResponse::Done)
        }
        SumsRequest::Rollback { .. } => {
            info!("SumsSession[{}]: rollback requested", HexId(session.id));
            session.rollback_requested = true;
            Ok(SumsResponse::Done)
        }
        SumsRequest::Info { sus, .. } => {
            let sunums = ids(&sus);
            let infos = with_conn(&db, move |conn| store_db::fetch_infos(conn, &sunums)).await?;
            Ok(SumsResponse::Info(infos))
        }
        SumsRequest::Get {
            sus,
            touch,
            retrieve,
            retention,
            ..
        } => handle_get(ctx, session, ids(&sus), touch, retrieve, retention).await,
        SumsRequest::Alloc {
            sunum,
            sugroup,
            numbytes,
            ..
        } => {
            let allocation = ctx
                .engine
                .alloc(
                    &db,
                    session.id,
                    sunum.map(|s| s.value()),
                    sugroup,
                    numbytes,
                    &mut session.undo,
                )
                .await?;
            Ok(SumsResponse::Allocated {
                sunum: allocation.sunum,
                sudir: allocation.sudir.to_string_lossy().to_string(),
            })
        }
        SumsRequest::Put {
            sudirs,
            series,
            retention,
            archivetype,
            ..
        } => {
            ctx.engine
                .put(
                    &db,
                    &sudirs,
                    PutBatch {
                        session_id: session.id,
                        username: &session.client.user,
                        series: &series,
                        retention,
                        archive_type: archivetype,
                    },
                    &mut session.undo,
                )
                .await?;
            Ok(SumsResponse::Done)
        }
        SumsRequest::DeleteSeries { series, .. } => {
            let name = series.clone();
            let snapshots = with_conn(&db, move |conn| {
                store_db::write_tx(conn, |tx| store_db::delete_series(tx, &name))
            })
            .await?;
            info!(
                "SumsSession[{}]: deleteseries {} expired {} placements",
                HexId(session.id),
                series,
                snapshots.len()
            );
            if !snapshots.is_empty() {
                session.undo.push(UndoAction::RestorePlacements(snapshots));
            }
            Ok(SumsResponse::Done)
        }
        SumsRequest::Ping { .. } => {
            with_conn(&db, |conn| store_db::ping(conn)).await?;
            Ok(SumsResponse::Done)
        }
        SumsRequest::Poll { requestid, .. } => handle_poll(ctx, session, requestid).await,
    }
}

async fn handle_get(
    ctx: &ServerContext,
    session: &mut Session,
    sunums: Vec<Sunum>,
    touch: bool,
    retrieve: bool,
    retention: i64,
) -> SumsResult<SumsResponse> {
    let db = session.handle();
    if retrieve && ctx.engine.tape_enabled() {
        let lookup = sunums.clone();
        let locations =
            with_conn(&db, move |conn| store_db::fetch_locations(conn, &lookup)).await?;
        let mut offline: Vec<Sunum> = Vec::new();
        for sunum in &sunums {
            if let Some(loc) = locations.get(sunum) {
                if !loc.online && loc.archived && !offline.contains(sunum) {
                    offline.push(*sunum);
                }
            }
        }
        if !offline.is_empty() {
            let request_id = ctx.tape.request_read(&offline).await?;
            info!(
                "SumsSession[{}]: tape read {} for {} storage units",
                HexId(session.id),
                request_id,
                offline.len()
            );
            session.tape_reads.insert(
                request_id.clone(),
                DeferredGet {
                    sunums,
                    touch,
                    retention,
                },
            );
            return Ok(SumsResponse::TapeRead { request_id });
        }
    }

    let paths = complete_get(&db, &mut session.undo, sunums, touch, retention).await?;
    Ok(SumsResponse::Paths(paths))
}

/// Applies the optional TTL touch and resolves one path per requested id, in
/// request order. `retention` only matters when touching.
async fn complete_get(
    db: &DbHandle,
    undo: &mut UndoLog,
    sunums: Vec<Sunum>,
    touch: bool,
    retention: i64,
) -> SumsResult<Vec<SuPath>> {
    let effective_date = if touch {
        Some(touch_effective_date(Local::now(), retention)?)
    } else {
        None
    };
    let (snapshots, paths) = with_conn(db, move |conn| {
        let snapshots = match effective_date {
            Some(date) => store_db::write_tx(conn, |tx| {
                store_db::touch(tx, &sunums, &date, retention < 0)
            })?,
            None => Vec::new(),
        };
        let locations = store_db::fetch_locations(conn, &sunums)?;
        let paths = sunums
            .iter()
            .map(|sunum| SuPath {
                sunum: HexId(*sunum),
                path: locations
                    .get(sunum)
                    .filter(|loc| loc.online)
                    .map(|loc| loc.online_loc.clone()),
            })
            .collect::<Vec<_>>();
        Ok((snapshots, paths))
    })
    .await?;
    if !snapshots.is_empty() {
        undo.push(UndoAction::RestorePlacements(snapshots));
    }
    Ok(paths)
}

async fn handle_poll(
    ctx: &ServerContext,
    session: &mut Session,
    request_id: String,
) -> SumsResult<SumsResponse> {
    if session.tape_reads.get(&request_id).is_none() {
        return Err(SumsError::BadRequest(format!(
            "unknown tape read request {}",
            request_id
        )));
    }
    if !ctx.tape.is_complete(&request_id).await? {
        return Ok(SumsResponse::PollPending { request_id });
    }

    let deferred = session
        .tape_reads
        .take(&request_id)
        .ok_or_else(|| SumsError::Internal(format!("tape read {} vanished", request_id)))?;
    let db = session.handle();
    let paths = complete_get(
        &db,
        &mut session.undo,
        deferred.sunums,
        deferred.touch,
        deferred.retention,
    )
    .await?;
    Ok(SumsResponse::PollDone(paths))
}
