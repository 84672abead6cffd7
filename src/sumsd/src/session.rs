use crate::handlers;
use crate::pool::PoolGuard;
use crate::sumsd::ServerContext;
use crate::tape::TapeReads;
use log::{debug, info, warn};
use std::net::SocketAddr;
use sums_lib::wire::{read_json, write_json};
use sums_lib::*;
use sums_store::store_db::{self, with_conn, DbHandle};
use sums_store::UndoLog;
use tokio::net::TcpStream;

/// An open session: one pooled connection plus the compensations for every
/// change its requests committed. Each request commits on its own, so no
/// write lock is held between round-trips.
pub struct Session {
    pub id: u64,
    pub client: ClientInfo,
    pub db: PoolGuard<DbHandle>,
    pub undo: UndoLog,
    pub tape_reads: TapeReads,
    pub failed: bool,
    pub rollback_requested: bool,
    pub closed: bool,
}

impl Session {
    /// Takes a connection from the pool and registers the session. A
    /// transaction left open on the pooled connection is rolled back first.
    pub async fn open(ctx: &ServerContext, client: ClientInfo) -> SumsResult<Self> {
        let db = ctx.db_pool.acquire().await;
        let handle = (*db).clone();
        let id = with_conn(&handle, |conn| {
            store_db::reset(conn)?;
            store_db::write_tx(conn, |tx| {
                let id = store_db::next_seq(tx, store_db::SEQ_SESSION)?;
                store_db::insert_open(tx, id)?;
                Ok(id)
            })
        })
        .await?;

        info!(
            "SumsSession[{}]: opened for {} (pid {})",
            HexId(id),
            client.user,
            client.pid
        );
        Ok(Self {
            id,
            client,
            db,
            undo: UndoLog::new(),
            tape_reads: TapeReads::default(),
            failed: false,
            rollback_requested: false,
            closed: false,
        })
    }

    pub fn handle(&self) -> DbHandle {
        (*self.db).clone()
    }

    fn should_commit(&self) -> bool {
        self.closed && !self.failed && !self.rollback_requested
    }

    /// Ends the session. A session closed cleanly keeps what its requests
    /// committed; anything else runs its compensations newest first and drops
    /// its open marker.
    pub async fn finish(mut self) {
        let sid = HexId(self.id);
        if self.should_commit() {
            self.undo.discard();
            info!("SumsSession[{}]: committed", sid);
            return;
        }

        let handle = self.handle();
        let failed = self.undo.unwind(&handle).await;
        if failed > 0 {
            warn!("SumsSession[{}]: {} undo actions failed", sid, failed);
        }
        let id = self.id;
        let result = with_conn(&handle, move |conn| {
            store_db::reset(conn)?;
            store_db::write_tx(conn, |tx| store_db::close_session(tx, id))
        })
        .await;
        match result {
            Ok(_) => info!("SumsSession[{}]: rolled back", sid),
            Err(e) => warn!("SumsSession[{}]: rollback failed! {}", sid, e),
        }
    }
}

/// Per-connection protocol state.
pub struct ClientConnection {
    peer: SocketAddr,
    client: ClientInfo,
    session: Option<Session>,
}

enum Flow {
    Continue,
    End,
}

impl ClientConnection {
    async fn dispatch(&mut self, ctx: &ServerContext, request: SumsRequest) -> (SumsResult<SumsResponse>, Flow) {
        if let SumsRequest::Open = request {
            if let Some(session) = &self.session {
                return (
                    Err(SumsError::SessionOpened(format!(
                        "session {} is already open",
                        HexId(session.id)
                    ))),
                    Flow::Continue,
                );
            }
            return match Session::open(ctx, self.client.clone()).await {
                Ok(session) => {
                    let id = session.id;
                    self.session = Some(session);
                    (Ok(SumsResponse::Opened { session_id: id }), Flow::Continue)
                }
                Err(e) => (Err(e), Flow::Continue),
            };
        }

        let session = match self.session.as_mut() {
            Some(session) => session,
            None => {
                return (
                    Err(SumsError::SessionClosed(format!(
                        "{} requires an open session",
                        request.reqtype()
                    ))),
                    Flow::Continue,
                )
            }
        };
        if let Some(id) = request.session_id() {
            if id != session.id {
                session.failed = true;
                return (
                    Err(SumsError::BadRequest(format!(
                        "session id {} does not match open session {}",
                        HexId(id),
                        HexId(session.id)
                    ))),
                    Flow::Continue,
                );
            }
        }

        let flow = if matches!(request, SumsRequest::Close { .. }) {
            Flow::End
        } else {
            Flow::Continue
        };
        let result = handlers::handle(ctx, session, request).await;
        if let Err(e) = &result {
            warn!("SumsSession[{}]: request failed: {}", HexId(session.id), e);
            session.failed = true;
        }
        (result, flow)
    }
}

async fn read_client_info(stream: &mut TcpStream) -> SumsResult<ClientInfo> {
    match read_json(stream).await {
        Ok(value) => ClientInfo::parse(value),
        Err(SumsError::BadJson(msg)) => Err(SumsError::BadClientInfo(msg)),
        Err(e) => Err(e),
    }
}

/// Runs one client connection to completion: identity frame, then requests
/// strictly in order until close, a fatal transport error or shutdown.
pub async fn serve_connection(ctx: &ServerContext, mut stream: TcpStream, peer: SocketAddr) {
    let mut shutdown = ctx.shutdown.clone();
    if *shutdown.borrow() {
        return;
    }
    let identity = tokio::select! {
        identity = read_client_info(&mut stream) => identity,
        _ = shutdown.changed() => {
            info!("SumsSession: shutting down before {} identified itself", peer);
            return;
        }
    };
    let client = match identity {
        Ok(client) => client,
        Err(e) => {
            warn!("SumsSession: client info from {} rejected: {}", peer, e);
            if !e.is_connection_fatal() {
                let _ = write_json(&mut stream, &error_response(&e)).await;
            }
            return;
        }
    };
    debug!("SumsSession: {} identified as {} (pid {})", peer, client.user, client.pid);

    let mut conn = ClientConnection {
        peer,
        client,
        session: None,
    };
    let sunum_list_max = ctx.config.sunum_list_max;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let frame = tokio::select! {
            frame = read_json(&mut stream) => frame,
            _ = shutdown.changed() => {
                info!("SumsSession: shutting down connection from {}", conn.peer);
                break;
            }
        };

        let request = match frame {
            Err(e) if e.is_connection_fatal() => {
                debug!("SumsSession: connection from {} ended: {}", conn.peer, e);
                break;
            }
            Err(e) => Err(e),
            Ok(value) => SumsRequest::parse(value, sunum_list_max),
        };

        let (result, flow) = match request {
            Ok(request) => {
                debug!("SumsSession: {} -> {}", conn.peer, request.reqtype());
                conn.dispatch(ctx, request).await
            }
            Err(e) => {
                if let Some(session) = conn.session.as_mut() {
                    session.failed = true;
                }
                (Err(e), Flow::Continue)
            }
        };

        // close is answered only after the session has ended
        let result = match (result, &flow) {
            (Ok(response), Flow::End) => {
                if let Some(session) = conn.session.take() {
                    session.finish().await;
                }
                Ok(response)
            }
            (result, _) => result,
        };
        let response = match result {
            Ok(response) => response.to_value(),
            Err(e) => error_response(&e),
        };
        if let Err(e) = write_json(&mut stream, &response).await {
            warn!("SumsSession: send to {} failed: {}", conn.peer, e);
            if let Some(session) = conn.session.as_mut() {
                session.failed = true;
            }
            break;
        }
        if let Flow::End = flow {
            break;
        }
    }

    if let Some(session) = conn.session.take() {
        session.finish().await;
    }
}
