use crate::pool::Pool;
use crate::session::serve_connection;
use crate::tape::{TapeService, UnimplementedTape};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sums_lib::*;
use sums_store::{AllocEngine, AllocEngineConfig, DbHandle, StatvfsProbe, SumsStoreDb, UsageProbe};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Bound on each `accept()` so the loop notices shutdown promptly.
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SumsdRunOptions {
    pub config_path: PathBuf,
}

/// Shared by every connection task.
pub struct ServerContext {
    pub config: DaemonConfig,
    pub engine: AllocEngine,
    pub tape: Arc<dyn TapeService>,
    pub db_pool: Arc<Pool<DbHandle>>,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

pub struct SumsServer {
    ctx: Arc<ServerContext>,
    worker_pool: Arc<Pool<usize>>,
    listener: TcpListener,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl SumsServer {
    pub async fn bind(
        config: &SumsConfig,
        probe: Arc<dyn UsageProbe>,
        tape: Arc<dyn TapeService>,
    ) -> SumsResult<Self> {
        let daemon = config.daemon.clone();
        let store = SumsStoreDb::init(config)?;

        let mut handles = Vec::with_capacity(daemon.max_db_connections);
        for _ in 0..daemon.max_db_connections {
            handles.push(store.connect_handle()?);
        }
        if daemon.max_db_connections < daemon.max_workers {
            warn!(
                "sumsd: {} db connections for {} workers, sessions beyond that wait for a connection",
                daemon.max_db_connections, daemon.max_workers
            );
        }
        let db_pool = Pool::new("db", handles);
        let worker_pool = Pool::new("worker", (0..daemon.max_workers).collect());

        let listener = TcpListener::bind(&daemon.listen_addr).await.map_err(|e| {
            SumsError::IoError(format!("bind {} failed: {}", daemon.listen_addr, e))
        })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = AllocEngine::new(probe, AllocEngineConfig::from(&daemon));
        let ctx = Arc::new(ServerContext {
            config: daemon,
            engine,
            tape,
            db_pool,
            shutdown: shutdown_rx,
        });

        Ok(Self {
            ctx,
            worker_pool,
            listener,
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }

    pub fn local_addr(&self) -> SumsResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Accepts connections until shutdown, then waits for the sessions to
    /// finish and closes the pooled connections.
    pub async fn run(self) -> SumsResult<()> {
        let SumsServer {
            ctx,
            worker_pool,
            listener,
            shutdown_tx,
        } = self;
        let mut shutdown = ctx.shutdown.clone();
        let mut sessions = JoinSet::new();
        info!("sumsd: listening on {}", listener.local_addr()?);

        loop {
            if *shutdown.borrow() {
                break;
            }
            let slot = tokio::select! {
                slot = worker_pool.acquire() => slot,
                _ = shutdown.changed() => break,
            };

            let (stream, peer) = match tokio::time::timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                Err(_) => continue,
                Ok(Err(e)) => {
                    warn!("sumsd: accept failed: {}", e);
                    continue;
                }
                Ok(Ok(accepted)) => accepted,
            };
            info!("sumsd: accepted connection from {} (worker {})", peer, *slot);

            let task_ctx = ctx.clone();
            sessions.spawn(async move {
                let _slot = slot;
                serve_connection(&task_ctx, stream, peer).await;
            });

            while let Some(joined) = sessions.try_join_next() {
                if let Err(e) = joined {
                    warn!("sumsd: connection task failed: {}", e);
                }
            }
        }

        info!("sumsd: shutting down, waiting for {} connections", sessions.len());
        drop(listener);
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                warn!("sumsd: connection task failed: {}", e);
            }
        }

        close_db_pool(&ctx);
        drop(shutdown_tx);
        info!("sumsd: stopped");
        Ok(())
    }
}

fn close_db_pool(ctx: &ServerContext) {
    for handle in ctx.db_pool.drain() {
        match Arc::try_unwrap(handle) {
            Ok(conn) => {
                let conn = match conn.into_inner() {
                    Ok(conn) => conn,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Err((_, e)) = conn.close() {
                    warn!("sumsd: close db connection failed: {}", e);
                }
            }
            Err(_) => debug!("sumsd: db connection still shared at shutdown"),
        }
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
                warn!("sumsd: install SIGTERM handler failed: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

pub fn run_sumsd(options: SumsdRunOptions) -> SumsResult<()> {
    let config = SumsConfig::load(&options.config_path)?;
    let runtime = Runtime::new().map_err(|e| SumsError::Internal(e.to_string()))?;
    runtime.block_on(async move {
        let tape: Arc<dyn TapeService> = Arc::new(UnimplementedTape);
        if config.daemon.tape_enabled {
            warn!("sumsd: tape enabled without a tape integration, tape reads will fail");
        }
        let server = SumsServer::bind(&config, Arc::new(StatvfsProbe), tape).await?;
        let handle = server.shutdown_handle();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("sumsd: signal received, shutting down");
            handle.shutdown();
        });
        server.run().await.map_err(|e| {
            error!("sumsd: server failed: {}", e);
            e
        })
    })
}
