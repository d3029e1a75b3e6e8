use crate::config::Config;
use crate::engine::{Engine, EngineClosed, EngineHandle, ReplySender};
use crate::error::StartupError;
use crate::persistence::journal::{self, FsyncPolicy, JournalHandle, JournalWriter};
use crate::protocol::{FrameReader, GREETING, ProtocolError, REJECTION, Request, Response};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long an arriving connection may wait for a free admission slot.
const ADMISSION_GRACE: Duration = Duration::from_millis(1);

/// A bound, not yet serving, cache server.
pub struct Server {
    listener: TcpListener,
    engine: Engine,
    engine_handle: EngineHandle,
    journal: Option<(JournalHandle, JoinHandle<()>)>,
    journal_path: Option<PathBuf>,
    gate: Arc<Semaphore>,
    connection_timeout: Duration,
}

impl Server {
    /// Restore state if asked to, open the journal and bind the listener.
    pub async fn bind(config: &Config) -> Result<Server, StartupError> {
        let (mut engine, engine_handle) = Engine::new();

        let journal_dir = Path::new(&config.journal_dir);
        let journal_path = if config.journal_enabled || config.restore_from_journal {
            Some(journal::resolve_path(
                journal_dir,
                &config.journal_filename,
                config.restore_from_journal,
            )?)
        } else {
            None
        };

        if config.restore_from_journal
            && let Some(path) = &journal_path
        {
            info!("Restoring from journal {}", path.display());
            let count = journal::replay(path, &mut engine)?;
            info!("Journal replayed {count} records, {} keys live", engine.store().len());
        }

        let journal = match (&journal_path, config.journal_enabled) {
            (Some(path), true) => {
                let policy = FsyncPolicy::from_str(&config.journal_fsync);
                let writer = JournalWriter::open(path, policy)?;
                info!("Journal enabled: {}", path.display());
                Some(journal::spawn_writer(writer))
            }
            _ => None,
        };

        let addr = config.listen_addr();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => return Err(StartupError::Bind { addr, source }),
        };

        Ok(Server {
            listener,
            engine,
            engine_handle,
            journal,
            journal_path,
            gate: Arc::new(Semaphore::new(config.max_connections)),
            connection_timeout: config.connection_timeout,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The journal file this run reads from or appends to, if any.
    pub fn journal_path(&self) -> Option<&Path> {
        self.journal_path.as_deref()
    }

    /// Serve until `shutdown` is cancelled. Connection handlers stop with it, and
    /// the journal is synced before this returns.
    pub async fn run(self, shutdown: CancellationToken) {
        let Server {
            listener,
            engine,
            engine_handle,
            journal,
            gate,
            connection_timeout,
            ..
        } = self;

        if let Ok(addr) = listener.local_addr() {
            info!("Fcache server listening on {addr}");
        }
        let engine_task = engine.spawn(shutdown.clone());
        let (journal_handle, journal_task) = match journal {
            Some((handle, task)) => (Some(handle), Some(task)),
            None => (None, None),
        };
        let mut connections = tokio::task::JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Accept failed: {e}");
                            continue;
                        }
                    };

                    let Some(permit) = admit(&gate).await else {
                        debug!("Rejecting {peer}: connection limit reached");
                        tokio::spawn(reject(stream));
                        continue;
                    };
                    debug!("New connection from {peer}");

                    let engine = engine_handle.clone();
                    let journal = journal_handle.clone();
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        serve_admitted(stream, peer, permit, connection_timeout, engine, journal, shutdown).await;
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.cancelled() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        while connections.join_next().await.is_some() {}
        drop(journal_handle);
        if let Some(task) = journal_task {
            let _ = task.await;
        }
        let _ = engine_task.await;
    }
}

/// Bind and serve with `config` until `shutdown` is cancelled.
pub async fn run_server(config: Config, shutdown: CancellationToken) -> Result<(), StartupError> {
    let server = Server::bind(&config).await?;
    server.run(shutdown).await;
    Ok(())
}

async fn admit(gate: &Arc<Semaphore>) -> Option<OwnedSemaphorePermit> {
    match tokio::time::timeout(ADMISSION_GRACE, gate.clone().acquire_owned()).await {
        Ok(Ok(permit)) => Some(permit),
        _ => None,
    }
}

async fn reject(mut stream: TcpStream) {
    if let Err(e) = stream.write_all(REJECTION).await {
        debug!("Failed to send rejection: {e}");
    }
    let _ = stream.shutdown().await;
}

async fn serve_admitted(
    stream: TcpStream,
    peer: SocketAddr,
    _permit: OwnedSemaphorePermit,
    lifetime: Duration,
    engine: EngineHandle,
    journal: Option<JournalHandle>,
    shutdown: CancellationToken,
) {
    // The lifetime cap covers the greeting too; when it elapses the stream is
    // dropped, which closes the socket.
    match tokio::time::timeout(lifetime, handle_connection(stream, engine, journal, shutdown)).await
    {
        Ok(Ok(())) => debug!("Connection closed: {peer}"),
        Ok(Err(e)) => debug!("Connection error from {peer}: {e}"),
        Err(_) => debug!("Connection lifetime elapsed: {peer}"),
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    engine: EngineHandle,
    journal: Option<JournalHandle>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    stream.write_all(GREETING).await?;

    let (reader, mut writer) = stream.into_split();
    let mut frames = FrameReader::new(reader);
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Response>();
    // Dropped once reading stops; replies keep draining until the engine has
    // answered everything already queued for this connection.
    let mut reply_tx = Some(reply_tx);
    let mut protocol_error: Option<ProtocolError> = None;

    loop {
        tokio::select! {
            frame = frames.next_request(), if reply_tx.is_some() => match frame {
                Ok(Some(req)) => {
                    if let Some(tx) = &reply_tx
                        && forward(req, tx, &engine, journal.as_ref()).await.is_err()
                    {
                        return Ok(());
                    }
                }
                Ok(None) => {
                    reply_tx = None;
                }
                Err(e) => {
                    debug!("Protocol error: {e}");
                    protocol_error = Some(e);
                    reply_tx = None;
                }
            },
            reply = reply_rx.recv() => match reply {
                Some(response) => writer.write_all(&response.serialize()).await?,
                None => break,
            },
            _ = shutdown.cancelled() => return Ok(()),
        }
    }

    if let Some(e) = protocol_error {
        writer
            .write_all(&Response::Error(e.to_string()).serialize())
            .await?;
    }
    writer.shutdown().await?;
    Ok(())
}

/// Queue `req` on the engine, then journal it if it mutates. A request that is
/// still waiting for queue space when the connection is cut never reaches the
/// journal. Its reply cannot be written before the record is queued.
async fn forward(
    req: Request,
    reply_tx: &ReplySender,
    engine: &EngineHandle,
    journal: Option<&JournalHandle>,
) -> Result<(), EngineClosed> {
    let journaled = match journal {
        Some(journal) if req.method.is_mutating() => Some((journal, req.clone())),
        _ => None,
    };
    engine.submit(reply_tx.clone(), req).await?;
    if let Some((journal, req)) = journaled {
        journal.submit(&req);
    }
    Ok(())
}
