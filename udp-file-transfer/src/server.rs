//! Rendezvous dispatcher and bounded worker pool.
//!
//! ```text
//!  clients ──REQ──▶ rendezvous socket ──▶ dispatcher ──Job──▶ [queue] ──▶ worker 0..N
//!                                             │                               │
//!                        ERROR("server busy") ◀── queue full          fresh socket per job
//! ```
//!
//! The dispatcher never runs a transfer itself.  It decodes requests,
//! validates them against the storage directory and queues a [`Job`]; the
//! decision (accept or reject) travels with the job so the worker can answer
//! from its own port.  An accepted upload reserves its staging file before
//! the worker answers, so a name that cannot be stored is refused during the
//! handshake rather than discovered mid-transfer.
//!
//! A fixed number of workers pull jobs, so at most `workers` transfers run
//! at once and at most `queue_capacity` wait.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::{ProtocolConfig, ServerConfig};
use crate::connection::{Connection, TransferError};
use crate::handshake::{Handshake, HandshakeError, Reply, Request};
use crate::packet::Packet;
use crate::socket::{Channel, Socket, SocketError};
use crate::state::{ArqMode, Direction, Side};
use crate::transfer::{staging_path, Staging, Transfer};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("storage directory {}: {reason}", .path.display())]
    Storage { path: PathBuf, reason: String },
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// One queued request, already validated.
#[derive(Debug, Clone)]
pub struct Job {
    pub client: SocketAddr,
    pub direction: Direction,
    pub file_name: String,
    /// Target file inside the storage directory.
    pub path: PathBuf,
    pub reply: Reply,
}

/// What every worker needs besides the job itself.
struct WorkerContext {
    bind: SocketAddr,
    mode: ArqMode,
    verbose: bool,
    protocol: ProtocolConfig,
}

pub struct Server {
    socket: Socket,
    config: ServerConfig,
}

impl Server {
    /// Bind the rendezvous socket.  The storage directory must exist.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        if !config.storage.is_dir() {
            return Err(ServerError::Storage {
                path: config.storage.clone(),
                reason: "not a directory".into(),
            });
        }
        let socket = Socket::bind(config.bind).await?;
        log::info!(
            "listening on {} (storage {}, {}, {} workers)",
            socket.local_addr,
            config.storage.display(),
            config.mode,
            config.workers
        );
        Ok(Self { socket, config })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    /// Serve until the process is killed.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` completes.  Queued and running transfers are
    /// allowed to finish before this returns.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let Server { socket, config } = self;

        let (tx, rx) = mpsc::channel::<Job>(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let context = Arc::new(WorkerContext {
            bind: SocketAddr::new(socket.local_addr.ip(), 0),
            mode: config.mode,
            verbose: config.verbose,
            protocol: config.protocol.clone(),
        });

        let mut workers = JoinSet::new();
        for id in 0..config.workers.max(1) {
            workers.spawn(worker(id, Arc::clone(&rx), Arc::clone(&context)));
        }

        let mut dispatcher = Dispatcher {
            storage: config.storage.clone(),
            queue: tx,
            recent: HashMap::new(),
            window: config.protocol.handshake_window(),
        };

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    log::info!("shutting down; waiting for active transfers");
                    break;
                }
                received = socket.recv_from() => match received {
                    Ok((packet, from)) => dispatcher.handle(&socket, packet, from).await,
                    Err(SocketError::Packet(e)) => log::debug!("malformed datagram: {e}"),
                    Err(SocketError::Io(e)) => log::warn!("rendezvous receive failed: {e}"),
                },
            }
        }

        // Closing the queue lets each worker exit after its current job.
        drop(dispatcher);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                log::error!("worker panicked: {e}");
            }
        }
        Ok(())
    }
}

struct Dispatcher {
    storage: PathBuf,
    queue: mpsc::Sender<Job>,
    /// Clients with a request accepted within the last handshake window.
    recent: HashMap<SocketAddr, Instant>,
    window: std::time::Duration,
}

impl Dispatcher {
    async fn handle(&mut self, socket: &Socket, packet: Packet, from: SocketAddr) {
        let Some(parsed) = Request::from_packet(&packet) else {
            log::debug!("ignoring {packet} from {from} on rendezvous port");
            return;
        };

        let now = Instant::now();
        let window = self.window;
        self.recent.retain(|_, at| now.duration_since(*at) < window);
        if self.recent.contains_key(&from) {
            log::debug!("repeated request from {from}; already queued");
            return;
        }

        let job = match parsed {
            Ok(request) => {
                let reply = validate(&self.storage, &request);
                Job {
                    client: from,
                    direction: request.direction,
                    path: self.storage.join(&request.file_name),
                    file_name: request.file_name,
                    reply,
                }
            }
            Err(e) => Job {
                client: from,
                direction: Direction::from_kind(packet.kind).unwrap_or(Direction::Upload),
                file_name: packet.text(),
                path: self.storage.clone(),
                reply: Reply::Reject(e.to_string()),
            },
        };

        log::info!("{} {:?} from {from}: {:?}", job.direction, job.file_name, job.reply);
        match self.queue.try_send(job) {
            Ok(()) => {
                self.recent.insert(from, now);
            }
            Err(TrySendError::Full(_)) => {
                log::warn!("queue full; turning {from} away");
                let busy = Packet::error(0, "server busy, try again later");
                if let Err(e) = socket.send_to(&busy, from).await {
                    log::warn!("could not send busy reply to {from}: {e}");
                }
            }
            Err(TrySendError::Closed(_)) => {
                log::error!("worker pool is gone; dropping request from {from}");
            }
        }
    }
}

/// Decide whether `request` can be served from `storage`.
pub fn validate(storage: &Path, request: &Request) -> Reply {
    let path = storage.join(&request.file_name);
    match request.direction {
        Direction::Download if !path.is_file() => Reply::Reject(format!(
            "the server storage doesn't contain the file: {}",
            request.file_name
        )),
        Direction::Upload if path.exists() => Reply::Reject(format!(
            "the server storage already contains a file named: {}",
            request.file_name
        )),
        Direction::Upload if staging_path(&path).exists() => Reply::Reject(format!(
            "an upload of {} is already in progress",
            request.file_name
        )),
        _ => Reply::Accept,
    }
}

async fn worker(id: usize, queue: Arc<Mutex<mpsc::Receiver<Job>>>, context: Arc<WorkerContext>) {
    loop {
        let job = queue.lock().await.recv().await;
        let Some(job) = job else {
            log::debug!("[worker {id}] queue closed");
            return;
        };
        let client = job.client;
        match serve(job, &context).await {
            Ok(()) => {}
            Err(ServerError::Handshake(HandshakeError::Rejected(reason))) => {
                log::info!("[worker {id}] rejected {client}: {reason}");
            }
            Err(e) => log::warn!("[worker {id}] transfer with {client} failed: {e}"),
        }
    }
}

/// Run one job on a fresh socket; the socket is dropped on every path out.
async fn serve(job: Job, context: &WorkerContext) -> Result<(), ServerError> {
    let socket = Socket::bind(context.bind).await?;
    log::debug!("serving {} from {}", job.client, socket.local_addr());

    let (reply, staging) = reserve(&job).await;
    let accepted = Handshake::new(&socket, &context.protocol)
        .accept(job.client, job.direction, &reply)
        .await;
    let established = match accepted {
        Ok(established) => established,
        Err(e) => {
            if let Some(staging) = staging {
                staging.discard().await;
            }
            return Err(e.into());
        }
    };

    let connection = Connection::new(
        socket,
        established.peer,
        context.protocol.clone(),
        context.verbose,
    );
    let mut transfer = Transfer::new(connection, Side::Server, job.direction, job.path, context.mode);
    if let Some(staging) = staging {
        transfer = transfer.with_staging(staging);
    }
    let stats = transfer.run(established.first).await?;

    log::info!(
        "{} {:?} with {} done: {} bytes, {} retransmissions",
        job.direction,
        job.file_name,
        job.client,
        stats.bytes,
        stats.retransmissions
    );
    Ok(())
}

/// Reserve the staging file of an accepted upload.  A reservation that
/// fails turns the reply into a rejection.
async fn reserve(job: &Job) -> (Reply, Option<Staging>) {
    if job.reply != Reply::Accept || job.direction != Direction::Upload {
        return (job.reply.clone(), None);
    }
    match Staging::create(&job.path).await {
        Ok(staging) => (Reply::Accept, Some(staging)),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => (
            Reply::Reject(format!("an upload of {} is already in progress", job.file_name)),
            None,
        ),
        Err(e) => {
            log::warn!("cannot stage {}: {e}", job.path.display());
            (
                Reply::Reject(format!("the server cannot store the file: {}", job.file_name)),
                None,
            )
        }
    }
}
