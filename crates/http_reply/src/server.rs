use core::fmt;
use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{self, TcpListener, TcpSocket},
    sync::broadcast,
    task::{JoinError, JoinSet},
};

use crate::{
    activity::{ActivityEvent, ActivityLog},
    config::{
        DEFAULT_BACKLOG, DEFAULT_HOST, DEFAULT_MAX_REQUEST_BYTES, DEFAULT_PORT,
        DEFAULT_READ_TIMEOUT_MS,
    },
    connection::{Connection, ConnectionContext, ConnectionOutcome},
    sequencer::{DispatchTrigger, Sequencer},
};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
const STOP_CHANNEL_CAPACITY: usize = 16;

// -- Errors

#[derive(Debug)]
pub enum ServerError {
    Bind { addr: String, source: io::Error },
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind { source, .. } => Some(source),
        }
    }
}

impl core::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind { addr, source } => write!(f, "unable to listen on {addr}: {source}"),
        }
    }
}

/// Signals that stop the accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// A single pass handed out its last case.
    Exhausted,
    /// Stop accepting, let open connections finish.
    Graceful,
    /// Stop accepting and drop every open connection.
    Hard,
}

/// `ShutdownHandle` lets an operator stop a running server.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(broadcast::Sender<Shutdown>);

impl ShutdownHandle {
    pub fn graceful(&self) {
        let _ = self.0.send(Shutdown::Graceful);
    }

    pub fn hard(&self) {
        let _ = self.0.send(Shutdown::Hard);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub read_timeout: Duration,
    pub close_delay: Duration,
    pub trigger: DispatchTrigger,
    pub max_request_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: String::from(DEFAULT_HOST),
            port: DEFAULT_PORT,
            backlog: DEFAULT_BACKLOG,
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            close_delay: Duration::ZERO,
            trigger: DispatchTrigger::default(),
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

impl fmt::Display for ServerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Totals of a finished server run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerSummary {
    pub accepted: u64,
    pub dispatched: u64,
    pub refused: u64,
    pub aborted: u64,
    pub cancelled: u64,
}

impl ServerSummary {
    fn tally(&mut self, joined: Result<ConnectionOutcome, JoinError>) {
        match joined {
            Ok(ConnectionOutcome::Closed { dispatched }) => self.dispatched += dispatched as u64,
            Ok(ConnectionOutcome::Refused) => self.refused += 1,
            Ok(ConnectionOutcome::Aborted { dispatched }) => {
                self.dispatched += dispatched as u64;
                self.aborted += 1;
            }
            Err(err) if err.is_cancelled() => self.cancelled += 1,
            Err(err) => {
                reply_trace::error!("Connection task failed: {}", err);
                self.aborted += 1;
            }
        }
    }
}

impl fmt::Display for ServerSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} connections, {} test cases dispatched, {} refused, {} aborted, {} cancelled",
            self.accepted, self.dispatched, self.refused, self.aborted, self.cancelled
        )
    }
}

async fn listen(settings: &ServerSettings) -> Result<TcpListener, ServerError> {
    let addr_str = settings.to_string();
    let bind_failure = |source: io::Error| ServerError::Bind {
        addr: addr_str.clone(),
        source,
    };

    let addr: SocketAddr = net::lookup_host((settings.host.as_str(), settings.port))
        .await
        .map_err(bind_failure)?
        .next()
        .ok_or_else(|| {
            bind_failure(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "host resolved to no address",
            ))
        })?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_failure)?;

    socket.set_reuseaddr(true).map_err(bind_failure)?;
    socket.bind(addr).map_err(bind_failure)?;
    socket.listen(settings.backlog).map_err(bind_failure)
}

/// Binds the listening socket. Nothing is accepted until
/// [`BoundServer::serve`] runs.
pub async fn bind(
    settings: ServerSettings,
    sequencer: Arc<Sequencer>,
    activity: ActivityLog,
) -> Result<BoundServer, ServerError> {
    let listener = listen(&settings).await?;
    let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
        addr: settings.to_string(),
        source,
    })?;

    reply_trace::info!("Server started on {}", local_addr);

    // subscribed here so signals sent before serve() first runs are kept
    let (stop, stop_signal) = broadcast::channel::<Shutdown>(STOP_CHANNEL_CAPACITY);
    let context = Arc::new(ConnectionContext {
        sequencer,
        activity,
        settings,
        stop,
    });

    Ok(BoundServer {
        listener,
        local_addr,
        context,
        stop_signal,
    })
}

/// `BoundServer` is a listening socket plus everything needed to serve it.
#[derive(Debug)]
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    context: Arc<ConnectionContext>,
    stop_signal: broadcast::Receiver<Shutdown>,
}

// -- Getters

impl BoundServer {
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.context.stop.clone())
    }

    #[must_use]
    pub fn sequencer(&self) -> Arc<Sequencer> {
        Arc::clone(&self.context.sequencer)
    }
}

// -- Serving

impl BoundServer {
    /// Runs the serve loop on its own task.
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<ServerSummary> {
        tokio::spawn(self.serve())
    }

    /// Accepts connections until a stop signal arrives, then waits for the
    /// open connections to finish on their own (or aborts them on a hard
    /// stop) and reports the totals.
    pub async fn serve(self) -> ServerSummary {
        let Self {
            listener,
            local_addr,
            context,
            mut stop_signal,
        } = self;

        let mut summary = ServerSummary::default();
        let mut connections = JoinSet::new();
        let mut connection_id = 0u64;

        if context.sequencer.is_exhausted() {
            reply_trace::warn!("No test cases left to serve, not accepting connections");
            return summary;
        }

        reply_trace::info!("Waiting for connections on {}", local_addr);

        let mut hard_stop = loop {
            tokio::select! {
                // stop signals win over new connections
                biased;

                signal = stop_signal.recv() => {
                    let signal = signal.unwrap_or(Shutdown::Graceful);
                    reply_trace::info!("Stopped accepting connections: {:?}", signal);
                    break signal == Shutdown::Hard;
                }

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    summary.tally(joined);
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connection_id += 1;
                        summary.accepted += 1;

                        let id = connection_id;
                        let ctx = Arc::clone(&context);
                        connections.spawn(async move {
                            Connection::new(id, peer, stream, &ctx.settings).run(&ctx).await
                        });
                    }
                    Err(err) => {
                        context.activity.record(ActivityEvent::Error {
                            connection: None,
                            peer: None,
                            message: format!("Failed to accept connection: {err}"),
                        });
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        };

        drop(listener);

        loop {
            if hard_stop {
                connections.abort_all();
            }

            tokio::select! {
                Some(joined) = connections.join_next() => summary.tally(joined),

                signal = stop_signal.recv(), if !hard_stop && !connections.is_empty() => {
                    hard_stop = matches!(signal, Ok(Shutdown::Hard));
                }

                else => break,
            }
        }

        reply_trace::info!("Server finished: {}", summary);
        summary
    }
}
