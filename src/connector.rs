//! Named listeners with independent accept loops
//!
//! Each connector owns one TCP listener (optionally TLS) and a task running its
//! accept loop. Removing a connector signals the loop, waits for it to exit and
//! only then returns, so the port is free for reuse.

use crate::config::ConnectorConfig;
use crate::error::{GatewayBody, GatewayError, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use rustls::server::ResolvesServerCert;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Per-connection details handed to the request handler
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connector: Arc<str>,
    pub peer_addr: SocketAddr,
    pub is_tls: bool,
}

/// Serves requests arriving on a connector
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, req: Request<Incoming>, conn: ConnectionInfo) -> Response<GatewayBody>;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Request<Incoming>, ConnectionInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<GatewayBody>> + Send + 'static,
{
    async fn handle(&self, req: Request<Incoming>, conn: ConnectionInfo) -> Response<GatewayBody> {
        (self)(req, conn).await
    }
}

/// Why an accept loop stopped
#[derive(Debug, Error)]
pub enum ServeError {
    /// Listener closed on request; the normal way a loop ends
    #[error("listener closed")]
    ListenerClosed,

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

/// HTTP/1.1 settings applied to every accepted connection
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub header_read_timeout: Duration,
    pub max_buf_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            header_read_timeout: Duration::from_secs(10),
            max_buf_size: 1 << 20,
        }
    }
}

struct Connector {
    config: ConnectorConfig,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<ServeError>,
}

/// Point-in-time view of a live connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorSnapshot {
    pub name: String,
    pub config: ConnectorConfig,
    pub local_addr: SocketAddr,
}

pub struct ConnectorManager {
    connectors: DashMap<String, Connector>,
    settings: ConnectionSettings,
    done_tx: watch::Sender<bool>,
}

impl Default for ConnectorManager {
    fn default() -> Self {
        Self::new(ConnectionSettings::default())
    }
}

impl ConnectorManager {
    pub fn new(settings: ConnectionSettings) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            connectors: DashMap::new(),
            settings,
            done_tx,
        }
    }

    /// Bind a listener and start serving it, returning the bound address
    pub async fn add_connector(
        &self,
        name: &str,
        config: &ConnectorConfig,
        handler: Arc<dyn RequestHandler>,
        resolver: Arc<dyn ResolvesServerCert>,
    ) -> Result<SocketAddr> {
        if self.connectors.contains_key(name) {
            return Err(GatewayError::Conflict(format!(
                "connector '{}' already exists",
                name
            )));
        }
        config.validate(name).map_err(GatewayError::Validation)?;
        let bind_addr = config.socket_addr().map_err(GatewayError::Validation)?;

        let tls_acceptor = if config.tls {
            Some(build_tls_acceptor(resolver).map_err(|e| {
                GatewayError::transport(name, io::Error::new(io::ErrorKind::InvalidInput, e))
            })?)
        } else {
            None
        };

        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| GatewayError::transport(name, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| GatewayError::transport(name, e))?;

        match self.connectors.entry(name.to_string()) {
            Entry::Occupied(_) => Err(GatewayError::Conflict(format!(
                "connector '{}' already exists",
                name
            ))),
            Entry::Vacant(slot) => {
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                let task = tokio::spawn(accept_loop(
                    Arc::from(name),
                    listener,
                    tls_acceptor,
                    handler,
                    self.settings,
                    shutdown_rx,
                ));
                slot.insert(Connector {
                    config: config.clone(),
                    local_addr,
                    shutdown_tx,
                    task,
                });
                info!(
                    connector = name,
                    addr = %local_addr,
                    tls = config.tls,
                    "Connector listening"
                );
                Ok(local_addr)
            }
        }
    }

    /// Close the listener and wait for its accept loop to finish.
    ///
    /// The record is removed even when the loop ended with an error.
    pub async fn remove_connector(&self, name: &str) -> Result<()> {
        let (_, connector) = self
            .connectors
            .remove(name)
            .ok_or_else(|| GatewayError::NotFound(format!("connector '{}'", name)))?;

        let _ = connector.shutdown_tx.send(true);
        let outcome = match connector.task.await {
            Ok(ServeError::ListenerClosed) => Ok(()),
            Ok(ServeError::Accept(e)) => Err(GatewayError::transport(name, e)),
            Err(join_error) => Err(GatewayError::transport(
                name,
                io::Error::new(io::ErrorKind::Other, join_error.to_string()),
            )),
        };

        match &outcome {
            Ok(()) => info!(connector = name, addr = %connector.local_addr, "Connector removed"),
            Err(e) => warn!(connector = name, error = %e, "Connector stopped with error"),
        }
        outcome
    }

    /// Remove every connector, then signal completion.
    ///
    /// All connectors are removed even if some fail; the first error is returned.
    pub async fn shutdown(&self) -> Result<()> {
        let mut first_error = None;
        for name in self.names() {
            if let Err(e) = self.remove_connector(&name).await {
                error!(connector = %name, error = %e, "Failed to remove connector during shutdown");
                first_error.get_or_insert(e);
            }
        }
        self.done_tx.send_replace(true);
        info!("All connectors stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Wait until `shutdown` has run
    pub async fn wait_for_completion(&self) {
        let mut done_rx = self.done_tx.subscribe();
        let _ = done_rx.wait_for(|done| *done).await;
    }

    pub fn is_shut_down(&self) -> bool {
        *self.done_tx.borrow()
    }

    /// Live connector names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connectors.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.connectors.contains_key(name)
    }

    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.connectors.get(name).map(|c| c.local_addr)
    }

    pub fn connectors(&self) -> Vec<ConnectorSnapshot> {
        let mut list: Vec<ConnectorSnapshot> = self
            .connectors
            .iter()
            .map(|c| ConnectorSnapshot {
                name: c.key().clone(),
                config: c.config.clone(),
                local_addr: c.local_addr,
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }
}

fn build_tls_acceptor(resolver: Arc<dyn ResolvesServerCert>) -> std::result::Result<TlsAcceptor, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// What the accept loop does after a failed `accept`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptRecovery {
    /// The failure concerned one connection; accept again right away
    Retry,
    /// Resource exhaustion and the like; accept again after a pause
    Backoff,
    /// The listener itself is unusable
    Stop,
}

fn accept_recovery(e: &io::Error) -> AcceptRecovery {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => AcceptRecovery::Retry,
        io::ErrorKind::InvalidInput => AcceptRecovery::Stop,
        // EMFILE, ENFILE, ENOBUFS, ENOMEM and anything unclassified
        _ => AcceptRecovery::Backoff,
    }
}

/// Doubling delay starting at 5ms, capped at 1s
fn next_backoff(previous: Option<Duration>) -> Duration {
    match previous {
        None => ACCEPT_BACKOFF_START,
        Some(delay) => (delay * 2).min(ACCEPT_BACKOFF_MAX),
    }
}

/// Source of inbound TCP connections for an accept loop
#[async_trait]
trait Listener: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

async fn accept_loop<L: Listener>(
    name: Arc<str>,
    listener: L,
    tls_acceptor: Option<TlsAcceptor>,
    handler: Arc<dyn RequestHandler>,
    settings: ConnectionSettings,
    mut shutdown_rx: watch::Receiver<bool>,
) -> ServeError {
    let mut backoff = None;
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                debug!(connector = %name, "Accept loop closing listener");
                return ServeError::ListenerClosed;
            }
            result = Listener::accept(&listener) => {
                match result {
                    Ok((stream, peer_addr)) => {
                        backoff = None;
                        let info = ConnectionInfo {
                            connector: Arc::clone(&name),
                            peer_addr,
                            is_tls: tls_acceptor.is_some(),
                        };
                        let handler = Arc::clone(&handler);
                        let tls_acceptor = tls_acceptor.clone();

                        tokio::spawn(async move {
                            let result = match tls_acceptor {
                                Some(acceptor) => match acceptor.accept(stream).await {
                                    Ok(tls_stream) => serve_connection(tls_stream, info.clone(), handler, settings).await,
                                    Err(e) => {
                                        debug!(connector = %info.connector, addr = %peer_addr, error = %e, "TLS handshake failed");
                                        return;
                                    }
                                },
                                None => serve_connection(stream, info.clone(), handler, settings).await,
                            };
                            if let Err(e) = result {
                                debug!(connector = %info.connector, addr = %peer_addr, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => match accept_recovery(&e) {
                        AcceptRecovery::Retry => {
                            debug!(connector = %name, error = %e, "Transient accept error");
                        }
                        AcceptRecovery::Backoff => {
                            let delay = next_backoff(backoff);
                            backoff = Some(delay);
                            warn!(
                                connector = %name,
                                error = %e,
                                retry_in_ms = delay.as_millis() as u64,
                                "Failed to accept connection"
                            );
                            tokio::select! {
                                biased;

                                _ = shutdown_rx.changed() => {
                                    debug!(connector = %name, "Accept loop closing listener");
                                    return ServeError::ListenerClosed;
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        AcceptRecovery::Stop => {
                            error!(connector = %name, error = %e, "Listener failed, connector stopped");
                            return ServeError::Accept(e);
                        }
                    },
                }
            }
        }
    }
}

async fn serve_connection<S>(
    stream: S,
    info: ConnectionInfo,
    handler: Arc<dyn RequestHandler>,
    settings: ConnectionSettings,
) -> std::result::Result<(), hyper::Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        let info = info.clone();
        async move { Ok::<_, Infallible>(handler.handle(req, info).await) }
    });

    http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(settings.header_read_timeout)
        .max_buf_size(settings.max_buf_size)
        .serve_connection(io, service)
        .await
}
