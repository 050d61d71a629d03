//! HTTP front of the gateway: listener, optional TLS and request routing.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use edgeway_core::{NodeStatus, SharedRoster};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::access::http::{self as access_http, HttpResponse};
use crate::access::{AccessService, CredentialValidator};
use crate::access_log::AccessLogger;
use crate::config::ServerConfig;
use crate::tls::{self, TlsError};

/// Verification endpoint called by edge nodes.
pub const VERIFY_PATH: &str = "/api/verify-token";
/// Credential check endpoint.
pub const AUTH_PATH: &str = "/api/auth";
/// Access statistics endpoint.
pub const STATS_PATH: &str = "/api/auth-stats";
/// Fleet status endpoint.
pub const NODES_PATH: &str = "/api/nodes";
/// Liveness endpoint.
pub const HEALTHZ_PATH: &str = "/healthz";

/// Listener setup failures.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("cannot bind {addr}: {source}")]
    Bind {
        /// Address requested.
        addr: SocketAddr,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
    /// TLS was configured but could not be loaded.
    #[error("tls setup failed: {0}")]
    Tls(#[from] TlsError),
}

/// Request routing over the access service, access log and roster.
pub struct Gateway<V> {
    access: AccessService<V>,
    access_log: Arc<AccessLogger>,
    roster: SharedRoster,
}

impl<V: CredentialValidator> Gateway<V> {
    /// Assemble the router.
    pub fn new(
        access: AccessService<V>,
        access_log: Arc<AccessLogger>,
        roster: SharedRoster,
    ) -> Self {
        Self {
            access,
            access_log,
            roster,
        }
    }

    /// The access service behind the mint, steer, auth and verify routes.
    pub fn access(&self) -> &AccessService<V> {
        &self.access
    }

    /// Route one request.
    pub async fn handle(&self, req: Request<Incoming>, remote: SocketAddr) -> HttpResponse {
        let (parts, _body) = req.into_parts();
        let path = parts.uri.path();
        debug!(method = %parts.method, path, %remote, "request");

        if parts.method != Method::GET {
            return access_http::empty(StatusCode::NOT_FOUND);
        }

        let settings = self.access.settings();
        match path {
            VERIFY_PATH => access_http::verify(&self.access, &self.access_log, &parts, remote),
            AUTH_PATH => access_http::auth(&self.access, &self.access_log, &parts, remote).await,
            STATS_PATH => access_http::json(StatusCode::OK, &self.access_log.stats()),
            NODES_PATH => {
                let nodes: Vec<NodeStatus> =
                    self.roster.snapshot().iter().map(|n| n.status()).collect();
                access_http::json(StatusCode::OK, &nodes)
            }
            HEALTHZ_PATH => access_http::empty(StatusCode::OK),
            p if p.starts_with(&settings.mint_prefix) => {
                access_http::mint(&self.access, &self.access_log, &parts, remote).await
            }
            p if p.starts_with(&settings.steer_prefix) => {
                access_http::steer(&self.access, &self.access_log, &parts, remote).await
            }
            _ => access_http::empty(StatusCode::NOT_FOUND),
        }
    }
}

/// A bound listener, ready to serve.
pub struct Server {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    grace: Duration,
}

impl Server {
    /// Bind the configured address and load TLS material if configured.
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let tls = config.tls.as_ref().map(tls::acceptor).transpose()?;
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen,
                source,
            })?;
        Ok(Self {
            listener,
            tls,
            grace: config.shutdown_grace,
        })
    }

    /// Address actually bound, useful with port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires, then give in-flight
    /// connections up to the grace period to finish.
    pub async fn serve<V: CredentialValidator>(
        self,
        gateway: Arc<Gateway<V>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        match self.listener.local_addr() {
            Ok(addr) => info!(%addr, scheme, "gateway listening"),
            Err(e) => warn!(error = %e, "gateway listening on unknown address"),
        }

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let gateway = Arc::clone(&gateway);
                    let shutdown = shutdown.clone();
                    let tls = self.tls.clone();
                    connections.spawn(async move {
                        match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => {
                                    serve_connection(stream, remote, gateway, shutdown).await
                                }
                                Err(e) => debug!(%remote, error = %e, "tls handshake failed"),
                            },
                            None => serve_connection(stream, remote, gateway, shutdown).await,
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }

        drop(self.listener);
        info!(in_flight = connections.len(), "gateway stopped accepting");
        let drained = tokio::time::timeout(self.grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = connections.len(), "grace period elapsed, aborting connections");
            connections.abort_all();
        }
    }
}

async fn serve_connection<S, V>(
    stream: S,
    remote: SocketAddr,
    gateway: Arc<Gateway<V>>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    V: CredentialValidator,
{
    let service = service_fn(move |req| {
        let gateway = Arc::clone(&gateway);
        async move { Ok::<_, Infallible>(gateway.handle(req, remote).await) }
    });
    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        debug!(%remote, error = %e, "connection closed with error");
    }
}
