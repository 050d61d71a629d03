//! Startup and shutdown of a complete gateway.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use edgeway_admin::AdminError;
use edgeway_core::{Roster, SharedRoster, SweeperHandle, SystemClock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::access::{AccessError, AccessService, HttpCredentialValidator, OriginError};
use crate::access_log::{AccessLogError, AccessLogger};
use crate::config::{ConfigError, GatewayConfig};
use crate::health_check::{HealthCheckHandle, HealthChecker};
use crate::server::{Gateway, Server, ServerError};

/// Extra wait for a task to exit once its own grace period has passed.
const EXIT_SLACK: Duration = Duration::from_secs(1);

/// Anything that can stop the gateway from starting.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// Configuration did not validate.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The probe client could not be built.
    #[error("health checker: {0}")]
    HealthClient(#[source] reqwest::Error),
    /// The origin client could not be built.
    #[error("origin client: {0}")]
    Origin(#[from] OriginError),
    /// The access service could not be built.
    #[error("access service: {0}")]
    Access(#[from] AccessError),
    /// The access log could not be opened.
    #[error(transparent)]
    AccessLog(#[from] AccessLogError),
    /// The admin socket could not be bound.
    #[error(transparent)]
    Admin(#[from] AdminError),
    /// The HTTP listener could not be set up.
    #[error(transparent)]
    Server(#[from] ServerError),
}

/// A started gateway and the handles needed to stop it.
pub struct RunningGateway {
    addr: SocketAddr,
    checker: Arc<HealthChecker>,
    access_log: Arc<AccessLogger>,
    health: HealthCheckHandle,
    sweepers: Vec<SweeperHandle>,
    shutdown_tx: watch::Sender<bool>,
    server: JoinHandle<()>,
    admin: Option<(PathBuf, JoinHandle<()>)>,
    grace: Duration,
}

/// Start every component in dependency order.
pub async fn launch(config: GatewayConfig) -> Result<RunningGateway, LaunchError> {
    config.validate()?;

    let roster: SharedRoster = Arc::new(Roster::new(config.nodes.list.clone()));
    info!(nodes = roster.len(), "roster loaded");

    let checker = Arc::new(
        HealthChecker::new(
            Arc::clone(&roster),
            config.nodes.health_check,
            config.nodes.probe.clone(),
        )
        .map_err(LaunchError::HealthClient)?,
    );
    let health = checker.start();

    let access_log = Arc::new(AccessLogger::start(&config.access_log).await?);

    let validator = HttpCredentialValidator::new(&config.origin)?;
    let access = AccessService::new(
        config.access.clone(),
        validator,
        Arc::clone(&roster),
        Arc::new(SystemClock),
    )?;
    let sweepers = access.spawn_sweepers(config.access.sweep_period);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin = if config.admin.enabled {
        start_admin(&config, &checker, shutdown_rx.clone())?
    } else {
        None
    };

    let server = Server::bind(&config.server).await?;
    let addr = server
        .local_addr()
        .map_err(|source| ServerError::Bind {
            addr: config.server.listen,
            source,
        })?;
    let gateway = Arc::new(Gateway::new(access, Arc::clone(&access_log), roster));
    let server = tokio::spawn(server.serve(gateway, shutdown_rx));

    info!(%addr, "gateway started");
    Ok(RunningGateway {
        addr,
        checker,
        access_log,
        health,
        sweepers,
        shutdown_tx,
        server,
        admin,
        grace: config.server.shutdown_grace,
    })
}

#[cfg(unix)]
fn start_admin(
    config: &GatewayConfig,
    checker: &Arc<HealthChecker>,
    shutdown: watch::Receiver<bool>,
) -> Result<Option<(PathBuf, JoinHandle<()>)>, LaunchError> {
    use crate::health_check::CheckerControl;

    let admin = edgeway_admin::AdminServer::bind(&config.admin.socket)?;
    let path = admin.path().to_path_buf();
    let control = Arc::new(CheckerControl(Arc::clone(checker)));
    Ok(Some((path, tokio::spawn(admin.serve(control, shutdown)))))
}

#[cfg(not(unix))]
fn start_admin(
    _config: &GatewayConfig,
    _checker: &Arc<HealthChecker>,
    _shutdown: watch::Receiver<bool>,
) -> Result<Option<(PathBuf, JoinHandle<()>)>, LaunchError> {
    warn!("admin socket requires unix domain sockets, skipping");
    Ok(None)
}

impl RunningGateway {
    /// Address the HTTP listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The health checker maintaining the roster.
    pub fn checker(&self) -> &Arc<HealthChecker> {
        &self.checker
    }

    /// The access logger.
    pub fn access_log(&self) -> &Arc<AccessLogger> {
        &self.access_log
    }

    /// Path of the admin socket, when it is being served.
    pub fn admin_socket(&self) -> Option<&PathBuf> {
        self.admin.as_ref().map(|(path, _)| path)
    }

    /// Stop the listener and admin socket, then the health loop and cache
    /// sweepers, then drain the access log.
    pub async fn shutdown(self) {
        info!("shutting down gateway");
        let _ = self.shutdown_tx.send(true);

        if tokio::time::timeout(self.grace + EXIT_SLACK, self.server).await.is_err() {
            warn!("http server did not stop in time");
        }
        if let Some((_, admin)) = self.admin {
            if tokio::time::timeout(EXIT_SLACK, admin).await.is_err() {
                warn!("admin socket did not stop in time");
            }
        }

        self.health.stop().await;
        for sweeper in self.sweepers {
            sweeper.stop().await;
        }
        self.access_log.shutdown(self.grace).await;
        info!("gateway stopped");
    }
}
