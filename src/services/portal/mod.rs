//! Captive portal listener lifecycle
//!
//! At most one portal server exists at a time. `stop` only returns once the
//! server task has ended and its port can be bound again, so a restart on the
//! same port right after a stop never races the old listener.

pub mod escape;
pub mod routes;

use crate::services::{
    jobs::{JobId, SubmitError},
    network::{ScannedNetwork, Secret},
    provisioning::state::ProvisioningState,
};
use actix_server::ServerHandle;
use actix_web::{App, HttpServer, web::Data};
use log::{debug, info, warn};
use serde::Serialize;
use std::{
    net::{IpAddr, SocketAddr, TcpListener},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use trait_variant::make;

pub use routes::PortalApi;

const REBIND_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What the portal shows and forwards; implemented by the provisioning state machine
#[make(Send)]
pub trait PortalBackend: Clone + Send + Sync + 'static {
    async fn status(&self) -> PortalStatus;

    /// Networks of the most recent scan
    fn networks(&self) -> Vec<ScannedNetwork>;

    async fn submit_credentials(
        &self,
        ssid: String,
        secret: Option<Secret>,
    ) -> Result<JobId, SubmitError>;

    fn rescan(&self) -> Result<JobId, SubmitError>;

    /// Names of the saved networks
    async fn saved_networks(&self) -> anyhow::Result<Vec<String>>;

    /// Forget a saved network, `false` when it was not saved
    async fn forget_network(&self, ssid: String) -> anyhow::Result<bool>;
}

#[derive(Clone, Debug, Serialize)]
pub struct PortalStatus {
    pub state: ProvisioningState,
    pub access_point_ssid: String,
    pub connecting_to: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("portal is already running")]
    AlreadyRunning,
    #[error("failed to bind portal to {address}: {source}")]
    BindFailure {
        address: SocketAddr,
        source: std::io::Error,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

/// A started portal server
pub struct PortalServerHandle {
    bind_address: IpAddr,
    port: u16,
    local_addr: SocketAddr,
    lifecycle: Lifecycle,
    server: ServerHandle,
    task: Option<JoinHandle<std::io::Result<()>>>,
}

impl PortalServerHandle {
    pub fn bind_address(&self) -> IpAddr {
        self.bind_address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address actually bound, differs from `port` when started on port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }
}

#[derive(Clone)]
pub struct PortalManager {
    active: Arc<AtomicBool>,
    shutdown_grace: Duration,
}

impl PortalManager {
    pub fn new(shutdown_grace: Duration) -> Self {
        Self {
            active: Arc::default(),
            shutdown_grace,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Bind and start the portal server
    ///
    /// # Arguments
    /// * `bind_address` - Address to listen on
    /// * `port` - Port to listen on, 0 picks a free one
    /// * `backend` - Source of networks and status, receiver of credentials
    pub fn start<B: PortalBackend>(
        &self,
        bind_address: IpAddr,
        port: u16,
        backend: B,
    ) -> Result<PortalServerHandle, PortalError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(PortalError::AlreadyRunning);
        }

        let address = SocketAddr::new(bind_address, port);
        debug!("portal {:?}: binding {address}", Lifecycle::Starting);

        let api = PortalApi::new(backend);
        let server = HttpServer::new(move || {
            App::new()
                .app_data(Data::new(api.clone()))
                .configure(PortalApi::<B>::configure)
        })
        .workers(1)
        .shutdown_timeout(self.shutdown_grace.as_secs())
        .disable_signals()
        .bind(address);

        let server = match server {
            Ok(server) => server,
            Err(source) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(PortalError::BindFailure { address, source });
            }
        };

        let local_addr = server.addrs().first().copied().unwrap_or(address);
        let server = server.run();
        let handle = server.handle();
        let task = tokio::spawn(server);

        info!("portal listening on {local_addr}");

        Ok(PortalServerHandle {
            bind_address,
            port,
            local_addr,
            lifecycle: Lifecycle::Running,
            server: handle,
            task: Some(task),
        })
    }

    /// Gracefully stop the server and wait until its port is free again
    pub async fn stop(&self, handle: &mut PortalServerHandle) -> StopOutcome {
        if handle.lifecycle == Lifecycle::Stopped {
            return StopOutcome::AlreadyStopped;
        }

        handle.lifecycle = Lifecycle::Stopping;
        handle.server.stop(true).await;

        if let Some(task) = handle.task.take() {
            match task.await {
                Ok(Ok(())) => debug!("portal server stopped normally"),
                Ok(Err(e)) => warn!("portal server stopped with error: {e}"),
                Err(e) => warn!("portal server task failed: {e}"),
            }
        }

        self.wait_until_bindable(handle.local_addr).await;

        handle.lifecycle = Lifecycle::Stopped;
        self.active.store(false, Ordering::SeqCst);
        info!("portal on {} stopped", handle.local_addr);

        StopOutcome::Stopped
    }

    async fn wait_until_bindable(&self, address: SocketAddr) {
        let deadline = tokio::time::Instant::now() + self.shutdown_grace;

        loop {
            match TcpListener::bind(address) {
                Ok(_) => return,
                Err(e) if tokio::time::Instant::now() >= deadline => {
                    warn!("port of {address} still not bindable: {e}");
                    return;
                }
                Err(_) => tokio::time::sleep(REBIND_POLL_INTERVAL).await,
            }
        }
    }
}
