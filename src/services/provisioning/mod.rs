//! Network provisioning
//!
//! Drives the device from boot to a working client connection, falling back
//! to a self-hosted access point with the captive portal when no known
//! network is reachable. All transitions go through one FIFO lock and the
//! table in [`state::transition`].

pub mod state;

use crate::{
    config::{PortalConfig, ProvisioningConfig},
    services::{
        jobs::{
            ExclusivityGroup, GroupLease, Holder, JobCoordinator, JobId, JobState, SubmitError,
            actions::{ConnectParams, JobActions, JobRequest},
        },
        network::{Connectivity, NetworkProfile, NetworkServices, ScannedNetwork, Secret},
        portal::{PortalBackend, PortalManager, PortalServerHandle, PortalStatus},
        system_actions::CommandRunner,
    },
};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use state::{InvalidTransition, ProvisioningEvent, ProvisioningState, transition};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::sync::watch;

const LEASE_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("no wireless hardware found")]
    NoHardware,
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("network interface is in use: {0}")]
    Busy(#[source] SubmitError),
}

#[derive(Default)]
struct Attempt {
    connecting_to: Option<String>,
    last_error: Option<String>,
}

/// Resources only touched while holding the transition lock
#[derive(Default)]
struct Driver {
    portal: Option<PortalServerHandle>,
}

struct Inner<R> {
    coordinator: JobCoordinator,
    actions: JobActions<R>,
    portal: PortalManager,
    portal_config: PortalConfig,
    config: ProvisioningConfig,
    driver: tokio::sync::Mutex<Driver>,
    state_tx: watch::Sender<ProvisioningState>,
    attempt: Mutex<Attempt>,
}

/// The provisioning state machine
///
/// Clones share the same machine.
pub struct Provisioning<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for Provisioning<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: CommandRunner + Clone> Provisioning<R> {
    pub fn new(
        coordinator: JobCoordinator,
        actions: JobActions<R>,
        portal_config: PortalConfig,
        config: ProvisioningConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ProvisioningState::Idle);

        Self {
            inner: Arc::new(Inner {
                portal: PortalManager::new(portal_config.shutdown_grace),
                coordinator,
                actions,
                portal_config,
                config,
                driver: tokio::sync::Mutex::default(),
                state_tx,
                attempt: Mutex::default(),
            }),
        }
    }

    fn network(&self) -> &NetworkServices<R> {
        self.inner.actions.network()
    }

    pub fn state(&self) -> ProvisioningState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProvisioningState> {
        self.inner.state_tx.subscribe()
    }

    pub fn status(&self) -> PortalStatus {
        let attempt = self.attempt();

        PortalStatus {
            state: self.state(),
            access_point_ssid: self.network().access_point.ssid().to_string(),
            connecting_to: attempt.connecting_to.clone(),
            last_error: attempt.last_error.clone(),
        }
    }

    /// Address of the running portal listener
    pub async fn portal_address(&self) -> Option<SocketAddr> {
        let driver = self.inner.driver.lock().await;
        driver.portal.as_ref().map(PortalServerHandle::local_addr)
    }

    /// Bring the device online after boot
    ///
    /// Ends in `Connected` or, after all probe attempts failed, in
    /// `PortalActive` with the access point broadcasting.
    pub async fn ensure_connectivity(&self) -> Result<ProvisioningState> {
        let mut driver = self.inner.driver.lock().await;

        self.check(ProvisioningEvent::Start)?;
        if !self.network().prober.hardware_present().await {
            self.apply(ProvisioningEvent::Start)?;
            return Err(self.fail(&mut driver, ProvisioningError::NoHardware).await);
        }

        let lease = self.lease().await?;
        self.apply(ProvisioningEvent::Start)?;
        self.settle(&mut driver, lease).await
    }

    /// Probe again on operator request
    pub async fn recheck(&self) -> Result<ProvisioningState> {
        let mut driver = self.inner.driver.lock().await;

        self.check(ProvisioningEvent::Recheck)?;
        let lease = self.lease().await?;
        self.apply(ProvisioningEvent::Recheck)?;
        self.settle(&mut driver, lease).await
    }

    /// Look for lost connectivity while connected
    pub async fn health_check(&self) -> Result<ProvisioningState> {
        let mut driver = self.inner.driver.lock().await;

        if self.state() != ProvisioningState::Connected {
            return Ok(self.state());
        }

        match self.network().prober.current_connectivity().await {
            Ok(Connectivity::Connected { .. }) => return Ok(ProvisioningState::Connected),
            Ok(Connectivity::Disconnected) => warn!("connectivity lost"),
            Err(e) => {
                warn!("health check probe failed: {e:#}");
                return Ok(ProvisioningState::Connected);
            }
        }

        let lease = self.lease().await?;
        self.apply(ProvisioningEvent::ConnectivityLost)?;
        self.settle(&mut driver, lease).await
    }

    /// Run `health_check` every configured interval until the machine fails
    pub async fn run_health_checks(self) {
        let mut interval = tokio::time::interval(self.inner.config.health_check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            interval.tick().await;

            match self.health_check().await {
                Ok(ProvisioningState::Failed) => {
                    error!("provisioning failed, stopping health checks");
                    return;
                }
                Ok(state) => debug!("health check done in state {state}"),
                Err(e) => warn!("health check failed: {e:#}"),
            }
        }
    }

    /// Hand portal credentials to a `connect-network` job
    ///
    /// The machine moves to `Reconnecting`; the outcome of the job decides
    /// between `Connected` and a return to `PortalActive`.
    pub async fn submit_credentials(
        &self,
        ssid: String,
        secret: Option<Secret>,
    ) -> Result<JobId, SubmitError> {
        let driver = self.inner.driver.lock().await;

        if self.state() != ProvisioningState::PortalActive {
            return Err(SubmitError::InvalidRequest(format!(
                "credentials are not accepted in state {}",
                self.state()
            )));
        }
        if !self.is_acceptable(&ssid).await {
            return Err(SubmitError::InvalidRequest(format!(
                "unknown network {ssid:?}"
            )));
        }

        self.connect_from_portal(&driver, ConnectParams { ssid, secret })
    }

    /// Submit an administrative job
    ///
    /// A `connect-network` request stops the access point, so it is
    /// coordinated with the machine: while the portal is up it takes the
    /// same path as portal credentials, and during a transition it is
    /// rejected as busy.
    pub async fn submit_job(&self, request: JobRequest) -> Result<JobId, SubmitError> {
        let JobRequest::ConnectNetwork(params) = request else {
            return self.inner.actions.submit(&self.inner.coordinator, request);
        };

        let busy = SubmitError::Busy {
            group: ExclusivityGroup::Network,
        };
        let Ok(driver) = self.inner.driver.try_lock() else {
            return Err(busy);
        };

        match self.state() {
            ProvisioningState::PortalActive => self.connect_from_portal(&driver, params),
            ProvisioningState::Idle | ProvisioningState::Connected | ProvisioningState::Failed => {
                self.inner
                    .actions
                    .submit(&self.inner.coordinator, JobRequest::ConnectNetwork(params))
            }
            state => {
                debug!("connect request rejected in state {state}");
                Err(busy)
            }
        }
    }

    /// Start the connect job and follow its outcome; requires `PortalActive`
    fn connect_from_portal(
        &self,
        _driver: &Driver,
        params: ConnectParams,
    ) -> Result<JobId, SubmitError> {
        let ssid = params.ssid.clone();
        let id = self
            .inner
            .actions
            .submit(&self.inner.coordinator, JobRequest::ConnectNetwork(params))?;

        if let Err(e) = self.apply(ProvisioningEvent::CredentialsSubmitted) {
            error!("{e}");
        }
        *self.attempt() = Attempt {
            connecting_to: Some(ssid.clone()),
            last_error: None,
        };
        info!("connecting to {ssid:?} as job {id}");

        tokio::spawn(self.clone().follow_connect(id));

        Ok(id)
    }

    /// Start a scan job for the portal listing
    pub fn rescan(&self) -> Result<JobId, SubmitError> {
        self.inner
            .actions
            .submit(&self.inner.coordinator, JobRequest::ScanNetworks)
    }

    /// Release portal and access point before the process exits
    pub async fn shutdown(&self) {
        let mut driver = self.inner.driver.lock().await;
        self.teardown(&mut driver).await;
    }

    async fn is_acceptable(&self, ssid: &str) -> bool {
        if self.inner.config.accept_unmanaged_networks {
            return true;
        }

        let scanned = self
            .network()
            .scans
            .latest()
            .is_some_and(|scan| scan.networks.iter().any(|n| n.ssid == ssid));

        scanned
            || self
                .network()
                .profiles
                .contains(ssid)
                .await
                .unwrap_or_else(|e| {
                    warn!("failed to look up saved networks: {e:#}");
                    false
                })
    }

    async fn follow_connect(self, id: JobId) {
        let job = self.inner.coordinator.wait(id).await;
        let mut driver = self.inner.driver.lock().await;

        let failure = match job {
            None => Some("connection job vanished".to_string()),
            Some(job) if job.state == JobState::Succeeded => {
                match self.network().prober.current_connectivity().await {
                    Ok(Connectivity::Connected { .. }) => None,
                    Ok(Connectivity::Disconnected) => {
                        Some("connection was established but did not last".to_string())
                    }
                    Err(e) => Some(format!("{e:#}")),
                }
            }
            Some(job) => Some(match job.error {
                Some(e) => e.message,
                None if job.state == JobState::Cancelled => "connection attempt was cancelled".into(),
                None => "connection attempt failed".into(),
            }),
        };

        let connecting_to = self.attempt().connecting_to.take();

        match failure {
            None => {
                if let Err(e) = self.apply(ProvisioningEvent::ConnectSucceeded) {
                    error!("{e}");
                }
                self.teardown(&mut driver).await;
                info!("connected to {:?}", connecting_to.unwrap_or_default());
            }
            Some(reason) => {
                warn!("connecting to {connecting_to:?} failed: {reason}");
                self.attempt().last_error = Some(reason);

                if self.network().access_point.is_broadcasting() {
                    if let Err(e) = self.apply(ProvisioningEvent::ConnectFailed) {
                        error!("{e}");
                    }
                } else {
                    error!("setup network is down after failed connection attempt");
                    self.teardown(&mut driver).await;
                    if let Err(e) = self.apply(ProvisioningEvent::Fatal) {
                        error!("{e}");
                    }
                }
            }
        }
    }

    /// Probe with retries; on exhaustion fall back to access point and portal
    async fn settle(
        &self,
        driver: &mut Driver,
        lease: GroupLease,
    ) -> Result<ProvisioningState> {
        let retries = self.inner.config.probe_retries.max(1);

        for attempt in 1..=retries {
            debug!("probe attempt {attempt}/{retries}");

            if let Some(ssid) = self.probe_attempt().await {
                info!("connected to {ssid:?}");
                return self.apply(ProvisioningEvent::ProbeConnected).map_err(Into::into);
            }

            tokio::time::sleep(self.inner.config.probe_backoff).await;
        }

        warn!("no connectivity after {retries} attempts, starting setup network");
        self.apply(ProvisioningEvent::ProbeExhausted)?;

        match self.network().prober.scan().await {
            Ok(networks) => {
                info!("found {} networks before switching to setup mode", networks.len());
                self.network().scans.store(networks);
            }
            Err(e) => warn!("scan before setup mode failed: {e:#}"),
        }

        if let Err(e) = self.network().access_point.start().await {
            return Err(self.fail(driver, e).await);
        }
        drop(lease);

        let handle = match self.inner.portal.start(
            self.inner.portal_config.bind_address,
            self.inner.portal_config.port,
            self.clone(),
        ) {
            Ok(handle) => handle,
            Err(e) => return Err(self.fail(driver, e).await),
        };
        driver.portal = Some(handle);

        self.apply(ProvisioningEvent::PortalBound).map_err(Into::into)
    }

    /// One probe attempt, trying saved networks when disconnected
    async fn probe_attempt(&self) -> Option<String> {
        let network = self.network();

        match network.prober.current_connectivity().await {
            Ok(Connectivity::Connected { ssid }) => return Some(ssid),
            Ok(Connectivity::Disconnected) => {}
            Err(e) => warn!("connectivity probe failed: {e:#}"),
        }

        let profiles = network.profiles.list().await.unwrap_or_else(|e| {
            warn!("failed to read saved networks: {e:#}");
            Vec::new()
        });

        for profile in profiles {
            match self.activate_profile(&profile).await {
                Ok(()) => {
                    if let Ok(Connectivity::Connected { ssid }) =
                        network.prober.current_connectivity().await
                    {
                        return Some(ssid);
                    }
                }
                Err(e) => debug!("saved network {:?} unavailable: {e:#}", profile.ssid),
            }
        }

        None
    }

    async fn activate_profile(&self, profile: &NetworkProfile) -> Result<()> {
        let connections = &self.network().connections;
        let secret = self.network().profiles.reveal(profile)?;

        if !connections.exists(&profile.ssid).await? {
            debug!("restoring connection {:?} from saved profile", profile.ssid);
            connections.add(&profile.ssid, secret.as_ref()).await?;
        }

        connections.activate(&profile.ssid, secret.as_ref()).await
    }

    /// Stop portal and access point, attempting both
    async fn teardown(&self, driver: &mut Driver) {
        if let Some(mut handle) = driver.portal.take() {
            self.inner.portal.stop(&mut handle).await;
        }
        if let Err(e) = self.network().access_point.stop().await {
            warn!("failed to stop setup network: {e:#}");
        }
    }

    async fn fail(&self, driver: &mut Driver, cause: impl Into<anyhow::Error>) -> anyhow::Error {
        let cause = cause.into();
        error!("provisioning failed: {cause:#}");

        self.teardown(driver).await;
        self.attempt().last_error = Some(format!("{cause:#}"));
        if let Err(e) = self.apply(ProvisioningEvent::Fatal) {
            error!("{e}");
        }

        cause.context("provisioning failed")
    }

    async fn lease(&self) -> Result<GroupLease> {
        self.inner
            .coordinator
            .acquire(&[ExclusivityGroup::Network], Holder::Provisioning, LEASE_WAIT)
            .await
            .map_err(ProvisioningError::Busy)
            .context("failed to claim network interface")
    }

    fn check(&self, event: ProvisioningEvent) -> Result<(), ProvisioningError> {
        transition(self.state(), event)?;
        Ok(())
    }

    /// Apply an event; callers hold the transition lock
    fn apply(&self, event: ProvisioningEvent) -> Result<ProvisioningState, InvalidTransition> {
        let from = self.state();
        let next = transition(from, event)?;

        self.inner.state_tx.send_replace(next);
        info!("provisioning: {from} --{event:?}--> {next}");

        Ok(next)
    }

    fn attempt(&self) -> MutexGuard<'_, Attempt> {
        self.inner
            .attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R: CommandRunner + Clone> PortalBackend for Provisioning<R> {
    async fn status(&self) -> PortalStatus {
        Provisioning::status(self)
    }

    fn networks(&self) -> Vec<ScannedNetwork> {
        self.network()
            .scans
            .latest()
            .map(|scan| scan.networks)
            .unwrap_or_default()
    }

    async fn submit_credentials(
        &self,
        ssid: String,
        secret: Option<Secret>,
    ) -> Result<JobId, SubmitError> {
        Provisioning::submit_credentials(self, ssid, secret).await
    }

    fn rescan(&self) -> Result<JobId, SubmitError> {
        Provisioning::rescan(self)
    }

    async fn saved_networks(&self) -> Result<Vec<String>> {
        let profiles = self.network().profiles.list().await?;
        Ok(profiles.into_iter().map(|profile| profile.ssid).collect())
    }

    async fn forget_network(&self, ssid: String) -> Result<bool> {
        self.network().forget(&ssid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{AccessPointConfig, PathConfig, SystemConfig},
        services::{
            network::{ProfileStore, SecretSealer, Security},
            store::AtomicStore,
            system_actions::{
                MockCommandRunner,
                testing::{CommandLog, Reply, command, recording_fallback},
            },
        },
    };
    use std::{
        net::{IpAddr, Ipv4Addr, TcpListener},
        path::PathBuf,
    };

    const DEVICE_LIST: &str = "nmcli -t -f TYPE,DEVICE device";
    const DEVICE_STATUS: &str = "nmcli -t -f TYPE,STATE,CONNECTION device";
    const WIFI_LIST: &str = "nmcli -t -f SSID,SIGNAL,SECURITY device wifi list";
    const HOSTAPD: &str = "hostapd -B";
    const ACTIVATE_HOME: &str = "nmcli --wait 30 connection up id HomeNet";
    const DISCONNECTED: &str = "wifi:disconnected:\n";
    const CONNECTED_HOME: &str = "wifi:connected:HomeNet\n";

    struct Fixture {
        _dir: tempfile::TempDir,
        log: CommandLog,
        link: Arc<Mutex<String>>,
        provisioning: Provisioning<Arc<MockCommandRunner>>,
        profiles: ProfileStore,
    }

    impl Fixture {
        /// What the next device status query reports
        fn set_link(&self, status: &str) {
            *self.link.lock().unwrap() = status.to_string();
        }
    }

    /// Answer commands starting with `prefix`, recording them in `log`
    fn answer(
        runner: &mut MockCommandRunner,
        log: &CommandLog,
        prefix: &str,
        reply: impl Fn() -> Reply + Send + 'static,
    ) {
        let log = log.clone();
        runner
            .expect_run()
            .withf(command(prefix))
            .returning(move |spec| {
                log.record(&spec);
                reply().answer(spec)
            });
    }

    /// A board with wireless hardware, two networks in range and no link
    /// until HomeNet is activated
    ///
    /// Expectations already set on `runner` take precedence.
    fn fixture_with(mut runner: MockCommandRunner, probe_retries: u32, port: u16) -> Fixture {
        let log = CommandLog::default();
        let link = Arc::new(Mutex::new(DISCONNECTED.to_string()));

        answer(&mut runner, &log, DEVICE_LIST, || {
            Reply::ok("wifi:wlan0\nethernet:eth0\n")
        });
        let status = link.clone();
        answer(&mut runner, &log, DEVICE_STATUS, move || {
            Reply::ok(status.lock().unwrap().clone())
        });
        answer(&mut runner, &log, WIFI_LIST, || {
            Reply::ok("HomeNet:70:WPA2\nCoffeeShop:40:\n")
        });
        let activated = link.clone();
        answer(&mut runner, &log, ACTIVATE_HOME, move || {
            *activated.lock().unwrap() = CONNECTED_HOME.to_string();
            Reply::ok("")
        });
        recording_fallback(&mut runner, &log);
        let runner = Arc::new(runner);

        let dir = tempfile::tempdir().unwrap();
        let paths = PathConfig::in_data_dir(
            dir.path(),
            dir.path().join("https"),
            dir.path().join("ssh"),
        );
        let store = AtomicStore::open(&paths.store_dir, Duration::from_secs(1)).unwrap();
        let sealer = SecretSealer::load_or_create(&paths.device_secret_file).unwrap();
        let profiles = ProfileStore::new(store, sealer);

        let config = ProvisioningConfig {
            probe_retries,
            probe_backoff: Duration::ZERO,
            health_check_interval: Duration::from_secs(30),
            accept_unmanaged_networks: false,
            scan_settle: Duration::ZERO,
        };
        let network = NetworkServices::new(
            runner.clone(),
            &AccessPointConfig {
                interface: "wlan0".into(),
                ssid: "ArrivalBoard-Setup".into(),
                address: "192.168.4.1/24".into(),
                hostapd_config: PathBuf::from("hostapd_provisioning.conf"),
                settle: Duration::ZERO,
                use_sudo: true,
            },
            &config,
            profiles.clone(),
        );
        let system = SystemConfig {
            use_sudo: true,
            repo_dir: dir.path().to_path_buf(),
            repo_user: None,
        };
        let actions = JobActions::new(runner, network, system, paths);

        let provisioning = Provisioning::new(
            JobCoordinator::new(),
            actions,
            PortalConfig {
                bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port,
                shutdown_grace: Duration::from_secs(2),
            },
            config,
        );

        Fixture {
            _dir: dir,
            log,
            link,
            provisioning,
            profiles,
        }
    }

    fn fixture(probe_retries: u32) -> Fixture {
        fixture_with(MockCommandRunner::new(), probe_retries, 0)
    }

    async fn settled(provisioning: &Provisioning<Arc<MockCommandRunner>>) -> ProvisioningState {
        let mut rx = provisioning.subscribe();
        let state = tokio::time::timeout(
            Duration::from_secs(10),
            rx.wait_for(|s| *s != ProvisioningState::Reconnecting),
        )
        .await
        .expect("connection attempt did not finish")
        .unwrap();
        *state
    }

    #[actix_web::test]
    async fn test_falls_back_to_portal_without_profiles() {
        let f = fixture(3);

        let state = f.provisioning.ensure_connectivity().await.unwrap();

        assert_eq!(state, ProvisioningState::PortalActive);
        assert_eq!(f.log.count(DEVICE_STATUS), 3);
        assert_eq!(f.log.count(HOSTAPD), 1);
        assert!(f.provisioning.network().access_point.is_broadcasting());
        assert!(f.provisioning.portal_address().await.is_some());
        assert_eq!(
            PortalBackend::networks(&f.provisioning)
                .iter()
                .map(|n| n.ssid.as_str())
                .collect::<Vec<_>>(),
            ["HomeNet", "CoffeeShop"]
        );

        f.provisioning.shutdown().await;
        assert!(!f.provisioning.network().access_point.is_broadcasting());
    }

    #[actix_web::test]
    async fn test_connected_at_boot() {
        let f = fixture(3);
        f.set_link("ethernet:connected:Wired\nwifi:connected:HomeNet\n");

        let state = f.provisioning.ensure_connectivity().await.unwrap();

        assert_eq!(state, ProvisioningState::Connected);
        assert_eq!(f.log.count(HOSTAPD), 0);
        assert!(f.provisioning.portal_address().await.is_none());
    }

    #[actix_web::test]
    async fn test_restores_saved_profile() {
        let mut runner = MockCommandRunner::new();
        // NetworkManager lost the connection
        runner
            .expect_run()
            .withf(command("nmcli -t -f NAME,TYPE connection show"))
            .returning(|spec| Reply::ok("").answer(spec));
        let f = fixture_with(runner, 3, 0);
        f.profiles
            .record_connection("HomeNet", Security::WpaPsk, Some(&Secret::new("password123")))
            .await
            .unwrap();

        let state = f.provisioning.ensure_connectivity().await.unwrap();

        assert_eq!(state, ProvisioningState::Connected);
        assert_eq!(f.log.count("nmcli connection add"), 1);
        assert_eq!(f.log.count(ACTIVATE_HOME), 1);
        assert!(f.log.lines().iter().all(|c| !c.contains("password123")));
    }

    #[actix_web::test]
    async fn test_wrong_secret_returns_to_portal() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(command(ACTIVATE_HOME))
            .returning(|spec| {
                Reply::fail(
                    4,
                    "Error: Connection activation failed: Secrets were required, but not provided",
                )
                .answer(spec)
            });
        let f = fixture_with(runner, 1, 0);
        f.provisioning.ensure_connectivity().await.unwrap();
        let portal = f.provisioning.portal_address().await.unwrap();

        f.provisioning
            .submit_credentials("HomeNet".into(), Some(Secret::new("wrongpassword")))
            .await
            .unwrap();

        assert_eq!(settled(&f.provisioning).await, ProvisioningState::PortalActive);
        assert!(f.provisioning.network().access_point.is_broadcasting());
        assert_eq!(f.log.count(HOSTAPD), 2);

        let status = f.provisioning.status();
        assert!(status.connecting_to.is_none());
        assert!(status.last_error.unwrap().contains("Secrets were required"));

        let page = reqwest::get(format!("http://{portal}/"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(page.contains("Last attempt failed"));
        assert!(page.contains("Secrets were required"));

        f.provisioning.shutdown().await;
    }

    #[actix_web::test]
    async fn test_successful_connect_tears_down() {
        let f = fixture(1);
        f.provisioning.ensure_connectivity().await.unwrap();

        f.provisioning
            .submit_credentials("HomeNet".into(), Some(Secret::new("password123")))
            .await
            .unwrap();

        assert_eq!(settled(&f.provisioning).await, ProvisioningState::Connected);
        assert!(!f.provisioning.network().access_point.is_broadcasting());
        assert!(f.provisioning.portal_address().await.is_none());
        assert!(f.profiles.contains("HomeNet").await.unwrap());
    }

    #[actix_web::test]
    async fn test_connect_job_while_portal_active_is_coordinated() {
        let f = fixture(1);
        f.provisioning.ensure_connectivity().await.unwrap();

        let request = |ssid: &str| {
            JobRequest::ConnectNetwork(ConnectParams {
                ssid: ssid.into(),
                secret: Some(Secret::new("password123")),
            })
        };

        f.provisioning.submit_job(request("HomeNet")).await.unwrap();
        assert_eq!(f.provisioning.state(), ProvisioningState::Reconnecting);
        assert_eq!(
            f.provisioning.status().connecting_to.as_deref(),
            Some("HomeNet")
        );

        // the interface is taken until the machine has settled
        assert!(matches!(
            f.provisioning.submit_job(request("CoffeeShop")).await,
            Err(SubmitError::Busy {
                group: ExclusivityGroup::Network
            })
        ));

        assert_eq!(settled(&f.provisioning).await, ProvisioningState::Connected);
        assert!(!f.provisioning.network().access_point.is_broadcasting());
        assert!(f.provisioning.portal_address().await.is_none());
    }

    #[actix_web::test]
    async fn test_other_jobs_bypass_the_machine() {
        let f = fixture(1);
        f.provisioning.ensure_connectivity().await.unwrap();

        let id = f
            .provisioning
            .submit_job(JobRequest::ScanNetworks)
            .await
            .unwrap();

        let job = f.provisioning.inner.coordinator.wait(id).await.unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(f.provisioning.state(), ProvisioningState::PortalActive);
        assert!(f.provisioning.network().access_point.is_broadcasting());

        f.provisioning.shutdown().await;
    }

    #[actix_web::test]
    async fn test_credentials_only_while_portal_active() {
        let f = fixture(1);
        f.set_link(CONNECTED_HOME);
        f.provisioning.ensure_connectivity().await.unwrap();

        let result = f
            .provisioning
            .submit_credentials("Elsewhere".into(), None)
            .await;

        assert!(matches!(result, Err(SubmitError::InvalidRequest(_))));
        assert_eq!(f.log.count("nmcli connection add"), 0);
    }

    #[actix_web::test]
    async fn test_unknown_network_rejected() {
        let f = fixture(1);
        f.provisioning.ensure_connectivity().await.unwrap();

        let result = f
            .provisioning
            .submit_credentials("NotNearby".into(), None)
            .await;

        assert!(matches!(result, Err(SubmitError::InvalidRequest(_))));
        assert_eq!(f.provisioning.state(), ProvisioningState::PortalActive);

        f.provisioning.shutdown().await;
    }

    #[actix_web::test]
    async fn test_portal_lists_and_forgets_saved_networks() {
        let f = fixture(1);
        f.profiles
            .record_connection("HomeNet", Security::WpaPsk, Some(&Secret::new("password123")))
            .await
            .unwrap();

        assert_eq!(
            PortalBackend::saved_networks(&f.provisioning).await.unwrap(),
            ["HomeNet"]
        );
        assert!(
            PortalBackend::forget_network(&f.provisioning, "HomeNet".into())
                .await
                .unwrap()
        );
        assert!(
            !PortalBackend::forget_network(&f.provisioning, "HomeNet".into())
                .await
                .unwrap()
        );

        assert!(f.profiles.list().await.unwrap().is_empty());
        assert_eq!(f.log.count("nmcli connection delete id HomeNet"), 1);
    }

    #[actix_web::test]
    async fn test_connectivity_loss_starts_portal() {
        let f = fixture(2);
        f.set_link(CONNECTED_HOME);
        f.provisioning.ensure_connectivity().await.unwrap();

        assert_eq!(
            f.provisioning.health_check().await.unwrap(),
            ProvisioningState::Connected
        );

        f.set_link(DISCONNECTED);
        assert_eq!(
            f.provisioning.health_check().await.unwrap(),
            ProvisioningState::PortalActive
        );

        f.provisioning.shutdown().await;
    }

    #[actix_web::test]
    async fn test_missing_hardware_fails() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(command(DEVICE_LIST))
            .returning(|spec| Reply::ok("ethernet:eth0\n").answer(spec));
        let f = fixture_with(runner, 1, 0);

        assert!(f.provisioning.ensure_connectivity().await.is_err());
        assert_eq!(f.provisioning.state(), ProvisioningState::Failed);
        assert!(f.provisioning.recheck().await.is_err());
    }

    #[actix_web::test]
    async fn test_portal_bind_failure_fails() {
        let occupied = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let f = fixture_with(
            MockCommandRunner::new(),
            1,
            occupied.local_addr().unwrap().port(),
        );

        assert!(f.provisioning.ensure_connectivity().await.is_err());
        assert_eq!(f.provisioning.state(), ProvisioningState::Failed);
        assert!(!f.provisioning.network().access_point.is_broadcasting());
    }

    #[actix_web::test]
    async fn test_waits_for_network_jobs() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(command("nmcli device wifi rescan"))
            .returning(|spec| {
                Reply::ok("")
                    .delayed(Duration::from_millis(300))
                    .answer(spec)
            });
        let f = fixture_with(runner, 1, 0);
        f.set_link(CONNECTED_HOME);
        f.provisioning.ensure_connectivity().await.unwrap();

        let scan = f.provisioning.rescan().unwrap();

        assert_eq!(
            f.provisioning.recheck().await.unwrap(),
            ProvisioningState::Connected
        );

        // the recheck probe runs only after the scan released the interface
        let calls = f.log.lines();
        let listed = calls.iter().position(|c| c.starts_with(WIFI_LIST)).unwrap();
        let probed = calls.iter().rposition(|c| c.starts_with(DEVICE_STATUS)).unwrap();
        assert!(listed < probed);

        let job = f.provisioning.inner.coordinator.wait(scan).await.unwrap();
        assert_eq!(job.state, JobState::Succeeded);
    }
}
