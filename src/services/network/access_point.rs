use crate::{
    config::AccessPointConfig,
    services::system_actions::{CommandRunner, CommandSpec},
};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

const STEP_TIMEOUT: Duration = Duration::from_secs(10);
const NETWORK_MANAGER_RESTART_TIMEOUT: Duration = Duration::from_secs(20);

/// Self-hosted wireless network (hostapd and dnsmasq)
#[derive(Clone)]
pub struct AccessPoint<R> {
    runner: R,
    config: AccessPointConfig,
    broadcasting: Arc<AtomicBool>,
}

impl<R: CommandRunner + Clone> AccessPoint<R> {
    pub fn new(runner: R, config: AccessPointConfig) -> Self {
        Self {
            runner,
            config,
            broadcasting: Arc::default(),
        }
    }

    pub fn is_broadcasting(&self) -> bool {
        self.broadcasting.load(Ordering::SeqCst)
    }

    pub fn ssid(&self) -> &str {
        &self.config.ssid
    }

    pub fn address(&self) -> &str {
        self.config.host_address()
    }

    fn step(&self, label: &str, program: &str, timeout: Duration) -> CommandSpec {
        CommandSpec::new(label, program, timeout).privileged(self.config.use_sudo)
    }

    /// Take the interface away from NetworkManager and broadcast the setup network
    pub async fn start(&self) -> Result<()> {
        let iface = &self.config.interface;

        let disconnect = self
            .runner
            .run(
                self.step("ap_disconnect", "nmcli", STEP_TIMEOUT)
                    .args(["device", "disconnect"])
                    .arg(iface),
            )
            .await;
        if !disconnect.ok() {
            debug!("{iface} was not connected: {}", disconnect.failure_reason());
        }

        let steps = [
            self.step("ap_addr_flush", "ip", STEP_TIMEOUT)
                .args(["addr", "flush", "dev"])
                .arg(iface),
            self.step("ap_addr_add", "ip", STEP_TIMEOUT)
                .args(["addr", "add"])
                .arg(&self.config.address)
                .arg("dev")
                .arg(iface),
            self.step("ap_link_up", "ip", STEP_TIMEOUT)
                .args(["link", "set"])
                .arg(iface)
                .arg("up"),
            self.step("ap_dnsmasq_start", "systemctl", STEP_TIMEOUT).args(["start", "dnsmasq"]),
            self.step("ap_hostapd_start", "hostapd", STEP_TIMEOUT)
                .arg("-B")
                .arg(self.config.hostapd_config.to_string_lossy()),
        ];

        for spec in steps {
            let label = spec.label().to_string();
            if let Err(e) = self.runner.run(spec).await.checked() {
                error!("access point step {label} failed: {e:#}");
                if let Err(e) = self.teardown().await {
                    debug!("cleanup after failed start incomplete: {e:#}");
                }
                return Err(e).context("failed to start access point");
            }
        }

        self.broadcasting.store(true, Ordering::SeqCst);
        info!(
            "broadcasting {:?} on {iface} at {}",
            self.config.ssid, self.config.address
        );
        Ok(())
    }

    /// Stop broadcasting and hand the interface back to NetworkManager
    ///
    /// Every step is attempted even if an earlier one failed; the first
    /// failure is returned. Does nothing when not broadcasting.
    pub async fn stop(&self) -> Result<()> {
        if !self.broadcasting.swap(false, Ordering::SeqCst) {
            debug!("access point not broadcasting, nothing to stop");
            return Ok(());
        }

        let result = self.teardown().await;
        tokio::time::sleep(self.config.settle).await;

        match &result {
            Ok(()) => info!("stopped broadcasting {:?}", self.config.ssid),
            Err(e) => warn!("access point stopped with errors: {e:#}"),
        }
        result
    }

    async fn teardown(&self) -> Result<()> {
        let iface = &self.config.interface;
        let steps = [
            self.step("ap_hostapd_stop", "killall", STEP_TIMEOUT).arg("hostapd"),
            self.step("ap_dnsmasq_stop", "systemctl", STEP_TIMEOUT).args(["stop", "dnsmasq"]),
            self.step("ap_addr_flush", "ip", STEP_TIMEOUT)
                .args(["addr", "flush", "dev"])
                .arg(iface),
            self.step(
                "ap_network_manager_restart",
                "systemctl",
                NETWORK_MANAGER_RESTART_TIMEOUT,
            )
            .args(["restart", "NetworkManager"]),
        ];

        let mut first_error = None;
        for spec in steps {
            let label = spec.label().to_string();
            if let Err(e) = self.runner.run(spec).await.checked() {
                warn!("access point step {label} failed: {e:#}");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e).context("failed to stop access point"),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::system_actions::{
        MockCommandRunner,
        testing::{Reply, allow_other_commands, command, succeed},
    };
    use mockall::Sequence;
    use std::path::PathBuf;

    fn access_point(runner: MockCommandRunner) -> AccessPoint<Arc<MockCommandRunner>> {
        AccessPoint::new(
            Arc::new(runner),
            AccessPointConfig {
                interface: "wlan0".into(),
                ssid: "ArrivalBoard-Setup".into(),
                address: "192.168.4.1/24".into(),
                hostapd_config: PathBuf::from("/opt/board/hostapd_provisioning.conf"),
                settle: Duration::ZERO,
                use_sudo: true,
            },
        )
    }

    #[tokio::test]
    async fn test_start_runs_steps_in_order() {
        let mut runner = MockCommandRunner::new();
        let mut sequence = Sequence::new();
        for line in [
            "sudo nmcli device disconnect wlan0",
            "sudo ip addr flush dev wlan0",
            "sudo ip addr add 192.168.4.1/24 dev wlan0",
            "sudo ip link set wlan0 up",
            "sudo systemctl start dnsmasq",
            "sudo hostapd -B /opt/board/hostapd_provisioning.conf",
        ] {
            runner
                .expect_run()
                .withf(move |spec| spec.command_line() == line)
                .times(1)
                .in_sequence(&mut sequence)
                .returning(succeed);
        }
        let ap = access_point(runner);

        ap.start().await.unwrap();

        assert!(ap.is_broadcasting());
    }

    #[tokio::test]
    async fn test_failed_start_cleans_up() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(command("hostapd"))
            .times(1)
            .returning(|spec| Reply::fail(1, "Could not configure driver mode").answer(spec));
        runner
            .expect_run()
            .withf(command("killall hostapd"))
            .times(1)
            .returning(succeed);
        runner
            .expect_run()
            .withf(command("systemctl restart NetworkManager"))
            .times(1)
            .returning(succeed);
        allow_other_commands(&mut runner);
        let ap = access_point(runner);

        assert!(ap.start().await.is_err());
        assert!(!ap.is_broadcasting());
    }

    #[tokio::test]
    async fn test_stop_attempts_every_step() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(command("killall hostapd"))
            .times(1)
            .returning(|spec| Reply::fail(1, "hostapd: no process found").answer(spec));
        runner
            .expect_run()
            .withf(command("systemctl stop dnsmasq"))
            .times(1)
            .returning(succeed);
        runner
            .expect_run()
            .withf(command("systemctl restart NetworkManager"))
            .times(1)
            .returning(succeed);
        allow_other_commands(&mut runner);
        let ap = access_point(runner);
        ap.start().await.unwrap();

        let error = ap.stop().await.unwrap_err();

        assert!(format!("{error:#}").contains("no process found"));
        assert!(!ap.is_broadcasting());
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_a_no_op() {
        // no expectations: any command would panic
        access_point(MockCommandRunner::new()).stop().await.unwrap();
    }
}
