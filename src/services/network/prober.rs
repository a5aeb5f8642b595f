use super::{Connectivity, ScannedNetwork, Security};
use crate::services::system_actions::{CommandRunner, CommandSpec, Outcome};
use anyhow::{Context, Result};
use log::{debug, warn};
use std::{collections::HashMap, path::Path, time::Duration};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const SCAN_TIMEOUT: Duration = Duration::from_secs(20);

/// Stateless view on the wireless link
#[derive(Clone)]
pub struct NetworkProber<R> {
    runner: R,
    interface: String,
    use_sudo: bool,
    scan_settle: Duration,
}

impl<R: CommandRunner + Clone> NetworkProber<R> {
    pub fn new(
        runner: R,
        interface: impl Into<String>,
        use_sudo: bool,
        scan_settle: Duration,
    ) -> Self {
        Self {
            runner,
            interface: interface.into(),
            use_sudo,
            scan_settle,
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Whether the wireless interface is connected and to which network
    pub async fn current_connectivity(&self) -> Result<Connectivity> {
        let result = self
            .runner
            .run(
                CommandSpec::new("nm_device_status", "nmcli", PROBE_TIMEOUT)
                    .args(["-t", "-f", "TYPE,STATE,CONNECTION", "device"]),
            )
            .await;

        if let Outcome::SpawnFailed(reason) = &result.outcome {
            debug!("nmcli unavailable ({reason}), falling back to iwgetid");
            return self.connectivity_from_wireless_tools().await;
        }

        let result = result.checked().context("failed to query device status")?;
        Ok(parse_device_status(&result.stdout))
    }

    async fn connectivity_from_wireless_tools(&self) -> Result<Connectivity> {
        let result = self
            .runner
            .run(CommandSpec::new("iwgetid", "iwgetid", PROBE_TIMEOUT).arg("-r"))
            .await;

        if let Outcome::SpawnFailed(reason) = &result.outcome {
            anyhow::bail!("failed to query connectivity: neither nmcli nor iwgetid usable ({reason})");
        }

        let ssid = result.stdout.trim();
        // iwgetid exits non-zero when not associated
        if result.ok() && !ssid.is_empty() {
            Ok(Connectivity::Connected {
                ssid: ssid.to_string(),
            })
        } else {
            Ok(Connectivity::Disconnected)
        }
    }

    /// Rescan and list nearby networks, strongest first, one entry per SSID
    pub async fn scan(&self) -> Result<Vec<ScannedNetwork>> {
        let rescan = self
            .runner
            .run(
                CommandSpec::new("nm_wifi_rescan", "nmcli", SCAN_TIMEOUT)
                    .args(["device", "wifi", "rescan"])
                    .privileged(self.use_sudo),
            )
            .await;

        if let Outcome::SpawnFailed(reason) = &rescan.outcome {
            debug!("nmcli unavailable ({reason}), falling back to iwlist");
            return self.scan_with_wireless_tools().await;
        }

        if !rescan.ok() {
            warn!("wifi rescan failed, listing cached results: {}", rescan.failure_reason());
        }

        tokio::time::sleep(self.scan_settle).await;

        let list = self
            .runner
            .run(
                CommandSpec::new("nm_wifi_list", "nmcli", SCAN_TIMEOUT)
                    .args(["-t", "-f", "SSID,SIGNAL,SECURITY", "device", "wifi", "list"]),
            )
            .await
            .checked()
            .context("failed to list wifi networks")?;

        Ok(dedupe_by_ssid(parse_wifi_list(&list.stdout)))
    }

    async fn scan_with_wireless_tools(&self) -> Result<Vec<ScannedNetwork>> {
        let result = self
            .runner
            .run(
                CommandSpec::new("iwlist_scan", "iwlist", SCAN_TIMEOUT)
                    .arg(&self.interface)
                    .arg("scan")
                    .privileged(self.use_sudo),
            )
            .await
            .checked()
            .context("failed to scan wifi networks")?;

        Ok(dedupe_by_ssid(parse_iwlist(&result.stdout)))
    }

    /// Whether a wireless interface exists at all
    pub async fn hardware_present(&self) -> bool {
        let result = self
            .runner
            .run(
                CommandSpec::new("nm_device_list", "nmcli", PROBE_TIMEOUT)
                    .args(["-t", "-f", "TYPE,DEVICE", "device"]),
            )
            .await;

        if result.ok() {
            return result
                .stdout
                .lines()
                .map(split_terse)
                .any(|fields| fields.first().is_some_and(|t| t == "wifi"));
        }

        let sysfs = Path::new("/sys/class/net")
            .join(&self.interface)
            .join("wireless");
        debug!("nmcli device list failed, checking {}", sysfs.display());
        sysfs.exists()
    }
}

/// Split one line of `nmcli -t` output, honoring `\:` and `\\` escapes
pub fn split_terse(line: &str) -> Vec<String> {
    let mut fields = vec![];
    let mut current = String::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => current.extend(chars.next()),
            ':' => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }

    fields.push(current);
    fields
}

pub fn parse_device_status(stdout: &str) -> Connectivity {
    stdout
        .lines()
        .map(split_terse)
        .find_map(|fields| match fields.as_slice() {
            [kind, state, connection, ..]
                if kind == "wifi"
                    && state.starts_with("connected")
                    && !connection.is_empty() =>
            {
                Some(Connectivity::Connected {
                    ssid: connection.clone(),
                })
            }
            _ => None,
        })
        .unwrap_or(Connectivity::Disconnected)
}

pub fn parse_wifi_list(stdout: &str) -> Vec<ScannedNetwork> {
    stdout
        .lines()
        .map(split_terse)
        .filter_map(|fields| match fields.as_slice() {
            [ssid, signal, security, ..] if !ssid.is_empty() => Some(ScannedNetwork {
                ssid: ssid.clone(),
                signal_strength: signal.trim().parse::<u8>().unwrap_or(0).min(100),
                security: Security::from_nmcli(security),
            }),
            _ => None,
        })
        .collect()
}

/// Parse the cell blocks of `iwlist <iface> scan`
pub fn parse_iwlist(stdout: &str) -> Vec<ScannedNetwork> {
    #[derive(Default)]
    struct Cell {
        ssid: Option<String>,
        quality: u8,
        encrypted: bool,
        enterprise: bool,
    }

    impl Cell {
        fn finish(self) -> Option<ScannedNetwork> {
            let ssid = self.ssid.filter(|s| !s.is_empty())?;
            let security = match (self.encrypted, self.enterprise) {
                (false, _) => Security::Open,
                (true, true) => Security::WpaEnterpriseUnsupported,
                (true, false) => Security::WpaPsk,
            };
            Some(ScannedNetwork {
                ssid,
                signal_strength: self.quality,
                security,
            })
        }
    }

    let mut networks = vec![];
    let mut cell: Option<Cell> = None;

    for line in stdout.lines().map(str::trim) {
        if line.starts_with("Cell ") {
            if let Some(network) = cell.take().and_then(Cell::finish) {
                networks.push(network);
            }
            cell = Some(Cell::default());
            continue;
        }

        let Some(current) = cell.as_mut() else {
            continue;
        };

        if let Some(essid) = line.strip_prefix("ESSID:") {
            current.ssid = Some(essid.trim_matches('"').to_string());
        } else if let Some(quality) = line.strip_prefix("Quality=") {
            current.quality = parse_quality(quality);
        } else if line.starts_with("Encryption key:") {
            current.encrypted = line.ends_with("on");
        } else if line.contains("Authentication Suites") && line.contains("802.1x") {
            current.enterprise = true;
        }
    }

    if let Some(network) = cell.and_then(Cell::finish) {
        networks.push(network);
    }

    networks
}

/// `70/70  Signal level=-40 dBm` as a percentage
fn parse_quality(field: &str) -> u8 {
    let ratio = field.split_whitespace().next().unwrap_or_default();
    let Some((value, max)) = ratio.split_once('/') else {
        return 0;
    };

    match (value.parse::<u32>(), max.parse::<u32>()) {
        (Ok(value), Ok(max)) if max > 0 => (value.min(max) * 100 / max) as u8,
        _ => 0,
    }
}

/// Keep the strongest entry per SSID, sorted by descending signal
pub fn dedupe_by_ssid(networks: Vec<ScannedNetwork>) -> Vec<ScannedNetwork> {
    let mut strongest: HashMap<String, ScannedNetwork> = HashMap::new();

    for network in networks {
        match strongest.get(&network.ssid) {
            Some(known) if known.signal_strength >= network.signal_strength => {}
            _ => {
                strongest.insert(network.ssid.clone(), network);
            }
        }
    }

    let mut networks: Vec<_> = strongest.into_values().collect();
    networks.sort_by(|a, b| {
        b.signal_strength
            .cmp(&a.signal_strength)
            .then_with(|| a.ssid.cmp(&b.ssid))
    });
    networks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::system_actions::{
        MockCommandRunner,
        testing::{Reply, command, succeed},
    };
    use std::sync::Arc;

    fn prober(runner: MockCommandRunner) -> NetworkProber<Arc<MockCommandRunner>> {
        NetworkProber::new(Arc::new(runner), "wlan0", true, Duration::ZERO)
    }

    #[test]
    fn test_split_terse_escapes() {
        assert_eq!(split_terse("a:b:c"), ["a", "b", "c"]);
        assert_eq!(split_terse(r"Cafe\: Free:55:WPA2"), ["Cafe: Free", "55", "WPA2"]);
        assert_eq!(split_terse(r"back\\slash:1"), [r"back\slash", "1"]);
        assert_eq!(split_terse(":80:"), ["", "80", ""]);
    }

    #[test]
    fn test_parse_device_status() {
        let connected = "ethernet:unavailable:\nwifi:connected:HomeNet\nloopback:connected (externally):lo\n";
        assert_eq!(
            parse_device_status(connected),
            Connectivity::Connected {
                ssid: "HomeNet".into()
            }
        );

        let connecting = "wifi:connecting (getting IP configuration):HomeNet\n";
        assert_eq!(parse_device_status(connecting), Connectivity::Disconnected);
        assert_eq!(
            parse_device_status("wifi:disconnected:\n"),
            Connectivity::Disconnected
        );
    }

    #[test]
    fn test_dedupe_keeps_strongest_and_sorts() {
        let list = "HomeNet:40:WPA2\nCoffeeShop:80:\nHomeNet:72:WPA2\n:90:WPA2\nOffice:60:WPA2 802.1X\n";
        let networks = dedupe_by_ssid(parse_wifi_list(list));

        let summary: Vec<_> = networks
            .iter()
            .map(|n| (n.ssid.as_str(), n.signal_strength, n.security))
            .collect();
        assert_eq!(
            summary,
            [
                ("CoffeeShop", 80, Security::Open),
                ("HomeNet", 72, Security::WpaPsk),
                ("Office", 60, Security::WpaEnterpriseUnsupported),
            ]
        );
    }

    #[test]
    fn test_parse_iwlist() {
        let output = r#"wlan0     Scan completed :
          Cell 01 - Address: 00:11:22:33:44:55
                    Quality=56/70  Signal level=-54 dBm
                    Encryption key:on
                    ESSID:"HomeNet"
                    IE: IEEE 802.11i/WPA2 Version 1
                        Authentication Suites (1) : PSK
          Cell 02 - Address: 66:77:88:99:AA:BB
                    Quality=35/70  Signal level=-75 dBm
                    Encryption key:off
                    ESSID:"CoffeeShop"
          Cell 03 - Address: CC:DD:EE:FF:00:11
                    Quality=70/70  Signal level=-30 dBm
                    Encryption key:on
                    ESSID:"Office"
                        Authentication Suites (1) : 802.1x
"#;

        let networks = dedupe_by_ssid(parse_iwlist(output));
        let summary: Vec<_> = networks
            .iter()
            .map(|n| (n.ssid.as_str(), n.signal_strength, n.security))
            .collect();
        assert_eq!(
            summary,
            [
                ("Office", 100, Security::WpaEnterpriseUnsupported),
                ("HomeNet", 80, Security::WpaPsk),
                ("CoffeeShop", 50, Security::Open),
            ]
        );
    }

    #[tokio::test]
    async fn test_connectivity_falls_back_to_wireless_tools() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(command("nmcli"))
            .returning(|spec| Reply::spawn_failed().answer(spec));
        runner
            .expect_run()
            .withf(command("iwgetid -r"))
            .times(1)
            .returning(|spec| Reply::ok("HomeNet\n").answer(spec));
        assert_eq!(
            prober(runner).current_connectivity().await.unwrap(),
            Connectivity::Connected {
                ssid: "HomeNet".into()
            }
        );

        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(command("nmcli"))
            .returning(|spec| Reply::spawn_failed().answer(spec));
        runner
            .expect_run()
            .withf(command("iwgetid -r"))
            .returning(|spec| Reply::fail(255, "").answer(spec));
        assert_eq!(
            prober(runner).current_connectivity().await.unwrap(),
            Connectivity::Disconnected
        );
    }

    #[tokio::test]
    async fn test_scan_rescans_every_time() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| spec.command_line() == "sudo nmcli device wifi rescan")
            .times(2)
            .returning(succeed);
        runner
            .expect_run()
            .withf(command("nmcli -t -f SSID,SIGNAL,SECURITY device wifi list"))
            .times(2)
            .returning(|spec| Reply::ok("HomeNet:70:WPA2\n").answer(spec));
        let prober = prober(runner);

        prober.scan().await.unwrap();
        let networks = prober.scan().await.unwrap();

        assert_eq!(networks.len(), 1);
    }

    #[tokio::test]
    async fn test_scan_tolerates_failed_rescan() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(command("nmcli device wifi rescan"))
            .returning(|spec| Reply::fail(1, "Error: Scanning not allowed").answer(spec));
        runner
            .expect_run()
            .withf(command("nmcli -t -f SSID,SIGNAL,SECURITY device wifi list"))
            .returning(|spec| Reply::ok("CoffeeShop:40:\n").answer(spec));

        let networks = prober(runner).scan().await.unwrap();
        assert_eq!(networks[0].ssid, "CoffeeShop");
    }

    #[tokio::test]
    async fn test_hardware_present() {
        let cases = [
            ("ethernet:eth0\nwifi:wlan0\n", true),
            ("ethernet:eth0\n", false),
        ];
        for (devices, present) in cases {
            let mut runner = MockCommandRunner::new();
            runner
                .expect_run()
                .withf(command("nmcli -t -f TYPE,DEVICE device"))
                .returning(move |spec| Reply::ok(devices).answer(spec));

            assert_eq!(prober(runner).hardware_present().await, present);
        }
    }
}
