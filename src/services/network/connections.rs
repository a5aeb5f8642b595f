use super::{Secret, prober::split_terse};
use crate::services::system_actions::{CommandRunner, CommandSpec};
use anyhow::{Context, Result};
use log::{debug, info};
use std::{io::Write, time::Duration};
use tempfile::NamedTempFile;

const NMCLI_TIMEOUT: Duration = Duration::from_secs(15);
const ACTIVATION_WAIT_SECS: u64 = 30;
const PSK_PROPERTY: &str = "802-11-wireless-security.psk";

/// NetworkManager connection profiles, named after their SSID
#[derive(Clone)]
pub struct Connections<R> {
    runner: R,
    interface: String,
    use_sudo: bool,
}

impl<R: CommandRunner + Clone> Connections<R> {
    pub fn new(runner: R, interface: impl Into<String>, use_sudo: bool) -> Self {
        Self {
            runner,
            interface: interface.into(),
            use_sudo,
        }
    }

    fn nmcli(&self, label: &str, timeout: Duration) -> CommandSpec {
        CommandSpec::new(label, "nmcli", timeout).privileged(self.use_sudo)
    }

    /// (Re-)create the connection for `ssid`
    ///
    /// An existing connection with the same name is replaced. The key itself
    /// never appears on a command line, it is handed over by `activate`.
    pub async fn add(&self, ssid: &str, secret: Option<&Secret>) -> Result<()> {
        if self.delete(ssid).await.is_ok() {
            debug!("replaced existing connection {ssid:?}");
        }

        let mut spec = self
            .nmcli("nm_connection_add", NMCLI_TIMEOUT)
            .args(["connection", "add", "type", "wifi", "ifname"])
            .arg(&self.interface)
            .arg("con-name")
            .arg(ssid)
            .arg("ssid")
            .arg(ssid);

        if secret.is_some() {
            spec = spec.args(["wifi-sec.key-mgmt", "wpa-psk"]);
        }

        self.runner
            .run(spec)
            .await
            .checked()
            .with_context(|| format!("failed to save connection {ssid:?}"))?;

        info!("saved connection {ssid:?}");
        Ok(())
    }

    /// Activate the connection and wait for NetworkManager to report the outcome
    ///
    /// A `secret` is passed through an owner-only `passwd-file`, which
    /// NetworkManager stores with the connection once it is accepted.
    pub async fn activate(&self, ssid: &str, secret: Option<&Secret>) -> Result<()> {
        let mut spec = self
            .nmcli(
                "nm_connection_up",
                Duration::from_secs(ACTIVATION_WAIT_SECS + 15),
            )
            .args(["--wait", &ACTIVATION_WAIT_SECS.to_string()])
            .args(["connection", "up", "id"])
            .arg(ssid);

        // removed on drop, after nmcli has finished
        let passwd_file = secret.map(passwd_file).transpose()?;
        if let Some(file) = &passwd_file {
            spec = spec
                .arg("passwd-file")
                .arg(file.path().to_string_lossy());
        }

        self.runner
            .run(spec)
            .await
            .checked()
            .with_context(|| format!("failed to activate connection {ssid:?}"))?;

        info!("activated connection {ssid:?}");
        Ok(())
    }

    pub async fn delete(&self, ssid: &str) -> Result<()> {
        let spec = self
            .nmcli("nm_connection_delete", NMCLI_TIMEOUT)
            .args(["connection", "delete", "id"])
            .arg(ssid);

        self.runner
            .run(spec)
            .await
            .checked()
            .with_context(|| format!("failed to delete connection {ssid:?}"))?;

        Ok(())
    }

    /// Whether NetworkManager knows a wireless connection with this name
    pub async fn exists(&self, ssid: &str) -> Result<bool> {
        let spec = CommandSpec::new("nm_connection_list", "nmcli", NMCLI_TIMEOUT)
            .args(["-t", "-f", "NAME,TYPE", "connection", "show"]);

        let result = self
            .runner
            .run(spec)
            .await
            .checked()
            .context("failed to list connections")?;

        Ok(result.stdout.lines().any(|line| {
            let fields = split_terse(line);
            fields.len() >= 2 && fields[0] == ssid && fields[1] == "802-11-wireless"
        }))
    }
}

/// Key in the `setting.property:value` format read by `nmcli ... passwd-file`
fn passwd_file(secret: &Secret) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new().context("failed to create passwd file")?;
    writeln!(file, "{PSK_PROPERTY}:{}", secret.expose())
        .and_then(|()| file.flush())
        .context("failed to write passwd file")?;
    Ok(file)
}
