//! Wireless network handling
//!
//! Everything here talks to the system through a `CommandRunner`:
//! NetworkManager (`nmcli`) first, wireless-tools when `nmcli` is missing.

pub mod access_point;
pub mod connections;
pub mod prober;
pub mod profiles;
pub mod secret;

pub use access_point::AccessPoint;
pub use connections::Connections;
pub use prober::NetworkProber;
pub use profiles::{NetworkProfile, ProfileStore};
pub use secret::{SealedSecret, Secret, SecretSealer};

use crate::{
    config::{AccessPointConfig, ProvisioningConfig},
    services::system_actions::CommandRunner,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

pub const MAX_SSID_BYTES: usize = 32;
pub const MIN_PSK_CHARS: usize = 8;
pub const MAX_PSK_CHARS: usize = 63;
pub const RAW_PSK_HEX_DIGITS: usize = 64;

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Connectivity {
    Connected { ssid: String },
    Disconnected,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Security {
    Open,
    WpaPsk,
    WpaEnterpriseUnsupported,
}

impl Security {
    /// Map the `SECURITY` column of `nmcli device wifi list`
    pub fn from_nmcli(field: &str) -> Self {
        let field = field.trim();

        if field.is_empty() || field == "--" {
            Security::Open
        } else if field.contains("802.1X") {
            Security::WpaEnterpriseUnsupported
        } else {
            // WEP is configured like a pre-shared key as well
            Security::WpaPsk
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ScannedNetwork {
    pub ssid: String,
    pub signal_strength: u8,
    pub security: Security,
}

#[derive(Clone, Debug, Serialize)]
pub struct ScanSnapshot {
    pub networks: Vec<ScannedNetwork>,
    pub scanned_at: DateTime<Utc>,
}

/// Latest scan result, shared by scan jobs and the captive portal
#[derive(Clone, Debug, Default)]
pub struct ScanCache {
    latest: Arc<RwLock<Option<ScanSnapshot>>>,
}

impl ScanCache {
    pub fn store(&self, networks: Vec<ScannedNetwork>) {
        let snapshot = ScanSnapshot {
            networks,
            scanned_at: Utc::now(),
        };
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
    }

    pub fn latest(&self) -> Option<ScanSnapshot> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn security_of(&self, ssid: &str) -> Option<Security> {
        self.latest()?
            .networks
            .into_iter()
            .find(|n| n.ssid == ssid)
            .map(|n| n.security)
    }
}

/// Network building blocks shared by jobs and the provisioning state machine
///
/// Clones share state: the broadcasting flag of the access point and the
/// scan cache are the same for every holder.
#[derive(Clone)]
pub struct NetworkServices<R> {
    pub prober: NetworkProber<R>,
    pub access_point: AccessPoint<R>,
    pub connections: Connections<R>,
    pub profiles: ProfileStore,
    pub scans: ScanCache,
}

impl<R: CommandRunner + Clone> NetworkServices<R> {
    pub fn new(
        runner: R,
        access_point: &AccessPointConfig,
        provisioning: &ProvisioningConfig,
        profiles: ProfileStore,
    ) -> Self {
        Self {
            prober: NetworkProber::new(
                runner.clone(),
                access_point.interface.clone(),
                access_point.use_sudo,
                provisioning.scan_settle,
            ),
            connections: Connections::new(
                runner.clone(),
                access_point.interface.clone(),
                access_point.use_sudo,
            ),
            access_point: AccessPoint::new(runner, access_point.clone()),
            profiles,
            scans: ScanCache::default(),
        }
    }

    /// Remove a saved network and its NetworkManager connection
    ///
    /// # Returns
    /// `false` when no network of that name was saved
    pub async fn forget(&self, ssid: &str) -> Result<bool> {
        if !self.profiles.remove(ssid).await? {
            return Ok(false);
        }
        if let Err(e) = self.connections.delete(ssid).await {
            warn!("saved network removed, but its connection remains: {e:#}");
        }

        Ok(true)
    }
}

/// Check an SSID and optional pre-shared key for plausibility
///
/// # Returns
/// A human readable rejection reason
pub fn validate_credentials(ssid: &str, secret: Option<&Secret>) -> Result<(), String> {
    if ssid.trim().is_empty() {
        return Err("ssid must not be empty".to_string());
    }
    if ssid.len() > MAX_SSID_BYTES {
        return Err(format!("ssid must not exceed {MAX_SSID_BYTES} bytes"));
    }
    if ssid.chars().any(char::is_control) {
        return Err("ssid must not contain control characters".to_string());
    }

    if let Some(secret) = secret {
        let key = secret.expose();
        // a passphrase, or the derived 256-bit key written out in hex
        let passphrase = (MIN_PSK_CHARS..=MAX_PSK_CHARS).contains(&key.len())
            && key.chars().all(|c| c.is_ascii() && !c.is_ascii_control());
        let raw_key =
            key.len() == RAW_PSK_HEX_DIGITS && key.chars().all(|c| c.is_ascii_hexdigit());

        if !passphrase && !raw_key {
            return Err(format!(
                "password must be {MIN_PSK_CHARS} to {MAX_PSK_CHARS} ASCII characters \
                 or {RAW_PSK_HEX_DIGITS} hexadecimal digits"
            ));
        }
    }

    Ok(())
}
