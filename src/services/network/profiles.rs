//! Saved network profiles
//!
//! Profiles live in the `networks` store record keyed by SSID. Secrets are
//! only ever written sealed; listing never exposes them.

use super::{SealedSecret, Secret, SecretSealer, Security};
use crate::services::store::AtomicStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const NETWORKS_KEY: &str = "networks";

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct NetworkProfile {
    pub ssid: String,
    pub security: Security,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SealedSecret>,
    pub priority: i32,
    pub last_connected_at: Option<DateTime<Utc>>,
}

/// Profile as shown to administrators
#[derive(Clone, Debug, Serialize)]
pub struct ProfileSummary {
    pub ssid: String,
    pub security: Security,
    pub priority: i32,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub has_secret: bool,
}

impl From<&NetworkProfile> for ProfileSummary {
    fn from(profile: &NetworkProfile) -> Self {
        Self {
            ssid: profile.ssid.clone(),
            security: profile.security,
            priority: profile.priority,
            last_connected_at: profile.last_connected_at,
            has_secret: profile.secret.is_some(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct NetworksRecord {
    #[serde(default)]
    profiles: BTreeMap<String, NetworkProfile>,
}

#[derive(Clone)]
pub struct ProfileStore {
    store: AtomicStore,
    sealer: SecretSealer,
}

impl ProfileStore {
    pub fn new(store: AtomicStore, sealer: SecretSealer) -> Self {
        Self { store, sealer }
    }

    /// All profiles, highest priority first, most recently used first on ties
    pub async fn list(&self) -> Result<Vec<NetworkProfile>> {
        let store = self.store.clone();
        let record: NetworksRecord =
            tokio::task::spawn_blocking(move || store.read_as(NETWORKS_KEY))
                .await
                .context("failed to join store task")??;

        let mut profiles: Vec<_> = record.profiles.into_values().collect();
        profiles.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.last_connected_at.cmp(&a.last_connected_at))
        });
        Ok(profiles)
    }

    pub async fn summaries(&self) -> Result<Vec<ProfileSummary>> {
        Ok(self.list().await?.iter().map(ProfileSummary::from).collect())
    }

    pub async fn get(&self, ssid: &str) -> Result<Option<NetworkProfile>> {
        Ok(self.list().await?.into_iter().find(|p| p.ssid == ssid))
    }

    pub async fn contains(&self, ssid: &str) -> Result<bool> {
        Ok(self.get(ssid).await?.is_some())
    }

    /// Remember a network after a successful connection
    ///
    /// A new profile gets a priority above all existing ones.
    pub async fn record_connection(
        &self,
        ssid: &str,
        security: Security,
        secret: Option<&Secret>,
    ) -> Result<()> {
        let sealed = secret.map(|s| self.sealer.seal(s)).transpose()?;
        let store = self.store.clone();
        let ssid = ssid.to_string();

        tokio::task::spawn_blocking(move || {
            store.update_as::<NetworksRecord, _, _>(NETWORKS_KEY, |record| {
                let next_priority = record
                    .profiles
                    .values()
                    .map(|p| p.priority + 1)
                    .max()
                    .unwrap_or(0);

                let profile = record
                    .profiles
                    .entry(ssid.clone())
                    .or_insert_with(|| NetworkProfile {
                        ssid: ssid.clone(),
                        security,
                        secret: None,
                        priority: next_priority,
                        last_connected_at: None,
                    });
                profile.security = security;
                profile.secret = sealed;
                profile.last_connected_at = Some(Utc::now());
            })
        })
        .await
        .context("failed to join store task")??;

        info!("saved network profile");
        Ok(())
    }

    /// Delete a profile
    ///
    /// # Returns
    /// Whether a profile existed
    pub async fn remove(&self, ssid: &str) -> Result<bool> {
        let store = self.store.clone();
        let ssid = ssid.to_string();

        let removed = tokio::task::spawn_blocking(move || {
            store.update_as::<NetworksRecord, _, _>(NETWORKS_KEY, |record| {
                record.profiles.remove(&ssid).is_some()
            })
        })
        .await
        .context("failed to join store task")??;

        Ok(removed)
    }

    pub fn reveal(&self, profile: &NetworkProfile) -> Result<Option<Secret>> {
        profile
            .secret
            .as_ref()
            .map(|sealed| self.sealer.open(sealed))
            .transpose()
            .with_context(|| format!("failed to open secret of {:?}", profile.ssid))
    }
}
