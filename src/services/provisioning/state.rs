use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisioningState {
    Idle,
    Probing,
    Connected,
    ApBroadcast,
    PortalActive,
    Reconnecting,
    Failed,
}

impl ProvisioningState {
    pub const ALL: [ProvisioningState; 7] = [
        ProvisioningState::Idle,
        ProvisioningState::Probing,
        ProvisioningState::Connected,
        ProvisioningState::ApBroadcast,
        ProvisioningState::PortalActive,
        ProvisioningState::Reconnecting,
        ProvisioningState::Failed,
    ];
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProvisioningState::Idle => "idle",
            ProvisioningState::Probing => "probing",
            ProvisioningState::Connected => "connected",
            ProvisioningState::ApBroadcast => "ap-broadcast",
            ProvisioningState::PortalActive => "portal-active",
            ProvisioningState::Reconnecting => "reconnecting",
            ProvisioningState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProvisioningEvent {
    Start,
    Recheck,
    ProbeConnected,
    ProbeExhausted,
    PortalBound,
    CredentialsSubmitted,
    ConnectSucceeded,
    ConnectFailed,
    ConnectivityLost,
    Fatal,
}

impl ProvisioningEvent {
    pub const ALL: [ProvisioningEvent; 10] = [
        ProvisioningEvent::Start,
        ProvisioningEvent::Recheck,
        ProvisioningEvent::ProbeConnected,
        ProvisioningEvent::ProbeExhausted,
        ProvisioningEvent::PortalBound,
        ProvisioningEvent::CredentialsSubmitted,
        ProvisioningEvent::ConnectSucceeded,
        ProvisioningEvent::ConnectFailed,
        ProvisioningEvent::ConnectivityLost,
        ProvisioningEvent::Fatal,
    ];
}

#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("invalid transition: {event:?} in state {from}")]
pub struct InvalidTransition {
    pub from: ProvisioningState,
    pub event: ProvisioningEvent,
}

/// The provisioning transition table
///
/// Pure function; anything not listed is an `InvalidTransition`.
pub fn transition(
    from: ProvisioningState,
    event: ProvisioningEvent,
) -> Result<ProvisioningState, InvalidTransition> {
    use ProvisioningEvent as E;
    use ProvisioningState as S;

    let next = match (from, event) {
        (S::Idle, E::Start) => S::Probing,
        (S::Idle | S::Connected, E::Recheck) => S::Probing,
        (S::Probing, E::ProbeConnected) => S::Connected,
        (S::Probing, E::ProbeExhausted) => S::ApBroadcast,
        (S::ApBroadcast, E::PortalBound) => S::PortalActive,
        (S::PortalActive, E::CredentialsSubmitted) => S::Reconnecting,
        (S::Reconnecting, E::ConnectSucceeded) => S::Connected,
        (S::Reconnecting, E::ConnectFailed) => S::PortalActive,
        (S::Connected, E::ConnectivityLost) => S::Probing,
        (from, E::Fatal) if from != S::Failed => S::Failed,
        _ => return Err(InvalidTransition { from, event }),
    };

    Ok(next)
}
