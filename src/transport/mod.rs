//! Push transports and transport selection
//!
//! One variant per underlying delivery mechanism. Which transport handles a
//! registration is a pure function of the fixed preference order, VAPID key
//! availability and each transport's capability probe.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::error::Result;

pub mod cloud;
pub mod distributor;

pub use cloud::CloudMessagingTransport;
pub use distributor::DistributorTransport;

/// Transport mechanism identifier, used in configuration preference lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Broadcast-based distributor protocol with feature negotiation.
    Distributor,
    /// Vendor cloud messaging; cannot deliver to arbitrary servers without
    /// a server-provided VAPID key.
    CloudMessaging,
}

/// Result of a transport registration.
///
/// `url` may be absent: registration accepted but the endpoint is not yet
/// known. That is fallback-worthy, not a failure. `distributor` is never
/// absent; it routes unregister and retry callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub url: Option<String>,
    pub distributor: String,
}

/// Where one registration attempt stands. Logged at every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    AwaitingProviderResponse,
    EndpointReceived,
    Failed,
    TimedOut,
    /// Provider acknowledged but cannot deliver an endpoint yet. Soft
    /// success: no endpoint, fallback polling stays armed.
    Delayed,
}

/// Closed set of push transports.
pub enum PushTransport {
    Distributor(DistributorTransport),
    CloudMessaging(CloudMessagingTransport),
}

impl PushTransport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Distributor(_) => TransportKind::Distributor,
            Self::CloudMessaging(_) => TransportKind::CloudMessaging,
        }
    }

    /// Capability probe. Never touches the network and never blocks on the
    /// user.
    pub fn is_available(&self) -> bool {
        match self {
            Self::Distributor(transport) => transport.is_available(),
            Self::CloudMessaging(transport) => transport.is_available(),
        }
    }

    /// Whether this transport is unusable without a server-provided VAPID
    /// application server key.
    pub fn requires_vapid(&self) -> bool {
        match self {
            Self::Distributor(_) => false,
            Self::CloudMessaging(_) => true,
        }
    }

    /// Ask the transport's provider for a delivery endpoint.
    ///
    /// Waits at most the transport's configured timeout; an attempt is
    /// never left pending.
    pub async fn register(
        &self,
        application_server_key: Option<&[u8]>,
        device_client_id: Uuid,
    ) -> Result<Endpoint> {
        match self {
            Self::Distributor(transport) => {
                transport.register(application_server_key, device_client_id).await
            }
            Self::CloudMessaging(transport) => {
                transport.register(application_server_key, device_client_id).await
            }
        }
    }
}

/// Pick the first available transport in preference order, skipping any
/// that require a VAPID key when the server provided none. `None` means
/// registration is skipped and the fallback scheduler takes over.
pub fn select_transport<'a>(
    transports: &'a [PushTransport],
    preference: &[TransportKind],
    has_application_server_key: bool,
) -> Option<&'a PushTransport> {
    for kind in preference {
        let Some(transport) = transports.iter().find(|t| t.kind() == *kind) else {
            continue;
        };
        if transport.requires_vapid() && !has_application_server_key {
            continue;
        }
        if transport.is_available() {
            return Some(transport);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::cloud::testing::StubBridge;
    use super::distributor::testing::StubBus;
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn distributor_transport(available: bool) -> PushTransport {
        PushTransport::Distributor(DistributorTransport::new(
            Arc::new(StubBus::with_availability(available)),
            "rs.ltt.android".into(),
            Duration::from_secs(30),
        ))
    }

    fn cloud_transport(available: bool) -> PushTransport {
        PushTransport::CloudMessaging(CloudMessagingTransport::new(
            Arc::new(StubBridge::with_availability(available)),
            Duration::from_secs(30),
        ))
    }

    const PREFERENCE: &[TransportKind] =
        &[TransportKind::Distributor, TransportKind::CloudMessaging];

    #[test]
    fn first_available_transport_wins() {
        let transports = vec![distributor_transport(true), cloud_transport(true)];
        let selected = select_transport(&transports, PREFERENCE, true).unwrap();
        assert_eq!(selected.kind(), TransportKind::Distributor);
    }

    #[test]
    fn vapid_requiring_transport_is_skipped_without_key() {
        let transports = vec![distributor_transport(false), cloud_transport(true)];
        assert!(select_transport(&transports, PREFERENCE, false).is_none());
        let selected = select_transport(&transports, PREFERENCE, true).unwrap();
        assert_eq!(selected.kind(), TransportKind::CloudMessaging);
    }

    #[test]
    fn no_available_transport_selects_nothing() {
        let transports = vec![distributor_transport(false), cloud_transport(false)];
        assert!(select_transport(&transports, PREFERENCE, true).is_none());
    }

    #[test]
    fn preference_order_is_respected_over_slice_order() {
        let transports = vec![cloud_transport(true), distributor_transport(true)];
        let selected = select_transport(&transports, PREFERENCE, true).unwrap();
        assert_eq!(selected.kind(), TransportKind::Distributor);
    }
}
