use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::auth::{Authenticator, Identity};
use crate::coordinator::SessionCoordinator;
use crate::protocol::{ConnectionId, RoomId, ServerFrame};
use crate::registry::{ConnectionHandle, ConnectionRegistry, RegistryError};
use crate::router::MessageRouter;

const DEFAULT_OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub outbound_buffer: usize,
    pub idle_timeout: Duration,
    /// How often the writer sends a WebSocket ping. Browsers answer with a
    /// pong, which counts as activity for the idle timeout.
    pub heartbeat_interval: Duration,
    pub recent_peers: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            idle_timeout: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(30),
            recent_peers: crate::coordinator::DEFAULT_RECENT_PEERS,
        }
    }
}

/// Process-wide signaling state shared by every connection task.
#[derive(Clone)]
pub struct SignalingState {
    registry: ConnectionRegistry,
    coordinator: SessionCoordinator,
    router: MessageRouter,
    authenticator: Arc<dyn Authenticator>,
    settings: RelaySettings,
    shutdown: watch::Sender<bool>,
}

impl SignalingState {
    pub fn new(settings: RelaySettings, authenticator: Arc<dyn Authenticator>) -> Self {
        let registry = ConnectionRegistry::new();
        let coordinator = SessionCoordinator::new(settings.recent_peers);
        let router = MessageRouter::new(registry.clone(), coordinator.clone());
        let (shutdown, _) = watch::channel(false);
        Self {
            registry,
            coordinator,
            router,
            authenticator,
            settings,
            shutdown,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn coordinator(&self) -> &SessionCoordinator {
        &self.coordinator
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn authenticator(&self) -> &dyn Authenticator {
        self.authenticator.as_ref()
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Register a fresh connection. The returned guard removes it again when
    /// dropped, whichever way the connection task ends.
    pub fn connect(
        &self,
        room: Option<RoomId>,
        identity: Identity,
    ) -> Result<(ConnectionGuard, mpsc::Receiver<ServerFrame>), RegistryError> {
        self.connect_with_id(ConnectionId::generate(), room, identity)
    }

    pub(crate) fn connect_with_id(
        &self,
        id: ConnectionId,
        room: Option<RoomId>,
        identity: Identity,
    ) -> Result<(ConnectionGuard, mpsc::Receiver<ServerFrame>), RegistryError> {
        let (tx, rx) = mpsc::channel(self.settings.outbound_buffer.max(1));
        let handle = ConnectionHandle {
            id,
            room,
            identity,
            tx,
        };
        self.registry.register(handle.clone())?;

        counter!("eventcast_relay_connections_total").increment(1);
        gauge!("eventcast_relay_connections_active").set(self.registry.len() as f64);

        Ok((
            ConnectionGuard {
                state: self.clone(),
                handle,
            },
            rx,
        ))
    }

    /// Remove a connection and tell its recent counterparts. Safe to call any
    /// number of times; only the first call for a registration does work.
    pub fn disconnect(&self, id: &ConnectionId) -> bool {
        let Some(departed) = self.registry.remove(id) else {
            return false;
        };
        gauge!("eventcast_relay_connections_active").set(self.registry.len() as f64);

        for peer_id in self.coordinator.depart(id) {
            let Some(peer) = self.registry.lookup(&peer_id) else {
                continue;
            };
            let notice = ServerFrame::PeerDisconnected {
                from_id: departed.id,
            };
            if peer.tx.try_send(notice).is_ok() {
                counter!("eventcast_relay_peer_disconnect_notices_total").increment(1);
            } else {
                debug!(
                    connection_id = %peer_id,
                    departed = %departed.id,
                    "could not deliver peer-disconnected notice"
                );
            }
        }
        true
    }

    /// Ask every connection task to wind down and drop whatever is left.
    pub fn close_all(&self) {
        self.shutdown.send_replace(true);
        let remaining = self.registry.len();
        self.registry.clear();
        self.coordinator.clear();
        gauge!("eventcast_relay_connections_active").set(0.0);
        info!(remaining, "signaling registry drained");
    }
}

/// Owns one registry entry for the lifetime of a connection task.
pub struct ConnectionGuard {
    state: SignalingState,
    handle: ConnectionHandle,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.handle.id
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.state.disconnect(&self.handle.id);
    }
}
