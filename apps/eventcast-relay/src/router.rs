use metrics::counter;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::coordinator::SessionCoordinator;
use crate::protocol::{ConnectionId, ServerFrame, SignalingEnvelope};
use crate::registry::{ConnectionHandle, ConnectionRegistry};

/// What happened to a single routed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    MissingTarget,
    SelfTarget,
    /// Target was never registered, has left, or lives in another room.
    UnknownTarget,
    Backpressure(Backpressure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    Full,
    Closed,
}

impl RouteOutcome {
    fn drop_label(self) -> Option<&'static str> {
        match self {
            RouteOutcome::Delivered => None,
            RouteOutcome::MissingTarget => Some("missing_target"),
            RouteOutcome::SelfTarget => Some("self_target"),
            RouteOutcome::UnknownTarget => Some("unknown_target"),
            RouteOutcome::Backpressure(Backpressure::Full) => Some("outbound_full"),
            RouteOutcome::Backpressure(Backpressure::Closed) => Some("outbound_closed"),
        }
    }
}

/// Forwards envelopes from one connection to another.
///
/// Signaling is best-effort: every failure is a local drop, nothing is ever
/// reported back to the sender.
#[derive(Clone)]
pub struct MessageRouter {
    registry: ConnectionRegistry,
    coordinator: SessionCoordinator,
}

impl MessageRouter {
    pub fn new(registry: ConnectionRegistry, coordinator: SessionCoordinator) -> Self {
        Self {
            registry,
            coordinator,
        }
    }

    pub fn route(&self, sender: &ConnectionHandle, envelope: SignalingEnvelope) -> RouteOutcome {
        let kind = envelope.kind;
        let outcome = self.forward(sender, envelope);

        match outcome.drop_label() {
            None => {
                counter!("eventcast_relay_envelopes_forwarded_total", "kind" => kind.as_str())
                    .increment(1);
            }
            Some(reason) => {
                counter!("eventcast_relay_envelopes_dropped_total", "reason" => reason).increment(1);
                if let RouteOutcome::Backpressure(_) = outcome {
                    warn!(
                        connection_id = %sender.id,
                        kind = %kind,
                        reason,
                        "dropping envelope; target outbound channel unavailable"
                    );
                } else {
                    debug!(connection_id = %sender.id, kind = %kind, reason, "dropping envelope");
                }
            }
        }

        outcome
    }

    fn forward(&self, sender: &ConnectionHandle, envelope: SignalingEnvelope) -> RouteOutcome {
        let Some(raw_target) = envelope
            .target
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
        else {
            return RouteOutcome::MissingTarget;
        };

        let Ok(target_id) = raw_target.parse::<ConnectionId>() else {
            return RouteOutcome::UnknownTarget;
        };
        if target_id == sender.id {
            return RouteOutcome::SelfTarget;
        }

        let Some(target) = self.registry.lookup(&target_id) else {
            return RouteOutcome::UnknownTarget;
        };
        if !sender.shares_room_with(&target) {
            return RouteOutcome::UnknownTarget;
        }

        match target.tx.try_send(ServerFrame::signal(sender.id, envelope)) {
            Ok(()) => {
                self.note_delivery(sender.id, target.id);
                RouteOutcome::Delivered
            }
            Err(TrySendError::Full(_)) => RouteOutcome::Backpressure(Backpressure::Full),
            Err(TrySendError::Closed(_)) => RouteOutcome::Backpressure(Backpressure::Closed),
        }
    }

    fn note_delivery(&self, sender: ConnectionId, target: ConnectionId) {
        self.coordinator.record(sender, target);
        // A disconnect can sweep the coordinator between our lookup and the
        // record above. Whoever is no longer registered is swept again here.
        for id in [sender, target] {
            if !self.registry.contains(&id) {
                self.coordinator.depart(&id);
            }
        }
    }
}
