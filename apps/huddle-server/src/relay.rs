use std::sync::Arc;

use huddle_protocol::{Envelope, ServerMessage};
use thiserror::Error;
use tracing::{debug, warn};

use crate::registry::{JoinOutcome, LeaveOutcome, MemberHandle, SessionRegistry};

#[derive(Debug, Error, PartialEq)]
pub enum RelayError {
    #[error("target {0} is not a member of session {1}")]
    TargetUnavailable(String, String),
    #[error("outbound channel closed for {0}")]
    SendFailed(String),
}

/// Routes negotiation envelopes between members of a session and fans out
/// presence events. Delivery is send-and-forget: a dead or slow recipient is
/// logged and skipped, never allowed to stall the session or surface an
/// error to the sender.
#[derive(Clone)]
pub struct SignalRelay {
    registry: Arc<SessionRegistry>,
}

impl SignalRelay {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Announce a new member to the peers that were present when it joined.
    pub fn announce_joined(&self, outcome: &JoinOutcome) {
        let event = ServerMessage::MemberJoined {
            member: outcome.member.clone(),
        };
        self.fan_out(&outcome.session_id, &outcome.recipients, event);
    }

    /// Announce a departure to the members that remain.
    pub fn announce_left(&self, outcome: &LeaveOutcome) {
        let event = ServerMessage::MemberLeft {
            connection_id: outcome.member.connection_id.clone(),
            display_name: outcome.member.display_name.clone(),
        };
        self.fan_out(&outcome.session_id, &outcome.recipients, event);
    }

    /// Forward an envelope verbatim to its target.
    ///
    /// The sender and target must both be current members of the same
    /// session. Any failure is swallowed here: an absent target means the
    /// peer left between send and delivery, which best-effort signaling
    /// treats as a silent drop.
    pub fn relay(&self, envelope: Envelope) {
        let kind = envelope.kind;
        if let Err(err) = self.try_relay(envelope) {
            debug!(kind = %kind, error = %err, "dropped signal");
        }
    }

    fn try_relay(&self, envelope: Envelope) -> Result<(), RelayError> {
        let sender = self.registry.lookup(&envelope.sender).map_err(|_| {
            RelayError::TargetUnavailable(envelope.sender.to_string(), "<unjoined>".to_string())
        })?;
        let target = self
            .registry
            .outbound(&sender.session_id, &envelope.target)
            .ok_or_else(|| {
                RelayError::TargetUnavailable(
                    envelope.target.to_string(),
                    sender.session_id.clone(),
                )
            })?;
        let target_id = envelope.target.to_string();
        target
            .send(envelope.into_delivery())
            .map_err(|_| RelayError::SendFailed(target_id))
    }

    fn fan_out(&self, session_id: &str, recipients: &[MemberHandle], event: ServerMessage) {
        for recipient in recipients {
            if recipient.tx.send(event.clone()).is_err() {
                warn!(
                    session_id,
                    connection_id = %recipient.info.connection_id,
                    "presence event not delivered, outbound channel closed"
                );
            }
        }
    }
}
