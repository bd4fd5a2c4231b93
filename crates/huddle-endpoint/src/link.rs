use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use huddle_protocol::{ConnectionId, MemberInfo, SignalKind};

use crate::client::SessionEvent;
use crate::error::EndpointError;

/// Handshake progress for one negotiation link toward a remote peer.
///
/// `Closed` is terminal: once a link closes (peer left, or the negotiation
/// engine failed) nothing transitions it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerExchanged,
    Linked,
    Closed,
}

/// Where outbound signals go. Implemented by [`crate::SignalingClient`];
/// tests substitute a channel.
pub trait SignalSink: Send + Sync {
    fn send(&self, kind: SignalKind, to: ConnectionId, payload: Value)
        -> Result<(), EndpointError>;
}

/// The external negotiation-transport engine.
///
/// Produces and consumes the opaque offer/answer/candidate payloads and owns
/// candidate buffering: candidates handed over before the remote description
/// is applied are held and flushed by the engine, not by this crate.
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Produce the offer payload opening a link toward `remote`.
    async fn create_offer(&self, remote: &ConnectionId) -> Result<Value, EndpointError>;
    /// Apply a remote offer and produce the answer payload.
    async fn accept_offer(
        &self,
        remote: &ConnectionId,
        offer: Value,
    ) -> Result<Value, EndpointError>;
    /// Apply the remote answer to an offer we sent.
    async fn accept_answer(&self, remote: &ConnectionId, answer: Value)
        -> Result<(), EndpointError>;
    /// Hand a remote network candidate to the engine.
    async fn add_candidate(
        &self,
        remote: &ConnectionId,
        candidate: Value,
    ) -> Result<(), EndpointError>;
    /// Tear down engine state for the link.
    async fn close(&self, remote: &ConnectionId);
}

/// Per-remote negotiation state machines for one endpoint.
///
/// Every endpoint initiates toward every peer it discovers, so a pair of
/// endpoints runs two independent offer/answer half-flows. The state kept
/// here tracks the half-flow this endpoint initiated; offers belonging to
/// the remote-initiated half-flow are answered without disturbing it.
pub struct PeerLinks {
    local: ConnectionId,
    outlet: Arc<dyn SignalSink>,
    negotiator: Arc<dyn Negotiator>,
    links: HashMap<ConnectionId, LinkState>,
}

impl PeerLinks {
    pub fn new(
        local: ConnectionId,
        outlet: Arc<dyn SignalSink>,
        negotiator: Arc<dyn Negotiator>,
    ) -> Self {
        Self {
            local,
            outlet,
            negotiator,
            links: HashMap::new(),
        }
    }

    pub fn state_of(&self, remote: &ConnectionId) -> Option<LinkState> {
        self.links.get(remote).copied()
    }

    /// Initiate toward every member already present when we joined.
    pub async fn adopt_roster(&mut self, members: &[MemberInfo]) {
        for member in members {
            self.initiate(member.connection_id.clone()).await;
        }
    }

    /// Feed one session event through the state machines.
    pub async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::MemberJoined(member) => {
                self.initiate(member.connection_id).await;
            }
            SessionEvent::MemberLeft { connection_id, .. } => {
                self.close_link(&connection_id).await;
            }
            SessionEvent::Signal {
                kind,
                from,
                payload,
            } => match kind {
                SignalKind::Offer => self.on_offer(from, payload).await,
                SignalKind::Answer => self.on_answer(from, payload).await,
                SignalKind::Candidate => self.on_candidate(from, payload).await,
            },
            SessionEvent::Disconnected => self.close_all().await,
        }
    }

    /// Open a link toward a newly-known peer: `Idle -> OfferSent`.
    pub async fn initiate(&mut self, remote: ConnectionId) {
        if remote == self.local {
            return;
        }
        if self.links.contains_key(&remote) {
            debug!(remote = %remote, "link already exists, not re-initiating");
            return;
        }
        self.links.insert(remote.clone(), LinkState::Idle);
        match self.negotiator.create_offer(&remote).await {
            Ok(offer) => {
                if let Err(err) = self.outlet.send(SignalKind::Offer, remote.clone(), offer) {
                    warn!(remote = %remote, error = %err, "failed to send offer");
                    self.fail_link(&remote).await;
                    return;
                }
                self.links.insert(remote.clone(), LinkState::OfferSent);
                debug!(remote = %remote, "offer sent");
            }
            Err(err) => {
                warn!(remote = %remote, error = %err, "offer creation failed");
                self.fail_link(&remote).await;
            }
        }
    }

    /// The negotiation engine reports connectivity for a link.
    pub fn mark_established(&mut self, remote: &ConnectionId) {
        match self.links.get_mut(remote) {
            Some(state @ (LinkState::Closed | LinkState::Linked)) => {
                debug!(remote = %remote, state = ?state, "ignoring establish signal");
            }
            Some(state) => {
                *state = LinkState::Linked;
                debug!(remote = %remote, "link established");
            }
            None => {
                debug!(remote = %remote, "establish signal for unknown link");
            }
        }
    }

    async fn on_offer(&mut self, from: ConnectionId, payload: Value) {
        let state = *self.links.entry(from.clone()).or_insert(LinkState::Idle);
        match state {
            LinkState::Idle | LinkState::OfferSent => {
                match self.negotiator.accept_offer(&from, payload).await {
                    Ok(answer) => {
                        if let Err(err) = self.outlet.send(SignalKind::Answer, from.clone(), answer)
                        {
                            warn!(remote = %from, error = %err, "failed to send answer");
                            self.fail_link(&from).await;
                            return;
                        }
                        // Only an offer that beat our own initiation moves
                        // the machine; an offer crossing ours belongs to the
                        // remote-initiated half-flow.
                        if state == LinkState::Idle {
                            self.links.insert(from.clone(), LinkState::OfferReceived);
                        }
                        debug!(remote = %from, "answered offer");
                    }
                    Err(err) => {
                        warn!(remote = %from, error = %err, "offer handling failed");
                        self.fail_link(&from).await;
                    }
                }
            }
            other => {
                debug!(remote = %from, state = ?other, "ignoring offer in this state");
            }
        }
    }

    async fn on_answer(&mut self, from: ConnectionId, payload: Value) {
        match self.links.get(&from).copied() {
            Some(LinkState::OfferSent) => {
                match self.negotiator.accept_answer(&from, payload).await {
                    Ok(()) => {
                        self.links.insert(from.clone(), LinkState::AnswerExchanged);
                        debug!(remote = %from, "answer applied");
                    }
                    Err(err) => {
                        warn!(remote = %from, error = %err, "answer handling failed");
                        self.fail_link(&from).await;
                    }
                }
            }
            // Duplicate or stale answers are never legal outside OfferSent.
            other => {
                warn!(remote = %from, state = ?other, "ignoring answer outside OfferSent");
            }
        }
    }

    async fn on_candidate(&mut self, from: ConnectionId, payload: Value) {
        match self.links.get(&from).copied() {
            Some(LinkState::Closed) | None => {
                debug!(remote = %from, "ignoring candidate for closed or unknown link");
            }
            Some(_) => {
                if let Err(err) = self.negotiator.add_candidate(&from, payload).await {
                    warn!(remote = %from, error = %err, "candidate handling failed");
                }
            }
        }
    }

    /// Peer left: destroy the link.
    async fn close_link(&mut self, remote: &ConnectionId) {
        if self.links.remove(remote).is_some() {
            self.negotiator.close(remote).await;
            debug!(remote = %remote, "link closed, peer left");
        }
    }

    /// Engine failure: the link stays around, terminally `Closed`.
    async fn fail_link(&mut self, remote: &ConnectionId) {
        self.links.insert(remote.clone(), LinkState::Closed);
        self.negotiator.close(remote).await;
    }

    async fn close_all(&mut self) {
        let remotes: Vec<ConnectionId> = self.links.keys().cloned().collect();
        for remote in remotes {
            self.close_link(&remote).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Offer(ConnectionId, Value),
        Answer(ConnectionId, Value),
        Candidate(ConnectionId, Value),
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Sent>>,
    }

    impl RecordingSink {
        fn drain(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().drain(..).collect()
        }
    }

    impl SignalSink for RecordingSink {
        fn send(
            &self,
            kind: SignalKind,
            to: ConnectionId,
            payload: Value,
        ) -> Result<(), EndpointError> {
            let sent = match kind {
                SignalKind::Offer => Sent::Offer(to, payload),
                SignalKind::Answer => Sent::Answer(to, payload),
                SignalKind::Candidate => Sent::Candidate(to, payload),
            };
            self.sent.lock().unwrap().push(sent);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeEngine {
        calls: Mutex<Vec<String>>,
        fail_offers: bool,
    }

    impl FakeEngine {
        fn failing() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_offers: true,
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl Negotiator for FakeEngine {
        async fn create_offer(&self, remote: &ConnectionId) -> Result<Value, EndpointError> {
            if self.fail_offers {
                return Err(EndpointError::Negotiation("engine down".into()));
            }
            self.record(format!("create_offer:{remote}"));
            Ok(json!({"sdp": format!("offer-for-{remote}")}))
        }

        async fn accept_offer(
            &self,
            remote: &ConnectionId,
            _offer: Value,
        ) -> Result<Value, EndpointError> {
            self.record(format!("accept_offer:{remote}"));
            Ok(json!({"sdp": format!("answer-for-{remote}")}))
        }

        async fn accept_answer(
            &self,
            remote: &ConnectionId,
            _answer: Value,
        ) -> Result<(), EndpointError> {
            self.record(format!("accept_answer:{remote}"));
            Ok(())
        }

        async fn add_candidate(
            &self,
            remote: &ConnectionId,
            _candidate: Value,
        ) -> Result<(), EndpointError> {
            self.record(format!("add_candidate:{remote}"));
            Ok(())
        }

        async fn close(&self, remote: &ConnectionId) {
            self.record(format!("close:{remote}"));
        }
    }

    fn links_with(engine: Arc<FakeEngine>) -> (PeerLinks, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let links = PeerLinks::new(ConnectionId::from("local"), sink.clone(), engine);
        (links, sink)
    }

    fn member(id: &str) -> MemberInfo {
        MemberInfo::new(ConnectionId::from(id), id)
    }

    #[tokio::test]
    async fn roster_adoption_initiates_toward_every_existing_member() {
        let engine = Arc::new(FakeEngine::default());
        let (mut links, sink) = links_with(engine.clone());

        links.adopt_roster(&[member("a"), member("b")]).await;

        assert_eq!(links.state_of(&"a".into()), Some(LinkState::OfferSent));
        assert_eq!(links.state_of(&"b".into()), Some(LinkState::OfferSent));
        let sent = sink.drain();
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[0], Sent::Offer(to, _) if to == &ConnectionId::from("a")));
        assert!(matches!(&sent[1], Sent::Offer(to, _) if to == &ConnectionId::from("b")));
    }

    #[tokio::test]
    async fn newly_joining_member_triggers_initiation() {
        let engine = Arc::new(FakeEngine::default());
        let (mut links, sink) = links_with(engine);

        links
            .handle_event(SessionEvent::MemberJoined(member("late")))
            .await;

        assert_eq!(links.state_of(&"late".into()), Some(LinkState::OfferSent));
        assert_eq!(sink.drain().len(), 1);
    }

    #[tokio::test]
    async fn offer_while_idle_is_answered() {
        let engine = Arc::new(FakeEngine::default());
        let (mut links, sink) = links_with(engine.clone());

        links
            .handle_event(SessionEvent::Signal {
                kind: SignalKind::Offer,
                from: "a".into(),
                payload: json!({"sdp": "remote-offer"}),
            })
            .await;

        assert_eq!(links.state_of(&"a".into()), Some(LinkState::OfferReceived));
        let sent = sink.drain();
        assert!(matches!(&sent[0], Sent::Answer(to, _) if to == &ConnectionId::from("a")));
        assert_eq!(engine.calls(), vec!["accept_offer:a"]);
    }

    #[tokio::test]
    async fn crossing_offers_are_answered_without_disturbing_our_half_flow() {
        let engine = Arc::new(FakeEngine::default());
        let (mut links, sink) = links_with(engine);

        links.initiate("a".into()).await;
        assert_eq!(links.state_of(&"a".into()), Some(LinkState::OfferSent));
        sink.drain();

        // The remote initiated too; its offer crosses ours on the wire.
        links
            .handle_event(SessionEvent::Signal {
                kind: SignalKind::Offer,
                from: "a".into(),
                payload: json!({"sdp": "their-offer"}),
            })
            .await;

        // We answered their half-flow, ours is still awaiting its answer.
        assert!(matches!(&sink.drain()[0], Sent::Answer(..)));
        assert_eq!(links.state_of(&"a".into()), Some(LinkState::OfferSent));

        links
            .handle_event(SessionEvent::Signal {
                kind: SignalKind::Answer,
                from: "a".into(),
                payload: json!({"sdp": "their-answer"}),
            })
            .await;
        assert_eq!(
            links.state_of(&"a".into()),
            Some(LinkState::AnswerExchanged)
        );
    }

    #[tokio::test]
    async fn answers_outside_offer_sent_are_ignored() {
        let engine = Arc::new(FakeEngine::default());
        let (mut links, _sink) = links_with(engine.clone());

        links.initiate("a".into()).await;
        links
            .handle_event(SessionEvent::Signal {
                kind: SignalKind::Answer,
                from: "a".into(),
                payload: json!({"sdp": "answer-1"}),
            })
            .await;
        assert_eq!(
            links.state_of(&"a".into()),
            Some(LinkState::AnswerExchanged)
        );

        // A duplicate answer from a stale handshake must not re-apply.
        links
            .handle_event(SessionEvent::Signal {
                kind: SignalKind::Answer,
                from: "a".into(),
                payload: json!({"sdp": "answer-2"}),
            })
            .await;
        assert_eq!(
            links.state_of(&"a".into()),
            Some(LinkState::AnswerExchanged)
        );
        let answer_applications = engine
            .calls()
            .iter()
            .filter(|c| c.starts_with("accept_answer"))
            .count();
        assert_eq!(answer_applications, 1);
    }

    #[tokio::test]
    async fn candidates_flow_to_the_engine_until_the_link_closes() {
        let engine = Arc::new(FakeEngine::default());
        let (mut links, _sink) = links_with(engine.clone());

        links.initiate("a".into()).await;
        links
            .handle_event(SessionEvent::Signal {
                kind: SignalKind::Candidate,
                from: "a".into(),
                payload: json!({"candidate": "c0"}),
            })
            .await;
        assert!(engine.calls().contains(&"add_candidate:a".to_string()));

        links
            .handle_event(SessionEvent::MemberLeft {
                connection_id: "a".into(),
                display_name: "a".into(),
            })
            .await;
        let before = engine.calls().len();
        links
            .handle_event(SessionEvent::Signal {
                kind: SignalKind::Candidate,
                from: "a".into(),
                payload: json!({"candidate": "c1"}),
            })
            .await;
        assert_eq!(engine.calls().len(), before);
    }

    #[tokio::test]
    async fn member_left_destroys_the_link() {
        let engine = Arc::new(FakeEngine::default());
        let (mut links, _sink) = links_with(engine.clone());

        links.initiate("a".into()).await;
        links
            .handle_event(SessionEvent::MemberLeft {
                connection_id: "a".into(),
                display_name: "a".into(),
            })
            .await;

        assert_eq!(links.state_of(&"a".into()), None);
        assert!(engine.calls().contains(&"close:a".to_string()));
    }

    #[tokio::test]
    async fn engine_failure_closes_the_link_terminally() {
        let engine = Arc::new(FakeEngine::failing());
        let (mut links, sink) = links_with(engine);

        links.initiate("a".into()).await;
        assert_eq!(links.state_of(&"a".into()), Some(LinkState::Closed));
        assert!(sink.drain().is_empty());

        // Closed is terminal: a later offer does not revive the link.
        links
            .handle_event(SessionEvent::Signal {
                kind: SignalKind::Offer,
                from: "a".into(),
                payload: json!({"sdp": "late-offer"}),
            })
            .await;
        assert_eq!(links.state_of(&"a".into()), Some(LinkState::Closed));
        assert!(sink.drain().is_empty());
    }

    #[tokio::test]
    async fn establish_signal_moves_the_link_to_linked() {
        let engine = Arc::new(FakeEngine::default());
        let (mut links, _sink) = links_with(engine);

        links.initiate("a".into()).await;
        links
            .handle_event(SessionEvent::Signal {
                kind: SignalKind::Answer,
                from: "a".into(),
                payload: json!({"sdp": "answer"}),
            })
            .await;
        links.mark_established(&"a".into());
        assert_eq!(links.state_of(&"a".into()), Some(LinkState::Linked));

        // Establish on a closed link is ignored.
        links
            .handle_event(SessionEvent::MemberLeft {
                connection_id: "a".into(),
                display_name: "a".into(),
            })
            .await;
        links.mark_established(&"a".into());
        assert_eq!(links.state_of(&"a".into()), None);
    }

    #[tokio::test]
    async fn disconnect_closes_every_link() {
        let engine = Arc::new(FakeEngine::default());
        let (mut links, _sink) = links_with(engine.clone());

        links.adopt_roster(&[member("a"), member("b")]).await;
        links.handle_event(SessionEvent::Disconnected).await;

        assert_eq!(links.state_of(&"a".into()), None);
        assert_eq!(links.state_of(&"b".into()), None);
        let closes = engine
            .calls()
            .iter()
            .filter(|c| c.starts_with("close:"))
            .count();
        assert_eq!(closes, 2);
    }

    #[tokio::test]
    async fn self_id_is_never_initiated() {
        let engine = Arc::new(FakeEngine::default());
        let (mut links, sink) = links_with(engine);

        links.initiate("local".into()).await;
        assert_eq!(links.state_of(&"local".into()), None);
        assert!(sink.drain().is_empty());
    }
}
