//! Call signaling state machine.
//!
//! One session per unordered pair of users, keyed by [`PairKey`]. Offers,
//! answers and ICE candidates are opaque; this module only decides which
//! relay is legal in which state and forwards through the room router.
//!
//! ```text
//! idle --initiate--> pending (calling / ringing)
//! pending --accept--> in-call
//! pending --reject | cancel | timeout--> ended
//! in-call --ice--> in-call (relayed verbatim)
//! in-call --end | peer disconnected | connection failed--> ended
//! ended --grace period--> idle (session freed)
//! ```
//!
//! An ended session lingers for a short grace window so late duplicate
//! termination events are absorbed. A fresh `initiate` during that window
//! cancels the grace timer and starts over.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::AbortHandle;
use tracing::{debug, info};

use courier_shared::protocol::ServerEvent;
use courier_shared::types::{MediaConstraints, UserId};

use crate::error::ServerError;
use crate::rooms::ConversationRoomRouter;

/// Order-independent identifier for a two-party session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    low: UserId,
    high: UserId,
}

impl PairKey {
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn involves(&self, user: UserId) -> bool {
        self.low == user || self.high == user
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Rejected,
    Cancelled,
    Timeout,
    Hangup,
    PeerDisconnected,
    ConnectionFailed,
    PeerUnreachable,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Rejected => "rejected",
            EndReason::Cancelled => "cancelled",
            EndReason::Timeout => "timeout",
            EndReason::Hangup => "hangup",
            EndReason::PeerDisconnected => "peer-disconnected",
            EndReason::ConnectionFailed => "connection-failed",
            EndReason::PeerUnreachable => "peer-unreachable",
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A call as seen by one of its two parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Calling,
    Ringing,
    InCall,
    Ended(EndReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Initiate {
        media: MediaConstraints,
        offer: Value,
    },
    Accept {
        answer: Value,
    },
    Reject {
        reason: Option<String>,
    },
    Ice {
        candidate: Value,
    },
    End,
    Failed {
        reason: Option<String>,
    },
}

impl CallEvent {
    fn name(&self) -> &'static str {
        match self {
            CallEvent::Initiate { .. } => "call_initiate",
            CallEvent::Accept { .. } => "call_accept",
            CallEvent::Reject { .. } => "call_reject",
            CallEvent::Ice { .. } => "call_ice",
            CallEvent::End => "call_end",
            CallEvent::Failed { .. } => "call_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    InCall,
    Ended(EndReason),
}

struct CallSession {
    initiator: UserId,
    receiver: UserId,
    media: MediaConstraints,
    phase: Phase,
    /// Distinguishes successive sessions of the same pair for timers.
    epoch: u64,
    /// Ring timeout while pending, grace timer once ended.
    timer: Option<AbortHandle>,
}

impl CallSession {
    fn is_active(&self) -> bool {
        !matches!(self.phase, Phase::Ended(_))
    }

    fn peer_of(&self, user: UserId) -> UserId {
        if user == self.initiator {
            self.receiver
        } else {
            self.initiator
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn state_for(&self, user: UserId) -> CallState {
        match self.phase {
            Phase::Pending if user == self.initiator => CallState::Calling,
            Phase::Pending => CallState::Ringing,
            Phase::InCall => CallState::InCall,
            Phase::Ended(reason) => CallState::Ended(reason),
        }
    }
}

#[derive(Default)]
struct Slot {
    session: Option<CallSession>,
    /// Set when the grace timer frees the slot; holders must look it up again.
    retired: bool,
}

#[derive(Clone)]
pub struct CallSignalingStateMachine {
    slots: Arc<RwLock<HashMap<PairKey, Arc<Mutex<Slot>>>>>,
    router: ConversationRoomRouter,
    ring_timeout: Duration,
    end_grace: Duration,
    epochs: Arc<AtomicU64>,
}

impl CallSignalingStateMachine {
    pub fn new(router: ConversationRoomRouter, ring_timeout: Duration, end_grace: Duration) -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            router,
            ring_timeout,
            end_grace,
            epochs: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Apply `event` sent by `from` about their call with `to`. Illegal
    /// events leave the session untouched.
    pub async fn handle(
        &self,
        from: UserId,
        to: UserId,
        event: CallEvent,
    ) -> Result<(), ServerError> {
        if from == to {
            return Err(ServerError::IllegalTransition(format!(
                "{}: cannot call yourself",
                event.name()
            )));
        }
        let pair = PairKey::new(from, to);
        let creates = matches!(event, CallEvent::Initiate { .. });

        loop {
            let slot = if creates {
                self.slot(pair).await
            } else {
                match self.existing_slot(pair).await {
                    Some(slot) => slot,
                    None => {
                        return Err(ServerError::IllegalTransition(format!(
                            "{}: no call in progress",
                            event.name()
                        )))
                    }
                }
            };

            let mut guard = slot.lock().await;
            if guard.retired {
                continue;
            }
            return self.apply(&mut guard, pair, from, to, event).await;
        }
    }

    async fn apply(
        &self,
        slot: &mut Slot,
        pair: PairKey,
        from: UserId,
        to: UserId,
        event: CallEvent,
    ) -> Result<(), ServerError> {
        let name = event.name();
        let illegal = |why: &str| ServerError::IllegalTransition(format!("{name}: {why}"));

        if let CallEvent::Initiate { media, offer } = event {
            if slot.session.as_ref().is_some_and(|s| s.is_active()) {
                return Err(illegal("a call is already active for this pair"));
            }
            if let Some(mut previous) = slot.session.take() {
                previous.cancel_timer();
            }

            let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
            slot.session = Some(CallSession {
                initiator: from,
                receiver: to,
                media,
                phase: Phase::Pending,
                epoch,
                timer: None,
            });
            info!(from = %from, to = %to, audio = media.audio, video = media.video, "Call initiated");

            let invite = ServerEvent::IncomingCall {
                from_user_id: from,
                offer,
                media,
            };
            self.relay_or_end(slot, pair, from, to, invite).await?;

            let timer = self.spawn_ring_timer(pair, epoch);
            if let Some(session) = slot.session.as_mut() {
                session.timer = Some(timer);
            }
            return Ok(());
        }

        let Some(session) = slot.session.as_mut() else {
            return Err(illegal("no call in progress"));
        };
        let receiver = session.receiver;
        let initiator = session.initiator;

        match (session.phase, event) {
            (Phase::Pending, CallEvent::Accept { answer }) if from == receiver => {
                session.cancel_timer();
                session.phase = Phase::InCall;
                info!(initiator = %initiator, receiver = %receiver, "Call answered");
                let event = ServerEvent::CallAnswer {
                    from_user_id: from,
                    answer,
                };
                self.relay_or_end(slot, pair, from, to, event).await
            }
            (Phase::Pending, CallEvent::Reject { reason }) if from == receiver => {
                self.end_session(slot, pair, EndReason::Rejected);
                let event = ServerEvent::CallRejected {
                    from_user_id: from,
                    reason,
                };
                self.notify(to, event).await;
                Ok(())
            }
            (Phase::Pending, CallEvent::End) => {
                if from == initiator {
                    self.end_session(slot, pair, EndReason::Cancelled);
                    self.notify(to, ended_event(from, EndReason::Cancelled)).await;
                } else {
                    // Hanging up while ringing is declining.
                    self.end_session(slot, pair, EndReason::Rejected);
                    let event = ServerEvent::CallRejected {
                        from_user_id: from,
                        reason: None,
                    };
                    self.notify(to, event).await;
                }
                Ok(())
            }
            (Phase::InCall, CallEvent::Ice { candidate }) => {
                debug!(from = %from, to = %to, "Relaying ICE candidate");
                let event = ServerEvent::IceCandidate {
                    from_user_id: from,
                    candidate,
                };
                self.relay_or_end(slot, pair, from, to, event).await
            }
            (Phase::InCall, CallEvent::End) => {
                self.end_session(slot, pair, EndReason::Hangup);
                self.notify(to, ended_event(from, EndReason::Hangup)).await;
                Ok(())
            }
            (Phase::Pending | Phase::InCall, CallEvent::Failed { reason }) => {
                info!(from = %from, reason = ?reason, "Call media negotiation failed");
                self.end_session(slot, pair, EndReason::ConnectionFailed);
                self.notify(to, ended_event(from, EndReason::ConnectionFailed))
                    .await;
                Ok(())
            }
            // Late duplicates of a termination are absorbed.
            (Phase::Ended(_), CallEvent::End | CallEvent::Reject { .. } | CallEvent::Failed { .. }) => {
                debug!(from = %from, event = name, "Absorbed late termination");
                Ok(())
            }
            (Phase::Pending, CallEvent::Accept { .. } | CallEvent::Reject { .. }) => {
                Err(illegal("only the callee can answer or decline"))
            }
            (Phase::Pending, CallEvent::Ice { .. }) => {
                Err(illegal("candidates are only relayed once the call is answered"))
            }
            (Phase::InCall, _) => Err(illegal("call already in progress")),
            (Phase::Ended(_), _) => Err(illegal("call has ended")),
            (Phase::Pending, CallEvent::Initiate { .. }) => {
                Err(illegal("a call is already active for this pair"))
            }
        }
    }

    /// Relay to `to`; if they are gone, end the session and tell `from`.
    async fn relay_or_end(
        &self,
        slot: &mut Slot,
        pair: PairKey,
        from: UserId,
        to: UserId,
        event: ServerEvent,
    ) -> Result<(), ServerError> {
        match self.router.relay_to_user(to, event).await {
            Ok(()) => Ok(()),
            Err(err) => {
                info!(from = %from, to = %to, "Call peer unreachable");
                self.end_session(slot, pair, EndReason::PeerUnreachable);
                self.notify(from, ended_event(to, EndReason::PeerUnreachable))
                    .await;
                Err(err)
            }
        }
    }

    /// Best-effort notification; an offline party has nothing to update.
    async fn notify(&self, user: UserId, event: ServerEvent) {
        if let Err(err) = self.router.relay_to_user(user, event).await {
            debug!(user = %user, error = %err, "Call notification dropped");
        }
    }

    fn end_session(&self, slot: &mut Slot, pair: PairKey, reason: EndReason) {
        let Some(session) = slot.session.as_mut() else {
            return;
        };
        session.cancel_timer();
        session.phase = Phase::Ended(reason);
        session.timer = Some(self.spawn_grace_timer(pair, session.epoch));
        info!(
            initiator = %session.initiator,
            receiver = %session.receiver,
            reason = %reason,
            "Call ended"
        );
    }

    fn spawn_ring_timer(&self, pair: PairKey, epoch: u64) -> AbortHandle {
        let machine = self.clone();
        let delay = self.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            machine.ring_expired(pair, epoch).await;
        })
        .abort_handle()
    }

    fn spawn_grace_timer(&self, pair: PairKey, epoch: u64) -> AbortHandle {
        let machine = self.clone();
        let delay = self.end_grace;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            machine.grace_expired(pair, epoch).await;
        })
        .abort_handle()
    }

    async fn ring_expired(&self, pair: PairKey, epoch: u64) {
        let slot = self.existing_slot(pair).await;
        let Some(slot) = slot else {
            return;
        };
        let mut guard = slot.lock().await;
        let (initiator, receiver) = match guard.session.as_mut() {
            Some(session) if session.epoch == epoch && session.phase == Phase::Pending => {
                // This task is the timer; don't abort ourselves.
                session.timer = None;
                (session.initiator, session.receiver)
            }
            _ => return,
        };

        self.end_session(&mut guard, pair, EndReason::Timeout);
        self.notify(initiator, ended_event(receiver, EndReason::Timeout))
            .await;
        self.notify(receiver, ended_event(initiator, EndReason::Timeout))
            .await;
    }

    async fn grace_expired(&self, pair: PairKey, epoch: u64) {
        let mut slots = self.slots.write().await;
        let Some(slot) = slots.get(&pair).cloned() else {
            return;
        };
        let mut guard = slot.lock().await;
        match &guard.session {
            Some(session) if session.epoch == epoch && !session.is_active() => {}
            _ => return,
        }
        guard.session = None;
        guard.retired = true;
        slots.remove(&pair);
        debug!(?pair, "Call session freed");
    }

    /// End every live call involving `user` and tell the other party.
    pub async fn peer_disconnected(&self, user: UserId) {
        let affected: Vec<(PairKey, Arc<Mutex<Slot>>)> = self
            .slots
            .read()
            .await
            .iter()
            .filter(|(pair, _)| pair.involves(user))
            .map(|(pair, slot)| (*pair, slot.clone()))
            .collect();

        for (pair, slot) in affected {
            let mut guard = slot.lock().await;
            let peer = match guard.session.as_ref() {
                Some(session) if session.is_active() => session.peer_of(user),
                _ => continue,
            };
            self.end_session(&mut guard, pair, EndReason::PeerDisconnected);
            self.notify(peer, ended_event(user, EndReason::PeerDisconnected))
                .await;
        }
    }

    /// Call state between `user` and `other`, from `user`'s side.
    pub async fn state_of(&self, user: UserId, other: UserId) -> CallState {
        let Some(slot) = self.existing_slot(PairKey::new(user, other)).await else {
            return CallState::Idle;
        };
        let guard = slot.lock().await;
        guard
            .session
            .as_ref()
            .map(|session| session.state_for(user))
            .unwrap_or(CallState::Idle)
    }

    pub async fn media_of(&self, a: UserId, b: UserId) -> Option<MediaConstraints> {
        let slot = self.existing_slot(PairKey::new(a, b)).await?;
        let guard = slot.lock().await;
        guard.session.as_ref().map(|s| s.media)
    }

    /// Sessions that are ringing or connected.
    pub async fn active_count(&self) -> usize {
        let slots: Vec<Arc<Mutex<Slot>>> = self.slots.read().await.values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if slot
                .lock()
                .await
                .session
                .as_ref()
                .is_some_and(|s| s.is_active())
            {
                count += 1;
            }
        }
        count
    }

    /// Pairs with any session, including ended ones still in their grace window.
    pub async fn tracked_pairs(&self) -> usize {
        self.slots.read().await.len()
    }

    async fn existing_slot(&self, pair: PairKey) -> Option<Arc<Mutex<Slot>>> {
        self.slots.read().await.get(&pair).cloned()
    }

    async fn slot(&self, pair: PairKey) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.existing_slot(pair).await {
            return slot;
        }
        self.slots.write().await.entry(pair).or_default().clone()
    }
}

fn ended_event(from: UserId, reason: EndReason) -> ServerEvent {
    ServerEvent::CallEnded {
        from_user_id: from,
        reason: Some(reason.as_str().to_string()),
    }
}
