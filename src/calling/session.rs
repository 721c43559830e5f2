//! Call session state machine.
//!
//! Pure transition logic with no I/O: `apply` decides the next state and
//! reports what the controller has to do about it.

use super::bridge::check_identity;
use super::{CallAction, CallDirection, CallIdentity, CallState, LifecycleCommand, SignalEvent};

/// Side effects of one applied event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Command for the UI collaborator. Set iff the state changed.
    pub command: Option<LifecycleCommand>,
    /// Signal to send to the peer.
    pub notify: Option<CallAction>,
    /// The ring timer must be cancelled.
    pub cancel_timer: bool,
}

impl Outcome {
    fn ignored() -> Self {
        Self::default()
    }

    fn show_active() -> Self {
        Self {
            command: Some(LifecycleCommand::ShowActive),
            notify: None,
            cancel_timer: true,
        }
    }

    fn terminate(notify: Option<CallAction>, cancel_timer: bool) -> Self {
        Self {
            command: Some(LifecycleCommand::Terminate),
            notify,
            cancel_timer,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.command.is_none()
    }
}

#[derive(Debug)]
pub struct CallSession {
    identity: CallIdentity,
    direction: CallDirection,
    state: CallState,
}

impl CallSession {
    pub fn new(identity: CallIdentity, direction: CallDirection) -> Self {
        let state = match direction {
            CallDirection::Incoming => CallState::AwaitingAnswer,
            // The caller sees its own call as active right away.
            CallDirection::Outgoing => CallState::Active,
        };
        Self {
            identity,
            direction,
            state,
        }
    }

    pub fn identity(&self) -> &CallIdentity {
        &self.identity
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == CallState::Terminated
    }

    /// Command that shows the initial view.
    pub fn initial_command(&self) -> LifecycleCommand {
        match self.state {
            CallState::AwaitingAnswer => LifecycleCommand::ShowIncoming,
            CallState::Active => LifecycleCommand::ShowActive,
            CallState::Terminated => LifecycleCommand::Terminate,
        }
    }

    /// Apply one event.
    pub fn apply(&mut self, event: &SignalEvent) -> Outcome {
        if self.state == CallState::Terminated {
            tracing::debug!("{}: {} after termination ignored", self.identity, event.name());
            return Outcome::ignored();
        }

        if let Err(e) = check_identity(&self.identity, event) {
            tracing::warn!("{}: {} rejected: {}", self.identity, event.name(), e);
            return Outcome::ignored();
        }

        let (next, outcome) = match (self.state, event) {
            (CallState::AwaitingAnswer, SignalEvent::UserAccept) => {
                (CallState::Active, Outcome::show_active())
            }
            (CallState::AwaitingAnswer, SignalEvent::UserDecline) => (
                CallState::Terminated,
                Outcome::terminate(Some(CallAction::HangUp), true),
            ),
            // The timer already fired; nothing left to cancel.
            (CallState::AwaitingAnswer, SignalEvent::RingTimeout) => (
                CallState::Terminated,
                Outcome::terminate(Some(CallAction::HangUp), false),
            ),
            // The peer already knows: no echo.
            (CallState::AwaitingAnswer, SignalEvent::RemoteHangup { .. })
            | (CallState::AwaitingAnswer, SignalEvent::LocalClose { .. }) => {
                (CallState::Terminated, Outcome::terminate(None, true))
            }
            (CallState::Active, SignalEvent::RemoteHangup { .. })
            | (CallState::Active, SignalEvent::LocalClose { .. }) => {
                (CallState::Terminated, Outcome::terminate(None, false))
            }
            (CallState::Active, SignalEvent::UserDecline) => (
                CallState::Terminated,
                Outcome::terminate(Some(CallAction::HangUp), false),
            ),
            (state, event) => {
                tracing::debug!(
                    "{}: {} has no effect in state {}",
                    self.identity,
                    event.name(),
                    state.as_str()
                );
                return Outcome::ignored();
            }
        };

        tracing::info!(
            "{}: {} -> {} on {}",
            self.identity,
            self.state.as_str(),
            next.as_str(),
            event.name()
        );
        self.state = next;
        outcome
    }

    /// End the session because its owner went away. The peer is not told.
    pub fn dispose(&mut self) -> Outcome {
        if self.state == CallState::Terminated {
            return Outcome::ignored();
        }
        tracing::info!(
            "{}: {} -> terminated on dispose",
            self.identity,
            self.state.as_str()
        );
        let cancel_timer = self.state == CallState::AwaitingAnswer;
        self.state = CallState::Terminated;
        Outcome::terminate(None, cancel_timer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(topic: &str, seq: i64) -> CallIdentity {
        CallIdentity::new(topic, seq).unwrap()
    }

    fn incoming() -> CallSession {
        CallSession::new(id("usrA", 10), CallDirection::Incoming)
    }

    fn all_events(identity: &CallIdentity) -> Vec<SignalEvent> {
        vec![
            SignalEvent::UserAccept,
            SignalEvent::UserDecline,
            SignalEvent::RingTimeout,
            SignalEvent::RemoteHangup { identity: identity.clone() },
            SignalEvent::LocalClose { identity: identity.clone() },
        ]
    }

    #[test]
    fn test_initial_states() {
        let s = incoming();
        assert_eq!(s.state(), CallState::AwaitingAnswer);
        assert_eq!(s.initial_command(), LifecycleCommand::ShowIncoming);

        let s = CallSession::new(id("usrA", 10), CallDirection::Outgoing);
        assert_eq!(s.state(), CallState::Active);
        assert_eq!(s.initial_command(), LifecycleCommand::ShowActive);
    }

    #[test]
    fn test_accept() {
        let mut s = incoming();
        let out = s.apply(&SignalEvent::UserAccept);
        assert_eq!(out, Outcome::show_active());
        assert_eq!(s.state(), CallState::Active);

        // A second accept does nothing.
        assert!(s.apply(&SignalEvent::UserAccept).is_noop());
        assert_eq!(s.state(), CallState::Active);
    }

    #[test]
    fn test_decline_notifies_peer() {
        let mut s = incoming();
        let out = s.apply(&SignalEvent::UserDecline);
        assert_eq!(out.command, Some(LifecycleCommand::Terminate));
        assert_eq!(out.notify, Some(CallAction::HangUp));
        assert!(out.cancel_timer);
        assert!(s.is_terminated());
    }

    #[test]
    fn test_ring_timeout_counts_as_decline() {
        let mut s = incoming();
        let out = s.apply(&SignalEvent::RingTimeout);
        assert_eq!(out.command, Some(LifecycleCommand::Terminate));
        assert_eq!(out.notify, Some(CallAction::HangUp));
        assert!(s.is_terminated());
    }

    #[test]
    fn test_remote_hangup_does_not_echo() {
        let mut s = incoming();
        let out = s.apply(&SignalEvent::RemoteHangup { identity: id("usrA", 10) });
        assert_eq!(out.command, Some(LifecycleCommand::Terminate));
        assert_eq!(out.notify, None);
        assert!(out.cancel_timer);
    }

    #[test]
    fn test_active_termination_paths() {
        let mut s = incoming();
        s.apply(&SignalEvent::UserAccept);
        let out = s.apply(&SignalEvent::UserDecline);
        assert_eq!(out.command, Some(LifecycleCommand::Terminate));
        assert_eq!(out.notify, Some(CallAction::HangUp));

        let mut s = CallSession::new(id("usrA", 10), CallDirection::Outgoing);
        let out = s.apply(&SignalEvent::LocalClose { identity: id("usrA", 10) });
        assert_eq!(out.command, Some(LifecycleCommand::Terminate));
        assert_eq!(out.notify, None);
        // Replayed close is absorbed.
        assert!(s
            .apply(&SignalEvent::LocalClose { identity: id("usrA", 10) })
            .is_noop());
    }

    #[test]
    fn test_ring_timeout_while_active_ignored() {
        let mut s = incoming();
        s.apply(&SignalEvent::UserAccept);
        assert!(s.apply(&SignalEvent::RingTimeout).is_noop());
        assert_eq!(s.state(), CallState::Active);
    }

    #[test]
    fn test_terminated_is_absorbing() {
        let identity = id("usrA", 10);
        for first in all_events(&identity).into_iter().skip(1) {
            let mut s = incoming();
            assert_eq!(s.apply(&first).command, Some(LifecycleCommand::Terminate));
            assert!(s.is_terminated());
            for event in all_events(&identity) {
                assert!(s.apply(&event).is_noop(), "{} re-emitted", event.name());
                assert!(s.is_terminated());
            }
        }
    }

    #[test]
    fn test_mismatched_identity_ignored() {
        let mut s = CallSession::new(id("A", 5), CallDirection::Incoming);
        assert!(s.apply(&SignalEvent::RemoteHangup { identity: id("B", 7) }).is_noop());
        assert!(s.apply(&SignalEvent::LocalClose { identity: id("A", 4) }).is_noop());
        assert_eq!(s.state(), CallState::AwaitingAnswer);
    }

    #[test]
    fn test_exactly_one_exit_from_awaiting() {
        let identity = id("usrA", 10);
        for first in all_events(&identity) {
            let mut s = incoming();
            let mut commands = Vec::new();
            commands.extend(s.apply(&first).command);
            for event in all_events(&identity) {
                commands.extend(s.apply(&event).command);
            }
            let exits = commands
                .iter()
                .take_while(|c| **c != LifecycleCommand::Terminate)
                .count();
            // At most one ShowActive before a single Terminate.
            assert!(exits <= 1, "{:?}", commands);
            assert_eq!(
                commands
                    .iter()
                    .filter(|c| **c == LifecycleCommand::Terminate)
                    .count(),
                1,
                "{:?}",
                commands
            );
        }
    }

    #[test]
    fn test_dispose() {
        let mut s = incoming();
        let out = s.dispose();
        assert_eq!(out.command, Some(LifecycleCommand::Terminate));
        assert_eq!(out.notify, None);
        assert!(out.cancel_timer);
        assert!(s.dispose().is_noop());
    }
}
