//! Call session controller.
//!
//! One task owns the `CallSession` and applies events from a single FIFO
//! queue, so transitions are serialized no matter which thread the UI,
//! the transport or the timer calls from. `CallHandle::handle` only enqueues.
//!
//! Tie-break: when a `UserAccept` is dequeued while a matching remote hang-up
//! or local close is already queued behind it, the accept is dropped and the
//! call ends without ever showing the active view.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::bridge::{check_identity, SignalBridge, SignalSources};
use super::session::{CallSession, Outcome};
use super::signaling::CallSignaler;
use super::timer::{RingTimer, TimerToken};
use super::{
    CallAction, CallDirection, CallError, CallIdentity, CallRequest, CallState, LifecycleCommand,
    SignalEvent,
};
use crate::config::{ServerLimits, CALL_TIMEOUT_LIMIT};

/// Ring timeout when the server advertises none, in seconds.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// Added to the ring timeout to absorb scheduling jitter.
pub const RING_GRACE: Duration = Duration::from_secs(5);

/// Stream of commands for the UI collaborator.
pub type CommandReceiver = mpsc::UnboundedReceiver<LifecycleCommand>;

/// How long an incoming call may ring before it is declined.
pub fn ring_duration(limits: &dyn ServerLimits) -> Duration {
    let secs = limits.server_limit(CALL_TIMEOUT_LIMIT, DEFAULT_CALL_TIMEOUT_SECS);
    Duration::from_secs(secs) + RING_GRACE
}

struct HandleInner {
    events: mpsc::UnboundedSender<SignalEvent>,
    shutdown: CancellationToken,
    identity: Option<CallIdentity>,
    state: watch::Receiver<CallState>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Cloneable entry point into a running controller.
///
/// Dropping the last clone disposes the controller.
#[derive(Clone)]
pub struct CallHandle {
    inner: Arc<HandleInner>,
}

impl CallHandle {
    /// Queue an event. Never blocks; rejects events for other calls and
    /// events sent after the controller stopped.
    pub fn handle(&self, event: SignalEvent) -> Result<(), CallError> {
        if self.inner.shutdown.is_cancelled() {
            tracing::warn!("Dropping {}: controller is closed", event.name());
            return Err(CallError::ControllerClosed);
        }
        if let Some(ref identity) = self.inner.identity {
            if let Err(e) = check_identity(identity, &event) {
                tracing::warn!("Dropping {}: {}", event.name(), e);
                return Err(e);
            }
        }
        let name = event.name();
        self.inner.events.send(event).map_err(|_| {
            tracing::warn!("Dropping {}: controller is gone", name);
            CallError::ControllerClosed
        })
    }

    pub fn on_user_accept(&self) -> Result<(), CallError> {
        self.handle(SignalEvent::UserAccept)
    }

    pub fn on_user_decline(&self) -> Result<(), CallError> {
        self.handle(SignalEvent::UserDecline)
    }

    /// Identity of the call, `None` if the request could not name one.
    pub fn identity(&self) -> Option<&CallIdentity> {
        self.inner.identity.as_ref()
    }

    pub fn state(&self) -> CallState {
        *self.inner.state.borrow()
    }

    /// Wait until the call reaches `target`. Returns false if the controller
    /// stopped in another state.
    pub async fn wait_for_state(&self, target: CallState) -> bool {
        let mut rx = self.inner.state.clone();
        let reached = rx.wait_for(|state| *state == target).await.is_ok();
        reached
    }

    /// Stop the controller. A live call is terminated without notifying the peer.
    pub fn dispose(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

/// Owner of one call session.
pub struct CallController {
    session: CallSession,
    timer: RingTimer,
    timer_token: Option<TimerToken>,
    bridge: SignalBridge,
    events: mpsc::UnboundedReceiver<SignalEvent>,
    /// Events pulled off the queue early by the tie-break check.
    pending: VecDeque<SignalEvent>,
    commands: mpsc::UnboundedSender<LifecycleCommand>,
    state: watch::Sender<CallState>,
    signaler: Arc<dyn CallSignaler>,
    shutdown: CancellationToken,
}

impl CallController {
    /// Create a session for `request` and spawn its controller.
    ///
    /// An unknown action creates nothing. A request without a usable
    /// identity yields a controller that is already terminated: its command
    /// stream carries a single `Terminate` so the UI never hangs on it.
    pub fn start(
        mut request: CallRequest,
        sources: &SignalSources,
        limits: &dyn ServerLimits,
        signaler: Arc<dyn CallSignaler>,
    ) -> Result<(CallHandle, CommandReceiver), CallError> {
        let direction = request.take_direction()?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let identity = match request.identity() {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!("Declining {:?} call: {}", direction, e);
                let _ = cmd_tx.send(LifecycleCommand::Terminate);
                let (_, state_rx) = watch::channel(CallState::Terminated);
                shutdown.cancel();
                let handle = CallHandle {
                    inner: Arc::new(HandleInner {
                        events: event_tx,
                        shutdown,
                        identity: None,
                        state: state_rx,
                    }),
                };
                return Ok((handle, cmd_rx));
            }
        };

        let session = CallSession::new(identity.clone(), direction);
        let (state_tx, state_rx) = watch::channel(session.state());

        let timer = RingTimer::new(event_tx.clone());
        let timer_token = match direction {
            CallDirection::Incoming => {
                let ring = ring_duration(limits);
                tracing::info!("{}: incoming call, ringing for up to {:?}", identity, ring);
                Some(timer.arm(ring))
            }
            CallDirection::Outgoing => {
                tracing::info!("{}: outgoing call", identity);
                None
            }
        };
        let bridge = SignalBridge::attach(identity.clone(), sources, event_tx.clone());

        let _ = cmd_tx.send(session.initial_command());

        let controller = CallController {
            session,
            timer,
            timer_token,
            bridge,
            events: event_rx,
            pending: VecDeque::new(),
            commands: cmd_tx,
            state: state_tx,
            signaler,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(controller.run());

        let handle = CallHandle {
            inner: Arc::new(HandleInner {
                events: event_tx,
                shutdown,
                identity: Some(identity),
                state: state_rx,
            }),
        };
        Ok((handle, cmd_rx))
    }

    async fn run(mut self) {
        loop {
            let event = match self.pending.pop_front() {
                Some(event) => event,
                None => tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    event = self.events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                },
            };
            self.dispatch(event);
        }

        let outcome = self.session.dispose();
        self.apply_outcome(outcome);
        self.release();
        tracing::debug!("{}: controller stopped", self.session.identity());
    }

    fn dispatch(&mut self, event: SignalEvent) {
        if event == SignalEvent::UserAccept
            && self.session.state() == CallState::AwaitingAnswer
            && self.termination_queued()
        {
            tracing::info!(
                "{}: accept superseded by a queued hang-up",
                self.session.identity()
            );
            return;
        }

        let outcome = self.session.apply(&event);
        self.apply_outcome(outcome);

        if self.session.is_terminated() {
            self.release();
        }
    }

    /// Pull everything already queued into `pending` and look for a
    /// matching external termination.
    fn termination_queued(&mut self) -> bool {
        while let Ok(event) = self.events.try_recv() {
            self.pending.push_back(event);
        }
        let identity = self.session.identity();
        self.pending
            .iter()
            .any(|e| e.is_external_termination() && e.identity() == Some(identity))
    }

    fn apply_outcome(&mut self, outcome: Outcome) {
        if outcome.cancel_timer {
            if let Some(token) = self.timer_token.take() {
                self.timer.cancel(token);
            }
        }
        if let Some(command) = outcome.command {
            self.state.send_replace(self.session.state());
            if self.commands.send(command).is_err() {
                tracing::debug!("{}: UI is gone, {:?} dropped", self.session.identity(), command);
            }
        }
        if let Some(action) = outcome.notify {
            self.notify(action);
        }
    }

    /// Send a call signal without waiting for it.
    fn notify(&self, action: CallAction) {
        let signaler = Arc::clone(&self.signaler);
        let identity = self.session.identity().clone();
        tokio::spawn(async move {
            if let Err(e) = signaler.send_call_signal(identity.clone(), action).await {
                let err = CallError::Notify {
                    reason: format!("{:#}", e),
                };
                tracing::warn!("{}: {}", identity, err);
            }
        });
    }

    /// Stop the timer and unsubscribe. Idempotent.
    fn release(&mut self) {
        if let Some(token) = self.timer_token.take() {
            self.timer.cancel(token);
        }
        self.timer.disarm();
        self.bridge.detach();
    }
}
