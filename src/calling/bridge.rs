//! Signaling event bridge: turns remote info messages and local close
//! requests into `SignalEvent`s for one call.
//!
//! `SignalSources` stands in for the messaging SDK's listener list and the
//! local broadcast manager. Each live call registers its event queue there
//! when the session starts and unregisters exactly once when it ends.
//! Delivery is synchronous: by the time `on_remote_info` or
//! `on_local_close_request` returns, the event sits in the controller's
//! queue, so it is ordered against everything enqueued afterwards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::{CallError, CallIdentity, CloseRequest, InfoMessage, SignalEvent};

struct Subscriber {
    target: CallIdentity,
    sink: mpsc::UnboundedSender<SignalEvent>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<u64, Subscriber>,
}

/// Inbound notification sources shared by the whole client.
#[derive(Clone, Default)]
pub struct SignalSources {
    registry: Arc<Mutex<Registry>>,
}

impl SignalSources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an info message from the signaling transport.
    pub fn publish_info(&self, info: InfoMessage) {
        if self.deliver(|target| translate_info(target, &info)) == 0 {
            tracing::debug!("Info '{}' on '{}' matched no call", info.what, info.topic);
        }
    }

    /// Transport callback: `{topic, seq, what, event}` info event arrived.
    pub fn on_remote_info(&self, identity: &CallIdentity, kind: &str, action: &str) {
        self.publish_info(InfoMessage::new(identity, kind, action));
    }

    /// Local notification subsystem asked to close a call.
    pub fn on_local_close_request(&self, request: CloseRequest) {
        if self.deliver(|target| translate_close(target, &request)) == 0 {
            tracing::debug!("Close request for {}:{} matched no call", request.topic, request.seq);
        }
    }

    /// Live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn subscribe(&self, target: CallIdentity, sink: mpsc::UnboundedSender<SignalEvent>) -> u64 {
        let mut registry = self.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.insert(id, Subscriber { target, sink });
        id
    }

    fn unsubscribe(&self, id: u64) -> bool {
        self.lock().subscribers.remove(&id).is_some()
    }

    /// Translate for every subscriber and enqueue matches inline. Returns
    /// how many queues took an event.
    fn deliver<F>(&self, translate: F) -> usize
    where
        F: Fn(&CallIdentity) -> Option<SignalEvent>,
    {
        let registry = self.lock();
        let mut delivered = 0;
        for subscriber in registry.subscribers.values() {
            let Some(event) = translate(&subscriber.target) else {
                continue;
            };
            if subscriber.sink.send(event).is_ok() {
                delivered += 1;
            } else {
                tracing::debug!("Call {} no longer takes events", subscriber.target);
            }
        }
        delivered
    }
}

/// Translate an info message for `target`. Only call hang-ups addressed to
/// exactly this call pass.
pub fn translate_info(target: &CallIdentity, info: &InfoMessage) -> Option<SignalEvent> {
    if !info.is_call_hangup() {
        return None;
    }
    match info.identity() {
        Ok(identity) if &identity == target => {
            tracing::debug!("Remote hangup: {}", identity);
            Some(SignalEvent::RemoteHangup { identity })
        }
        Ok(identity) => {
            tracing::debug!("Ignoring hang-up for {} (bridge is for {})", identity, target);
            None
        }
        Err(e) => {
            tracing::warn!("Ignoring malformed hang-up info on '{}': {}", info.topic, e);
            None
        }
    }
}

pub fn translate_close(target: &CallIdentity, request: &CloseRequest) -> Option<SignalEvent> {
    match request.identity() {
        Ok(identity) if &identity == target => Some(SignalEvent::LocalClose { identity }),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!("Ignoring malformed close request: {}", e);
            None
        }
    }
}

/// Per-call subscription to [`SignalSources`].
pub struct SignalBridge {
    target: CallIdentity,
    sources: SignalSources,
    subscription: Option<u64>,
}

impl SignalBridge {
    /// Register `sink` for events addressed to `target`. Anything published
    /// after this returns is delivered.
    pub fn attach(
        target: CallIdentity,
        sources: &SignalSources,
        sink: mpsc::UnboundedSender<SignalEvent>,
    ) -> Self {
        let subscription = sources.subscribe(target.clone(), sink);
        tracing::debug!("Signal bridge #{} attached for {}", subscription, target);
        Self {
            target,
            sources: sources.clone(),
            subscription: Some(subscription),
        }
    }

    /// Unsubscribe. Only the first call does anything; nothing is delivered
    /// once it returns.
    pub fn detach(&mut self) -> bool {
        let Some(subscription) = self.subscription.take() else {
            return false;
        };
        self.sources.unsubscribe(subscription);
        tracing::debug!("Signal bridge #{} detached for {}", subscription, self.target);
        true
    }

    pub fn is_attached(&self) -> bool {
        self.subscription.is_some()
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Validate an event's identity against the session it is addressed to.
pub fn check_identity(expected: &CallIdentity, event: &SignalEvent) -> Result<(), CallError> {
    match event.identity() {
        Some(identity) if identity != expected => Err(CallError::InvalidIdentity {
            reason: format!("event for {} delivered to {}", identity, expected),
        }),
        _ => Ok(()),
    }
}
