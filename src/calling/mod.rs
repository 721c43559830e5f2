//! Call session lifecycle: identity, events, and the controller that ties
//! timer, signaling bridge and UI commands together.
//!
//! This handles call state only (no media streaming).

pub mod bridge;
pub mod controller;
pub mod session;
pub mod signaling;
pub mod timer;

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Intent action for a call started by the server (someone is calling us).
pub const INTENT_ACTION_CALL_INCOMING: &str = "tindroidx.intent.action.call.INCOMING";
/// Intent action for a call started by the current user.
pub const INTENT_ACTION_CALL_START: &str = "tindroidx.intent.action.call.START";

/// `what` value of info messages that concern calls.
pub const INFO_WHAT_CALL: &str = "call";

/// Errors raised by the call lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("invalid call identity: {reason}")]
    InvalidIdentity { reason: String },

    #[error("call request has no resolvable peer topic")]
    MissingPeerTopic,

    #[error("unknown call action '{action}'")]
    UnknownCallAction { action: String },

    #[error("call controller is closed")]
    ControllerClosed,

    #[error("failed to notify peer: {reason}")]
    Notify { reason: String },
}

/// Uniquely names one call session: the p2p topic plus the call's message
/// sequence number within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallIdentity {
    topic: String,
    seq: i64,
}

impl CallIdentity {
    /// Build an identity, rejecting an empty topic or a negative sequence
    /// number (`-1` is what the push layer uses for "absent").
    pub fn new(topic: impl Into<String>, seq: i64) -> Result<Self, CallError> {
        let topic = topic.into();
        if topic.trim().is_empty() {
            return Err(CallError::InvalidIdentity {
                reason: "empty topic".to_string(),
            });
        }
        if seq < 0 {
            return Err(CallError::InvalidIdentity {
                reason: format!("negative sequence number {}", seq),
            });
        }
        Ok(Self { topic, seq })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn seq(&self) -> i64 {
        self.seq
    }
}

impl fmt::Display for CallIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.seq)
    }
}

/// Parses `topic:seq`. The topic itself may contain colons, so the split is
/// on the last one.
impl FromStr for CallIdentity {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (topic, seq) = s.rsplit_once(':').ok_or_else(|| CallError::InvalidIdentity {
            reason: format!("expected topic:seq, got '{}'", s),
        })?;
        let seq = seq.parse::<i64>().map_err(|e| CallError::InvalidIdentity {
            reason: format!("bad sequence number '{}': {}", seq, e),
        })?;
        Self::new(topic, seq)
    }
}

/// Who started the call. Fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Call lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    AwaitingAnswer,
    Active,
    Terminated,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::AwaitingAnswer => "awaiting-answer",
            CallState::Active => "active",
            CallState::Terminated => "terminated",
        }
    }
}

/// Normalized input to the controller, whatever its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    /// The peer (or server on its behalf) hung up.
    RemoteHangup { identity: CallIdentity },
    /// A local component (push notification) asked to close the call.
    LocalClose { identity: CallIdentity },
    UserAccept,
    /// Decline while ringing, hang up once active.
    UserDecline,
    RingTimeout,
}

impl SignalEvent {
    /// Identity carried by the event, if any. User and timer events carry
    /// none; they always refer to the controller's own session.
    pub fn identity(&self) -> Option<&CallIdentity> {
        match self {
            SignalEvent::RemoteHangup { identity } | SignalEvent::LocalClose { identity } => {
                Some(identity)
            }
            SignalEvent::UserAccept | SignalEvent::UserDecline | SignalEvent::RingTimeout => None,
        }
    }

    /// True for terminations that did not originate from this client's user.
    pub fn is_external_termination(&self) -> bool {
        matches!(
            self,
            SignalEvent::RemoteHangup { .. } | SignalEvent::LocalClose { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            SignalEvent::RemoteHangup { .. } => "remote-hangup",
            SignalEvent::LocalClose { .. } => "local-close",
            SignalEvent::UserAccept => "user-accept",
            SignalEvent::UserDecline => "user-decline",
            SignalEvent::RingTimeout => "ring-timeout",
        }
    }
}

/// Instruction to the UI collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleCommand {
    ShowIncoming,
    ShowActive,
    Terminate,
}

/// Outbound call signal sent to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallAction {
    HangUp,
}

impl CallAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallAction::HangUp => "hang-up",
        }
    }
}

/// Server info message (`{info: {...}}` on the wire).
///
/// Only `what == "call"` messages matter here; the rest of the client uses
/// the same message for read/recv/typing notifications.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InfoMessage {
    pub topic: String,
    #[serde(default = "absent_seq")]
    pub seq: i64,
    pub what: String,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
}

fn absent_seq() -> i64 {
    -1
}

impl InfoMessage {
    pub fn new(identity: &CallIdentity, what: &str, event: &str) -> Self {
        Self {
            topic: identity.topic().to_string(),
            seq: identity.seq(),
            what: what.to_string(),
            event: Some(event.to_string()),
            from: None,
        }
    }

    pub fn identity(&self) -> Result<CallIdentity, CallError> {
        CallIdentity::new(self.topic.clone(), self.seq)
    }

    /// True for `{what: "call", event: "hang-up"}`.
    pub fn is_call_hangup(&self) -> bool {
        self.what == INFO_WHAT_CALL && self.event.as_deref() == Some(CallAction::HangUp.as_str())
    }
}

/// Try to parse an info message from a server frame.
///
/// Accepts either the bare message or the `{"info": {...}}` envelope.
pub fn parse_info_message(json_str: &str) -> Option<InfoMessage> {
    let v: serde_json::Value = serde_json::from_str(json_str).ok()?;

    if let Some(info) = v.get("info") {
        return serde_json::from_value(info.clone()).ok();
    }

    if v.get("what").is_some() {
        return serde_json::from_value(v).ok();
    }

    None
}

/// Local request to close a call, e.g. from a push notification that
/// reports the remote hang-up before the signaling channel does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    pub topic: String,
    pub seq: i64,
}

impl CloseRequest {
    pub fn identity(&self) -> Result<CallIdentity, CallError> {
        CallIdentity::new(self.topic.clone(), self.seq)
    }
}

impl From<&CallIdentity> for CloseRequest {
    fn from(identity: &CallIdentity) -> Self {
        Self {
            topic: identity.topic().to_string(),
            seq: identity.seq(),
        }
    }
}

/// External action that creates a call session.
///
/// The action is consumed on first use so a redelivered request cannot
/// start a second session.
#[derive(Debug, Clone, Default)]
pub struct CallRequest {
    action: Option<String>,
    pub topic: Option<String>,
    pub seq: Option<i64>,
}

impl CallRequest {
    pub fn new(action: impl Into<String>, topic: Option<String>, seq: Option<i64>) -> Self {
        Self {
            action: Some(action.into()),
            topic,
            seq,
        }
    }

    pub fn incoming(identity: &CallIdentity) -> Self {
        Self::new(
            INTENT_ACTION_CALL_INCOMING,
            Some(identity.topic().to_string()),
            Some(identity.seq()),
        )
    }

    pub fn outgoing(identity: &CallIdentity) -> Self {
        Self::new(
            INTENT_ACTION_CALL_START,
            Some(identity.topic().to_string()),
            Some(identity.seq()),
        )
    }

    /// Consume the action and resolve the call direction.
    pub fn take_direction(&mut self) -> Result<CallDirection, CallError> {
        let action = self.action.take().ok_or_else(|| CallError::UnknownCallAction {
            action: "(none)".to_string(),
        })?;
        match action.as_str() {
            INTENT_ACTION_CALL_INCOMING | "incoming" | "INCOMING" => Ok(CallDirection::Incoming),
            INTENT_ACTION_CALL_START | "start" | "START" | "outgoing" => {
                Ok(CallDirection::Outgoing)
            }
            _ => Err(CallError::UnknownCallAction { action }),
        }
    }

    /// Resolve the session identity. Anything missing or malformed means
    /// there is no peer to talk to.
    pub fn identity(&self) -> Result<CallIdentity, CallError> {
        let topic = self.topic.as_deref().ok_or(CallError::MissingPeerTopic)?;
        let seq = self.seq.unwrap_or(-1);
        CallIdentity::new(topic, seq).map_err(|e| {
            tracing::debug!("Unresolvable call identity: {}", e);
            CallError::MissingPeerTopic
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_equality_requires_both_fields() {
        let a = CallIdentity::new("usrA", 5).unwrap();
        assert_eq!(a, CallIdentity::new("usrA", 5).unwrap());
        assert_ne!(a, CallIdentity::new("usrA", 6).unwrap());
        assert_ne!(a, CallIdentity::new("usrB", 5).unwrap());
    }

    #[test]
    fn test_identity_rejects_bad_input() {
        assert!(matches!(
            CallIdentity::new("", 1),
            Err(CallError::InvalidIdentity { .. })
        ));
        assert!(matches!(
            CallIdentity::new("usrA", -1),
            Err(CallError::InvalidIdentity { .. })
        ));
    }

    #[test]
    fn test_identity_from_str() {
        let id: CallIdentity = "usrA:10".parse().unwrap();
        assert_eq!(id.topic(), "usrA");
        assert_eq!(id.seq(), 10);
        assert_eq!(id.to_string(), "usrA:10");

        let id: CallIdentity = "p2p:abc:3".parse().unwrap();
        assert_eq!(id.topic(), "p2p:abc");

        assert!("usrA".parse::<CallIdentity>().is_err());
        assert!("usrA:x".parse::<CallIdentity>().is_err());
    }

    #[test]
    fn test_parse_info_envelope() {
        let json = r#"{"info":{"topic":"usrA","from":"usrA","what":"call","seq":10,"event":"hang-up"}}"#;
        let info = parse_info_message(json).unwrap();
        assert!(info.is_call_hangup());
        assert_eq!(info.identity().unwrap(), CallIdentity::new("usrA", 10).unwrap());
        assert_eq!(info.from.as_deref(), Some("usrA"));
    }

    #[test]
    fn test_parse_info_bare_and_non_call() {
        let info = parse_info_message(r#"{"topic":"usrA","what":"read","seq":4}"#).unwrap();
        assert!(!info.is_call_hangup());

        let info = parse_info_message(r#"{"topic":"usrA","what":"call","event":"ringing"}"#).unwrap();
        assert!(!info.is_call_hangup());
        assert_eq!(info.seq, -1);
        assert!(info.identity().is_err());

        assert!(parse_info_message("not json").is_none());
        assert!(parse_info_message(r#"{"ctrl":{}}"#).is_none());
    }

    #[test]
    fn test_request_direction_consumed_once() {
        let id = CallIdentity::new("usrA", 1).unwrap();
        let mut req = CallRequest::incoming(&id);
        assert_eq!(req.take_direction().unwrap(), CallDirection::Incoming);
        assert!(matches!(
            req.take_direction(),
            Err(CallError::UnknownCallAction { .. })
        ));

        let mut req = CallRequest::new("start", Some("usrA".into()), Some(1));
        assert_eq!(req.take_direction().unwrap(), CallDirection::Outgoing);

        let mut req = CallRequest::new("bogus", Some("usrA".into()), Some(1));
        assert!(matches!(
            req.take_direction(),
            Err(CallError::UnknownCallAction { action }) if action == "bogus"
        ));
    }

    #[test]
    fn test_request_identity_missing_topic() {
        let req = CallRequest::new("incoming", None, Some(3));
        assert!(matches!(req.identity(), Err(CallError::MissingPeerTopic)));

        let req = CallRequest::new("incoming", Some("usrA".into()), None);
        assert!(matches!(req.identity(), Err(CallError::MissingPeerTopic)));
    }
}
