//! Outbound call signaling. Tells the peer we hung up or declined.
//!
//! Fire-and-forget: the controller spawns the send and only logs failures.

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;

use super::{CallAction, CallIdentity, INFO_WHAT_CALL};

/// Sends call signals to the remote peer.
pub trait CallSignaler: Send + Sync + 'static {
    fn send_call_signal(
        &self,
        identity: CallIdentity,
        action: CallAction,
    ) -> BoxFuture<'static, Result<()>>;
}

/// Build the `{note: {...}}` message carrying a call signal.
pub fn call_note(identity: &CallIdentity, action: CallAction) -> serde_json::Value {
    serde_json::json!({
        "note": {
            "topic": identity.topic(),
            "what": INFO_WHAT_CALL,
            "seq": identity.seq(),
            "event": action.as_str(),
        }
    })
}

/// Posts call notes to an HTTP endpoint.
pub struct HttpSignaler {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpSignaler {
    pub fn new(http: reqwest::Client, url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            url: url.into(),
            token,
        }
    }
}

impl CallSignaler for HttpSignaler {
    fn send_call_signal(
        &self,
        identity: CallIdentity,
        action: CallAction,
    ) -> BoxFuture<'static, Result<()>> {
        post_note(
            self.http.clone(),
            self.url.clone(),
            self.token.clone(),
            identity,
            action,
        )
        .boxed()
    }
}

async fn post_note(
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    identity: CallIdentity,
    action: CallAction,
) -> Result<()> {
    let payload = call_note(&identity, action);
    tracing::info!("Call signal {} for {} -> POST {}", action.as_str(), identity, url);

    let mut req = http
        .post(&url)
        .header("Content-Type", "application/json")
        .json(&payload);
    if let Some(token) = token {
        req = req.header("Authorization", format!("Bearer {}", token));
    }

    let resp = req.send().await.context("Failed to POST call signal")?;

    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();

    if status.is_success() {
        tracing::debug!("Call signal accepted ({}): {}", status, body);
        Ok(())
    } else {
        anyhow::bail!("Call signal rejected ({}): {}", status, body);
    }
}

/// Signaler used when no endpoint is configured: logs the note and succeeds.
pub struct LogSignaler;

impl CallSignaler for LogSignaler {
    fn send_call_signal(
        &self,
        identity: CallIdentity,
        action: CallAction,
    ) -> BoxFuture<'static, Result<()>> {
        tracing::info!(
            "Call signal (not sent, no signal_url): {}",
            call_note(&identity, action)
        );
        futures::future::ready(Ok(())).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_note_shape() {
        let identity = CallIdentity::new("usrA", 10).unwrap();
        let note = call_note(&identity, CallAction::HangUp);
        assert_eq!(note["note"]["topic"], "usrA");
        assert_eq!(note["note"]["what"], "call");
        assert_eq!(note["note"]["seq"], 10);
        assert_eq!(note["note"]["event"], "hang-up");
    }

    #[tokio::test]
    async fn test_log_signaler_succeeds() {
        let identity = CallIdentity::new("usrA", 10).unwrap();
        assert!(LogSignaler
            .send_call_signal(identity, CallAction::HangUp)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_http_signaler_reports_connection_failure() {
        // Nothing listens on port 9 of the loopback address.
        let signaler = HttpSignaler::new(reqwest::Client::new(), "http://127.0.0.1:9/note", None);
        let identity = CallIdentity::new("usrA", 10).unwrap();
        let err = signaler
            .send_call_signal(identity, CallAction::HangUp)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to POST call signal"));
    }
}
