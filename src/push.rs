//! A single request/response exchange (spec §4.3).

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::PushError;
use crate::events::ReplyOutcome;
use crate::message::Ref;

/// A pending or completed push. Awaiting it yields the flattened `response`
/// payload on `status: "ok"`, or the matching [`PushError`] otherwise.
///
/// `ref_`/`ref_event` are only populated once the push has actually been
/// handed to the socket (immediately for a channel that `can_push`, or later
/// when a buffered push is flushed on join) — see [`Push::ref_id`].
pub struct Push {
    pub(crate) event: String,
    pub(crate) payload: Value,
    timeout: Duration,
    ref_: Option<Ref>,
    rx: Option<oneshot::Receiver<ReplyOutcome>>,
    timeout_sleep: Option<Pin<Box<tokio::time::Sleep>>>,
    /// Set once a timeout has already been recorded, so a stray poll after
    /// completion does not return a second, different result (spec §4.3:
    /// "returns early if a timeout status was already recorded").
    timed_out: bool,
}

impl Push {
    pub(crate) fn pending(
        event: String,
        payload: Value,
        timeout: Duration,
        rx: oneshot::Receiver<ReplyOutcome>,
    ) -> Self {
        let timeout_sleep = (!timeout.is_zero()).then(|| Box::pin(tokio::time::sleep(timeout)));

        Self {
            event,
            payload,
            timeout,
            ref_: None,
            rx: Some(rx),
            timeout_sleep,
            timed_out: false,
        }
    }

    /// A push that will never be sent (e.g. the owning channel is already
    /// gone). Immediately resolves to [`PushError::PushFailed`].
    pub(crate) fn already_failed(event: String, payload: Value) -> Self {
        Self {
            event,
            payload,
            timeout: Duration::ZERO,
            ref_: None,
            rx: None,
            timeout_sleep: None,
            timed_out: false,
        }
    }

    pub(crate) fn assign_ref(&mut self, ref_: Ref) {
        self.ref_ = Some(ref_);
    }

    /// The ref assigned once this push has actually been written to the
    /// socket; `None` while still buffered.
    pub fn ref_id(&self) -> Option<Ref> {
        self.ref_
    }

    /// The synthetic event name a reply to this push is routed under
    /// (`chan_reply_<ref>`), once sent.
    pub fn ref_event(&self) -> Option<String> {
        self.ref_.map(|r| format!("chan_reply_{r}"))
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Future for Push {
    type Output = Result<Value, PushError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.timed_out {
            return Poll::Ready(Err(PushError::Timeout {
                event: this.event.clone(),
                payload: this.payload.clone(),
            }));
        }

        if let Some(rx) = this.rx.as_mut() {
            match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(ReplyOutcome::Ok(value))) => {
                    this.rx = None;
                    return Poll::Ready(Ok(value));
                }
                Poll::Ready(Ok(ReplyOutcome::Error(value))) => {
                    this.rx = None;
                    return Poll::Ready(Err(PushError::Error(value)));
                }
                Poll::Ready(Err(_canceled)) => {
                    this.rx = None;
                    return Poll::Ready(Err(PushError::PushFailed));
                }
                Poll::Pending => {}
            }
        } else if this.timeout_sleep.is_none() {
            // Completed on a previous poll and already consumed, or never
            // had anything to wait on.
            return Poll::Ready(Err(PushError::PushFailed));
        }

        if let Some(sleep) = this.timeout_sleep.as_mut() {
            if sleep.as_mut().poll(cx).is_ready() {
                this.timed_out = true;
                this.rx = None;
                return Poll::Ready(Err(PushError::Timeout {
                    event: this.event.clone(),
                    payload: this.payload.clone(),
                }));
            }
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn completes_ok_on_matching_reply() {
        let (tx, rx) = oneshot::channel();
        let mut push = Push::pending("event".into(), json!({}), Duration::from_secs(1), rx);
        push.assign_ref(Ref::for_test(1));

        tx.send(ReplyOutcome::Ok(json!({"ack": true}))).unwrap();

        assert_eq!(push.await.unwrap(), json!({"ack": true}));
    }

    #[tokio::test]
    async fn completes_error_on_error_reply() {
        let (tx, rx) = oneshot::channel();
        let push = Push::pending("event".into(), json!({}), Duration::from_secs(1), rx);
        tx.send(ReplyOutcome::Error(json!("nope"))).unwrap();

        assert_eq!(push.await, Err(PushError::Error(json!("nope"))));
    }

    #[tokio::test]
    async fn push_failed_when_sender_dropped() {
        let (tx, rx) = oneshot::channel();
        drop(tx);
        let push = Push::pending("event".into(), json!({}), Duration::from_secs(1), rx);

        assert_eq!(push.await, Err(PushError::PushFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_no_reply_arrives() {
        let (_tx, rx) = oneshot::channel();
        let push = Push::pending(
            "e".into(),
            json!({}),
            Duration::from_millis(100),
            rx,
        );

        tokio::time::advance(Duration::from_millis(101)).await;
        assert_eq!(
            push.await,
            Err(PushError::Timeout {
                event: "e".into(),
                payload: json!({})
            })
        );
    }

    #[tokio::test]
    async fn zero_timeout_never_expires() {
        let (tx, rx) = oneshot::channel();
        let push = Push::pending("e".into(), json!({}), Duration::ZERO, rx);

        tx.send(ReplyOutcome::Ok(json!(1))).unwrap();
        assert_eq!(push.await, Ok(json!(1)));
    }
}
