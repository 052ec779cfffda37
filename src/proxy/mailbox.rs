use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::{oneshot, Mutex};
use tokio::time;
use tracing::{debug, trace};

use crate::envelope::{Envelope, Payload, StepPair};
use crate::proxy::message_buffer::MessageBuffer;

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MailboxError {
    #[error("timed out")]
    Timeout,
    #[error("{0}")]
    Failed(String),
}

/// Everything received from one peer that was not claimed yet, together with the consumers
///  currently waiting for a specific step pair.
///
/// A single pump task delivers into the mailbox, and any number of consumers take from it. A
///  delivered payload goes to the longest-waiting consumer for its pair if there is one, and
///  into the buffer otherwise. Consumers that gave up (timed out or were cancelled) never swallow
///  a payload: it is buffered for the next consumer of that pair instead.
pub struct Mailbox {
    peer: String,
    inner: Mutex<MailboxInner>,
    undecodable: AtomicU64,
}

#[derive(Default)]
struct MailboxInner {
    buffer: MessageBuffer,
    waiters: FxHashMap<StepPair, VecDeque<oneshot::Sender<Payload>>>,
    failure: Option<String>,
}

impl MailboxInner {
    fn prune_closed_waiters(&mut self, pair: &StepPair) {
        if let Some(waiters) = self.waiters.get_mut(pair) {
            waiters.retain(|w| !w.is_closed());
            if waiters.is_empty() {
                self.waiters.remove(pair);
            }
        }
    }
}

impl Mailbox {
    pub fn new(peer: impl Into<String>) -> Mailbox {
        Mailbox {
            peer: peer.into(),
            inner: Default::default(),
            undecodable: AtomicU64::new(0),
        }
    }

    pub async fn deliver(&self, envelope: Envelope) {
        let Envelope { pair, mut payload } = envelope;
        let mut inner = self.inner.lock().await;

        if let Some(mut waiters) = inner.waiters.remove(&pair) {
            while let Some(waiter) = waiters.pop_front() {
                match waiter.send(payload) {
                    Ok(()) => {
                        trace!("handed {:?} from {} to a waiting consumer", pair, self.peer);
                        if !waiters.is_empty() {
                            inner.waiters.insert(pair, waiters);
                        }
                        return;
                    }
                    Err(returned) => payload = returned,
                }
            }
        }

        trace!("buffering {:?} from {}", pair, self.peer);
        inner.buffer.put(pair, payload);
    }

    /// Claims the payload for a pair, waiting for it up to `timeout` if it was not received yet.
    pub async fn take(&self, pair: &StepPair, timeout: Duration) -> Result<Payload, MailboxError> {
        let mut receiver = {
            let mut inner = self.inner.lock().await;
            if let Some(payload) = inner.buffer.take_if_present(pair) {
                trace!("{:?} from {} was buffered", pair, self.peer);
                return Ok(payload);
            }
            if let Some(reason) = &inner.failure {
                return Err(MailboxError::Failed(reason.clone()));
            }

            let (sender, receiver) = oneshot::channel();
            inner.waiters.entry(pair.clone())
                .or_default()
                .push_back(sender);
            receiver
        };

        match time::timeout(timeout, &mut receiver).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(MailboxError::Failed(self.failure_reason().await)),
            Err(_) => {
                // deliveries happen under the lock, so after closing the receiver while holding
                //  it, a payload is either in the receiver already or will be buffered
                let mut inner = self.inner.lock().await;
                receiver.close();
                if let Ok(payload) = receiver.try_recv() {
                    return Ok(payload);
                }
                inner.prune_closed_waiters(pair);
                Err(MailboxError::Timeout)
            }
        }
    }

    /// Marks the mailbox as failed: current and future consumers that find nothing buffered get
    ///  an error. Payloads that are buffered already can still be claimed.
    pub async fn fail(&self, reason: impl Into<String>) {
        let mut inner = self.inner.lock().await;
        if inner.failure.is_none() {
            let reason = reason.into();
            debug!("mailbox for {} failed: {}", self.peer, reason);
            if !inner.buffer.is_empty() {
                debug!("{} buffered messages from {} can still be claimed", inner.buffer.len(), self.peer);
            }
            inner.failure = Some(reason);
        }
        inner.waiters.clear();
    }

    async fn failure_reason(&self) -> String {
        self.inner.lock().await
            .failure
            .clone()
            .unwrap_or_else(|| format!("mailbox for {} was closed", self.peer))
    }

    pub async fn num_buffered(&self) -> usize {
        self.inner.lock().await.buffer.len()
    }

    /// Counts a message from this peer that was received but could not be decoded
    pub fn record_undecodable(&self) -> u64 {
        self.undecodable.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn num_undecodable(&self) -> u64 {
        self.undecodable.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use crate::error::RemoteError;
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn envelope(up: &str, down: &str, data: &'static str) -> Envelope {
        Envelope::new(StepPair::new(up, down), Payload::data(data))
    }

    #[tokio::test]
    async fn test_delivered_before_take_is_buffered() {
        let mailbox = Mailbox::new("alice");
        mailbox.deliver(envelope("s1", "s2", "x")).await;
        assert_eq!(mailbox.num_buffered().await, 1);

        assert_eq!(mailbox.take(&StepPair::new("s1", "s2"), TIMEOUT).await, Ok(Payload::data("x")));
        assert_eq!(mailbox.num_buffered().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_consumer_gets_payload() {
        let mailbox = Arc::new(Mailbox::new("alice"));

        let consumer = tokio::spawn({
            let mailbox = mailbox.clone();
            async move { mailbox.take(&StepPair::new("s1", "s2"), TIMEOUT).await }
        });
        time::sleep(Duration::from_millis(100)).await;

        mailbox.deliver(envelope("other", "s2", "foreign")).await;
        mailbox.deliver(envelope("s1", "s2", "x")).await;

        assert_eq!(consumer.await.unwrap(), Ok(Payload::data("x")));
        assert_eq!(mailbox.num_buffered().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_for_same_pair_are_served_in_order() {
        let mailbox = Arc::new(Mailbox::new("alice"));

        let first = tokio::spawn({
            let mailbox = mailbox.clone();
            async move { mailbox.take(&StepPair::new("s1", "s2"), TIMEOUT).await }
        });
        time::sleep(Duration::from_millis(10)).await;
        let second = tokio::spawn({
            let mailbox = mailbox.clone();
            async move { mailbox.take(&StepPair::new("s1", "s2"), TIMEOUT).await }
        });
        time::sleep(Duration::from_millis(10)).await;

        mailbox.deliver(envelope("s1", "s2", "a")).await;
        mailbox.deliver(envelope("s1", "s2", "b")).await;

        assert_eq!(first.await.unwrap(), Ok(Payload::data("a")));
        assert_eq!(second.await.unwrap(), Ok(Payload::data("b")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let mailbox = Mailbox::new("alice");

        let start = time::Instant::now();
        assert_eq!(mailbox.take(&StepPair::new("s1", "s2"), TIMEOUT).await, Err(MailboxError::Timeout));
        assert!(start.elapsed() >= TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_for_timed_out_consumer_is_buffered() {
        let mailbox = Mailbox::new("alice");
        assert_eq!(mailbox.take(&StepPair::new("s1", "s2"), TIMEOUT).await, Err(MailboxError::Timeout));

        mailbox.deliver(envelope("s1", "s2", "late")).await;
        assert_eq!(mailbox.num_buffered().await, 1);
        assert_eq!(mailbox.take(&StepPair::new("s1", "s2"), TIMEOUT).await, Ok(Payload::data("late")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_for_cancelled_consumer_is_buffered() {
        let mailbox = Arc::new(Mailbox::new("alice"));

        let consumer = tokio::spawn({
            let mailbox = mailbox.clone();
            async move { mailbox.take(&StepPair::new("s1", "s2"), TIMEOUT).await }
        });
        time::sleep(Duration::from_millis(10)).await;
        consumer.abort();
        let _ = consumer.await;

        mailbox.deliver(envelope("s1", "s2", "x")).await;
        assert_eq!(mailbox.take(&StepPair::new("s1", "s2"), TIMEOUT).await, Ok(Payload::data("x")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail() {
        let mailbox = Arc::new(Mailbox::new("alice"));
        mailbox.deliver(Envelope::new(StepPair::new("s0", "s1"), Payload::Error(RemoteError::new("alice", "boom")))).await;

        let waiting = tokio::spawn({
            let mailbox = mailbox.clone();
            async move { mailbox.take(&StepPair::new("s1", "s2"), TIMEOUT).await }
        });
        time::sleep(Duration::from_millis(10)).await;

        mailbox.fail("link closed").await;
        mailbox.fail("ignored").await;

        assert_eq!(waiting.await.unwrap(), Err(MailboxError::Failed("link closed".to_string())));
        assert_eq!(mailbox.take(&StepPair::new("s1", "s2"), TIMEOUT).await, Err(MailboxError::Failed("link closed".to_string())));
        assert_eq!(
            mailbox.take(&StepPair::new("s0", "s1"), TIMEOUT).await,
            Ok(Payload::Error(RemoteError::new("alice", "boom"))),
        );
    }

    #[tokio::test]
    async fn test_undecodable_messages_are_counted() {
        let mailbox = Mailbox::new("alice");
        assert_eq!(mailbox.num_undecodable(), 0);

        assert_eq!(mailbox.record_undecodable(), 1);
        assert_eq!(mailbox.record_undecodable(), 2);

        assert_eq!(mailbox.num_undecodable(), 2);
        assert_eq!(mailbox.num_buffered().await, 0);
    }
}
