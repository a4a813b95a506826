//! Bounded, ordered store of requests awaiting broker acknowledgement

use super::cancel::CancelSignal;
use super::request::QueuedRequest;
use crate::error::SessionError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// What to do when a request arrives at a full store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    /// Evict the head of the store and fail it as purged.
    #[default]
    DropOldest,
    /// Refuse the incoming request and fail it as purged.
    DropNewest,
}

/// Pending-request store shared by callers and the dispatcher
///
/// The deque keeps enqueue order. `in_flight` entries stay in place, so after
/// [`mark_all_not_in_flight`](Self::mark_all_not_in_flight) the resend order
/// is still the original enqueue order.
///
/// The mutex is never held across an await. Wake-ups use
/// `Notify::notify_waiters` on a `Notified` future that the consumer enables
/// before checking the deque, so a release racing the check is still seen and
/// no permit outlives a [`cancel_all`](Self::cancel_all).
#[derive(Debug)]
pub struct PendingRequestStore {
    requests: Mutex<VecDeque<Arc<QueuedRequest>>>,
    ready: Notify,
    max_pending: usize,
    overflow: OverflowStrategy,
}

impl PendingRequestStore {
    pub fn new(max_pending: usize, overflow: OverflowStrategy) -> Self {
        Self {
            requests: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            max_pending: max_pending.max(1),
            overflow,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<QueuedRequest>>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Insert at the tail, applying the overflow strategy when full.
    ///
    /// Returns whether `request` was stored. A purged request (the evicted
    /// head or the refused newcomer) has its completion failed with
    /// [`SessionError::Purged`].
    pub fn enqueue(&self, request: Arc<QueuedRequest>) -> bool {
        let (accepted, purged) = {
            let mut requests = self.lock();
            if requests.len() < self.max_pending {
                requests.push_back(request);
                (true, None)
            } else {
                match self.overflow {
                    OverflowStrategy::DropNewest => (false, Some(request)),
                    OverflowStrategy::DropOldest => {
                        let evicted = requests.pop_front();
                        requests.push_back(request);
                        (true, evicted)
                    }
                }
            }
        };

        if let Some(purged) = purged {
            warn!(
                request_id = purged.id(),
                kind = %purged.kind(),
                strategy = ?self.overflow,
                "Pending request store full, purging request"
            );
            purged.fail(SessionError::purged(format!(
                "pending request store is full ({} requests, {:?})",
                self.max_pending, self.overflow
            )));
        }

        self.ready.notify_waiters();
        accepted
    }

    /// Remove a specific request wherever it sits.
    pub fn remove(&self, request: &QueuedRequest) -> bool {
        let mut requests = self.lock();
        match requests.iter().position(|r| r.id() == request.id()) {
            Some(index) => {
                requests.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, request: &QueuedRequest) -> bool {
        self.lock().iter().any(|r| r.id() == request.id())
    }

    /// Make every sent-but-unacknowledged request eligible again. Returns how
    /// many were reset.
    pub fn mark_all_not_in_flight(&self) -> usize {
        let mut reset = 0;
        for request in self.lock().iter().filter(|r| r.is_in_flight()) {
            request.set_in_flight(false);
            reset += 1;
        }
        if reset > 0 {
            debug!(reset, "Reset in-flight requests for resend");
            self.ready.notify_waiters();
        }
        reset
    }

    fn take_next_ready(&self) -> Option<Arc<QueuedRequest>> {
        let requests = self.lock();
        let next = requests.iter().find(|r| !r.is_in_flight())?;
        next.set_in_flight(true);
        Some(Arc::clone(next))
    }

    /// Wait for the oldest request that is not in flight, mark it in flight
    /// and return it. Returns `None` once `cancel` fires.
    pub async fn peek_next_ready(&self, cancel: &CancelSignal) -> Option<Arc<QueuedRequest>> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(request) = self.take_next_ready() {
                return Some(request);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    /// Fail every stored request with `error` and empty the store. Returns
    /// how many requests were failed.
    pub fn cancel_all(&self, error: SessionError) -> usize {
        let drained: Vec<_> = self.lock().drain(..).collect();
        let count = drained.len();
        for request in drained {
            request.fail(error.clone());
        }
        // Wake a blocked consumer so it re-checks against the empty store.
        self.ready.notify_waiters();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::request::{Completion, RequestPayload};
    use crate::transport::PublishMessage;
    use proptest::prelude::*;
    use std::time::Duration;

    fn publish(topic: &str) -> (Arc<QueuedRequest>, Completion) {
        QueuedRequest::new(
            RequestPayload::Publish(PublishMessage::new(topic, "payload")),
            CancelSignal::new(),
        )
    }

    fn topic_of(request: &QueuedRequest) -> String {
        match request.payload() {
            RequestPayload::Publish(message) => message.topic.clone(),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let store = PendingRequestStore::new(10, OverflowStrategy::DropNewest);
        let mut keep = Vec::new();
        for topic in ["a", "b", "c"] {
            let (request, rx) = publish(topic);
            assert!(store.enqueue(request));
            keep.push(rx);
        }

        let cancel = CancelSignal::new();
        for expected in ["a", "b", "c"] {
            let next = store.peek_next_ready(&cancel).await.unwrap();
            assert_eq!(topic_of(&next), expected);
            assert!(next.is_in_flight());
        }
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_drop_newest_at_capacity_one() {
        let store = PendingRequestStore::new(1, OverflowStrategy::DropNewest);
        let (first, _first_rx) = publish("first");
        let (second, second_rx) = publish("second");

        assert!(store.enqueue(first.clone()));
        assert!(!store.enqueue(second));

        assert!(matches!(second_rx.await.unwrap(), Err(SessionError::Purged(_))));
        assert!(store.contains(&first));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_drop_oldest_at_capacity_one() {
        let store = PendingRequestStore::new(1, OverflowStrategy::DropOldest);
        let (first, first_rx) = publish("first");
        let (second, _second_rx) = publish("second");

        assert!(store.enqueue(first));
        assert!(store.enqueue(second.clone()));

        assert!(matches!(first_rx.await.unwrap(), Err(SessionError::Purged(_))));
        assert!(store.contains(&second));
        assert!(!second.is_settled());
    }

    #[test]
    fn test_remove_from_middle() {
        let store = PendingRequestStore::new(10, OverflowStrategy::DropOldest);
        let (a, _ra) = publish("a");
        let (b, _rb) = publish("b");
        let (c, _rc) = publish("c");
        store.enqueue(a.clone());
        store.enqueue(b.clone());
        store.enqueue(c.clone());

        assert!(store.remove(&b));
        assert!(!store.remove(&b));
        assert_eq!(store.len(), 2);
        assert!(store.contains(&a));
        assert!(store.contains(&c));
    }

    #[tokio::test]
    async fn test_reset_resends_in_enqueue_order_ahead_of_new_requests() {
        let store = PendingRequestStore::new(10, OverflowStrategy::DropOldest);
        let cancel = CancelSignal::new();
        let mut keep = Vec::new();
        for topic in ["a", "b"] {
            let (request, rx) = publish(topic);
            store.enqueue(request);
            keep.push(rx);
        }
        store.peek_next_ready(&cancel).await.unwrap();
        store.peek_next_ready(&cancel).await.unwrap();

        let (c, _rc) = publish("c");
        store.enqueue(c);

        assert_eq!(store.mark_all_not_in_flight(), 2);
        let order: Vec<_> = [
            store.peek_next_ready(&cancel).await.unwrap(),
            store.peek_next_ready(&cancel).await.unwrap(),
            store.peek_next_ready(&cancel).await.unwrap(),
        ]
        .iter()
        .map(|r| topic_of(r))
        .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_peek_blocks_until_enqueue() {
        let store = Arc::new(PendingRequestStore::new(10, OverflowStrategy::DropOldest));
        let cancel = CancelSignal::new();

        let consumer = {
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            tokio::spawn(async move { store.peek_next_ready(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        let (request, _rx) = publish("late");
        store.enqueue(request);

        let next = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should wake")
            .unwrap()
            .unwrap();
        assert_eq!(topic_of(&next), "late");
    }

    #[tokio::test]
    async fn test_peek_is_cancellable() {
        let store = Arc::new(PendingRequestStore::new(10, OverflowStrategy::DropOldest));
        let cancel = CancelSignal::new();

        let consumer = {
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            tokio::spawn(async move { store.peek_next_ready(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("cancel should wake the consumer")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_peek_skips_in_flight_requests() {
        let store = PendingRequestStore::new(10, OverflowStrategy::DropOldest);
        let cancel = CancelSignal::new();
        let (only, _rx) = publish("only");
        store.enqueue(only);
        store.peek_next_ready(&cancel).await.unwrap();

        let second = tokio::time::timeout(
            Duration::from_millis(20),
            store.peek_next_ready(&cancel),
        )
        .await;
        assert!(second.is_err(), "in-flight request must not be handed out twice");
    }

    #[tokio::test]
    async fn test_cancel_all_settles_and_empties() {
        let store = PendingRequestStore::new(10, OverflowStrategy::DropOldest);
        let (a, ra) = publish("a");
        let (b, rb) = publish("b");
        store.enqueue(a);
        store.enqueue(b);

        assert_eq!(store.cancel_all(SessionError::closed_by_user()), 2);
        assert!(store.is_empty());
        assert_eq!(ra.await.unwrap(), Err(SessionError::closed_by_user()));
        assert_eq!(rb.await.unwrap(), Err(SessionError::closed_by_user()));

        assert_eq!(store.cancel_all(SessionError::Cancelled), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_and_consumer_lose_nothing() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 50;

        let store = Arc::new(PendingRequestStore::new(
            PRODUCERS * PER_PRODUCER,
            OverflowStrategy::DropNewest,
        ));
        let cancel = CancelSignal::new();

        let consumer = {
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut seen = 0;
                while seen < PRODUCERS * PER_PRODUCER {
                    let Some(request) = store.peek_next_ready(&cancel).await else {
                        break;
                    };
                    store.remove(&request);
                    seen += 1;
                }
                seen
            })
        };

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let mut receivers = Vec::new();
                    for i in 0..PER_PRODUCER {
                        let (request, rx) = publish(&format!("{p}/{i}"));
                        assert!(store.enqueue(request));
                        receivers.push(rx);
                        if i % 7 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                    receivers
                })
            })
            .collect();

        let receivers = futures::future::join_all(producers).await;
        let seen = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .expect("consumer must not miss a wake-up")
            .unwrap();
        assert_eq!(seen, PRODUCERS * PER_PRODUCER);
        assert!(store.is_empty());
        drop(receivers);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_all_racing_consumer() {
        let store = Arc::new(PendingRequestStore::new(100, OverflowStrategy::DropOldest));
        let cancel = CancelSignal::new();

        let consumer = {
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut taken = 0;
                while store.peek_next_ready(&cancel).await.is_some() {
                    taken += 1;
                }
                taken
            })
        };

        let mut receivers = Vec::new();
        for i in 0..50 {
            let (request, rx) = publish(&i.to_string());
            store.enqueue(request);
            receivers.push(rx);
        }
        let failed = store.cancel_all(SessionError::Cancelled);
        cancel.cancel();

        let taken = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(taken <= 50);
        assert_eq!(failed, 50);
        assert!(store.is_empty());

        // Every completion resolves exactly once with the cancel_all error.
        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(SessionError::Cancelled));
        }
    }

    proptest! {
        #[test]
        fn prop_dispatch_order_matches_enqueue_order(
            topics in proptest::collection::vec("[a-z]{1,8}", 1..40),
            reset_after in 0usize..40,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            runtime.block_on(async {
                let store = PendingRequestStore::new(topics.len(), OverflowStrategy::DropNewest);
                let cancel = CancelSignal::new();
                let mut keep = Vec::new();
                for topic in &topics {
                    let (request, rx) = publish(topic);
                    prop_assert!(store.enqueue(request));
                    keep.push(rx);
                }

                let first_pass = reset_after.min(topics.len());
                for _ in 0..first_pass {
                    store.peek_next_ready(&cancel).await.unwrap();
                }
                store.mark_all_not_in_flight();

                let mut order = Vec::new();
                for _ in 0..topics.len() {
                    let next = store.peek_next_ready(&cancel).await.unwrap();
                    order.push(topic_of(&next));
                }
                prop_assert_eq!(order, topics.clone());
                Ok(())
            })?;
        }
    }
}
