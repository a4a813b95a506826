//! Request dispatcher: drains the pending store into the transport
//!
//! One request is in flight at a time, which keeps transport order equal to
//! store order. The loop runs only while the transport reports connected and
//! is torn down by the connection supervisor before any in-flight reset.

use super::cancel::CancelSignal;
use super::request::{QueuedRequest, RequestOutcome, RequestPayload};
use super::store::PendingRequestStore;
use crate::dispatch_span;
use crate::error::{SessionError, TransportError};
use crate::transport::MqttTransportClient;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

struct DispatcherHandle {
    connection: CancelSignal,
    task: JoinHandle<()>,
}

/// How a single dispatch attempt ended
#[derive(Debug)]
enum DispatchOutcome {
    Completed(Result<RequestOutcome, TransportError>),
    RequestCancelled,
    ConnectionLost,
}

/// Owner of the single dispatcher task
pub(crate) struct Dispatcher {
    client_id: String,
    store: Arc<PendingRequestStore>,
    transport: Arc<dyn MqttTransportClient>,
    handle: Mutex<Option<DispatcherHandle>>,
}

impl Dispatcher {
    pub(crate) fn new(
        client_id: String,
        store: Arc<PendingRequestStore>,
        transport: Arc<dyn MqttTransportClient>,
    ) -> Self {
        Self {
            client_id,
            store,
            transport,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the dispatcher loop unless one is already running.
    pub(crate) async fn start(&self) {
        let mut handle = self.handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.task.is_finished()) {
            debug!(client_id = %self.client_id, "Dispatcher already running");
            return;
        }

        let connection = CancelSignal::new();
        let task = tokio::spawn(
            run_dispatch_loop(
                Arc::clone(&self.store),
                Arc::clone(&self.transport),
                connection.clone(),
            )
            .instrument(dispatch_span!(client_id = %self.client_id)),
        );
        *handle = Some(DispatcherHandle { connection, task });
    }

    /// Cancel the loop and wait until it has stopped touching the transport.
    pub(crate) async fn stop(&self) {
        let Some(DispatcherHandle { connection, task }) = self.handle.lock().await.take() else {
            return;
        };
        connection.cancel();
        if let Err(e) = task.await {
            if e.is_panic() {
                warn!(client_id = %self.client_id, "Dispatcher task panicked: {}", e);
            }
        }
    }

    /// Synchronous teardown for `Drop`; does not wait for the task.
    pub(crate) fn abort(&self) {
        if let Ok(mut handle) = self.handle.try_lock() {
            if let Some(DispatcherHandle { connection, task }) = handle.take() {
                connection.cancel();
                task.abort();
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.task.is_finished())
    }
}

async fn send_request(
    transport: &dyn MqttTransportClient,
    payload: &RequestPayload,
) -> Result<RequestOutcome, TransportError> {
    match payload {
        RequestPayload::Publish(message) => {
            transport.publish(message).await.map(RequestOutcome::Publish)
        }
        RequestPayload::Subscribe(options) => transport
            .subscribe(options)
            .await
            .map(RequestOutcome::Subscribe),
        RequestPayload::Unsubscribe(options) => transport
            .unsubscribe(options)
            .await
            .map(RequestOutcome::Unsubscribe),
    }
}

async fn run_dispatch_loop(
    store: Arc<PendingRequestStore>,
    transport: Arc<dyn MqttTransportClient>,
    connection: CancelSignal,
) {
    debug!("Dispatcher started");
    while transport.is_connected() {
        let Some(request) = store.peek_next_ready(&connection).await else {
            break;
        };

        let outcome = tokio::select! {
            biased;
            _ = request.cancel_signal().cancelled() => DispatchOutcome::RequestCancelled,
            _ = connection.cancelled() => DispatchOutcome::ConnectionLost,
            result = send_request(transport.as_ref(), request.payload()) => {
                DispatchOutcome::Completed(result)
            }
        };

        handle_outcome(&store, transport.as_ref(), &request, outcome);
    }
    debug!("Dispatcher stopped");
}

fn handle_outcome(
    store: &PendingRequestStore,
    transport: &dyn MqttTransportClient,
    request: &QueuedRequest,
    outcome: DispatchOutcome,
) {
    let request_id = request.id();
    let kind = request.kind();
    match outcome {
        DispatchOutcome::Completed(Ok(result)) => {
            store.remove(request);
            if !request.settle(Ok(result)) {
                debug!(request_id, %kind, "Acknowledged request was already settled");
            }
        }
        DispatchOutcome::RequestCancelled => {
            store.remove(request);
            request.fail(SessionError::Cancelled);
            debug!(request_id, %kind, "Request cancelled during dispatch");
        }
        DispatchOutcome::ConnectionLost => {
            // Stays in flight; the supervisor resets it before resending.
            debug!(request_id, %kind, "Dispatch interrupted by connection loss");
        }
        DispatchOutcome::Completed(Err(error)) if error.is_fatal() => {
            store.remove(request);
            warn!(request_id, %kind, %error, "Request failed permanently");
            request.fail(SessionError::Transport(error));
        }
        DispatchOutcome::Completed(Err(error)) => {
            if transport.is_connected() {
                warn!(
                    request_id,
                    %kind,
                    %error,
                    "Transient failure while still connected; request left in flight"
                );
            } else {
                debug!(request_id, %kind, %error, "Request will be resent after reconnect");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::request::Completion;
    use crate::session::store::OverflowStrategy;
    use crate::testing::mocks::MockTransport;
    use crate::transport::PublishMessage;
    use std::time::Duration;

    fn setup() -> (Arc<MockTransport>, Arc<PendingRequestStore>, Dispatcher) {
        let transport = Arc::new(MockTransport::new());
        transport.set_connected(true);
        let store = Arc::new(PendingRequestStore::new(16, OverflowStrategy::DropOldest));
        let dispatcher = Dispatcher::new(
            "test-client".to_string(),
            Arc::clone(&store),
            transport.clone() as Arc<dyn MqttTransportClient>,
        );
        (transport, store, dispatcher)
    }

    fn enqueue(store: &PendingRequestStore, topic: &str) -> (Arc<QueuedRequest>, Completion) {
        let (request, rx) = QueuedRequest::new(
            RequestPayload::Publish(PublishMessage::new(topic, "x")),
            CancelSignal::new(),
        );
        store.enqueue(Arc::clone(&request));
        (request, rx)
    }

    #[tokio::test]
    async fn test_dispatches_in_order_and_settles() {
        let (transport, store, dispatcher) = setup();
        let receivers: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|t| enqueue(&store, t).1)
            .collect();

        dispatcher.start().await;
        for rx in receivers {
            let result = tokio::time::timeout(Duration::from_secs(1), rx)
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(result, Ok(RequestOutcome::Publish(_))));
        }
        assert_eq!(transport.published_topics(), vec!["a", "b", "c"]);
        assert!(store.is_empty());
        dispatcher.stop().await;
        assert!(!dispatcher.is_running().await);
    }

    #[tokio::test]
    async fn test_fatal_error_settles_and_continues() {
        let (transport, store, dispatcher) = setup();
        transport.fail_next_publish(TransportError::InvalidArgument("bad topic".into()));
        let (_bad, bad_rx) = enqueue(&store, "bad");
        let (_good, good_rx) = enqueue(&store, "good");

        dispatcher.start().await;
        assert!(matches!(
            bad_rx.await.unwrap(),
            Err(SessionError::Transport(TransportError::InvalidArgument(_)))
        ));
        match good_rx.await.unwrap() {
            Ok(RequestOutcome::Publish(result)) => {
                assert!(result.is_success());
                assert!(result.packet_id.is_some());
            }
            other => panic!("Expected publish outcome, got {other:?}"),
        }
        assert!(store.is_empty());
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_transient_error_leaves_request_in_flight() {
        let (transport, store, dispatcher) = setup();
        transport.fail_next_publish(TransportError::network("reset"));
        let (request, _rx) = enqueue(&store, "retry-me");

        dispatcher.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.stop().await;

        assert!(store.contains(&request));
        assert!(request.is_in_flight());
        assert!(!request.is_settled());
    }

    #[tokio::test]
    async fn test_stop_interrupts_pending_send() {
        let (transport, store, dispatcher) = setup();
        transport.hold_publishes(true);
        let (request, _rx) = enqueue(&store, "held");

        dispatcher.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::time::timeout(Duration::from_secs(1), dispatcher.stop())
            .await
            .expect("stop must not wait for the held publish");

        assert!(store.contains(&request));
        assert!(request.is_in_flight());
    }

    #[tokio::test]
    async fn test_request_cancel_during_send() {
        let (transport, store, dispatcher) = setup();
        transport.hold_publishes(true);
        let (request, rx) = enqueue(&store, "held");

        dispatcher.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        request.cancel_signal().cancel();

        assert_eq!(rx.await.unwrap(), Err(SessionError::Cancelled));
        assert!(store.is_empty());
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (_transport, _store, dispatcher) = setup();
        dispatcher.start().await;
        dispatcher.start().await;
        assert!(dispatcher.is_running().await);
        dispatcher.stop().await;
        dispatcher.stop().await;
    }
}
