//! Session client: public API and connection supervisor
//!
//! Callers enqueue publish/subscribe/unsubscribe requests into the pending
//! store and await their completion handles. The dispatcher drains the store
//! while the transport is connected. Transport disconnect events reach the
//! supervisor through an event pump; the supervisor pauses the dispatcher,
//! resets in-flight requests and resumes the broker session according to the
//! retry policy.

use super::cancel::CancelSignal;
use super::dispatcher::Dispatcher;
use super::options::SessionClientOptions;
use super::receiver::{MessageReceiver, MessageRouter};
use super::request::{QueuedRequest, RequestOutcome, RequestPayload};
use super::state::{
    ConnectionEvent, ConnectionState, HealthMetrics, HealthMonitor, SessionLostEvent,
};
use super::store::PendingRequestStore;
use crate::error::{SessionError, SessionResult, TransportError};
use crate::retry::RetryDecision;
use crate::transport::{
    validate_topic_filter, ConnectOptions, ConnectResult, DisconnectOptions,
    DisconnectReasonCode, IncomingMessage, MqttTransportClient, PublishMessage, PublishResult,
    SubscribeOptions, SubscribeResult, TransportEvent, UnsubscribeOptions, UnsubscribeResult,
};
use crate::{reconnect_span, session_span};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Supervisor flags, guarded together
#[derive(Debug, Default)]
struct SessionFlags {
    desired_connected: bool,
    connecting: bool,
    closing: bool,
    /// Cancels the current first-connect or reconnection loop.
    reconnect_cancel: Option<CancelSignal>,
    connect_options: Option<ConnectOptions>,
    /// Set on terminal failure; operations fail with it until the next connect.
    terminal_error: Option<SessionError>,
}

#[derive(Debug, Default)]
struct ConnectionStats {
    connect_time: Option<Instant>,
    connection_count: u32,
    reconnect_count: u32,
}

/// Why a connect loop ended without a connection
enum ConnectLoopError {
    Cancelled,
    Failed(SessionError),
}

struct Shared {
    client_id: String,
    options: SessionClientOptions,
    transport: Arc<dyn MqttTransportClient>,
    store: Arc<PendingRequestStore>,
    dispatcher: Dispatcher,
    flags: Mutex<SessionFlags>,
    reconnect_lock: Arc<tokio::sync::Mutex<()>>,
    state_tx: watch::Sender<ConnectionState>,
    stats: Mutex<ConnectionStats>,
    session_lost_listeners: Mutex<Vec<mpsc::UnboundedSender<SessionLostEvent>>>,
    receivers: Mutex<MessageRouter>,
    disposed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn flags(&self) -> MutexGuard<'_, SessionFlags> {
        lock(&self.flags)
    }

    fn transition(&self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(event);
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            HealthMonitor::log_state_transition(&self.client_id, &previous, &next);
        }
    }

    /// One CONNECT bounded by the per-attempt timeout. A CONNACK carrying a
    /// failure reason is reported as a refusal.
    async fn attempt_connect(&self, options: &ConnectOptions) -> Result<ConnectResult, TransportError> {
        let timeout = self.options.connection_attempt_timeout;
        let connack = tokio::time::timeout(timeout, self.transport.connect(options))
            .await
            .map_err(|_| TransportError::Timeout {
                millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })??;
        if connack.reason_code.is_success() {
            Ok(connack)
        } else {
            Err(TransportError::ConnectRefused(connack.reason_code))
        }
    }

    /// Attempt to connect until success, a fatal error, the policy giving up
    /// or `cancel` firing. The first attempt is immediate.
    async fn connect_with_retry(
        &self,
        options: &ConnectOptions,
        cancel: &CancelSignal,
        resuming: bool,
    ) -> Result<ConnectResult, ConnectLoopError> {
        let mut failures = 0u32;
        loop {
            if resuming {
                self.transition(ConnectionEvent::ReconnectionStarted(failures + 1));
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectLoopError::Cancelled),
                result = self.attempt_connect(options) => result,
            };

            let error = match result {
                Ok(connack) => return Ok(connack),
                Err(error) if error.is_fatal() => {
                    error!(client_id = %self.client_id, %error, "Fatal connection error, not retrying");
                    return Err(ConnectLoopError::Failed(SessionError::Transport(error)));
                }
                Err(error) => error,
            };

            failures += 1;
            match self.options.connection_retry_policy.should_retry(failures, &error) {
                RetryDecision::Stop => {
                    return Err(ConnectLoopError::Failed(SessionError::RetryExhausted {
                        attempts: failures,
                        reason: error.to_string(),
                    }));
                }
                RetryDecision::Retry(delay) => {
                    warn!(
                        client_id = %self.client_id,
                        attempt = failures,
                        %error,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Connection attempt failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ConnectLoopError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn record_connected(&self) {
        let mut stats = lock(&self.stats);
        stats.connect_time = Some(Instant::now());
        stats.connection_count += 1;
    }

    /// Whether a dropped connection should be recovered right now.
    fn needs_recovery(&self) -> bool {
        let flags = self.flags();
        flags.desired_connected && !flags.closing && !self.transport.is_connected()
    }

    /// Entry point for a lost connection. Idempotent: duplicate events while a
    /// reconnection runs, or after the transport already recovered, are ignored.
    fn handle_connection_lost(
        self: &Arc<Self>,
        reason: Option<DisconnectReasonCode>,
        error: Option<TransportError>,
    ) {
        let Ok(guard) = Arc::clone(&self.reconnect_lock).try_lock_owned() else {
            debug!(client_id = %self.client_id, "Reconnection already in progress, ignoring disconnect event");
            return;
        };
        if !self.needs_recovery() {
            debug!(client_id = %self.client_id, "Ignoring disconnect event, no recovery needed");
            return;
        }

        let cancel = CancelSignal::new();
        self.flags().reconnect_cancel = Some(cancel.clone());
        lock(&self.stats).reconnect_count += 1;

        let shared = Arc::clone(self);
        let span = reconnect_span!(client_id = %self.client_id);
        tokio::spawn(
            async move {
                shared.reconnect(reason, error, &cancel).await;
                drop(guard);
                // A drop that raced the end of this cycle was ignored above.
                if shared.needs_recovery() {
                    shared.handle_connection_lost(None, None);
                }
            }
            .instrument(span),
        );
    }

    async fn reconnect(
        &self,
        reason: Option<DisconnectReasonCode>,
        error: Option<TransportError>,
        cancel: &CancelSignal,
    ) {
        let description = match (&reason, &error) {
            (Some(code), _) => format!("server disconnect {code}"),
            (None, Some(error)) => error.to_string(),
            (None, None) => "transport disconnected".to_string(),
        };
        self.transition(ConnectionEvent::ConnectionLost(description));
        lock(&self.stats).connect_time = None;

        self.dispatcher.stop().await;
        self.store.mark_all_not_in_flight();

        if let Some(code) = reason.filter(|code| code.is_fatal()) {
            self.terminate(SessionError::fatal_disconnect(code)).await;
            return;
        }

        let stored_options = self.flags().connect_options.clone();
        let Some(options) = stored_options else {
            self.terminate(SessionError::invalid_state("no connect options to resume with"))
                .await;
            return;
        };
        // Resume the broker-side session rather than starting over.
        let options = ConnectOptions {
            clean_start: false,
            ..options
        };

        match self.connect_with_retry(&options, cancel, true).await {
            Ok(connack) if !connack.session_present => {
                warn!(client_id = %self.client_id, "Broker no longer holds the session");
                self.force_disconnect().await;
                self.terminate(SessionError::session_expired(
                    "broker discarded the session before it could be resumed",
                ))
                .await;
            }
            Ok(_) => {
                if self.flags().closing {
                    debug!(client_id = %self.client_id, "Reconnected during close, not resuming");
                    return;
                }
                self.record_connected();
                self.transition(ConnectionEvent::ConnAckReceived);
                self.dispatcher.start().await;
            }
            Err(ConnectLoopError::Cancelled) => {
                debug!(client_id = %self.client_id, "Reconnection cancelled");
            }
            Err(ConnectLoopError::Failed(error)) => self.terminate(error).await,
        }
    }

    /// DISCONNECT with session expiry 0 so the broker drops whatever it kept.
    async fn force_disconnect(&self) {
        let options = DisconnectOptions {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            session_expiry_interval: Some(0),
        };
        let timeout = self.options.connection_attempt_timeout;
        match tokio::time::timeout(timeout, self.transport.disconnect(&options)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(client_id = %self.client_id, "Forced disconnect failed: {}", e),
            Err(_) => debug!(client_id = %self.client_id, "Forced disconnect timed out"),
        }
    }

    /// End the session: stop retrying, fail every pending request and notify
    /// session-lost listeners.
    async fn terminate(&self, error: SessionError) {
        {
            let mut flags = self.flags();
            flags.desired_connected = false;
            flags.reconnect_cancel = None;
            flags.terminal_error = Some(error.clone());
        }
        self.dispatcher.stop().await;
        let failed = self.store.cancel_all(error.clone());
        lock(&self.stats).connect_time = None;

        error!(client_id = %self.client_id, %error, failed, "Session lost");
        self.transition(ConnectionEvent::SessionLost(error.to_string()));
        self.notify_session_lost(error);
    }

    fn notify_session_lost(&self, reason: SessionError) {
        let event = SessionLostEvent::new(reason);
        lock(&self.session_lost_listeners).retain(|listener| listener.send(event.clone()).is_ok());
    }

    /// Never waits on a consumer, so disconnects queued behind a burst of
    /// messages are handled promptly.
    fn deliver_message(&self, message: &IncomingMessage) {
        let delivered = lock(&self.receivers).dispatch(message);
        if delivered == 0 {
            debug!(client_id = %self.client_id, topic = %message.topic, "No receiver for message, dropped");
        }
    }

    fn ensure_not_disposed(&self) -> SessionResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(SessionError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Enqueue unless the session has ended. The check and the insert share
    /// the flags lock with `terminate`, so a request either sees the terminal
    /// error or is failed by its `cancel_all`.
    fn enqueue_if_operational(&self, request: &Arc<QueuedRequest>) -> SessionResult<()> {
        self.ensure_not_disposed()?;
        let flags = self.flags();
        if let Some(error) = &flags.terminal_error {
            return Err(error.clone());
        }
        self.store.enqueue(Arc::clone(request));
        Ok(())
    }

    /// Synchronous teardown used from `Drop`.
    fn shutdown_now(&self) {
        let cancel = {
            let mut flags = self.flags();
            flags.desired_connected = false;
            flags.closing = true;
            flags.reconnect_cancel.take()
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.dispatcher.abort();
        self.store.cancel_all(SessionError::Disposed);
    }
}

/// Routes transport events to the supervisor until the client goes away.
async fn run_event_pump(shared: Weak<Shared>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match event {
            TransportEvent::MessageReceived(message) => shared.deliver_message(&message),
            TransportEvent::Disconnected { reason, error } => {
                debug!(client_id = %shared.client_id, ?reason, ?error, "Transport reported disconnect");
                shared.handle_connection_lost(reason, error);
            }
        }
    }
}

/// Removes a request from the store if its caller stops waiting.
struct RemoveOnDrop<'a> {
    store: &'a PendingRequestStore,
    request: &'a QueuedRequest,
}

impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        if self.store.remove(self.request) {
            self.request.cancel_signal().cancel();
            self.request.fail(SessionError::Cancelled);
        }
    }
}

/// Resilient MQTT session client
///
/// Publish, subscribe and unsubscribe calls succeed across transient
/// disconnects: requests wait in the pending store and are resent, in order,
/// once the broker session is resumed.
///
/// ```rust,no_run
/// use mqtt_session::session::{SessionClient, SessionClientOptions};
/// use mqtt_session::testing::MockTransport;
/// use mqtt_session::transport::{ConnectOptions, PublishMessage};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let transport = Arc::new(MockTransport::new());
/// let client = SessionClient::new(transport, SessionClientOptions::default())?;
/// client.connect(ConnectOptions::new("sensor-1")).await?;
/// let ack = client.publish(PublishMessage::new("sensors/1/temp", "21.5")).await?;
/// assert!(ack.is_success());
/// client.dispose().await;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// # });
/// ```
pub struct SessionClient {
    shared: Arc<Shared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SessionClient {
    /// Create a client over `transport`. Must be called within a Tokio
    /// runtime: the transport event pump is spawned immediately.
    pub fn new<T>(transport: Arc<T>, options: SessionClientOptions) -> SessionResult<Self>
    where
        T: MqttTransportClient + 'static,
    {
        Self::with_transport(transport, options)
    }

    pub fn with_transport(
        transport: Arc<dyn MqttTransportClient>,
        options: SessionClientOptions,
    ) -> SessionResult<Self> {
        options.validate()?;

        let client_id = uuid::Uuid::new_v4().to_string();
        let store = Arc::new(PendingRequestStore::new(
            options.max_pending_requests,
            options.overflow_strategy,
        ));
        let dispatcher = Dispatcher::new(client_id.clone(), Arc::clone(&store), Arc::clone(&transport));
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let shared = Arc::new(Shared {
            client_id,
            options,
            transport,
            store,
            dispatcher,
            flags: Mutex::new(SessionFlags::default()),
            reconnect_lock: Arc::new(tokio::sync::Mutex::new(())),
            state_tx,
            stats: Mutex::new(ConnectionStats::default()),
            session_lost_listeners: Mutex::new(Vec::new()),
            receivers: Mutex::new(MessageRouter::default()),
            disposed: AtomicBool::new(false),
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        shared.transport.set_event_sender(event_tx);
        let pump = tokio::spawn(run_event_pump(Arc::downgrade(&shared), event_rx));

        Ok(Self {
            shared,
            pump: Mutex::new(Some(pump)),
        })
    }

    /// Identifier used in this client's log output.
    pub fn instance_id(&self) -> &str {
        &self.shared.client_id
    }

    /// Connect and establish the MQTT session.
    ///
    /// `options.session_expiry_interval` must be non-zero: recovery relies on
    /// the broker keeping the session across a dropped connection.
    pub async fn connect(&self, options: ConnectOptions) -> SessionResult<ConnectResult> {
        let shared = &self.shared;
        shared.ensure_not_disposed()?;
        if options.session_expiry_interval == 0 {
            return Err(SessionError::configuration(
                "session expiry interval must be non-zero for the session to survive reconnects",
            ));
        }

        let cancel = {
            let mut flags = shared.flags();
            if flags.desired_connected || flags.connecting {
                return Err(SessionError::invalid_state("session is already connected or connecting"));
            }
            let cancel = CancelSignal::new();
            flags.connecting = true;
            flags.closing = false;
            flags.terminal_error = None;
            flags.reconnect_cancel = Some(cancel.clone());
            flags.connect_options = Some(options.clone());
            cancel
        };

        let span = session_span!(client_id = %options.client_id);
        async {
            shared.transition(ConnectionEvent::ConnectStarted);
            let result = if shared.options.retry_on_first_connect {
                shared.connect_with_retry(&options, &cancel, false).await
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ConnectLoopError::Cancelled),
                    result = shared.attempt_connect(&options) => {
                        result.map_err(|e| ConnectLoopError::Failed(e.into()))
                    }
                }
            };

            let connack = match result {
                Ok(connack) => connack,
                Err(e) => {
                    {
                        let mut flags = shared.flags();
                        flags.connecting = false;
                        flags.reconnect_cancel = None;
                    }
                    shared.transition(ConnectionEvent::ConnectFailed);
                    return Err(match e {
                        ConnectLoopError::Cancelled => SessionError::Cancelled,
                        ConnectLoopError::Failed(error) => error,
                    });
                }
            };

            let closing = {
                let mut flags = shared.flags();
                flags.connecting = false;
                flags.reconnect_cancel = None;
                if !flags.closing {
                    flags.desired_connected = true;
                }
                flags.closing
            };
            if closing {
                shared.force_disconnect().await;
                return Err(SessionError::Cancelled);
            }

            info!(
                session_present = connack.session_present,
                "Connected to broker"
            );
            shared.record_connected();
            shared.transition(ConnectionEvent::ConnAckReceived);
            shared.dispatcher.start().await;

            if shared.needs_recovery() {
                shared.handle_connection_lost(None, None);
            }
            Ok(connack)
        }
        .instrument(span)
        .await
    }

    /// Close the session.
    ///
    /// Only a zero session expiry is accepted: the broker session ends with
    /// the connection. Pending requests fail with a "closed by user" error.
    pub async fn disconnect(&self, options: Option<DisconnectOptions>) -> SessionResult<()> {
        self.shared.ensure_not_disposed()?;
        let options = options.unwrap_or_default();
        if options.session_expiry_interval != Some(0) {
            return Err(SessionError::configuration(
                "disconnect requires a session expiry interval of 0",
            ));
        }
        self.close(&options).await
    }

    async fn close(&self, options: &DisconnectOptions) -> SessionResult<()> {
        let shared = &self.shared;
        let reconnect_cancel = {
            let mut flags = shared.flags();
            flags.closing = true;
            flags.desired_connected = false;
            flags.reconnect_cancel.take()
        };
        shared.transition(ConnectionEvent::CloseRequested);
        if let Some(cancel) = reconnect_cancel {
            cancel.cancel();
        }

        // Wait for a running reconnection cycle to observe the cancel.
        let reconnect_guard = shared.reconnect_lock.lock().await;
        shared.dispatcher.stop().await;

        let result = if shared.transport.is_connected() {
            shared.transport.disconnect(options).await
        } else {
            Ok(())
        };
        drop(reconnect_guard);

        let failed = shared.store.cancel_all(SessionError::closed_by_user());
        lock(&shared.stats).connect_time = None;
        shared.flags().closing = false;
        shared.transition(ConnectionEvent::Closed);
        info!(client_id = %shared.client_id, failed, "Session closed");

        result.map_err(|e| {
            warn!(client_id = %shared.client_id, "Transport disconnect failed: {}", e);
            SessionError::Transport(e)
        })
    }

    /// Disconnect if needed, then release the client. Idempotent; afterwards
    /// every operation fails with [`SessionError::Disposed`].
    pub async fn dispose(&self) {
        let shared = &self.shared;
        if shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let session_active = {
            let flags = shared.flags();
            flags.desired_connected || flags.connecting || flags.reconnect_cancel.is_some()
        };
        if session_active || shared.transport.is_connected() {
            if let Err(e) = self.close(&DisconnectOptions::default()).await {
                debug!(client_id = %shared.client_id, "Best-effort disconnect during dispose failed: {}", e);
            }
        }

        shared.dispatcher.stop().await;
        shared.store.cancel_all(SessionError::Disposed);
        lock(&shared.session_lost_listeners).clear();
        lock(&shared.receivers).clear();
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        debug!(client_id = %shared.client_id, "Session client disposed");
    }

    pub async fn publish(&self, message: PublishMessage) -> SessionResult<PublishResult> {
        self.publish_with_cancel(message, CancelSignal::new()).await
    }

    pub async fn publish_with_cancel(
        &self,
        message: PublishMessage,
        cancel: CancelSignal,
    ) -> SessionResult<PublishResult> {
        match self.submit(RequestPayload::Publish(message), &cancel).await? {
            RequestOutcome::Publish(result) => Ok(result),
            other => Err(unexpected_outcome("publish", &other)),
        }
    }

    pub async fn subscribe(&self, options: SubscribeOptions) -> SessionResult<SubscribeResult> {
        self.subscribe_with_cancel(options, CancelSignal::new()).await
    }

    pub async fn subscribe_with_cancel(
        &self,
        options: SubscribeOptions,
        cancel: CancelSignal,
    ) -> SessionResult<SubscribeResult> {
        match self.submit(RequestPayload::Subscribe(options), &cancel).await? {
            RequestOutcome::Subscribe(result) => Ok(result),
            other => Err(unexpected_outcome("subscribe", &other)),
        }
    }

    pub async fn unsubscribe(
        &self,
        options: UnsubscribeOptions,
    ) -> SessionResult<UnsubscribeResult> {
        self.unsubscribe_with_cancel(options, CancelSignal::new()).await
    }

    pub async fn unsubscribe_with_cancel(
        &self,
        options: UnsubscribeOptions,
        cancel: CancelSignal,
    ) -> SessionResult<UnsubscribeResult> {
        match self.submit(RequestPayload::Unsubscribe(options), &cancel).await? {
            RequestOutcome::Unsubscribe(result) => Ok(result),
            other => Err(unexpected_outcome("unsubscribe", &other)),
        }
    }

    /// Enqueue a request and wait for it to settle. The request keeps its own
    /// cancel signal; the caller's signal is only observed here.
    async fn submit(
        &self,
        payload: RequestPayload,
        cancel: &CancelSignal,
    ) -> SessionResult<RequestOutcome> {
        self.shared.ensure_not_disposed()?;
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        let (request, completion) = QueuedRequest::new(payload, CancelSignal::new());
        let _remove_on_drop = RemoveOnDrop {
            store: &self.shared.store,
            request: &request,
        };
        self.shared.enqueue_if_operational(&request)?;

        tokio::select! {
            biased;
            settled = completion => settled.unwrap_or(Err(SessionError::Cancelled)),
            _ = cancel.cancelled() => {
                request.cancel_signal().cancel();
                self.shared.store.remove(&request);
                request.fail(SessionError::Cancelled);
                Err(SessionError::Cancelled)
            }
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.flags().desired_connected && self.shared.transport.is_connected()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.store.len()
    }

    /// Register a listener for terminal session failures.
    pub fn subscribe_session_lost(&self) -> mpsc::UnboundedReceiver<SessionLostEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.session_lost_listeners).push(tx);
        rx
    }

    /// Receive incoming messages whose topic matches `topic_filter`
    /// (`+` and `#` wildcards, `$share/{group}/` prefix allowed).
    ///
    /// Registering a receiver does not subscribe; call
    /// [`subscribe`](Self::subscribe) for the broker to send the messages.
    pub fn create_filtered_receiver(&self, topic_filter: &str) -> SessionResult<MessageReceiver> {
        self.shared.ensure_not_disposed()?;
        validate_topic_filter(topic_filter)?;
        Ok(lock(&self.shared.receivers).add_filtered(topic_filter))
    }

    /// Receive incoming messages that no filtered receiver matched.
    pub fn create_unfiltered_receiver(&self) -> SessionResult<MessageReceiver> {
        self.shared.ensure_not_disposed()?;
        Ok(lock(&self.shared.receivers).add_unfiltered())
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        let stats = lock(&self.shared.stats);
        HealthMonitor::calculate_health_metrics(
            stats.connect_time,
            stats.connection_count,
            stats.reconnect_count,
            self.shared.store.len(),
            self.shared.store.max_pending(),
        )
    }

    /// Wait until the observable state satisfies `predicate`, up to `timeout`.
    pub async fn wait_for_state<F>(&self, timeout: Duration, predicate: F) -> Option<ConnectionState>
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut rx = self.shared.state_tx.subscribe();
        let state = match tokio::time::timeout(timeout, rx.wait_for(predicate)).await {
            Ok(Ok(state)) => Some(state.clone()),
            _ => None,
        };
        state
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        self.shared.shutdown_now();
    }
}

fn unexpected_outcome(operation: &str, outcome: &RequestOutcome) -> SessionError {
    SessionError::invalid_state(format!("{operation} settled with {outcome:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{NoRetry, PatternBackoff};
    use crate::session::store::OverflowStrategy;
    use crate::testing::MockTransport;
    use crate::transport::ConnectReasonCode;

    fn options() -> SessionClientOptions {
        SessionClientOptions {
            connection_attempt_timeout: Duration::from_millis(200),
            ..SessionClientOptions::default()
        }
        .with_retry_policy(PatternBackoff {
            max_attempts: Some(5),
            backoff_pattern: vec![1, 2, 3],
            sustained_delay: 5,
        })
    }

    fn client(transport: &Arc<MockTransport>) -> SessionClient {
        SessionClient::new(Arc::clone(transport), options()).unwrap()
    }

    #[tokio::test]
    async fn test_new_rejects_no_retry_policy() {
        let transport = Arc::new(MockTransport::new());
        let result = SessionClient::new(transport, options().with_retry_policy(NoRetry));
        assert!(matches!(result, Err(SessionError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_connect_requires_session_expiry() {
        let transport = Arc::new(MockTransport::new());
        let client = client(&transport);
        let result = client
            .connect(ConnectOptions::new("c").with_session_expiry(0))
            .await;
        assert!(matches!(result, Err(SessionError::Configuration(_))));
        assert_eq!(transport.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_connect_twice_is_invalid_state() {
        let transport = Arc::new(MockTransport::new());
        let client = client(&transport);
        client.connect(ConnectOptions::new("c")).await.unwrap();
        let second = client.connect(ConnectOptions::new("c")).await;
        assert!(matches!(second, Err(SessionError::InvalidState(_))));
        assert_eq!(client.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_first_connect_failure_propagates_without_retry() {
        let transport = Arc::new(MockTransport::new());
        transport.script_connect(Err(TransportError::network("refused")));
        let client = client(&transport);

        let result = client.connect(ConnectOptions::new("c")).await;
        assert_eq!(
            result,
            Err(SessionError::Transport(TransportError::network("refused")))
        );
        assert_eq!(transport.connect_count(), 1);
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_first_connect_retries_when_enabled() {
        let transport = Arc::new(MockTransport::new());
        transport.script_connect(Err(TransportError::network("refused")));
        transport.script_connect(Err(TransportError::ConnectRefused(
            ConnectReasonCode::ServerBusy,
        )));
        let options = SessionClientOptions {
            retry_on_first_connect: true,
            ..options()
        };
        let client = SessionClient::new(Arc::clone(&transport), options).unwrap();

        let connack = client.connect(ConnectOptions::new("c")).await.unwrap();
        assert!(connack.reason_code.is_success());
        assert_eq!(transport.connect_count(), 3);
    }

    #[tokio::test]
    async fn test_connack_failure_code_is_refusal() {
        let transport = Arc::new(MockTransport::new());
        transport.script_connect(Ok(ConnectResult {
            reason_code: ConnectReasonCode::BadUserNameOrPassword,
            session_present: false,
            assigned_client_id: None,
        }));
        let client = client(&transport);
        let result = client.connect(ConnectOptions::new("c")).await;
        assert_eq!(
            result,
            Err(SessionError::Transport(TransportError::ConnectRefused(
                ConnectReasonCode::BadUserNameOrPassword
            )))
        );
    }

    #[tokio::test]
    async fn test_connect_attempt_timeout() {
        let transport = Arc::new(MockTransport::new());
        transport.delay_connects(Duration::from_secs(5));
        let client = client(&transport);
        let result = client.connect(ConnectOptions::new("c")).await;
        assert!(matches!(
            result,
            Err(SessionError::Transport(TransportError::Timeout { millis: 200 }))
        ));
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_waits_for_connect() {
        let transport = Arc::new(MockTransport::new());
        let client = Arc::new(client(&transport));

        let publisher = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.publish(PublishMessage::new("queued", "1")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.pending_requests(), 1);
        assert!(transport.published_topics().is_empty());

        client.connect(ConnectOptions::new("c")).await.unwrap();
        let ack = tokio::time::timeout(Duration::from_secs(1), publisher)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(ack.is_success());
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_cancel_signal_removes_queued_request() {
        let transport = Arc::new(MockTransport::new());
        let client = Arc::new(client(&transport));
        let cancel = CancelSignal::new();

        let publisher = {
            let client = Arc::clone(&client);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                client
                    .publish_with_cancel(PublishMessage::new("t", "p"), cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.pending_requests(), 1);

        cancel.cancel();
        assert_eq!(publisher.await.unwrap(), Err(SessionError::Cancelled));
        assert_eq!(client.pending_requests(), 0);

        client.connect(ConnectOptions::new("c")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(transport.published_topics().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_future_removes_request() {
        let transport = Arc::new(MockTransport::new());
        let client = client(&transport);

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            client.publish(PublishMessage::new("t", "p")),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_operations_after_dispose_fail() {
        let transport = Arc::new(MockTransport::new());
        let client = client(&transport);
        client.connect(ConnectOptions::new("c")).await.unwrap();
        client.dispose().await;
        client.dispose().await;

        assert_eq!(transport.disconnect_count(), 1);
        assert_eq!(
            client.publish(PublishMessage::new("t", "p")).await,
            Err(SessionError::Disposed)
        );
        assert_eq!(
            client.connect(ConnectOptions::new("c")).await,
            Err(SessionError::Disposed)
        );
    }

    #[tokio::test]
    async fn test_disconnect_rejects_nonzero_expiry() {
        let transport = Arc::new(MockTransport::new());
        let client = client(&transport);
        let result = client
            .disconnect(Some(DisconnectOptions {
                reason_code: DisconnectReasonCode::NormalDisconnection,
                session_expiry_interval: Some(60),
            }))
            .await;
        assert!(matches!(result, Err(SessionError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe_round_trip() {
        let transport = Arc::new(MockTransport::new());
        let client = client(&transport);
        client.connect(ConnectOptions::new("c")).await.unwrap();

        let suback = client
            .subscribe(SubscribeOptions::single("a/#", crate::transport::QoS::AtLeastOnce))
            .await
            .unwrap();
        assert_eq!(suback.reason_codes, vec![1]);

        let unsuback = client
            .unsubscribe(UnsubscribeOptions::single("a/#"))
            .await
            .unwrap();
        assert!(unsuback.is_success());
    }

    #[tokio::test]
    async fn test_health_metrics_track_connection() {
        let transport = Arc::new(MockTransport::new());
        let client = SessionClient::new(
            Arc::clone(&transport),
            options().with_max_pending(4, OverflowStrategy::DropNewest),
        )
        .unwrap();
        assert!(!client.health_metrics().is_healthy);

        client.connect(ConnectOptions::new("c")).await.unwrap();
        let metrics = client.health_metrics();
        assert!(metrics.is_healthy);
        assert_eq!(metrics.connection_count, 1);
        assert_eq!(metrics.reconnect_count, 0);
        assert_eq!(metrics.pending_requests, 0);
    }
}
