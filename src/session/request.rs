//! One outstanding publish, subscribe or unsubscribe operation

use super::cancel::CancelSignal;
use crate::error::{SessionError, SessionResult};
use crate::transport::{
    PublishMessage, PublishResult, SubscribeOptions, SubscribeResult, UnsubscribeOptions,
    UnsubscribeResult,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestKind::Publish => "publish",
            RequestKind::Subscribe => "subscribe",
            RequestKind::Unsubscribe => "unsubscribe",
        };
        f.write_str(name)
    }
}

/// What the dispatcher hands to the transport
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPayload {
    Publish(PublishMessage),
    Subscribe(SubscribeOptions),
    Unsubscribe(UnsubscribeOptions),
}

impl RequestPayload {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestPayload::Publish(_) => RequestKind::Publish,
            RequestPayload::Subscribe(_) => RequestKind::Subscribe,
            RequestPayload::Unsubscribe(_) => RequestKind::Unsubscribe,
        }
    }
}

/// What the transport answered
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Publish(PublishResult),
    Subscribe(SubscribeResult),
    Unsubscribe(UnsubscribeResult),
}

pub type Completion = oneshot::Receiver<SessionResult<RequestOutcome>>;

/// A request waiting in the pending store
///
/// The `in_flight` flag is only flipped by the store, under its lock. The
/// completion sender is taken on first settlement, so a request resolves at
/// most once no matter how many parties race to settle it.
pub struct QueuedRequest {
    id: u64,
    payload: RequestPayload,
    cancel: CancelSignal,
    in_flight: AtomicBool,
    completion: Mutex<Option<oneshot::Sender<SessionResult<RequestOutcome>>>>,
}

impl QueuedRequest {
    pub fn new(payload: RequestPayload, cancel: CancelSignal) -> (Arc<Self>, Completion) {
        let (tx, rx) = oneshot::channel();
        let request = Arc::new(Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            payload,
            cancel,
            in_flight: AtomicBool::new(false),
            completion: Mutex::new(Some(tx)),
        });
        (request, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.payload.kind()
    }

    pub fn payload(&self) -> &RequestPayload {
        &self.payload
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_flight(&self, in_flight: bool) {
        self.in_flight.store(in_flight, Ordering::Release);
    }

    pub fn is_settled(&self) -> bool {
        self.completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Resolve the completion handle. Returns `false` if it was already
    /// settled or the caller stopped waiting.
    pub fn settle(&self, result: SessionResult<RequestOutcome>) -> bool {
        let sender = self
            .completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    pub fn fail(&self, error: SessionError) -> bool {
        self.settle(Err(error))
    }
}

impl fmt::Debug for QueuedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("in_flight", &self.is_in_flight())
            .field("settled", &self.is_settled())
            .finish()
    }
}
