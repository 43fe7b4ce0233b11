// Copyright (c) 2025, The Typebus Authors
// MIT License
// All rights reserved.

//! # Pending Messages
//!
//! A received message is held under a *lease*: it stays invisible to other
//! readers until it is finished (permanently removed), cancelled (returned to
//! the head of its queue) or the lease times out. [`PendingMessage`] is the
//! checked handle for that lease: each transition is valid exactly once, and
//! late or repeated calls fail with an error naming what already happened.

use crate::{
    errors::MessagingError,
    router::{MessageProperties, MessageRouting},
};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseState {
    Open,
    Finished,
    Cancelled,
    TimedOut,
}

struct LeaseInner {
    router: Arc<dyn MessageRouting>,
    delivery_tag: u64,
    state: tokio::sync::Mutex<LeaseState>,
}

/// A message claimed from a destination, plus the single-use lease on it.
///
/// With an acknowledge timeout configured, an unfinished lease is cancelled
/// automatically when the timeout elapses, returning the message to its
/// queue; `finish` and `cancel` afterwards report [`MessagingError::LeaseTimedOut`].
/// Without a timeout the lease lasts until settled or until the underlying
/// channel closes.
pub struct PendingMessage<T> {
    message: T,
    properties: MessageProperties,
    inner: Arc<LeaseInner>,
    timer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<T> PendingMessage<T> {
    pub(crate) fn new(
        message: T,
        properties: MessageProperties,
        router: Arc<dyn MessageRouting>,
        ack_timeout: Option<Duration>,
    ) -> PendingMessage<T> {
        let inner = Arc::new(LeaseInner {
            router,
            delivery_tag: properties.delivery_tag,
            state: tokio::sync::Mutex::new(LeaseState::Open),
        });

        let timer = ack_timeout.map(|timeout| {
            let inner = inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let mut state = inner.state.lock().await;
                if *state == LeaseState::Open {
                    if let Err(err) = inner.router.cancel(inner.delivery_tag).await {
                        warn!(
                            error = ?err,
                            delivery_tag = inner.delivery_tag,
                            "failed to return timed-out message to its queue"
                        );
                    }
                    *state = LeaseState::TimedOut;
                }
            })
        });

        PendingMessage {
            message,
            properties,
            inner,
            timer: std::sync::Mutex::new(timer),
        }
    }

    /// The decoded message body.
    pub fn message(&self) -> &T {
        &self.message
    }

    /// Delivery metadata: original contract chain, correlation id, sender.
    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    /// Consumes the handle, keeping only the message. The lease is left in
    /// whatever state it reached; settle it first.
    pub fn into_message(self) -> T {
        self.message
    }

    /// Permanently removes the message from its queue.
    pub async fn finish(&self) -> Result<(), MessagingError> {
        let mut state = self.inner.state.lock().await;
        match *state {
            LeaseState::Open => {
                self.inner.router.finish(self.inner.delivery_tag).await?;
                *state = LeaseState::Finished;
                self.stop_timer();
                Ok(())
            }
            LeaseState::Finished => Err(MessagingError::AlreadyFinished),
            LeaseState::Cancelled => Err(MessagingError::AlreadyCancelled),
            LeaseState::TimedOut => Err(MessagingError::LeaseTimedOut),
        }
    }

    /// Returns the message to the head of its queue, so it is the next one
    /// delivered from that destination.
    pub async fn cancel(&self) -> Result<(), MessagingError> {
        let mut state = self.inner.state.lock().await;
        match *state {
            LeaseState::Open => {
                self.inner.router.cancel(self.inner.delivery_tag).await?;
                *state = LeaseState::Cancelled;
                self.stop_timer();
                Ok(())
            }
            LeaseState::Finished => Err(MessagingError::AlreadyFinished),
            LeaseState::Cancelled => Err(MessagingError::AlreadyCancelled),
            LeaseState::TimedOut => Err(MessagingError::LeaseTimedOut),
        }
    }

    fn stop_timer(&self) {
        if let Some(timer) = self.timer.lock().unwrap_or_else(|e| e.into_inner()).take() {
            timer.abort();
        }
    }
}

impl<T> std::fmt::Debug for PendingMessage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingMessage")
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}
