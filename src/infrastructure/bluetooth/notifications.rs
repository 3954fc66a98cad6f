//! Notification Hub
//!
//! Every value the controller reports for a characteristic lands here and
//! fans out three ways:
//!
//! - a bounded buffer for poll-style reads
//! - one-shot waiters (a `read` or a sample waiting for the next value)
//! - at most one push stream per characteristic
//!
//! The hub lives inside the session actor and is never shared.

use futures::Stream;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};
use uuid::Uuid;

/// Buffered values kept per characteristic before eviction kicks in
pub const BUFFER_CAPACITY: usize = 1000;
/// Oldest values dropped once the buffer exceeds its capacity
pub const BUFFER_EVICTION: usize = 500;

#[derive(Debug, Default)]
struct Channel {
    buffer: VecDeque<Vec<u8>>,
    subscriber: Option<mpsc::UnboundedSender<Vec<u8>>>,
    waiters: Vec<oneshot::Sender<Vec<u8>>>,
    /// Notifications enabled on the peripheral (CCCD written)
    notifying: bool,
}

impl Channel {
    fn is_idle(&self) -> bool {
        self.buffer.is_empty()
            && self.subscriber.is_none()
            && self.waiters.is_empty()
            && !self.notifying
    }
}

#[derive(Debug, Default)]
pub struct NotificationHub {
    channels: HashMap<Uuid, Channel>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a value reported by the controller
    pub fn accept(&mut self, characteristic: Uuid, value: Vec<u8>) {
        let channel = self.channels.entry(characteristic).or_default();

        for waiter in channel.waiters.drain(..) {
            let _ = waiter.send(value.clone());
        }

        if let Some(subscriber) = &channel.subscriber {
            if subscriber.send(value.clone()).is_err() {
                trace!("Stream reader for {} went away", characteristic);
                channel.subscriber = None;
            }
        }

        channel.buffer.push_back(value);
        if channel.buffer.len() > BUFFER_CAPACITY {
            channel.buffer.drain(..BUFFER_EVICTION);
            debug!(
                "Evicted {} buffered values for {}",
                BUFFER_EVICTION, characteristic
            );
        }
    }

    pub fn clear_buffer(&mut self, characteristic: &Uuid) {
        if let Some(channel) = self.channels.get_mut(characteristic) {
            channel.buffer.clear();
        }
    }

    /// Buffered values, oldest first
    pub fn buffered(&self, characteristic: &Uuid) -> Vec<Vec<u8>> {
        self.channels
            .get(characteristic)
            .map(|c| c.buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Resolve with the next value reported for `characteristic`
    pub fn wait_next(&mut self, characteristic: Uuid) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        let channel = self.channels.entry(characteristic).or_default();
        channel.waiters.retain(|w| !w.is_closed());
        channel.waiters.push(tx);
        rx
    }

    /// Open the push stream, replacing (and finishing) any previous one
    pub fn subscribe(&mut self, characteristic: Uuid) -> NotificationStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = self.channels.entry(characteristic).or_default();
        if channel.subscriber.replace(tx).is_some() {
            debug!("Replacing existing stream for {}", characteristic);
        }
        channel.notifying = true;
        NotificationStream::new(rx)
    }

    /// Finish the stream, drop buffered values and forget the registration.
    /// Returns whether notifications were enabled.
    pub fn unsubscribe(&mut self, characteristic: &Uuid) -> bool {
        let Some(channel) = self.channels.get_mut(characteristic) else {
            return false;
        };
        channel.subscriber = None;
        channel.buffer.clear();
        let was_notifying = std::mem::replace(&mut channel.notifying, false);
        if channel.is_idle() {
            self.channels.remove(characteristic);
        }
        was_notifying
    }

    pub fn set_notifying(&mut self, characteristic: Uuid, notifying: bool) {
        self.channels.entry(characteristic).or_default().notifying = notifying;
    }

    pub fn is_notifying(&self, characteristic: &Uuid) -> bool {
        self.channels
            .get(characteristic)
            .map(|c| c.notifying)
            .unwrap_or(false)
    }

    pub fn has_subscriber(&self, characteristic: &Uuid) -> bool {
        self.channels
            .get(characteristic)
            .map(|c| c.subscriber.is_some())
            .unwrap_or(false)
    }

    /// Tear everything down: streams end, waiters are dropped, buffers go
    pub fn finish_all(&mut self) {
        let count = self.channels.len();
        self.channels.clear();
        if count > 0 {
            debug!("Finished {} notification channels", count);
        }
    }
}

/// Values pushed for one characteristic, ending when it is unsubscribed or
/// the peripheral disconnects
#[derive(Debug)]
pub struct NotificationStream {
    inner: UnboundedReceiverStream<Vec<u8>>,
}

impl NotificationStream {
    fn new(rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
        }
    }
}

impl Stream for NotificationStream {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
