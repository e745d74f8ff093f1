// src/gateway/consumer.rs

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{self, Stream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use super::errors::{GatewayError, Result};
use crate::transport::{BrokerChannel, DeliveryHandler};

/// Messages delivered by the broker but not yet pulled by the consumer.
pub const RECEIVE_BUFFER_CAPACITY: usize = 100;

/// `None` is the end-of-sequence sentinel.
type Slot = Option<String>;

/// Write side of the receive buffer, driven by the transport's deliveries.
struct Inbox {
    queue: String,
    tx: mpsc::Sender<Slot>,
    dropped: Arc<AtomicU64>,
}

impl Inbox {
    /// Never blocks. Returns whether the message was buffered.
    fn offer(&self, body: &[u8]) -> bool {
        let text = match std::str::from_utf8(body) {
            Ok(text) => text.to_owned(),
            Err(e) => {
                warn!(queue = %self.queue, "Dropping message that is not valid UTF-8: {}", e);
                return false;
            }
        };
        debug!(queue = %self.queue, "Received message {:?}", text);

        match self.tx.try_send(Some(text)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(queue = %self.queue, dropped = total, "Receive buffer full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(queue = %self.queue, dropped = total, "Receiver closed, dropping message");
                false
            }
        }
    }

    fn into_handler(self) -> DeliveryHandler {
        Arc::new(move |body: &[u8]| {
            self.offer(body);
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    /// Not yet registered with the broker; the first pull registers it.
    Unattached,
    Consuming,
    Closed,
}

/// Ends a [`Receiver`]'s sequence by pushing the sentinel behind any buffered messages.
#[derive(Clone)]
pub struct StopHandle {
    tx: mpsc::WeakSender<Slot>,
}

impl StopHandle {
    /// Returns `false` if the sequence had already ended.
    pub async fn stop(&self) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx.send(None).await.is_ok(),
            None => false,
        }
    }
}

/// Pull-based, single-pass sequence of text messages from one queue.
///
/// Consumes in no-ack mode: a message dropped because the buffer was full is
/// already acknowledged and cannot be recovered.
pub struct Receiver<C: BrokerChannel> {
    channel: C,
    queue: String,
    rx: mpsc::Receiver<Slot>,
    // Held until the consumer is registered, then owned by the delivery handler.
    pending: Option<mpsc::Sender<Slot>>,
    weak: mpsc::WeakSender<Slot>,
    consumer_tag: Option<String>,
    dropped: Arc<AtomicU64>,
    state: ReceiverState,
}

impl<C: BrokerChannel> Receiver<C> {
    pub(crate) fn new(channel: C, queue: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel(RECEIVE_BUFFER_CAPACITY);
        Self {
            channel,
            queue: queue.into(),
            rx,
            weak: tx.downgrade(),
            pending: Some(tx),
            consumer_tag: None,
            dropped: Arc::new(AtomicU64::new(0)),
            state: ReceiverState::Unattached,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Messages lost after the broker delivered them: the buffer was full, or
    /// the sequence had already ended.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { tx: self.weak.clone() }
    }

    /// Registers the consumer now rather than on the first pull.
    pub async fn attach(&mut self) -> Result<()> {
        let tx = match &self.pending {
            Some(tx) => tx.clone(),
            None => return Ok(()),
        };
        let inbox = Inbox {
            queue: self.queue.clone(),
            tx,
            dropped: self.dropped.clone(),
        };

        let consumer_tag = self
            .channel
            .consume(&self.queue, inbox.into_handler())
            .await
            .map_err(GatewayError::ConsumeError)?;

        self.pending = None;
        self.consumer_tag = Some(consumer_tag);
        self.state = ReceiverState::Consuming;
        info!(queue = %self.queue, "Receiver attached");
        Ok(())
    }

    /// Waits for the next message. `Ok(None)` means the sequence has ended,
    /// either through a [`StopHandle`] or because the channel closed.
    pub async fn next(&mut self) -> Result<Option<String>> {
        if self.state == ReceiverState::Unattached {
            self.attach().await?;
        }
        if self.state == ReceiverState::Closed {
            return Ok(None);
        }

        match self.rx.recv().await {
            Some(Some(message)) => Ok(Some(message)),
            Some(None) => {
                self.finish();
                // Later messages stay in the queue for the next consumer.
                if let Some(tag) = self.consumer_tag.take() {
                    if let Err(e) = self.channel.cancel(&tag).await {
                        warn!(queue = %self.queue, consumer_tag = %tag, "Failed to cancel consumer: {}", e);
                    }
                }
                Ok(None)
            }
            None => {
                self.finish();
                Ok(None)
            }
        }
    }

    fn finish(&mut self) {
        debug!(queue = %self.queue, "Receiver sequence ended");
        self.state = ReceiverState::Closed;
        self.rx.close();

        let mut discarded = 0;
        while let Ok(slot) = self.rx.try_recv() {
            if slot.is_some() {
                discarded += 1;
            }
        }
        if discarded > 0 {
            let total = self.dropped.fetch_add(discarded, Ordering::Relaxed) + discarded;
            warn!(queue = %self.queue, dropped = total, "Discarding {} messages buffered after end of sequence", discarded);
        }
    }

    /// Adapts the receiver into a stream. A consume error is yielded once and
    /// ends the stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<String>> {
        stream::unfold(Some(self), |receiver| async move {
            let mut receiver = receiver?;
            match receiver.next().await {
                Ok(Some(message)) => Some((Ok(message), Some(receiver))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
