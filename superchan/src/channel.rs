//! A cancellable, bounded channel.
//!
//! [`Channel`] pairs a [`Context`] with a fixed-capacity FIFO queue. Producers
//! get cloneable [`Sender`] handles; one logical consumer reads with
//! [`Channel::recv`] or snapshots the queue with [`Channel::drain`] /
//! [`Channel::try_drain`].

use crate::context::Context;
use crate::errors::ContractViolation;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendError, TryRecvError, TrySendError};

struct Shared<T> {
    /// `None` once the channel is closed.
    tx: RwLock<Option<mpsc::Sender<T>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<T>>,
    capacity: usize,
}

impl<T> Shared<T> {
    fn sender(&self) -> Option<mpsc::Sender<T>> {
        self.tx.read().clone()
    }
}

/// Send-only handle to a [`Channel`].
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Sender<T> {
    /// Sends a value, waiting for buffer space.
    ///
    /// Fails if the channel is closed before or while waiting.
    pub async fn send(&self, value: T) -> Result<(), SendError<T>> {
        let Some(tx) = self.shared.sender() else {
            return Err(SendError(value));
        };
        let Ok(permit) = tx.reserve().await else {
            return Err(SendError(value));
        };
        // Holding the read lock keeps close() out until the value is queued.
        let open = self.shared.tx.read();
        if open.is_none() {
            return Err(SendError(value));
        }
        permit.send(value);
        Ok(())
    }

    /// Attempts to send without waiting.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        match &*self.shared.tx.read() {
            Some(tx) => tx.try_send(value),
            None => Err(TrySendError::Closed(value)),
        }
    }

    /// Returns whether the channel has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.tx.read().is_none()
    }
}

impl<T> std::fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A [`Context`] plus a bounded FIFO queue of `T`.
pub struct Channel<T> {
    ctx: Context,
    shared: Arc<Shared<T>>,
}

impl<T> Channel<T> {
    /// Creates a channel with a fresh child scope of `parent`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(parent: &Context, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self::wrap(parent.child(), tx, rx)
    }

    /// Wraps an existing scope and an existing queue.
    #[must_use]
    pub fn wrap(ctx: Context, tx: mpsc::Sender<T>, rx: mpsc::Receiver<T>) -> Self {
        let capacity = tx.max_capacity();
        Self {
            ctx,
            shared: Arc::new(Shared {
                tx: RwLock::new(Some(tx)),
                rx: tokio::sync::Mutex::new(rx),
                capacity,
            }),
        }
    }

    /// Returns the scope.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Returns a send-only handle.
    #[must_use]
    pub fn sender(&self) -> Sender<T> {
        Sender {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Receives the next item. Returns `None` once the channel is closed and
    /// empty.
    ///
    /// Meant for a single consumer; concurrent callers queue up behind each
    /// other.
    pub async fn recv(&self) -> Option<T> {
        self.shared.rx.lock().await.recv().await
    }

    /// Pops every item queued at the time of the call.
    pub async fn drain(&self) -> Vec<T> {
        let mut rx = self.shared.rx.lock().await;
        let queued = rx.len();
        let mut items = Vec::with_capacity(queued);
        for _ in 0..queued {
            match rx.recv().await {
                Some(item) => items.push(item),
                None => break,
            }
        }
        items
    }

    /// Pops whatever is queued without waiting.
    ///
    /// Returns `None` when nothing is queued or another consumer currently
    /// holds the receiver.
    #[must_use]
    pub fn try_drain(&self) -> Option<Vec<T>> {
        let mut rx = self.shared.rx.try_lock().ok()?;
        let mut items = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(item) => items.push(item),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        if items.is_empty() {
            None
        } else {
            Some(items)
        }
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        match self.shared.rx.try_lock() {
            Ok(rx) => rx.len(),
            // A consumer is parked in recv(); count used permits instead.
            Err(_) => self
                .shared
                .sender()
                .map_or(0, |tx| tx.max_capacity() - tx.capacity()),
        }
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixed buffer capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Returns whether [`Channel::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.tx.read().is_none()
    }

    /// Closes the channel. Queued items stay receivable.
    ///
    /// # Panics
    ///
    /// Panics on the second call.
    pub fn close(&self) {
        if let Err(violation) = self.try_close() {
            violation.raise();
        }
    }

    /// Closes the channel, reporting a second close instead of panicking.
    pub fn try_close(&self) -> Result<(), ContractViolation> {
        match self.shared.tx.write().take() {
            Some(_) => Ok(()),
            None => Err(ContractViolation::ChannelAlreadyClosed),
        }
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("ctx", &self.ctx)
            .field("capacity", &self.shared.capacity)
            .field("closed", &self.shared.tx.read().is_none())
            .finish()
    }
}
