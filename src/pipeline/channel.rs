//! Row channels between stage copies.
//!
//! A channel connects exactly one producer copy to one consumer copy. Three
//! transports are available, selected at allocation time:
//!
//! - **Blocking**: bounded crossbeam queue; `put` waits while full, `get`
//!   waits while empty and the producer is not done.
//! - **Batching**: same contract, but rows travel in `Vec<Row>` batches to
//!   cut per-row synchronization.
//! - **Queue**: non-blocking, unbounded queue for single-threaded pipelines.
//!   Nothing ever waits; the driver decides when a stage runs.
//!
//! FIFO order holds within a channel. The producer marks the channel done
//! once it will not put any more rows.

use crate::pipeline::id::{ChannelId, CopyKey};
use crate::pipeline::row::Row;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Channel transport flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFlavor {
    Blocking,
    Batching { batch_size: usize },
    Queue,
}

enum Transport {
    Blocking {
        tx: Sender<Row>,
        rx: Receiver<Row>,
    },
    Batching {
        tx: Sender<Vec<Row>>,
        rx: Receiver<Vec<Row>>,
        batch_size: usize,
        pending: Mutex<Vec<Row>>,
        inbox: Mutex<VecDeque<Row>>,
    },
    Queue(Mutex<VecDeque<Row>>),
}

/// A FIFO row channel from one stage copy to another.
pub struct Channel {
    id: ChannelId,
    origin: CopyKey,
    destination: CopyKey,
    capacity: usize,
    done: AtomicBool,
    /// Rows put but not yet taken, including rows parked in a batch.
    size: AtomicUsize,
    transport: Transport,
}

impl Channel {
    pub fn new(
        id: ChannelId,
        flavor: ChannelFlavor,
        origin: CopyKey,
        destination: CopyKey,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        let transport = match flavor {
            ChannelFlavor::Blocking => {
                let (tx, rx) = bounded(capacity);
                Transport::Blocking { tx, rx }
            }
            ChannelFlavor::Batching { batch_size } => {
                let batch_size = batch_size.clamp(1, capacity);
                let (tx, rx) = bounded((capacity / batch_size).max(1));
                Transport::Batching {
                    tx,
                    rx,
                    batch_size,
                    pending: Mutex::new(Vec::with_capacity(batch_size)),
                    inbox: Mutex::new(VecDeque::new()),
                }
            }
            ChannelFlavor::Queue => Transport::Queue(Mutex::new(VecDeque::new())),
        };
        Self {
            id,
            origin,
            destination,
            capacity,
            done: AtomicBool::new(false),
            size: AtomicUsize::new(0),
            transport,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn origin(&self) -> &CopyKey {
        &self.origin
    }

    pub fn destination(&self) -> &CopyKey {
        &self.destination
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn flavor(&self) -> ChannelFlavor {
        match &self.transport {
            Transport::Blocking { .. } => ChannelFlavor::Blocking,
            Transport::Batching { batch_size, .. } => ChannelFlavor::Batching {
                batch_size: *batch_size,
            },
            Transport::Queue(_) => ChannelFlavor::Queue,
        }
    }

    /// Put a row, waiting at most `timeout` for room.
    ///
    /// The row is handed back on timeout so the caller can retry or drop it.
    pub fn put_row_wait(&self, row: Row, timeout: Duration) -> Result<(), Row> {
        match &self.transport {
            Transport::Blocking { tx, .. } => {
                self.size.fetch_add(1, Ordering::SeqCst);
                match tx.send_timeout(row, timeout) {
                    Ok(()) => Ok(()),
                    Err(SendTimeoutError::Timeout(row)) | Err(SendTimeoutError::Disconnected(row)) => {
                        self.size.fetch_sub(1, Ordering::SeqCst);
                        Err(row)
                    }
                }
            }
            Transport::Batching {
                tx,
                batch_size,
                pending,
                ..
            } => {
                let mut pending = pending.lock();
                if pending.len() >= *batch_size && !Self::flush_locked(tx, &mut pending, timeout) {
                    return Err(row);
                }
                self.size.fetch_add(1, Ordering::SeqCst);
                pending.push(row);
                if pending.len() >= *batch_size {
                    // Best effort; a full channel leaves the batch parked.
                    Self::flush_locked(tx, &mut pending, Duration::ZERO);
                }
                Ok(())
            }
            Transport::Queue(queue) => {
                self.size.fetch_add(1, Ordering::SeqCst);
                queue.lock().push_back(row);
                Ok(())
            }
        }
    }

    /// Put a row, waiting as long as needed.
    pub fn put_row(&self, row: Row) {
        let mut row = row;
        loop {
            match self.put_row_wait(row, Duration::from_millis(100)) {
                Ok(()) => return,
                Err(back) => row = back,
            }
        }
    }

    /// Push any parked batch downstream. Returns false if the channel stayed
    /// full for `timeout`.
    pub fn flush_wait(&self, timeout: Duration) -> bool {
        match &self.transport {
            Transport::Batching { tx, pending, .. } => {
                let mut pending = pending.lock();
                Self::flush_locked(tx, &mut pending, timeout)
            }
            _ => true,
        }
    }

    fn flush_locked(tx: &Sender<Vec<Row>>, pending: &mut Vec<Row>, timeout: Duration) -> bool {
        if pending.is_empty() {
            return true;
        }
        let batch = std::mem::take(pending);
        match tx.send_timeout(batch, timeout) {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(batch)) | Err(SendTimeoutError::Disconnected(batch)) => {
                *pending = batch;
                false
            }
        }
    }

    /// Take the next row without waiting.
    pub fn get_row(&self) -> Option<Row> {
        let row = match &self.transport {
            Transport::Blocking { rx, .. } => rx.try_recv().ok(),
            Transport::Batching { rx, inbox, .. } => {
                let mut inbox = inbox.lock();
                if inbox.is_empty() {
                    if let Ok(batch) = rx.try_recv() {
                        inbox.extend(batch);
                    }
                }
                inbox.pop_front()
            }
            Transport::Queue(queue) => queue.lock().pop_front(),
        };
        if row.is_some() {
            self.size.fetch_sub(1, Ordering::SeqCst);
        }
        row
    }

    /// Take the next row, waiting at most `timeout` for one to arrive.
    pub fn get_row_wait(&self, timeout: Duration) -> Option<Row> {
        let row = match &self.transport {
            Transport::Blocking { rx, .. } => match rx.recv_timeout(timeout) {
                Ok(row) => Some(row),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
            },
            Transport::Batching { rx, inbox, .. } => {
                let mut inbox = inbox.lock();
                if inbox.is_empty() {
                    if let Ok(batch) = rx.recv_timeout(timeout) {
                        inbox.extend(batch);
                    }
                }
                inbox.pop_front()
            }
            Transport::Queue(queue) => queue.lock().pop_front(),
        };
        if row.is_some() {
            self.size.fetch_sub(1, Ordering::SeqCst);
        }
        row
    }

    /// Producer side: no more rows will be put.
    pub fn set_done(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Done and drained: the consumer will never see another row.
    pub fn is_finished(&self) -> bool {
        self.is_done() && self.size() == 0
    }

    /// Rows currently buffered.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    /// Drop every buffered row. Used on hard stop.
    pub fn clear(&self) {
        let dropped = match &self.transport {
            Transport::Blocking { rx, .. } => rx.try_iter().count(),
            Transport::Batching {
                rx, pending, inbox, ..
            } => {
                let mut n = std::mem::take(&mut *pending.lock()).len();
                n += std::mem::take(&mut *inbox.lock()).len();
                n + rx.try_iter().map(|b| b.len()).sum::<usize>()
            }
            Transport::Queue(queue) => std::mem::take(&mut *queue.lock()).len(),
        };
        let _ = self
            .size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| Some(s.saturating_sub(dropped)));
    }

    /// Display name, e.g. `Read.0 - Write.1`.
    pub fn name(&self) -> String {
        format!("{} - {}", self.origin, self.destination)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("flavor", &self.flavor())
            .field("size", &self.size())
            .field("done", &self.is_done())
            .finish()
    }
}

/// Feeds rows into a stage copy from outside the pipeline.
///
/// Returned by `Pipeline::add_row_producer`. Call [`RowProducer::finished`]
/// when done so the consumer can complete.
#[derive(Debug, Clone)]
pub struct RowProducer {
    channel: std::sync::Arc<Channel>,
}

impl RowProducer {
    pub fn new(channel: std::sync::Arc<Channel>) -> Self {
        Self { channel }
    }

    /// Put a row, waiting for room as long as needed.
    pub fn put_row(&self, row: Row) {
        self.channel.put_row(row);
    }

    /// Put a row, giving up after `timeout`. Returns whether it was accepted.
    pub fn put_row_wait(&self, row: Row, timeout: Duration) -> bool {
        self.channel.put_row_wait(row, timeout).is_ok()
    }

    /// Signal that no more rows will follow.
    pub fn finished(&self) {
        while !self.channel.flush_wait(Duration::from_millis(100)) {}
        self.channel.set_done();
    }

    pub fn channel(&self) -> &std::sync::Arc<Channel> {
        &self.channel
    }
}
