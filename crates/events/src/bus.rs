//! Process-wide change-event bus.
//!
//! [`EventBus`] delivers every published
//! [`ChangeEvent`](metacat_core::event::ChangeEvent), in one total publish
//! order, to every registered [`EventConsumer`]. Each consumer runs on its
//! own task and drains a bounded channel at its own pace; when the slowest
//! consumer falls a full buffer behind, [`publish`](EventBus::publish)
//! stalls the caller instead of dropping events.
//!
//! Internally a single dispatcher task serializes concurrent publishers
//! into one order and fans each event out to the per-consumer channels.
//! Consumer registration and removal travel over the dispatcher's command
//! channel, so the registry mutates without locks even while a dispatch is
//! blocked on a full channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use metacat_core::event::ChangeEvent;

use crate::error::{BusError, ConsumerError};

/// Default capacity of the per-consumer event buffer.
pub const DEFAULT_CAPACITY: usize = 1024;

/// How long `remove_consumer` and `shutdown` wait for tasks to exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// EventConsumer
// ---------------------------------------------------------------------------

/// A registered reader of the event bus.
///
/// Implementations run on a dedicated task. `on_event` receives every
/// published event in publish order; `end_of_batch` is `true` when no
/// further event is already buffered for this consumer, which lets
/// batching consumers flush without waiting.
///
/// Returning an error from `on_event` retires the consumer: its task stops
/// handling events but stays registered (still gating the writer) until it
/// is removed or the bus shuts down.
#[async_trait]
pub trait EventConsumer: Send + 'static {
    /// Called once on the consumer task before the first event.
    async fn on_start(&mut self) {}

    /// Handle one event.
    async fn on_event(
        &mut self,
        event: Arc<ChangeEvent>,
        end_of_batch: bool,
    ) -> Result<(), ConsumerError>;

    /// Called once when the consumer stops, cleanly or after a failure.
    async fn on_shutdown(&mut self) {}
}

/// Adapts a closure into an [`EventConsumer`].
pub struct FnConsumer<F> {
    f: F,
}

impl<F> FnConsumer<F>
where
    F: FnMut(Arc<ChangeEvent>, bool) -> Result<(), ConsumerError> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> EventConsumer for FnConsumer<F>
where
    F: FnMut(Arc<ChangeEvent>, bool) -> Result<(), ConsumerError> + Send + 'static,
{
    async fn on_event(
        &mut self,
        event: Arc<ChangeEvent>,
        end_of_batch: bool,
    ) -> Result<(), ConsumerError> {
        (self.f)(event, end_of_batch)
    }
}

// ---------------------------------------------------------------------------
// ConsumerHandle
// ---------------------------------------------------------------------------

/// Handle to a registered consumer, used to remove it later.
pub struct ConsumerHandle {
    id: u64,
    cancel: CancellationToken,
    terminated: Arc<AtomicBool>,
    done: oneshot::Receiver<()>,
}

impl ConsumerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the consumer retired itself by returning an error from
    /// `on_event`. A terminated consumer no longer handles events but
    /// keeps gating the writer until removed.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

enum BusCommand {
    Join {
        id: u64,
        tx: mpsc::Sender<Arc<ChangeEvent>>,
    },
    Leave {
        id: u64,
    },
}

struct ConsumerChannel {
    id: u64,
    tx: mpsc::Sender<Arc<ChangeEvent>>,
}

/// Bounded multi-consumer broadcast bus with backpressure.
///
/// Built once at startup and shared via `Arc<EventBus>`. Construction
/// spawns the dispatcher task, so a bus must be created inside a Tokio
/// runtime.
pub struct EventBus {
    input: mpsc::Sender<Arc<ChangeEvent>>,
    commands: mpsc::UnboundedSender<BusCommand>,
    capacity: usize,
    next_id: AtomicU64,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl EventBus {
    /// Create a bus whose consumers may each buffer up to `capacity`
    /// events before the writer stalls.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "event bus capacity must be non-zero");

        // The input channel is kept at capacity 1 so the producer stall
        // point stays close to `capacity` events behind the slowest
        // consumer.
        let (input_tx, input_rx) = mpsc::channel(1);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(dispatch_loop(input_rx, cmd_rx, cancel.clone()));

        Self {
            input: input_tx,
            commands: cmd_tx,
            capacity,
            next_id: AtomicU64::new(0),
            cancel,
            tracker,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish one event to every registered consumer.
    ///
    /// All consumers observe events in one total publish order. When the
    /// slowest consumer is a full buffer behind, this call stalls until a
    /// slot frees; it never drops an event. Errors only once the bus has
    /// shut down.
    pub async fn publish(&self, event: ChangeEvent) -> Result<(), BusError> {
        self.input
            .send(Arc::new(event))
            .await
            .map_err(|_| BusError::Closed)
    }

    /// Register a consumer starting from the current tail (no backlog
    /// replay) and spawn its dedicated task.
    pub fn add_consumer(&self, handler: impl EventConsumer) -> Result<ConsumerHandle, BusError> {
        if self.cancel.is_cancelled() {
            return Err(BusError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.commands
            .send(BusCommand::Join { id, tx })
            .map_err(|_| BusError::Closed)?;

        let cancel = self.cancel.child_token();
        let terminated = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = oneshot::channel();
        self.tracker.spawn(consumer_loop(
            id,
            rx,
            Box::new(handler),
            cancel.clone(),
            Arc::clone(&terminated),
            done_tx,
        ));

        tracing::debug!(consumer_id = id, "Consumer registered");
        Ok(ConsumerHandle {
            id,
            cancel,
            terminated,
            done: done_rx,
        })
    }

    /// Deregister a consumer: it stops after finishing its current event
    /// and no longer holds back the writer. Waits (bounded) for the task
    /// to exit.
    pub async fn remove_consumer(&self, handle: ConsumerHandle) {
        let _ = self.commands.send(BusCommand::Leave { id: handle.id });
        handle.cancel.cancel();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle.done)
            .await
            .is_err()
        {
            tracing::warn!(
                consumer_id = handle.id,
                "Timed out waiting for consumer to stop"
            );
        }
    }

    /// Stop the dispatcher and every consumer, waiting up to a bounded
    /// timeout for clean task exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("Timed out waiting for event bus tasks to stop");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

async fn dispatch_loop(
    mut input: mpsc::Receiver<Arc<ChangeEvent>>,
    mut commands: mpsc::UnboundedReceiver<BusCommand>,
    cancel: CancellationToken,
) {
    let mut consumers: Vec<ConsumerChannel> = Vec::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            cmd = commands.recv() => match cmd {
                Some(BusCommand::Join { id, tx }) => consumers.push(ConsumerChannel { id, tx }),
                Some(BusCommand::Leave { id }) => consumers.retain(|c| c.id != id),
                // The bus handle was dropped; treat it as shutdown.
                None => break,
            },
            event = input.recv() => match event {
                Some(event) => {
                    if !dispatch_event(event, &mut consumers, &mut commands, &cancel).await {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    // Releases every consumer, including ones parked after a failure.
    cancel.cancel();
}

/// Forward one event to every registered consumer, in registration order.
///
/// Leave commands are honored even while blocked on a full channel, so
/// removing a stalled consumer always unblocks the writer. Joins observed
/// mid-dispatch take effect after this event. Returns `false` when the
/// bus is shutting down.
async fn dispatch_event(
    event: Arc<ChangeEvent>,
    consumers: &mut Vec<ConsumerChannel>,
    commands: &mut mpsc::UnboundedReceiver<BusCommand>,
    cancel: &CancellationToken,
) -> bool {
    let mut pending_joins: Vec<ConsumerChannel> = Vec::new();
    let mut i = 0;

    'consumers: while i < consumers.len() {
        let tx = consumers[i].tx.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                cmd = commands.recv() => match cmd {
                    Some(BusCommand::Join { id, tx: joined }) => {
                        pending_joins.push(ConsumerChannel { id, tx: joined });
                    }
                    Some(BusCommand::Leave { id }) => {
                        pending_joins.retain(|c| c.id != id);
                        if let Some(pos) = consumers.iter().position(|c| c.id == id) {
                            consumers.remove(pos);
                            if pos < i {
                                i -= 1;
                            }
                            continue 'consumers;
                        }
                    }
                    None => return false,
                },
                permit = tx.reserve() => match permit {
                    Ok(permit) => {
                        permit.send(Arc::clone(&event));
                        break;
                    }
                    // Receiver gone without a Leave; forget the consumer.
                    Err(_) => {
                        consumers.remove(i);
                        continue 'consumers;
                    }
                },
            }
        }
        i += 1;
    }

    consumers.append(&mut pending_joins);
    true
}

// ---------------------------------------------------------------------------
// Consumer task
// ---------------------------------------------------------------------------

async fn consumer_loop(
    id: u64,
    mut rx: mpsc::Receiver<Arc<ChangeEvent>>,
    mut handler: Box<dyn EventConsumer>,
    cancel: CancellationToken,
    terminated: Arc<AtomicBool>,
    done: oneshot::Sender<()>,
) {
    handler.on_start().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => {
                    let end_of_batch = rx.is_empty();
                    if let Err(err) = handler.on_event(event, end_of_batch).await {
                        tracing::error!(
                            consumer_id = id,
                            error = %err,
                            "Consumer failed, retiring it"
                        );
                        terminated.store(true, Ordering::Release);
                        handler.on_shutdown().await;
                        // Park holding the receiver: the retired consumer
                        // keeps gating the writer until removed.
                        cancel.cancelled().await;
                        let _ = done.send(());
                        return;
                    }
                }
                None => break,
            },
        }
    }

    handler.on_shutdown().await;
    let _ = done.send(());
}
