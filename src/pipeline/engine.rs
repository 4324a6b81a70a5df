//! Pipelining engine.
//!
//! ## Drivers
//!
//! ```text
//!   callers ──execute()──► requests ──send driver──► FrameWriter ──► socket
//!                                         │
//!                                         ▼
//!   callers ◄──oneshot──── awaiting ◄──receive driver◄── FrameReader ◄── socket
//! ```
//!
//! The send driver and the receive driver are Tokio tasks started on demand.
//! An atomic "active" flag per direction makes sure at most one of each runs
//! per connection: whoever flips the flag from `false` to `true` spawns the
//! driver, everyone else just enqueues. A driver that runs out of work clears
//! its flag and then looks at its queue once more, so an item pushed during
//! that window is never stranded.
//!
//! The writer and reader live in slots on the shared state. The active
//! driver takes its half out of the slot for the duration of its run, so the
//! socket halves, the write buffer and the read buffer lease are owned by
//! exactly one task at a time.
//!
//! ## Ordering
//!
//! Both queues are FIFO and each driver finishes one item before starting
//! the next, so the Nth request written is paired with the Nth reply read.
//!
//! ## Poisoning
//!
//! The first transport fault is latched for the life of the pipeline. Every
//! queued request, every request awaiting a reply and every later request
//! fails with that fault.
//!
//! ## One-way mode
//!
//! Every ordinary request holds a ticket from the moment it is queued until
//! its reply has been read. The one-way flag is flipped under the request
//! queue lock, so no ordinary request can be queued after it, and
//! subscribers only start reading once the last ticket is gone.

use crate::buffer::BufferPool;
use crate::error::{Error, TransportError};
use crate::protocol::{FrameReader, FrameWriter, Response, DEFAULT_SEND_BUFFER_SIZE};
use crate::transport::{self, BoxSocket};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

/// Default soft limit on requests waiting to be written
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 1024;

type Writer = FrameWriter<WriteHalf<BoxSocket>>;
type Reader = FrameReader<ReadHalf<BoxSocket>>;

/// `Ok(None)` acknowledges a one-way send; `Ok(Some(_))` carries a reply.
type Completion = oneshot::Sender<Result<Option<Response>, TransportError>>;

/// Tunables for one pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Size of the write buffer (default: 16 KB)
    pub send_buffer_size: usize,

    /// Requests allowed to wait for the send driver before producers
    /// are held back (default: 1024)
    pub max_queue_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
        }
    }
}

/// Counters for one pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Requests written to the socket (including one-way sends)
    pub commands_sent: AtomicU64,
    /// Replies parsed and delivered
    pub replies_received: AtomicU64,
    /// Bytes flushed to the socket
    pub bytes_written: AtomicU64,
    /// Bytes read from the socket
    pub bytes_read: AtomicU64,
    /// Requests failed because the pipeline was poisoned
    pub commands_failed: AtomicU64,
}

impl PipelineStats {
    fn command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn reply_received(&self) {
        self.replies_received.fetch_add(1, Ordering::Relaxed);
    }

    fn command_failed(&self) {
        self.commands_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn add_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    fn add_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Ordinary requests that have been queued and not yet answered.
#[derive(Default)]
struct Outstanding {
    count: AtomicUsize,
    settled: Notify,
}

/// Held by an ordinary request until its reply is read or it fails.
struct Ticket(Arc<Outstanding>);

impl Ticket {
    fn issue(outstanding: &Arc<Outstanding>) -> Self {
        outstanding.count.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(outstanding))
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.settled.notify_waiters();
        }
    }
}

/// A request waiting for the send driver.
struct PendingRequest {
    args: Vec<Bytes>,
    one_way: bool,
    completion: Completion,
    ticket: Option<Ticket>,
    /// Held while queued; dropping it lets a blocked producer in.
    _slot: OwnedSemaphorePermit,
}

/// A request whose bytes are written and whose reply is still to be read,
/// or a subscriber waiting for the next pushed message (no ticket).
struct AwaitingReply {
    completion: Completion,
    ticket: Option<Ticket>,
}

struct Shared {
    label: String,
    requests: Mutex<VecDeque<PendingRequest>>,
    awaiting: Mutex<VecDeque<AwaitingReply>>,
    writer: Mutex<Option<Writer>>,
    reader: Mutex<Option<Reader>>,
    send_active: AtomicBool,
    receive_active: AtomicBool,
    one_way: AtomicBool,
    fault: OnceLock<TransportError>,
    /// Bounds the request queue; closed on poison so blocked producers wake.
    queue_slots: Arc<Semaphore>,
    /// Woken when the pipeline is poisoned.
    poisoned: Notify,
    outstanding: Arc<Outstanding>,
    stats: PipelineStats,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The ordering engine for one connection.
///
/// `execute` may be called concurrently from any number of tasks; replies
/// are delivered to callers in the order their requests were enqueued.
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("label", &self.shared.label)
            .field("one_way", &self.is_one_way())
            .field("fault", &self.shared.fault.get())
            .finish()
    }
}

impl Pipeline {
    /// Builds a pipeline over a connected socket.
    ///
    /// `label` identifies the connection in log output.
    pub fn new(
        socket: BoxSocket,
        config: &PipelineConfig,
        buffers: BufferPool,
        label: impl Into<String>,
    ) -> Self {
        let (recv, send) = transport::split(socket);
        let shared = Shared {
            label: label.into(),
            requests: Mutex::new(VecDeque::new()),
            awaiting: Mutex::new(VecDeque::new()),
            writer: Mutex::new(Some(FrameWriter::from_transport(
                send,
                config.send_buffer_size.max(1),
            ))),
            reader: Mutex::new(Some(FrameReader::from_transport(recv, buffers))),
            send_active: AtomicBool::new(false),
            receive_active: AtomicBool::new(false),
            one_way: AtomicBool::new(false),
            fault: OnceLock::new(),
            queue_slots: Arc::new(Semaphore::new(config.max_queue_depth.max(1))),
            poisoned: Notify::new(),
            outstanding: Arc::default(),
            stats: PipelineStats::default(),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Sends a command and waits for its reply.
    ///
    /// Error replies are returned as `Ok(Response::Error(_))`; only
    /// transport faults and misuse are `Err`.
    pub async fn execute(&self, args: Vec<Bytes>) -> Result<Response, Error> {
        if self.is_one_way() {
            return Err(Error::OneWayMode);
        }
        match self.enqueue(args, false).await? {
            Some(reply) => Ok(reply),
            None => Err(Error::Transport(TransportError::Closed)),
        }
    }

    /// Sends a command without reading a reply. Returns once the bytes have
    /// been flushed to the socket. Only allowed in one-way mode.
    pub async fn send_one_way(&self, args: Vec<Bytes>) -> Result<(), Error> {
        if !self.is_one_way() {
            return Err(Error::NotOneWay);
        }
        self.enqueue(args, true).await.map(|_| ())
    }

    /// Reads the next reply off the socket without sending anything.
    /// Only allowed in one-way mode.
    ///
    /// Dropping the future before the receive driver has started on it
    /// gives up its place in line. Once the driver is reading on its
    /// behalf, the message it was waiting for is discarded.
    pub async fn read_next(&self) -> Result<Response, Error> {
        if !self.is_one_way() {
            return Err(Error::NotOneWay);
        }
        self.shared.settled().await;
        if let Some(fault) = self.shared.fault.get() {
            return Err(fault.clone().into());
        }
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.awaiting).push_back(AwaitingReply {
            completion: tx,
            ticket: None,
        });
        Shared::arm_receive(&self.shared);
        match self.shared.outcome(rx).await? {
            Some(reply) => Ok(reply),
            None => Err(Error::Transport(TransportError::Closed)),
        }
    }

    /// Switches to one-way mode and waits until every ordinary request
    /// already accepted has been written and answered.
    ///
    /// The switch is permanent. Ordinary `execute` calls made afterwards
    /// fail with [`Error::OneWayMode`].
    pub async fn enter_one_way(&self) {
        let switched = {
            let _requests = lock(&self.shared.requests);
            !self.shared.one_way.swap(true, Ordering::AcqRel)
        };
        self.shared.settled().await;
        if switched {
            debug!(conn = %self.shared.label, "Pipeline switched to one-way mode");
        }
    }

    /// Poisons the pipeline with [`TransportError::Closed`] and shuts the
    /// socket down. Pending requests fail.
    pub async fn close(&self) {
        self.shared.poison(TransportError::Closed);
        let writer = lock(&self.shared.writer).take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                trace!(conn = %self.shared.label, error = %e, "Socket shutdown failed");
            }
        }
        lock(&self.shared.reader).take();
    }

    /// The latched fault, if the pipeline is poisoned.
    pub fn fault(&self) -> Option<TransportError> {
        self.shared.fault.get().cloned()
    }

    pub fn is_poisoned(&self) -> bool {
        self.shared.fault.get().is_some()
    }

    pub fn is_one_way(&self) -> bool {
        self.shared.one_way.load(Ordering::Acquire)
    }

    /// Requests waiting to be written.
    pub fn queued(&self) -> usize {
        lock(&self.shared.requests).len()
    }

    /// Requests written and waiting for a reply.
    pub fn in_flight(&self) -> usize {
        lock(&self.shared.awaiting).len()
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.shared.stats
    }

    async fn enqueue(&self, args: Vec<Bytes>, one_way: bool) -> Result<Option<Response>, Error> {
        if let Some(fault) = self.shared.fault.get() {
            return Err(fault.clone().into());
        }
        // Backpressure: wait for room in the request queue.
        let slot = match Arc::clone(&self.shared.queue_slots).acquire_owned().await {
            Ok(slot) => slot,
            Err(_) => return Err(self.shared.current_fault().into()),
        };
        let (tx, rx) = oneshot::channel();
        {
            let mut requests = lock(&self.shared.requests);
            // Checked under the queue lock so a switch to one-way mode
            // never races a producer that was parked on backpressure.
            if !one_way && self.is_one_way() {
                return Err(Error::OneWayMode);
            }
            let ticket = (!one_way).then(|| Ticket::issue(&self.shared.outstanding));
            requests.push_back(PendingRequest {
                args,
                one_way,
                completion: tx,
                ticket,
                _slot: slot,
            });
        }
        Shared::arm_send(&self.shared);
        self.shared.outcome(rx).await
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // Lets an idle-blocked receive driver exit and release the socket.
        self.shared.poison(TransportError::Closed);
    }
}

impl Shared {
    async fn outcome(
        &self,
        rx: oneshot::Receiver<Result<Option<Response>, TransportError>>,
    ) -> Result<Option<Response>, Error> {
        match rx.await {
            Ok(result) => result.map_err(Error::from),
            // A driver dropped the completion without answering; only
            // possible if its task was torn down with the runtime.
            Err(_) => Err(self.current_fault().into()),
        }
    }

    fn current_fault(&self) -> TransportError {
        self.fault.get().cloned().unwrap_or(TransportError::Closed)
    }

    /// Waits until no ordinary request is queued or awaiting a reply.
    async fn settled(&self) {
        loop {
            let settled = self.outstanding.settled.notified();
            if self.outstanding.count.load(Ordering::Acquire) == 0 {
                return;
            }
            settled.await;
        }
    }

    fn arm_send(this: &Arc<Self>) {
        if this
            .send_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tokio::spawn(Self::run_send(Arc::clone(this)));
        }
    }

    fn arm_receive(this: &Arc<Self>) {
        if this
            .receive_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tokio::spawn(Self::run_receive(Arc::clone(this)));
        }
    }

    /// Latches `fault` (first one wins) and fails everything queued.
    fn poison(&self, fault: TransportError) {
        if self.fault.set(fault).is_ok() {
            let fault = self.current_fault();
            if matches!(fault, TransportError::Closed) {
                debug!(conn = %self.label, "Pipeline closed");
            } else {
                warn!(conn = %self.label, error = %fault, "Pipeline poisoned");
            }
            self.queue_slots.close();
            self.poisoned.notify_waiters();
        }
        self.fail_pending();
    }

    fn fail_pending(&self) {
        let fault = self.current_fault();
        let requests: Vec<_> = lock(&self.requests).drain(..).collect();
        let awaiting: Vec<_> = lock(&self.awaiting).drain(..).collect();
        for request in requests {
            self.stats.command_failed();
            let _ = request.completion.send(Err(fault.clone()));
        }
        for waiter in awaiting {
            self.stats.command_failed();
            let _ = waiter.completion.send(Err(fault.clone()));
        }
    }

    async fn run_send(this: Arc<Self>) {
        loop {
            let writer = lock(&this.writer).take();
            match writer {
                Some(mut writer) => match this.drain_requests(&mut writer).await {
                    // Closed while this driver held the writer.
                    Ok(()) if this.fault.get().is_some() => drop(writer),
                    Ok(()) => *lock(&this.writer) = Some(writer),
                    Err(fault) => {
                        drop(writer);
                        this.poison(fault);
                    }
                },
                // The writer only goes missing once the pipeline is closed.
                None => this.fail_pending(),
            }

            this.send_active.store(false, Ordering::Release);

            if lock(&this.requests).is_empty() {
                return;
            }
            if this
                .send_active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
        }
    }

    /// Writes queued requests until the queue is empty and everything has
    /// been flushed.
    async fn drain_requests(self: &Arc<Self>, writer: &mut Writer) -> Result<(), TransportError> {
        let flushed_before = writer.bytes_flushed();
        let result = self.write_queued(writer).await;
        self.stats.add_written(writer.bytes_flushed() - flushed_before);
        result
    }

    async fn write_queued(self: &Arc<Self>, writer: &mut Writer) -> Result<(), TransportError> {
        // One-way sends are acknowledged once their bytes are flushed.
        let mut unacked: Vec<Completion> = Vec::new();

        loop {
            if let Some(fault) = self.fault.get() {
                return Err(self.abandon(unacked, fault.clone()));
            }
            let next = lock(&self.requests).pop_front();
            let Some(request) = next else {
                if let Err(fault) = writer.flush().await {
                    return Err(self.abandon(unacked, fault));
                }
                for completion in unacked {
                    let _ = completion.send(Ok(None));
                }
                return Ok(());
            };

            let PendingRequest {
                args,
                one_way,
                completion,
                ticket,
                _slot,
            } = request;
            drop(_slot);

            if let Err(fault) = writer.write(&args).await {
                unacked.push(completion);
                return Err(self.abandon(unacked, fault));
            }
            self.stats.command_sent();

            if one_way {
                unacked.push(completion);
            } else {
                lock(&self.awaiting).push_back(AwaitingReply { completion, ticket });
                Self::arm_receive(self);
            }
        }
    }

    /// Poisons the pipeline, then fails completions already taken off the
    /// queues.
    fn abandon(&self, completions: Vec<Completion>, fault: TransportError) -> TransportError {
        self.poison(fault);
        let fault = self.current_fault();
        for completion in completions {
            self.stats.command_failed();
            let _ = completion.send(Err(fault.clone()));
        }
        fault
    }

    async fn run_receive(this: Arc<Self>) {
        loop {
            let reader = lock(&this.reader).take();
            match reader {
                Some(mut reader) => match this.drain_replies(&mut reader).await {
                    Ok(()) if this.fault.get().is_some() => drop(reader),
                    Ok(()) => *lock(&this.reader) = Some(reader),
                    Err(fault) => {
                        drop(reader);
                        this.poison(fault);
                    }
                },
                None => this.fail_pending(),
            }

            this.receive_active.store(false, Ordering::Release);

            if lock(&this.awaiting).is_empty() {
                return;
            }
            if this
                .receive_active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
        }
    }

    /// Reads one reply per awaiting request, oldest first, until none remain.
    async fn drain_replies(&self, reader: &mut Reader) -> Result<(), TransportError> {
        let received_before = reader.bytes_received();
        let result = self.read_awaited(reader).await;
        self.stats.add_read(reader.bytes_received() - received_before);
        result
    }

    async fn read_awaited(&self, reader: &mut Reader) -> Result<(), TransportError> {
        loop {
            let poisoned = self.poisoned.notified();
            if let Some(fault) = self.fault.get() {
                return Err(fault.clone());
            }
            let next = lock(&self.awaiting).pop_front();
            let Some(waiter) = next else {
                return Ok(());
            };
            if waiter.ticket.is_none() && waiter.completion.is_closed() {
                trace!(conn = %self.label, "Skipping abandoned subscriber");
                continue;
            }

            let result = tokio::select! {
                reply = reader.receive() => reply,
                _ = poisoned => Err(self.current_fault()),
            };

            match result {
                Ok(reply) => {
                    self.stats.reply_received();
                    trace!(conn = %self.label, "Reply delivered");
                    let _ = waiter.completion.send(Ok(Some(reply)));
                }
                Err(fault) => return Err(self.abandon(vec![waiter.completion], fault)),
            }
        }
    }
}
