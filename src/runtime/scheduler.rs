//! Cooperative connection scheduler.
//!
//! A fixed pool of worker tasks each owns a disjoint set of connection slots.
//! Per-connection reader and writer tasks do the socket I/O; workers run the
//! protocol. A worker drains at most `read_budget` frames per slot before
//! moving to the next one, so one busy peer cannot starve the rest. Frames of
//! one connection are always handled in receipt order by a single worker.

use crate::config::{NetworkConfig, ServerConfig};
use crate::core::packet::Frame;
use crate::error::constants::ERR_SERVER_FULL;
use crate::error::{ProtocolError, Result};
use crate::protocol::session::Session;
use crate::runtime::context::{Connection, Runtime};
use crate::stream::mux::StreamMux;
use crate::transport::framed::{ByteStream, FrameReader, FrameWriter, FramedTransport};
use crate::utils::locks;
use futures::{SinkExt, StreamExt};
use rand::seq::IndexedRandom;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

const INBOUND_CAPACITY: usize = 256;
const CLIENT_TICK: Duration = Duration::from_millis(100);
const CLIENT_READ_BUDGET: usize = 64;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub connections_per_worker: usize,
    pub read_budget: usize,
    pub tick_interval: Duration,
}

impl From<&ServerConfig> for SchedulerConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            workers: config.workers,
            connections_per_worker: config.connections_per_worker,
            read_budget: config.read_budget,
            tick_interval: config.tick_interval,
        }
    }
}

impl SchedulerConfig {
    /// One worker holding a single connection
    pub fn client(config: &NetworkConfig) -> Self {
        Self {
            workers: 1,
            connections_per_worker: 1,
            read_budget: CLIENT_READ_BUDGET,
            tick_interval: CLIENT_TICK.min(config.protocol.keepalive_interval),
        }
    }
}

/// What a reader task hands its worker
enum Inbound {
    Frame(Frame),
    Closed(String),
}

struct Slot {
    connection: Arc<Connection>,
    inbound: mpsc::Receiver<Inbound>,
    reader: JoinHandle<()>,
}

struct Worker {
    index: usize,
    slots: Mutex<Vec<Slot>>,
    notify: Arc<Notify>,
    load: AtomicUsize,
}

impl Worker {
    fn new(index: usize) -> Self {
        Self {
            index,
            slots: Mutex::new(Vec::new()),
            notify: Arc::new(Notify::new()),
            load: AtomicUsize::new(0),
        }
    }

    fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    /// One pass over every owned connection
    fn service(&self, runtime: &Runtime, read_budget: usize, tick: Option<Instant>) {
        let mut more = false;
        let mut finished = Vec::new();
        {
            let Ok(mut slots) = locks::lock(&self.slots) else {
                return;
            };
            for slot in slots.iter_mut() {
                let mut handled = 0;
                while handled < read_budget {
                    match slot.inbound.try_recv() {
                        Ok(Inbound::Frame(frame)) => {
                            runtime.handle_frame(&slot.connection, frame);
                            handled += 1;
                        }
                        Ok(Inbound::Closed(reason)) => {
                            runtime.connection_lost(&slot.connection, reason);
                            break;
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            runtime.connection_lost(&slot.connection, "reader stopped".into());
                            break;
                        }
                    }
                }
                if handled == read_budget {
                    more = true;
                }
                if let Some(now) = tick {
                    runtime.tick_connection(&slot.connection, now);
                }
            }

            let mut index = 0;
            while index < slots.len() {
                if slots[index].connection.is_closed() {
                    let slot = slots.swap_remove(index);
                    slot.reader.abort();
                    finished.push(slot.connection);
                } else {
                    index += 1;
                }
            }
            self.load.store(slots.len(), Ordering::Release);
        }

        for connection in finished {
            trace!(worker = self.index, connection_id = connection.id(), "slot released");
            runtime.detach(&connection, "connection closed");
        }
        if more {
            self.notify.notify_one();
        }
    }

    fn abort_all(&self) {
        if let Ok(mut slots) = locks::lock(&self.slots) {
            for slot in slots.drain(..) {
                slot.reader.abort();
                slot.connection.shutdown_outbound();
            }
            self.load.store(0, Ordering::Release);
        }
    }
}

pub struct Scheduler {
    runtime: Runtime,
    workers: Vec<Arc<Worker>>,
    config: SchedulerConfig,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("loads", &self.loads())
            .finish()
    }
}

impl Scheduler {
    /// Spawn the worker tasks
    pub fn start(runtime: Runtime, config: SchedulerConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let workers: Vec<Arc<Worker>> = (0..config.workers.max(1))
            .map(|i| Arc::new(Worker::new(i)))
            .collect();

        let handles = workers
            .iter()
            .map(|worker| {
                tokio::spawn(run_worker(
                    Arc::clone(worker),
                    runtime.clone(),
                    config.read_budget.max(1),
                    config.tick_interval,
                    shutdown.subscribe(),
                ))
            })
            .collect();

        info!(workers = workers.len(), per_worker = config.connections_per_worker, "scheduler started");
        Arc::new(Self {
            runtime,
            workers,
            config,
            shutdown,
            handles: Mutex::new(handles),
        })
    }

    pub fn capacity(&self) -> usize {
        self.workers.len() * self.config.connections_per_worker
    }

    pub fn has_capacity(&self) -> bool {
        self.workers
            .iter()
            .any(|w| w.load() < self.config.connections_per_worker)
    }

    /// Connections per worker, in worker order
    pub fn loads(&self) -> Vec<usize> {
        self.workers.iter().map(|w| w.load()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.loads().iter().sum()
    }

    fn pick_worker(&self) -> Option<Arc<Worker>> {
        let least = self
            .workers
            .iter()
            .map(|w| w.load())
            .filter(|load| *load < self.config.connections_per_worker)
            .min()?;
        let candidates: Vec<&Arc<Worker>> = self
            .workers
            .iter()
            .filter(|w| w.load() == least)
            .collect();
        candidates.choose(&mut rand::rng()).map(|w| Arc::clone(w))
    }

    /// Hand a transport and its session to the least loaded worker
    #[instrument(skip_all, fields(peer = %transport.peer()))]
    pub fn attach<T: ByteStream>(
        &self,
        transport: FramedTransport<T>,
        session: Session,
    ) -> Result<Arc<Connection>> {
        let worker = self
            .pick_worker()
            .ok_or_else(|| ProtocolError::Rejected(ERR_SERVER_FULL.into()))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let streams = StreamMux::new(self.runtime.side(), &self.runtime.config().streams);
        let connection = Arc::new(Connection::new(
            session,
            streams,
            outbound_tx,
            Arc::clone(&worker.notify),
            self.runtime.metrics_handle(),
        ));
        self.runtime.register_connection(Arc::clone(&connection))?;

        let (sink, stream) = transport.split();
        tokio::spawn(write_loop(sink, outbound_rx, inbound_tx.clone()));
        let reader = tokio::spawn(read_loop(stream, inbound_tx, Arc::clone(&connection)));

        {
            let mut slots = locks::lock(&worker.slots)?;
            slots.push(Slot {
                connection: Arc::clone(&connection),
                inbound: inbound_rx,
                reader,
            });
            worker.load.store(slots.len(), Ordering::Release);
        }
        debug!(worker = worker.index, connection_id = connection.id(), "connection assigned");

        // Anything the session queued before it had a writer
        let _ = connection.session_op(|_| Ok(()));
        worker.notify.notify_one();
        Ok(connection)
    }

    /// Even out worker loads; returns how many connections moved
    pub fn rebalance(&self) -> Result<usize> {
        let mut moved = 0;
        loop {
            let (Some(busiest), Some(idlest)) = (
                self.workers.iter().max_by_key(|w| w.load()),
                self.workers.iter().min_by_key(|w| w.load()),
            ) else {
                return Ok(moved);
            };
            if busiest.load() <= idlest.load() + 1 {
                return Ok(moved);
            }

            // Both locks, always in index order
            let (first, second) = if busiest.index < idlest.index {
                (busiest, idlest)
            } else {
                (idlest, busiest)
            };
            let mut first_slots = locks::lock(&first.slots)?;
            let mut second_slots = locks::lock(&second.slots)?;
            let (from, to) = if busiest.index < idlest.index {
                (&mut *first_slots, &mut *second_slots)
            } else {
                (&mut *second_slots, &mut *first_slots)
            };
            if from.len() <= to.len() + 1 {
                return Ok(moved);
            }
            let Some(slot) = from.pop() else {
                return Ok(moved);
            };
            slot.connection.set_waker(Arc::clone(&idlest.notify));
            debug!(connection_id = slot.connection.id(), from = busiest.index, to = idlest.index, "connection migrated");
            to.push(slot);
            busiest.load.store(from.len(), Ordering::Release);
            idlest.load.store(to.len(), Ordering::Release);
            drop(first_slots);
            drop(second_slots);
            idlest.notify.notify_one();
            moved += 1;
        }
    }

    /// Stop every worker and drop whatever connections remain
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = locks::lock(&self.handles)
            .map(|mut h| h.drain(..).collect())
            .unwrap_or_default();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker ended abnormally");
            }
        }
        for worker in &self.workers {
            worker.abort_all();
        }
        info!("scheduler stopped");
    }
}

async fn run_worker(
    worker: Arc<Worker>,
    runtime: Runtime,
    read_budget: usize,
    tick_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        let tick = tokio::select! {
            _ = worker.notify.notified() => None,
            _ = ticker.tick() => Some(Instant::now()),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(worker = worker.index, "worker stopping");
                    return;
                }
                None
            }
        };
        worker.service(&runtime, read_budget, tick);
    }
}

async fn read_loop<T: ByteStream>(
    mut stream: FrameReader<T>,
    inbound: mpsc::Sender<Inbound>,
    connection: Arc<Connection>,
) {
    loop {
        let item = match stream.next().await {
            Some(Ok(frame)) => Inbound::Frame(frame),
            Some(Err(e)) => Inbound::Closed(e.to_string()),
            None => Inbound::Closed("peer closed the connection".into()),
        };
        let last = matches!(item, Inbound::Closed(_));
        if inbound.send(item).await.is_err() {
            return;
        }
        connection.wake();
        if last {
            return;
        }
    }
}

async fn write_loop<T: ByteStream>(
    mut sink: FrameWriter<T>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    inbound: mpsc::Sender<Inbound>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(frame).await {
            debug!(error = %e, "write failed");
            let _ = inbound.send(Inbound::Closed(format!("write failed: {e}"))).await;
            return;
        }
    }
    // Sender dropped: the connection is done, flush and close our half
    if let Err(e) = sink.close().await {
        trace!(error = %e, "close after drain failed");
    }
}
