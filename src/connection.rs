use crate::config::LinkConfig;
use crate::dispatcher::EventDispatcher;
use crate::fault::FaultInjector;
use crate::segment::{emit_segment, Segment};
use crate::send_socket::SendSocket;
use crate::stream::{Stream, StreamJob};
use rand::Rng;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

/// Segments buffered per stream between arrival and the worker popping them.
const INBOUND_QUEUE_DEPTH: usize = 1024;

/// Which of the two peers this endpoint is. The role decides stream id
///  parity, so both sides can open streams concurrently without collisions.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    /// Allocates even stream ids.
    Server,
    /// Allocates odd stream ids.
    Client,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum KeepAliveState {
    Normal,
    /// A ping was launched for the current silence; no further pings until
    ///  traffic resumes or the connection is given up.
    Notified,
}

struct KeepAlive {
    last_inbound: Instant,
    state: KeepAliveState,
}

struct StreamHandle {
    inbound: mpsc::Sender<Segment>,
    worker: JoinHandle<()>,
}

/// This is the shared heart of one link: it owns the stream registry, routes
///  every inbound segment to the right mailbox, spawns a listening worker for
///  stream ids the peer opens, and watches inbound silence for the
///  keep-alive. All outbound traffic funnels through [Connection::send] so
///  the fault injector sees every segment.
pub struct Connection {
    /// Back-reference handed to stream workers, who need a shared handle.
    me: Weak<Connection>,
    peer_addr: SocketAddr,
    socket: Arc<dyn SendSocket>,
    dispatcher: Arc<dyn EventDispatcher>,
    config: LinkConfig,
    /// Runtime-adjustable copy of the configured fragment size; applies to
    ///  transfers started after the change.
    fragment_size: AtomicUsize,
    fault: FaultInjector,
    open: AtomicBool,
    streams: Mutex<FxHashMap<u32, StreamHandle>>,
    next_stream_id: AtomicU32,
    keep_alive: Mutex<KeepAlive>,
}

impl Connection {
    pub fn new(
        socket: Arc<dyn SendSocket>,
        peer_addr: SocketAddr,
        role: Role,
        config: LinkConfig,
        dispatcher: Arc<dyn EventDispatcher>,
    ) -> anyhow::Result<Arc<Connection>> {
        config.validate()?;
        let first_stream_id = match role {
            Role::Server => 0,
            Role::Client => 1,
        };
        info!("connection to {:?} as {:?}", peer_addr, role);
        Ok(Arc::new_cyclic(|me| Connection {
            me: me.clone(),
            peer_addr,
            socket,
            dispatcher,
            fragment_size: AtomicUsize::new(config.fragment_size),
            config,
            fault: FaultInjector::new(),
            open: AtomicBool::new(true),
            streams: Mutex::new(FxHashMap::default()),
            next_stream_id: AtomicU32::new(first_stream_id),
            keep_alive: Mutex::new(KeepAlive {
                last_inbound: Instant::now(),
                state: KeepAliveState::Normal,
            }),
        }))
    }

    /// Serializes and sends one segment to the peer, giving the fault
    ///  injector its chance to mangle the buffer first.
    pub(crate) async fn send(&self, segment: &Segment) {
        let mut buf = emit_segment(segment);
        self.fault.maybe_corrupt(segment, &mut buf);
        debug!("--> {}", segment);
        self.socket.send_packet(self.peer_addr, &buf).await;
    }

    /// Opens a fresh locally initiated stream and hands `job` to its worker.
    ///  Returns the allocated stream id.
    pub async fn open_stream(&self, job: StreamJob) -> u32 {
        let stream_id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let mut streams = self.streams.lock().await;
        self.start_stream(&mut streams, stream_id, job, None);
        stream_id
    }

    fn start_stream(
        &self,
        streams: &mut FxHashMap<u32, StreamHandle>,
        stream_id: u32,
        job: StreamJob,
        seed: Option<Segment>,
    ) {
        let Some(conn) = self.me.upgrade() else {
            // only reachable while the last handle is being dropped
            return;
        };
        let (sender, receiver) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        if let Some(segment) = seed {
            // freshly created channel, cannot be full or closed
            sender.try_send(segment).ok();
        }
        debug!("starting stream {} for {:?}", stream_id, job);
        let stream = Stream::new(stream_id, conn, receiver);
        let worker = tokio::spawn(stream.run(job));
        streams.insert(stream_id, StreamHandle { inbound: sender, worker });
    }

    /// Routes one parsed inbound segment. Known stream ids go to their
    ///  worker's mailbox; an unknown id means the peer opened a new stream,
    ///  which gets a listening worker seeded with this segment.
    pub async fn handle_segment(&self, segment: Segment) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "segment_received", ?correlation_id);
        async {
            self.refresh_keep_alive().await;

            let stream_id = segment.stream_id();
            let mut streams = self.streams.lock().await;
            if let Some(handle) = streams.get(&stream_id) {
                match handle.inbound.try_send(segment) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(segment)) => {
                        warn!("stream {} mailbox full - dropping {}", stream_id, segment);
                    }
                    Err(mpsc::error::TrySendError::Closed(segment)) => {
                        trace!("stream {} already finished - dropping {}", stream_id, segment);
                    }
                }
            } else {
                debug!("peer opened stream {}", stream_id);
                self.start_stream(&mut streams, stream_id, StreamJob::Listen, Some(segment));
            }
        }.instrument(span).await
    }

    /// Marks the peer as alive. The timestamp is pushed slightly into the
    ///  future so the two endpoints' ping schedules drift apart instead of
    ///  pinging each other in lockstep.
    async fn refresh_keep_alive(&self) {
        let jitter = self.config.ping_interval.mul_f64(0.1 * rand::rng().random_range(0.0..1.0));
        self.keep_alive.lock().await.last_inbound = Instant::now() + jitter;
    }

    /// Periodic keep-alive check, driven by the host's receive loop. One
    ///  silence episode launches at most one ping stream; if silence outlasts
    ///  twice the ping interval, the connection is given up.
    pub async fn tick(&self) {
        if !self.is_open() {
            return;
        }
        let mut keep_alive = self.keep_alive.lock().await;
        let elapsed = Instant::now().saturating_duration_since(keep_alive.last_inbound);
        if elapsed < self.config.ping_interval {
            if keep_alive.state == KeepAliveState::Notified {
                debug!("peer {:?} is answering again", self.peer_addr);
                keep_alive.state = KeepAliveState::Normal;
            }
            return;
        }
        match keep_alive.state {
            KeepAliveState::Normal => {
                keep_alive.state = KeepAliveState::Notified;
                drop(keep_alive);
                info!("nothing heard from {:?} for {:?} - pinging", self.peer_addr, elapsed);
                self.open_stream(StreamJob::SendPing).await;
            }
            KeepAliveState::Notified => {
                if elapsed > self.config.ping_interval * 2 {
                    drop(keep_alive);
                    warn!("peer {:?} unreachable for {:?} - giving up on the connection", self.peer_addr, elapsed);
                    self.close();
                }
            }
        }
    }

    /// Starts an orderly shutdown: a fin handshake on a fresh stream. The
    ///  connection reports closed once the peer acknowledged (or the
    ///  handshake ran out of retries).
    pub async fn request_fin(&self) {
        info!("requesting orderly shutdown of the connection to {:?}", self.peer_addr);
        self.open_stream(StreamJob::SendFin).await;
    }

    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            info!("closing the connection to {:?}", self.peer_addr);
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Drops all mailboxes, which stops the workers, and waits for them to
    ///  finish. For host shutdown after the receive loop ends.
    pub async fn dispose(&self) {
        self.close();
        let workers: Vec<(u32, JoinHandle<()>)> = self.streams.lock().await
            .drain()
            .map(|(stream_id, handle)| (stream_id, handle.worker))
            .collect();
        for (stream_id, worker) in workers {
            trace!("waiting for stream {} to finish", stream_id);
            worker.await.ok();
        }
    }

    pub(crate) async fn unregister_stream(&self, stream_id: u32) {
        self.streams.lock().await.remove(&stream_id);
        trace!("stream {} finished", stream_id);
    }

    pub fn set_fragment_size(&self, fragment_size: usize) -> anyhow::Result<()> {
        if fragment_size == 0 || fragment_size > LinkConfig::MAX_FRAGMENT_SIZE {
            anyhow::bail!("fragment size must be between 1 and {}, got {}",
                LinkConfig::MAX_FRAGMENT_SIZE, fragment_size);
        }
        self.fragment_size.store(fragment_size, Ordering::Relaxed);
        info!("fragment size for new transfers is now {}", fragment_size);
        Ok(())
    }

    /// Arms the fault injector: the next `count` outbound payload segments
    ///  leave with a flipped checksum byte, which the peer must detect and
    ///  recover from. For exercising the loss paths on an otherwise clean
    ///  link.
    pub fn arm_corruption(&self, count: u32) {
        info!("the next {} outbound payload segments will be corrupted in flight", count);
        self.fault.arm_corruption(count);
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub(crate) fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub(crate) fn fragment_size(&self) -> usize {
        self.fragment_size.load(Ordering::Relaxed)
    }

    pub(crate) fn dispatcher(&self) -> &Arc<dyn EventDispatcher> {
        &self.dispatcher
    }

    #[cfg(test)]
    pub(crate) async fn stream_count(&self) -> usize {
        self.streams.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn keep_alive_state(&self) -> KeepAliveState {
        self.keep_alive.lock().await.state
    }
}
