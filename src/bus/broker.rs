//! Server half of the bus: listener, receiver shards, workers and the
//! distributor.
//!
//! The listener hands each accepted link to receiver shard `sid % R` through
//! a typed command channel; a shard owns its links exclusively. Control
//! frames are handled inline by the shard (auth, keepalive, subscription);
//! business frames cross to the worker threads through the shared bounded
//! queue. Outbound traffic flows through the distribution shards, which
//! resolve a destination node to a live link via the route table.
//!
//! FIFO holds only within a single link's writer channel. Two directed sends
//! racing through different distribution shards may arrive out of issue
//! order; that is the bus's throughput-over-ordering trade.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::auth::CredentialTable;
use crate::bus::codec::{self, Control, Frame, FrameCursor};
use crate::bus::dispatch::{HandlerRegistry, MessageHandler, WorkerPool, WorkerQueue};
use crate::bus::link_writer;
use crate::bus::metrics::BusMetrics;
use crate::bus::route::NodeRouteTable;
use crate::bus::subscribe::SubscriptionTable;
use crate::bus::{epoch_ms, tune_socket};
use crate::config::BrokerConfig;
use crate::error::{Error, ProtocolError};

// ---------------------------------------------------------------------------
// Internal types
// ---------------------------------------------------------------------------

/// Commands from the listener (and the public API) to a receiver shard.
enum ReceiverCommand {
    AddLink { sid: u64, stream: TcpStream },
    KickLink { sid: u64 },
}

/// Registered per live link; the writer channel is the only way to put bytes
/// on a link someone else owns.
struct LinkHandle {
    wire_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

/// One encoded frame waiting for route resolution.
struct OutboundItem {
    dest_nid: u32,
    wire: Bytes,
}

struct BrokerShared {
    node_id: u32,
    credentials: CredentialTable,
    routes: NodeRouteTable,
    subscriptions: SubscriptionTable,
    links: DashMap<u64, LinkHandle>,
    metrics: Arc<BusMetrics>,
    recv_buffer_size: usize,
    wire_capacity: usize,
    idle_timeout: Duration,
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// The server-side bus handle.
pub struct Broker {
    cfg: BrokerConfig,
    shared: Arc<BrokerShared>,
    registry: Arc<HandlerRegistry>,
    metrics: Arc<BusMetrics>,
    recv_cmd_txs: Vec<mpsc::UnboundedSender<ReceiverCommand>>,
    dist_txs: Vec<mpsc::Sender<OutboundItem>>,
    pending_recv: Option<Vec<mpsc::UnboundedReceiver<ReceiverCommand>>>,
    pending_dist: Option<Vec<mpsc::Receiver<OutboundItem>>>,
    workers: Option<WorkerPool>,
    runtime_thread: Option<thread::JoinHandle<()>>,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    rng: Mutex<SmallRng>,
}

impl Broker {
    /// Build the auth/route/subscription tables and all channel plumbing.
    /// Nothing runs until `launch`.
    pub fn new(cfg: BrokerConfig) -> Result<Self, Error> {
        cfg.validate()?;
        let metrics = Arc::new(BusMetrics::new());
        let shared = Arc::new(BrokerShared {
            node_id: cfg.node_id,
            credentials: CredentialTable::new(&cfg.credentials),
            routes: NodeRouteTable::new(cfg.route_slots_per_node),
            subscriptions: SubscriptionTable::new(),
            links: DashMap::new(),
            metrics: metrics.clone(),
            recv_buffer_size: cfg.receive_buffer_size,
            wire_capacity: cfg.send_queue.capacity,
            idle_timeout: Duration::from_secs(cfg.idle_timeout_secs),
        });

        let mut recv_cmd_txs = Vec::new();
        let mut pending_recv = Vec::new();
        for _ in 0..cfg.receive_threads {
            let (tx, rx) = mpsc::unbounded_channel();
            recv_cmd_txs.push(tx);
            pending_recv.push(rx);
        }
        let mut dist_txs = Vec::new();
        let mut pending_dist = Vec::new();
        for _ in 0..cfg.distribution_shards {
            let (tx, rx) = mpsc::channel(cfg.send_queue.capacity);
            dist_txs.push(tx);
            pending_dist.push(rx);
        }

        Ok(Self {
            cfg,
            shared,
            registry: Arc::new(HandlerRegistry::new()),
            metrics,
            recv_cmd_txs,
            dist_txs,
            pending_recv: Some(pending_recv),
            pending_dist: Some(pending_dist),
            workers: None,
            runtime_thread: None,
            cancel: CancellationToken::new(),
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            rng: Mutex::new(SmallRng::from_entropy()),
        })
    }

    /// Bind the listener and start receivers, workers and distributors.
    pub fn launch(&mut self) -> Result<(), Error> {
        let (Some(pending_recv), Some(pending_dist)) =
            (self.pending_recv.take(), self.pending_dist.take())
        else {
            warn!("broker already launched");
            return Ok(());
        };
        let workers = WorkerPool::start(
            "rtmq-broker",
            self.cfg.worker_threads,
            self.cfg.recv_queue,
            self.registry.clone(),
            self.metrics.clone(),
        );
        let worker_queue = workers.queue();
        self.workers = Some(workers);

        let listen_addr = self.cfg.listen_addr();
        let shared = self.shared.clone();
        let cancel = self.cancel.clone();
        let receive_threads = self.cfg.receive_threads as u64;
        let recv_cmd_txs = self.recv_cmd_txs.clone();
        let (bound_tx, bound_rx) = std::sync::mpsc::sync_channel::<io::Result<SocketAddr>>(1);

        let handle = thread::Builder::new()
            .name("rtmq-broker-rt".into())
            .spawn(move || {
                let rt = match Runtime::new() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = bound_tx.send(Err(e));
                        return;
                    }
                };
                rt.block_on(async move {
                    let listener = match TcpListener::bind(listen_addr).await {
                        Ok(listener) => {
                            let _ = bound_tx.send(listener.local_addr());
                            listener
                        }
                        Err(e) => {
                            let _ = bound_tx.send(Err(e));
                            return;
                        }
                    };

                    let mut handles = Vec::new();
                    for (shard_id, cmd_rx) in pending_recv.into_iter().enumerate() {
                        handles.push(tokio::spawn(receiver_shard(
                            shard_id,
                            cmd_rx,
                            shared.clone(),
                            worker_queue.clone(),
                            cancel.clone(),
                        )));
                    }
                    for (shard_id, rx) in pending_dist.into_iter().enumerate() {
                        handles.push(tokio::spawn(distributor(
                            shard_id,
                            rx,
                            shared.clone(),
                            cancel.clone(),
                        )));
                    }

                    let mut seq: u64 = 0;
                    loop {
                        tokio::select! {
                            res = listener.accept() => match res {
                                Ok((stream, peer)) => {
                                    seq += 1;
                                    tune_socket(&stream);
                                    let shard = (seq % receive_threads) as usize;
                                    debug!("link {seq} from {peer} -> receiver {shard}");
                                    let _ = recv_cmd_txs[shard]
                                        .send(ReceiverCommand::AddLink { sid: seq, stream });
                                }
                                Err(e) => warn!("accept error: {e}"),
                            },
                            () = cancel.cancelled() => break,
                        }
                    }
                    for h in handles {
                        let _ = h.await;
                    }
                });
            })
            .map_err(Error::Transport)?;
        self.runtime_thread = Some(handle);

        match bound_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(addr)) => {
                self.local_addr = Some(addr);
                self.running.store(true, Ordering::SeqCst);
                info!(
                    "broker listening on {addr}: {} receivers, {} distribution shards",
                    self.cfg.receive_threads, self.cfg.distribution_shards
                );
                Ok(())
            }
            Ok(Err(e)) => {
                self.cancel.cancel();
                Err(e.into())
            }
            Err(_) => {
                self.cancel.cancel();
                Err(Error::Transport(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "listener never came up",
                )))
            }
        }
    }

    /// Address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Register the handler invoked for inbound business frames of `ty`.
    pub fn register_handler(
        &self,
        ty: u32,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), Error> {
        self.registry.register(ty, handler)
    }

    /// Wrap `payload` for `dest_nid` and hand it to a random distribution
    /// shard. Resolution and the actual write happen on the shard's task.
    pub fn directed_send(
        &self,
        ty: u32,
        dest_nid: u32,
        payload: impl Into<Bytes>,
    ) -> Result<(), Error> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::NotRunning);
        }
        let payload = payload.into();
        if payload.len() > self.cfg.send_queue.item_size {
            self.metrics.add_dropped(1);
            return Err(Error::ResourceExhausted("send"));
        }
        let wire = Frame::exp(ty, dest_nid, payload).encode().freeze();
        let shard = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            rng.gen_range(0..self.dist_txs.len())
        };
        self.dist_txs[shard]
            .try_send(OutboundItem { dest_nid, wire })
            .map_err(|_| {
                self.metrics.add_dropped(1);
                Error::ResourceExhausted("send")
            })
    }

    /// One delivery attempt per group subscribed to `ty`: pick one member
    /// per group at random and issue a directed send to each. A member with
    /// no live route is dropped by the distributor, with no fallback.
    pub fn publish(&self, ty: u32, payload: impl Into<Bytes>) -> Result<(), Error> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::NotRunning);
        }
        let payload = payload.into();
        let members = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            self.shared.subscriptions.pick_one_per_group(ty, &mut *rng)
        };
        for member in members {
            // per-group best effort: one full shard must not starve the rest
            if let Err(e) = self.directed_send(ty, member.nid, payload.clone()) {
                debug!("publish to node {} dropped: {e}", member.nid);
            }
        }
        Ok(())
    }

    pub fn add_credential(&self, username: &str, password: &str) {
        self.shared.credentials.add(username, password);
    }

    pub fn check_credential(&self, username: &str, password: &str) -> bool {
        self.shared.credentials.check(username, password)
    }

    /// Ask the owning receiver shard to drop a link.
    pub fn kick(&self, sid: u64) {
        if self.recv_cmd_txs.is_empty() {
            return;
        }
        let shard = (sid % self.recv_cmd_txs.len() as u64) as usize;
        let _ = self.recv_cmd_txs[shard].send(ReceiverCommand::KickLink { sid });
    }

    pub fn metrics(&self) -> Arc<BusMetrics> {
        self.metrics.clone()
    }

    /// Live routing state, mostly for health checks and tests.
    pub fn routed_nodes(&self) -> usize {
        self.shared.routes.node_count()
    }

    pub fn subscription_groups(&self, ty: u32) -> usize {
        self.shared.subscriptions.group_count(ty)
    }

    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        if let Some(handle) = self.runtime_thread.take() {
            let _ = handle.join();
        }
        if let Some(mut workers) = self.workers.take() {
            workers.shutdown();
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Receiver shard
// ---------------------------------------------------------------------------

/// Owns every link assigned to it; nothing else touches those sockets.
async fn receiver_shard(
    shard_id: usize,
    mut cmd_rx: mpsc::UnboundedReceiver<ReceiverCommand>,
    shared: Arc<BrokerShared>,
    workers: WorkerQueue,
    cancel: CancellationToken,
) {
    let mut links = JoinSet::new();
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ReceiverCommand::AddLink { sid, stream }) => {
                    let link_cancel = cancel.child_token();
                    let (wire_tx, wire_rx) = mpsc::channel::<Bytes>(shared.wire_capacity);
                    shared.links.insert(sid, LinkHandle {
                        wire_tx: wire_tx.clone(),
                        cancel: link_cancel.clone(),
                    });
                    shared.metrics.connected_links.fetch_add(1, Ordering::Relaxed);
                    links.spawn(serve_link(
                        sid,
                        stream,
                        wire_rx,
                        wire_tx,
                        shared.clone(),
                        workers.clone(),
                        link_cancel,
                    ));
                }
                Some(ReceiverCommand::KickLink { sid }) => {
                    if let Some(handle) = shared.links.get(&sid) {
                        debug!("receiver {shard_id} kicking link {sid}");
                        handle.cancel.cancel();
                    }
                }
                None => break,
            },
            Some(_) = links.join_next(), if !links.is_empty() => {}
            () = cancel.cancelled() => break,
        }
    }
    links.shutdown().await;
}

/// Drive one link: frame the byte stream, answer control traffic, queue
/// business frames for the workers.
async fn serve_link(
    sid: u64,
    stream: TcpStream,
    wire_rx: mpsc::Receiver<Bytes>,
    wire_tx: mpsc::Sender<Bytes>,
    shared: Arc<BrokerShared>,
    workers: WorkerQueue,
    cancel: CancellationToken,
) {
    let (mut read, write) = stream.into_split();
    let writer = tokio::spawn(link_writer(
        wire_rx,
        write,
        cancel.clone(),
        shared.metrics.clone(),
        None,
    ));

    let mut cursor = FrameCursor::new(shared.recv_buffer_size);
    let mut authed: Option<(u32, u32)> = None; // (nid, gid)
    let mut last_recv = epoch_ms();
    let mut ticker = tokio::time::interval(shared.idle_timeout);
    ticker.tick().await;

    'link: loop {
        loop {
            let frame = match cursor.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    if matches!(e, ProtocolError::BadCheck { .. }) {
                        shared.metrics.check_rejects.fetch_add(1, Ordering::Relaxed);
                    }
                    warn!("link {sid} stream corrupt: {e}");
                    break 'link;
                }
            };
            last_recv = epoch_ms();
            if !handle_frame(sid, &frame, &mut authed, &shared, &workers, &wire_tx).await {
                break 'link;
            }
        }

        let dst = match cursor.unfilled() {
            Ok(dst) => dst,
            Err(e) => {
                warn!("link {sid} receive buffer overflow: {e}");
                break 'link;
            }
        };
        enum Wake {
            Read(io::Result<usize>),
            IdleCheck,
            Stop,
        }
        let wake = tokio::select! {
            r = read.read(dst) => Wake::Read(r),
            _ = ticker.tick() => Wake::IdleCheck,
            () = cancel.cancelled() => Wake::Stop,
        };
        match wake {
            Wake::Read(Ok(0)) | Wake::Stop => break 'link,
            Wake::Read(Ok(n)) => {
                cursor.advance(n);
                shared.metrics.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
            }
            Wake::Read(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => {}
            Wake::Read(Err(e)) => {
                debug!("link {sid} read error: {e}");
                break 'link;
            }
            Wake::IdleCheck => {
                if epoch_ms().saturating_sub(last_recv) >= shared.idle_timeout.as_millis() as u64 {
                    debug!("link {sid} idle, dropping");
                    break 'link;
                }
            }
        }
    }

    // teardown is local to this task: routes out, registry entry out
    cancel.cancel();
    if let Some((nid, _)) = authed {
        shared.routes.remove(nid, sid);
    }
    shared.links.remove(&sid);
    shared.metrics.connected_links.fetch_sub(1, Ordering::Relaxed);
    let _ = writer.await;
    debug!("link {sid} closed");
}

/// Returns false when the link must be dropped.
async fn handle_frame(
    sid: u64,
    frame: &Frame,
    authed: &mut Option<(u32, u32)>,
    shared: &BrokerShared,
    workers: &WorkerQueue,
    wire_tx: &mpsc::Sender<Bytes>,
) -> bool {
    if !frame.is_sys() {
        if authed.is_none() {
            warn!("link {sid} sent business traffic before auth");
            return false;
        }
        let _ = workers.push(frame.clone());
        return true;
    }

    match Control::decode(frame) {
        Ok(Control::AuthReq {
            gid,
            username,
            password,
        }) => {
            let nid = frame.header.nid;
            if shared.credentials.check(&username, &password) {
                *authed = Some((nid, gid));
                if !shared.routes.add(nid, sid) {
                    warn!("route table full for node {nid}, link {sid} not routable");
                }
                let _ = wire_tx
                    .try_send(codec::auth_ack_frame(shared.node_id, true).encode().freeze());
                debug!("link {sid} authed as node {nid} group {gid}");
                true
            } else {
                shared.metrics.auth_failures.fetch_add(1, Ordering::Relaxed);
                warn!("link {sid} auth rejected for user {username:?}");
                let _ = wire_tx
                    .try_send(codec::auth_ack_frame(shared.node_id, false).encode().freeze());
                // give the writer a beat to flush the rejection
                tokio::time::sleep(Duration::from_millis(50)).await;
                false
            }
        }
        Ok(Control::Ping) => {
            let _ = wire_tx.try_send(codec::pong_frame(shared.node_id).encode().freeze());
            true
        }
        Ok(Control::Pong) => true,
        Ok(Control::Subscribe { topic }) => match *authed {
            Some((nid, gid)) => {
                shared.subscriptions.subscribe(topic, gid, nid, sid);
                true
            }
            None => {
                warn!("link {sid} subscribed before auth");
                false
            }
        },
        Ok(Control::Unsubscribe { topic }) => match *authed {
            Some((nid, gid)) => {
                shared.subscriptions.unsubscribe(topic, gid, nid, sid);
                true
            }
            None => false,
        },
        Ok(other) => {
            debug!("link {sid} sent unexpected control frame {other:?}");
            true
        }
        Err(e) => {
            warn!("link {sid} malformed control frame: {e}");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Distributor
// ---------------------------------------------------------------------------

/// Resolve destination nodes to live links and push the framed bytes onto
/// the owning link's writer channel. Unresolvable destinations are dropped
/// and logged, never retried here.
async fn distributor(
    shard_id: usize,
    mut rx: mpsc::Receiver<OutboundItem>,
    shared: Arc<BrokerShared>,
    cancel: CancellationToken,
) {
    let mut rng = SmallRng::from_entropy();
    loop {
        let item = tokio::select! {
            item = rx.recv() => item,
            () = cancel.cancelled() => break,
        };
        let Some(item) = item else { break };

        let Some(slot) = shared.routes.pick(item.dest_nid, &mut rng) else {
            debug!(
                "dist {shard_id}: no route to node {}, dropping frame",
                item.dest_nid
            );
            shared.metrics.add_dropped(1);
            continue;
        };
        match shared.links.get(&slot) {
            Some(handle) => {
                if handle.wire_tx.try_send(item.wire).is_ok() {
                    shared.metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
                } else {
                    shared.metrics.add_dropped(1);
                }
            }
            None => {
                // the link died between route lookup and hand-off
                debug!(
                    "dist {shard_id}: stale route {} for node {}, cleaning",
                    slot, item.dest_nid
                );
                shared.routes.remove(item.dest_nid, slot);
                shared.metrics.add_dropped(1);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
