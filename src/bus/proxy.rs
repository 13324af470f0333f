//! Client half of the bus: a pool of sender slots, each owning one outbound
//! link to a broker endpoint, plus the worker threads that run inbound
//! handlers.
//!
//! Every slot drives the same loop: dial with backoff, authenticate, replay
//! the active subscription set, then shuttle frames until the link dies and
//! start over. Business traffic is never pulled off a slot's queue while the
//! link is offline, so queued sends survive a reconnect; pending control
//! writes do not.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use ahash::AHashSet;
use bytes::{Bytes, BytesMut};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::codec::{self, Control, Frame, FrameCursor};
use crate::bus::dispatch::{HandlerRegistry, MessageHandler, WorkerPool, WorkerQueue};
use crate::bus::metrics::BusMetrics;
use crate::bus::reliability::{DialBreaker, ExponentialBackoff};
use crate::bus::{epoch_ms, link_writer, tune_socket};
use crate::config::ProxyConfig;
use crate::error::{Error, ProtocolError};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Unanswered pings tolerated before the link is torn down.
const KEEPALIVE_MAX_MISSES: u32 = 3;

// ---------------------------------------------------------------------------
// Slot plumbing
// ---------------------------------------------------------------------------

/// Commands pushed to a slot from the public API.
enum SlotCommand {
    Subscribe(u32),
    Unsubscribe(u32),
}

/// One queued business payload, owned by exactly one consumer.
struct QueuedSend {
    ty: u32,
    payload: Bytes,
}

struct SlotHandle {
    business_tx: mpsc::Sender<QueuedSend>,
    control_tx: mpsc::UnboundedSender<SlotCommand>,
}

/// Channel ends moved into the runtime at launch.
struct SlotRuntime {
    slot_id: usize,
    addr: SocketAddr,
    business_rx: mpsc::Receiver<QueuedSend>,
    control_rx: mpsc::UnboundedReceiver<SlotCommand>,
}

/// Everything a slot task needs besides its own channels.
struct SlotContext {
    slot_id: usize,
    addr: SocketAddr,
    node_id: u32,
    group_id: u32,
    username: String,
    password: String,
    keepalive_interval: Duration,
    receive_buffer_size: usize,
    wire_capacity: usize,
    subscriptions: Arc<RwLock<AHashSet<u32>>>,
    workers: WorkerQueue,
    metrics: Arc<BusMetrics>,
    cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

/// The client-side bus handle.
pub struct Proxy {
    cfg: ProxyConfig,
    registry: Arc<HandlerRegistry>,
    metrics: Arc<BusMetrics>,
    subscriptions: Arc<RwLock<AHashSet<u32>>>,
    slots: Vec<SlotHandle>,
    pending: Option<Vec<SlotRuntime>>,
    next_slot: AtomicUsize,
    workers: Option<WorkerPool>,
    runtime_thread: Option<thread::JoinHandle<()>>,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
}

impl Proxy {
    /// Validate the config and build the slot pool. Nothing runs until
    /// `launch`.
    pub fn new(cfg: ProxyConfig) -> Result<Self, Error> {
        cfg.validate()?;
        let mut slots = Vec::new();
        let mut pending = Vec::new();
        let mut slot_id = 0usize;
        for addr in cfg.destinations() {
            for _ in 0..cfg.senders_per_address {
                let (business_tx, business_rx) = mpsc::channel(cfg.send_queue.capacity);
                let (control_tx, control_rx) = mpsc::unbounded_channel();
                slots.push(SlotHandle {
                    business_tx,
                    control_tx,
                });
                pending.push(SlotRuntime {
                    slot_id,
                    addr,
                    business_rx,
                    control_rx,
                });
                slot_id += 1;
            }
        }
        Ok(Self {
            cfg,
            registry: Arc::new(HandlerRegistry::new()),
            metrics: Arc::new(BusMetrics::new()),
            subscriptions: Arc::new(RwLock::new(AHashSet::new())),
            slots,
            pending: Some(pending),
            next_slot: AtomicUsize::new(0),
            workers: None,
            runtime_thread: None,
            cancel: CancellationToken::new(),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Start the worker pool and all sender slots.
    pub fn launch(&mut self) -> Result<(), Error> {
        let Some(pending) = self.pending.take() else {
            warn!("proxy already launched");
            return Ok(());
        };
        let workers = WorkerPool::start(
            "rtmq-proxy",
            self.cfg.worker_threads,
            self.cfg.recv_queue,
            self.registry.clone(),
            self.metrics.clone(),
        );
        let worker_queue = workers.queue();
        self.workers = Some(workers);

        let contexts: Vec<(SlotContext, SlotRuntime)> = pending
            .into_iter()
            .map(|rt| {
                (
                    SlotContext {
                        slot_id: rt.slot_id,
                        addr: rt.addr,
                        node_id: self.cfg.node_id,
                        group_id: self.cfg.group_id,
                        username: self.cfg.username.clone(),
                        password: self.cfg.password.clone(),
                        keepalive_interval: Duration::from_secs(
                            self.cfg.keepalive_interval_secs,
                        ),
                        receive_buffer_size: self.cfg.receive_buffer_size,
                        wire_capacity: self.cfg.send_queue.capacity,
                        subscriptions: self.subscriptions.clone(),
                        workers: worker_queue.clone(),
                        metrics: self.metrics.clone(),
                        cancel: self.cancel.clone(),
                    },
                    rt,
                )
            })
            .collect();

        let running = self.running.clone();
        let handle = thread::Builder::new()
            .name("rtmq-proxy-rt".into())
            .spawn(move || {
                let rt = match Runtime::new() {
                    Ok(rt) => rt,
                    Err(e) => {
                        warn!("failed to create proxy runtime: {e}");
                        return;
                    }
                };
                rt.block_on(async move {
                    let mut handles = Vec::new();
                    for (ctx, slot) in contexts {
                        handles.push(tokio::spawn(sender_slot(
                            ctx,
                            slot.business_rx,
                            slot.control_rx,
                        )));
                    }
                    for h in handles {
                        let _ = h.await;
                    }
                });
                running.store(false, Ordering::SeqCst);
            })
            .map_err(Error::Transport)?;
        self.runtime_thread = Some(handle);
        self.running.store(true, Ordering::SeqCst);
        info!("proxy launched: {} sender slots", self.slots.len());
        Ok(())
    }

    /// Register the handler for `ty` and mark the type subscribed. The
    /// subscription is pushed on live links and replayed on every reconnect.
    pub fn register_handler(
        &self,
        ty: u32,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), Error> {
        self.registry.register(ty, handler)?;
        let newly = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ty);
        if newly {
            for slot in &self.slots {
                let _ = slot.control_tx.send(SlotCommand::Subscribe(ty));
            }
        }
        Ok(())
    }

    /// Stop handling `ty` and tell the brokers to drop the subscription.
    pub fn unsubscribe(&self, ty: u32) {
        let removed = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&ty);
        if removed {
            for slot in &self.slots {
                let _ = slot.control_tx.send(SlotCommand::Unsubscribe(ty));
            }
        }
    }

    /// Enqueue a business payload, round-robining across sender slots.
    pub fn send(&self, ty: u32, payload: impl Into<Bytes>) -> Result<(), Error> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::NotRunning);
        }
        let payload = payload.into();
        if payload.len() > self.cfg.send_queue.item_size {
            self.metrics.add_dropped(1);
            return Err(Error::ResourceExhausted("send"));
        }
        let i = self.next_slot.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        self.slots[i]
            .business_tx
            .try_send(QueuedSend { ty, payload })
            .map_err(|_| {
                self.metrics.add_dropped(1);
                Error::ResourceExhausted("send")
            })
    }

    pub fn metrics(&self) -> Arc<BusMetrics> {
        self.metrics.clone()
    }

    /// Tear everything down and join the runtime and worker threads.
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

impl Drop for Proxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Slot task: dial, handshake, run, repeat
// ---------------------------------------------------------------------------

async fn sender_slot(
    ctx: SlotContext,
    mut business_rx: mpsc::Receiver<QueuedSend>,
    mut control_rx: mpsc::UnboundedReceiver<SlotCommand>,
) {
    let mut rng = SmallRng::from_entropy();
    let mut backoff = ExponentialBackoff::new(BACKOFF_BASE, BACKOFF_CAP);
    let mut breaker = DialBreaker::new();

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        if !breaker.can_dial() {
            debug!(
                "slot {} breaker open for {}, pausing {:?}",
                ctx.slot_id, ctx.addr, breaker.open_for
            );
            if sleep_or_cancel(breaker.open_for, &ctx.cancel).await {
                break;
            }
            continue;
        }

        // Pending control messages do not survive into a new connection;
        // the handshake replays from the authoritative subscription set.
        while control_rx.try_recv().is_ok() {}

        let mut cursor = FrameCursor::new(ctx.receive_buffer_size);
        match establish(&ctx, &mut cursor).await {
            Ok((read, write)) => {
                info!("slot {} online to {}", ctx.slot_id, ctx.addr);
                breaker.record_success();
                backoff.reset();
                ctx.metrics.connected_links.fetch_add(1, Ordering::Relaxed);
                run_link(&ctx, read, write, cursor, &mut business_rx, &mut control_rx).await;
                ctx.metrics.connected_links.fetch_sub(1, Ordering::Relaxed);
                info!("slot {} offline from {}", ctx.slot_id, ctx.addr);
            }
            Err(e) => {
                breaker.record_failure();
                debug!("slot {} connect to {} failed: {e}", ctx.slot_id, ctx.addr);
            }
        }

        if ctx.cancel.is_cancelled() {
            break;
        }
        ctx.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
        let delay = backoff.next_delay(&mut rng);
        debug!(
            "slot {} redialing {} in {:.1}s",
            ctx.slot_id,
            ctx.addr,
            delay.as_secs_f64()
        );
        if sleep_or_cancel(delay, &ctx.cancel).await {
            break;
        }
    }
}

/// Sleep, returning true when cancelled instead.
async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = tokio::time::sleep(d) => false,
        () = cancel.cancelled() => true,
    }
}

/// Dial, authenticate, replay subscriptions. The cursor carries any bytes
/// that arrived after the ack into the reader loop.
async fn establish(
    ctx: &SlotContext,
    cursor: &mut FrameCursor,
) -> Result<(OwnedReadHalf, OwnedWriteHalf), Error> {
    let stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(ctx.addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            return Err(Error::Transport(io::Error::new(
                io::ErrorKind::TimedOut,
                "connect timed out",
            )))
        }
    };
    tune_socket(&stream);
    let (mut read, mut write) = stream.into_split();

    let auth =
        codec::auth_req_frame(ctx.node_id, ctx.group_id, &ctx.username, &ctx.password);
    write.write_all(&auth.encode()).await?;

    let ok = match timeout(AUTH_TIMEOUT, read_auth_ack(&mut read, cursor)).await {
        Ok(res) => res?,
        Err(_) => {
            return Err(Error::Transport(io::Error::new(
                io::ErrorKind::TimedOut,
                "auth ack timed out",
            )))
        }
    };
    if !ok {
        warn!("slot {} rejected by {}", ctx.slot_id, ctx.addr);
        return Err(Error::AuthFailure);
    }

    let subs: Vec<u32> = {
        let set = ctx
            .subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner());
        set.iter().copied().collect()
    };
    if !subs.is_empty() {
        let mut batch = BytesMut::new();
        for ty in &subs {
            batch.extend_from_slice(&codec::subscribe_frame(ctx.node_id, *ty).encode());
        }
        write.write_all(&batch).await?;
        debug!("slot {} replayed {} subscriptions", ctx.slot_id, subs.len());
    }
    Ok((read, write))
}

async fn read_auth_ack(read: &mut OwnedReadHalf, cursor: &mut FrameCursor) -> Result<bool, Error> {
    loop {
        while let Some(frame) = cursor.next_frame()? {
            if frame.is_sys() {
                if let Control::AuthAck { ok } = Control::decode(&frame)? {
                    return Ok(ok);
                }
            }
            // anything else before the ack is dropped on the floor
        }
        let dst = cursor.unfilled()?;
        let n = read.read(dst).await?;
        if n == 0 {
            return Err(Error::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "link closed during auth",
            )));
        }
        cursor.advance(n);
    }
}

// ---------------------------------------------------------------------------
// Per-connection task tree
// ---------------------------------------------------------------------------

async fn run_link(
    ctx: &SlotContext,
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
    cursor: FrameCursor,
    business_rx: &mut mpsc::Receiver<QueuedSend>,
    control_rx: &mut mpsc::UnboundedReceiver<SlotCommand>,
) {
    let link_cancel = ctx.cancel.child_token();
    let (wire_tx, wire_rx) = mpsc::channel::<Bytes>(ctx.wire_capacity);
    let last_write = Arc::new(AtomicU64::new(epoch_ms()));
    let pending_pings = Arc::new(AtomicU32::new(0));

    let writer = tokio::spawn(link_writer(
        wire_rx,
        write,
        link_cancel.clone(),
        ctx.metrics.clone(),
        Some(last_write.clone()),
    ));
    let reader = tokio::spawn(link_reader(
        read,
        cursor,
        wire_tx.clone(),
        ctx.workers.clone(),
        pending_pings.clone(),
        link_cancel.clone(),
        ctx.metrics.clone(),
        ctx.node_id,
    ));
    let keepalive = tokio::spawn(link_keepalive(
        wire_tx.clone(),
        link_cancel.clone(),
        last_write,
        pending_pings,
        ctx.keepalive_interval,
        ctx.node_id,
    ));

    loop {
        tokio::select! {
            biased;
            () = link_cancel.cancelled() => break,
            cmd = control_rx.recv() => {
                let Some(cmd) = cmd else { break };
                let frame = match cmd {
                    SlotCommand::Subscribe(ty) => codec::subscribe_frame(ctx.node_id, ty),
                    SlotCommand::Unsubscribe(ty) => codec::unsubscribe_frame(ctx.node_id, ty),
                };
                if wire_tx.send(frame.encode().freeze()).await.is_err() {
                    break;
                }
            }
            item = business_rx.recv() => {
                let Some(QueuedSend { ty, payload }) = item else { break };
                let frame = Frame::exp(ty, ctx.node_id, payload);
                ctx.metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
                if wire_tx.send(frame.encode().freeze()).await.is_err() {
                    break;
                }
            }
        }
    }

    link_cancel.cancel();
    let _ = writer.await;
    let _ = reader.await;
    let _ = keepalive.await;
}

async fn link_reader(
    mut read: OwnedReadHalf,
    mut cursor: FrameCursor,
    wire_tx: mpsc::Sender<Bytes>,
    workers: WorkerQueue,
    pending_pings: Arc<AtomicU32>,
    cancel: CancellationToken,
    metrics: Arc<BusMetrics>,
    node_id: u32,
) {
    loop {
        loop {
            match cursor.next_frame() {
                Ok(Some(frame)) => {
                    if frame.is_sys() {
                        match Control::decode(&frame) {
                            Ok(Control::Ping) => {
                                let _ = wire_tx
                                    .try_send(codec::pong_frame(node_id).encode().freeze());
                            }
                            Ok(Control::Pong) => pending_pings.store(0, Ordering::Relaxed),
                            Ok(other) => debug!("ignoring control frame {other:?}"),
                            Err(e) => {
                                warn!("malformed control frame: {e}");
                                cancel.cancel();
                                return;
                            }
                        }
                    } else {
                        // best-effort hand-off; drop accounting lives in the queue
                        let _ = workers.push(frame);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    if matches!(e, ProtocolError::BadCheck { .. }) {
                        metrics.check_rejects.fetch_add(1, Ordering::Relaxed);
                    }
                    warn!("stream corrupt, dropping link: {e}");
                    cancel.cancel();
                    return;
                }
            }
        }

        let dst = match cursor.unfilled() {
            Ok(dst) => dst,
            Err(e) => {
                warn!("receive buffer overflow, dropping link: {e}");
                cancel.cancel();
                return;
            }
        };
        let n = tokio::select! {
            r = read.read(dst) => r,
            () = cancel.cancelled() => return,
        };
        match n {
            Ok(0) => {
                cancel.cancel();
                return;
            }
            Ok(n) => {
                cursor.advance(n);
                metrics
                    .bytes_received
                    .fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(_) => {
                cancel.cancel();
                return;
            }
        }
    }
}

/// Sends a PING whenever the link has been write-idle for a full interval;
/// three unanswered pings force a reconnect.
async fn link_keepalive(
    wire_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    last_write: Arc<AtomicU64>,
    pending_pings: Arc<AtomicU32>,
    interval: Duration,
    node_id: u32,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // immediate first tick
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if pending_pings.load(Ordering::Relaxed) >= KEEPALIVE_MAX_MISSES {
                    warn!("keepalive failed after {KEEPALIVE_MAX_MISSES} pings, dropping link");
                    cancel.cancel();
                    break;
                }
                let idle = epoch_ms().saturating_sub(last_write.load(Ordering::Relaxed))
                    >= interval.as_millis() as u64;
                if idle {
                    pending_pings.fetch_add(1, Ordering::Relaxed);
                    if wire_tx
                        .try_send(codec::ping_frame(node_id).encode().freeze())
                        .is_err()
                    {
                        cancel.cancel();
                        break;
                    }
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::bus::codec::{
        auth_ack_frame, Control, FrameCursor, OP_AUTH_REQ, OP_PING, OP_SUB,
    };
    use crate::config::QueueConfig;

    fn test_config(addr: &str) -> ProxyConfig {
        ProxyConfig {
            node_id: 7,
            group_id: 3,
            work_dir: None,
            username: "edge".into(),
            password: "secret".into(),
            destination_addresses: vec![addr.into()],
            senders_per_address: 1,
            worker_threads: 1,
            receive_buffer_size: 65_536,
            send_queue: QueueConfig {
                capacity: 64,
                item_size: 4096,
            },
            recv_queue: QueueConfig {
                capacity: 64,
                item_size: 4096,
            },
            keepalive_interval_secs: 1,
        }
    }

    async fn next_frame(stream: &mut TcpStream, cursor: &mut FrameCursor) -> Frame {
        loop {
            if let Some(frame) = cursor.next_frame().unwrap() {
                return frame;
            }
            let dst = cursor.unfilled().unwrap();
            let n = stream.read(dst).await.unwrap();
            assert!(n > 0, "peer closed while a frame was expected");
            cursor.advance(n);
        }
    }

    /// Accept one proxy link and walk it through the handshake.
    async fn accept_and_auth(listener: &TcpListener) -> (TcpStream, FrameCursor) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut cursor = FrameCursor::new(65_536);
        let frame = next_frame(&mut stream, &mut cursor).await;
        assert!(frame.is_sys());
        assert_eq!(frame.header.msg_type, OP_AUTH_REQ);
        assert_eq!(frame.header.nid, 7);
        assert_eq!(
            Control::decode(&frame).unwrap(),
            Control::AuthReq {
                gid: 3,
                username: "edge".into(),
                password: "secret".into(),
            }
        );
        stream
            .write_all(&auth_ack_frame(1, true).encode())
            .await
            .unwrap();
        (stream, cursor)
    }

    #[test]
    fn invalid_config_fails_fast() {
        let mut cfg = test_config("127.0.0.1:9999");
        cfg.destination_addresses.clear();
        assert!(matches!(Proxy::new(cfg), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn send_before_launch_is_refused() {
        let proxy = Proxy::new(test_config("127.0.0.1:9999")).unwrap();
        assert!(matches!(
            proxy.send(0x0201, Bytes::from_static(b"x")),
            Err(Error::NotRunning)
        ));
    }

    #[test]
    fn duplicate_handler_is_refused() {
        let proxy = Proxy::new(test_config("127.0.0.1:9999")).unwrap();
        proxy
            .register_handler(0x0201, Arc::new(|_: &Frame| Ok(())))
            .unwrap();
        assert!(matches!(
            proxy.register_handler(0x0201, Arc::new(|_: &Frame| Ok(()))),
            Err(Error::DuplicateRegistration(0x0201))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn auth_precedes_business_on_every_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut proxy = Proxy::new(test_config(&addr.to_string())).unwrap();
        proxy
            .register_handler(0x0201, Arc::new(|_: &Frame| Ok(())))
            .unwrap();
        proxy.launch().unwrap();
        proxy.send(0x0201, Bytes::from_static(b"hello-1")).unwrap();

        // first connection: AUTH_REQ comes first, then the subscription
        // replay, then the queued business frame
        let (mut stream, mut cursor) = accept_and_auth(&listener).await;
        let sub = next_frame(&mut stream, &mut cursor).await;
        assert_eq!(sub.header.msg_type, OP_SUB);
        assert_eq!(
            Control::decode(&sub).unwrap(),
            Control::Subscribe { topic: 0x0201 }
        );
        let business = next_frame(&mut stream, &mut cursor).await;
        assert!(!business.is_sys());
        assert_eq!(business.body.as_ref(), b"hello-1");

        // kill the link; anything sent while offline must wait for the next
        // handshake to finish
        drop(stream);
        tokio::time::sleep(Duration::from_millis(200)).await;
        proxy.send(0x0201, Bytes::from_static(b"hello-2")).unwrap();

        let (mut stream, mut cursor) = accept_and_auth(&listener).await;
        let sub = next_frame(&mut stream, &mut cursor).await;
        assert_eq!(sub.header.msg_type, OP_SUB);
        let business = next_frame(&mut stream, &mut cursor).await;
        assert!(!business.is_sys());
        assert_eq!(business.body.as_ref(), b"hello-2");

        proxy.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn inbound_business_reaches_the_handler() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Bytes>();
        let mut proxy = Proxy::new(test_config(&addr.to_string())).unwrap();
        proxy
            .register_handler(
                0x0301,
                Arc::new(move |frame: &Frame| {
                    let _ = seen_tx.send(frame.body.clone());
                    Ok(())
                }),
            )
            .unwrap();
        proxy.launch().unwrap();

        let (mut stream, mut cursor) = accept_and_auth(&listener).await;
        // skip the SUB replay, then push one business frame down
        let _sub = next_frame(&mut stream, &mut cursor).await;
        let frame = Frame::exp(0x0301, 1, Bytes::from_static(b"from-broker"));
        stream.write_all(&frame.encode()).await.unwrap();

        let got = timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_ref(), b"from-broker");
        assert_eq!(proxy.metrics().delivered(), 1);

        proxy.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unanswered_pings_force_a_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut proxy = Proxy::new(test_config(&addr.to_string())).unwrap();
        proxy.launch().unwrap();

        let (mut stream, mut cursor) = accept_and_auth(&listener).await;

        // read pings but never answer; the proxy must give up and close
        let mut pings = 0u32;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            let frame = tokio::select! {
                () = tokio::time::sleep_until(deadline) => panic!("proxy never gave up"),
                f = async {
                    loop {
                        if let Some(f) = cursor.next_frame().unwrap() {
                            break Some(f);
                        }
                        let dst = cursor.unfilled().unwrap();
                        let n = stream.read(dst).await.unwrap_or(0);
                        if n == 0 {
                            break None;
                        }
                        cursor.advance(n);
                    }
                } => f,
            };
            match frame {
                Some(f) if f.header.msg_type == OP_PING => pings += 1,
                Some(_) => {}
                None => break, // proxy closed the link
            }
        }
        assert!(pings >= KEEPALIVE_MAX_MISSES);

        // and it redials
        let (_stream, _cursor) = timeout(Duration::from_secs(10), accept_and_auth(&listener))
            .await
            .unwrap();
        assert!(proxy.metrics().reconnects.load(Ordering::Relaxed) >= 1);

        proxy.shutdown();
    }
}
