//! Handler registry and the worker pool that drives it.
//!
//! Inbound business frames cross from the I/O tasks to OS worker threads
//! through one bounded queue; enqueue is non-blocking and a full queue drops
//! the frame and bumps a counter rather than stalling a receiver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use ahash::RandomState;
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::bus::codec::Frame;
use crate::bus::metrics::BusMetrics;
use crate::config::QueueConfig;
use crate::error::Error;

/// One handler per business message type. Returning `Err` is reported, not
/// fatal; the worker moves on to the next frame.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_frame(&self, frame: &Frame) -> Result<(), Error>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Frame) -> Result<(), Error> + Send + Sync + 'static,
{
    fn on_frame(&self, frame: &Frame) -> Result<(), Error> {
        self(frame)
    }
}

/// `type -> handler` dispatch map.
pub struct HandlerRegistry {
    inner: RwLock<HashMap<u32, Arc<dyn MessageHandler>, RandomState>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::default()),
        }
    }

    /// Register the handler for `ty`. A second registration for the same
    /// type is refused, never silently replaced.
    pub fn register(&self, ty: u32, handler: Arc<dyn MessageHandler>) -> Result<(), Error> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&ty) {
            return Err(Error::DuplicateRegistration(ty));
        }
        map.insert(ty, handler);
        Ok(())
    }

    pub fn get(&self, ty: u32) -> Option<Arc<dyn MessageHandler>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&ty)
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// Poll interval for the shutdown flag while the queue is quiet.
const WORKER_POLL: Duration = Duration::from_millis(100);

/// Cloneable enqueue side of the worker queue, handed to the I/O tasks.
#[derive(Clone)]
pub struct WorkerQueue {
    tx: Sender<Frame>,
    item_size: usize,
    metrics: Arc<BusMetrics>,
}

impl WorkerQueue {
    /// Non-blocking hand-off from an I/O task to the workers.
    pub fn push(&self, frame: Frame) -> Result<(), Error> {
        if frame.body.len() > self.item_size {
            self.metrics.add_dropped(1);
            return Err(Error::ResourceExhausted("recv"));
        }
        if self.tx.try_send(frame).is_err() {
            self.metrics.add_dropped(1);
            return Err(Error::ResourceExhausted("recv"));
        }
        Ok(())
    }
}

/// Fixed pool of OS threads draining the shared receive queue.
pub struct WorkerPool {
    queue: WorkerQueue,
    running: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        name: &str,
        threads: usize,
        queue: QueueConfig,
        registry: Arc<HandlerRegistry>,
        metrics: Arc<BusMetrics>,
    ) -> Self {
        let (tx, rx) = bounded::<Frame>(queue.capacity);
        let running = Arc::new(AtomicBool::new(true));
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = rx.clone();
            let registry = registry.clone();
            let metrics = metrics.clone();
            let running = running.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-worker-{i}"))
                .spawn(move || worker_loop(&rx, &registry, &metrics, &running))
                .expect("spawn worker thread");
            handles.push(handle);
        }
        Self {
            queue: WorkerQueue {
                tx,
                item_size: queue.item_size,
                metrics,
            },
            running,
            handles,
        }
    }

    pub fn queue(&self) -> WorkerQueue {
        self.queue.clone()
    }

    /// See [`WorkerQueue::push`].
    pub fn push(&self, frame: Frame) -> Result<(), Error> {
        self.queue.push(frame)
    }

    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    rx: &Receiver<Frame>,
    registry: &HandlerRegistry,
    metrics: &BusMetrics,
    running: &AtomicBool,
) {
    while running.load(Ordering::SeqCst) {
        let frame = match rx.recv_timeout(WORKER_POLL) {
            Ok(frame) => frame,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        };
        let ty = frame.header.msg_type;
        match registry.get(ty) {
            Some(handler) => {
                if let Err(e) = handler.on_frame(&frame) {
                    warn!("handler for type 0x{ty:04x} failed: {e}");
                } else {
                    metrics
                        .frames_delivered
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                debug!("no handler for type 0x{ty:04x}, dropping frame");
                metrics.add_dropped(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::time::Instant;

    use bytes::Bytes;

    use super::*;

    fn frame(ty: u32) -> Frame {
        Frame::exp(ty, 1, Bytes::from_static(b"body"))
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let registry = HandlerRegistry::new();
        registry
            .register(0x0201, Arc::new(|_: &Frame| Ok(())))
            .unwrap();
        let err = registry
            .register(0x0201, Arc::new(|_: &Frame| Ok(())))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRegistration(0x0201)));
    }

    #[test]
    fn workers_invoke_the_registered_handler() {
        let registry = Arc::new(HandlerRegistry::new());
        let hits = Arc::new(AtomicU64::new(0));
        let hits2 = hits.clone();
        registry
            .register(
                0x0201,
                Arc::new(move |_: &Frame| {
                    hits2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();

        let metrics = Arc::new(BusMetrics::new());
        let mut pool = WorkerPool::start(
            "test",
            2,
            QueueConfig {
                capacity: 16,
                item_size: 1024,
            },
            registry,
            metrics.clone(),
        );
        for _ in 0..5 {
            pool.push(frame(0x0201)).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        pool.shutdown();
        assert_eq!(hits.load(Ordering::SeqCst), 5);
        assert_eq!(metrics.delivered(), 5);
    }

    #[test]
    fn unhandled_type_counts_as_drop() {
        let registry = Arc::new(HandlerRegistry::new());
        let metrics = Arc::new(BusMetrics::new());
        let mut pool = WorkerPool::start(
            "test",
            1,
            QueueConfig {
                capacity: 4,
                item_size: 1024,
            },
            registry,
            metrics.clone(),
        );
        pool.push(frame(0x0999)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while metrics.dropped() < 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        pool.shutdown();
        assert_eq!(metrics.dropped(), 1);
    }

    #[test]
    fn oversized_item_is_refused() {
        let registry = Arc::new(HandlerRegistry::new());
        let metrics = Arc::new(BusMetrics::new());
        let mut pool = WorkerPool::start(
            "test",
            1,
            QueueConfig {
                capacity: 4,
                item_size: 2,
            },
            registry,
            metrics.clone(),
        );
        let err = pool.push(frame(0x0201)).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted("recv")));
        assert_eq!(metrics.dropped(), 1);
        pool.shutdown();
    }
}
