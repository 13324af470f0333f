pub mod auth;
pub mod broker;
pub mod codec;
pub mod dispatch;
pub mod metrics;
pub mod proxy;
pub(crate) mod reliability;
pub mod route;
pub mod subscribe;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::metrics::BusMetrics;

/// Outbound batch cap per write syscall.
pub(crate) const MAX_BATCH_BYTES: usize = 65_536;

/// Wall-clock milliseconds since the UNIX epoch, for lock-free activity
/// timestamps shared between tasks.
pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// TCP_NODELAY, OS-level keepalive and larger socket buffers on every bus
/// link, dialed or accepted.
pub(crate) fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));
    let sock = SockRef::from(stream);
    let _ = sock.set_tcp_keepalive(&keepalive);
    let _ = sock.set_recv_buffer_size(262_144);
    let _ = sock.set_send_buffer_size(262_144);
}

/// Drains a link's wire channel into batched writes, coalescing whatever is
/// ready up to the batch cap. A partial write is resumed by `write_all` from
/// the exact unwritten offset; already-transmitted bytes are never
/// re-issued. Cancels the link token on exit so teardown propagates.
pub(crate) async fn link_writer(
    mut rx: mpsc::Receiver<Bytes>,
    mut write: OwnedWriteHalf,
    cancel: CancellationToken,
    metrics: Arc<BusMetrics>,
    last_write: Option<Arc<AtomicU64>>,
) {
    let mut buf = BytesMut::with_capacity(MAX_BATCH_BYTES);
    loop {
        let first = tokio::select! {
            msg = rx.recv() => msg,
            () = cancel.cancelled() => break,
        };
        let Some(first) = first else { break };
        buf.extend_from_slice(&first);

        while buf.len() < MAX_BATCH_BYTES {
            match rx.try_recv() {
                Ok(data) => buf.extend_from_slice(&data),
                Err(_) => break,
            }
        }

        if write.write_all(&buf).await.is_err() {
            break;
        }
        metrics
            .bytes_sent
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        if let Some(ts) = &last_write {
            ts.store(epoch_ms(), Ordering::Relaxed);
        }
        buf.clear();
    }
    cancel.cancel();
}
