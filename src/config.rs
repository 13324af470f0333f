//! Bus configuration. Validation is fail-fast: a proxy or broker is never
//! constructed from a config that did not pass `validate()`.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::bus::codec::MAX_FRAME_BODY;
use crate::error::Error;

fn default_senders_per_address() -> usize {
    1
}
fn default_worker_threads() -> usize {
    2
}
fn default_receive_threads() -> usize {
    2
}
fn default_distribution_shards() -> usize {
    2
}
fn default_receive_buffer_size() -> usize {
    65_536
}
fn default_keepalive_interval_secs() -> u64 {
    5
}
fn default_idle_timeout_secs() -> u64 {
    60
}
fn default_route_slots_per_node() -> usize {
    16
}

/// Bounds for one direction's message queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum queued items; enqueue past this drops the item.
    pub capacity: usize,
    /// Maximum payload bytes per item; larger payloads are refused.
    pub item_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            item_size: 65_536,
        }
    }
}

impl QueueConfig {
    fn validate(&self, name: &str) -> Result<(), Error> {
        if self.capacity == 0 {
            return Err(Error::ConfigInvalid(format!("{name}.capacity must be > 0")));
        }
        if self.item_size == 0 || self.item_size > MAX_FRAME_BODY {
            return Err(Error::ConfigInvalid(format!(
                "{name}.item_size must be in 1..={MAX_FRAME_BODY}"
            )));
        }
        Ok(())
    }
}

fn validate_common(
    node_id: u32,
    work_dir: &Option<PathBuf>,
    receive_buffer_size: usize,
    send_queue: &QueueConfig,
    recv_queue: &QueueConfig,
) -> Result<(), Error> {
    if node_id == 0 {
        return Err(Error::ConfigInvalid("node_id must be non-zero".into()));
    }
    if let Some(dir) = work_dir {
        if !dir.is_dir() {
            return Err(Error::ConfigInvalid(format!(
                "work_dir {} is not a directory",
                dir.display()
            )));
        }
    }
    // The cursor must hold at least one maximal frame plus its header.
    if receive_buffer_size < 4096 {
        return Err(Error::ConfigInvalid(
            "receive_buffer_size must be at least 4096".into(),
        ));
    }
    send_queue.validate("send_queue")?;
    recv_queue.validate("recv_queue")?;
    Ok(())
}

fn parse_addr(addr: &str, what: &str) -> Result<SocketAddr, Error> {
    addr.parse::<SocketAddr>()
        .map_err(|e| Error::ConfigInvalid(format!("{what} {addr:?}: {e}")))
}

/// Client-half configuration: one proxy dialing the broker tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub node_id: u32,
    pub group_id: u32,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    pub username: String,
    pub password: String,
    /// `ip:port` of every broker endpoint this proxy maintains links to.
    pub destination_addresses: Vec<String>,
    #[serde(default = "default_senders_per_address")]
    pub senders_per_address: usize,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: usize,
    #[serde(default)]
    pub send_queue: QueueConfig,
    #[serde(default)]
    pub recv_queue: QueueConfig,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), Error> {
        validate_common(
            self.node_id,
            &self.work_dir,
            self.receive_buffer_size,
            &self.send_queue,
            &self.recv_queue,
        )?;
        if self.username.is_empty() {
            return Err(Error::ConfigInvalid("username must not be empty".into()));
        }
        if self.destination_addresses.is_empty() {
            return Err(Error::ConfigInvalid(
                "destination_addresses must not be empty".into(),
            ));
        }
        for addr in &self.destination_addresses {
            parse_addr(addr, "destination address")?;
        }
        if self.senders_per_address == 0 {
            return Err(Error::ConfigInvalid(
                "senders_per_address must be > 0".into(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(Error::ConfigInvalid("worker_threads must be > 0".into()));
        }
        if self.keepalive_interval_secs == 0 {
            return Err(Error::ConfigInvalid(
                "keepalive_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn destinations(&self) -> Vec<SocketAddr> {
        // validate() already proved these parse
        self.destination_addresses
            .iter()
            .filter_map(|a| a.parse().ok())
            .collect()
    }
}

/// Server-half configuration: one broker terminating proxy links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub node_id: u32,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// `ip:port` the listener binds.
    pub listen_address: String,
    #[serde(default = "default_receive_threads")]
    pub receive_threads: usize,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_distribution_shards")]
    pub distribution_shards: usize,
    /// Username/password pairs loaded into the credential table at init.
    #[serde(default)]
    pub credentials: Vec<(String, String)>,
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: usize,
    #[serde(default)]
    pub send_queue: QueueConfig,
    #[serde(default)]
    pub recv_queue: QueueConfig,
    /// Links with no inbound frame for this long are dropped.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_route_slots_per_node")]
    pub route_slots_per_node: usize,
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<(), Error> {
        validate_common(
            self.node_id,
            &self.work_dir,
            self.receive_buffer_size,
            &self.send_queue,
            &self.recv_queue,
        )?;
        parse_addr(&self.listen_address, "listen address")?;
        if self.receive_threads == 0 {
            return Err(Error::ConfigInvalid("receive_threads must be > 0".into()));
        }
        if self.worker_threads == 0 {
            return Err(Error::ConfigInvalid("worker_threads must be > 0".into()));
        }
        if self.distribution_shards == 0 {
            return Err(Error::ConfigInvalid(
                "distribution_shards must be > 0".into(),
            ));
        }
        if self.idle_timeout_secs == 0 {
            return Err(Error::ConfigInvalid("idle_timeout_secs must be > 0".into()));
        }
        if self.route_slots_per_node == 0 {
            return Err(Error::ConfigInvalid(
                "route_slots_per_node must be > 0".into(),
            ));
        }
        for (user, _) in &self.credentials {
            if user.is_empty() {
                return Err(Error::ConfigInvalid(
                    "credential usernames must not be empty".into(),
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn listen_addr(&self) -> SocketAddr {
        self.listen_address.parse().expect("validated")
    }
}
