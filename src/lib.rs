//! RTMQ: the internal message bus carrying control and business traffic
//! between the chat backend tiers over plain TCP.
//!
//! Best-effort by design: no durability, no cross-link ordering, no
//! redelivery. Peers are expected to reconnect and resynchronize their own
//! state; anything needing acknowledgement layers its own protocol on top.

pub mod bus;
pub mod config;
pub mod error;

pub use bus::broker::Broker;
pub use bus::codec::{Frame, FrameHeader};
pub use bus::dispatch::MessageHandler;
pub use bus::metrics::BusMetrics;
pub use bus::proxy::Proxy;
pub use config::{BrokerConfig, ProxyConfig, QueueConfig};
pub use error::{Error, ProtocolError};
