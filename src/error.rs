use std::io;

use thiserror::Error;

/// Why a frame was rejected before reaching any handler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame check field 0x{found:08x} does not match 0x{expected:08x}")]
    BadCheck { found: u32, expected: u32 },

    #[error("frame flag {0} is neither SYS nor EXP")]
    BadFlag(i32),

    #[error("frame body of {length} bytes exceeds the {max} byte limit")]
    FrameTooLarge { length: usize, max: usize },

    #[error("frame of {needed} bytes cannot fit a {capacity} byte receive buffer")]
    BufferOverflow { needed: usize, capacity: usize },

    #[error("truncated control body for opcode 0x{0:04x}")]
    TruncatedControl(u32),
}

/// Bus error taxonomy.
///
/// Transport and protocol errors never cross a thread boundary: the owning
/// task tears down its single connection and the rest of the bus keeps
/// running. Callers of the public API only ever see the enqueue-side
/// variants.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport: {0}")]
    Transport(#[from] io::Error),

    #[error("{0} queue full or item too large, message dropped")]
    ResourceExhausted(&'static str),

    #[error("a handler is already registered for type 0x{0:04x}")]
    DuplicateRegistration(u32),

    #[error("link authentication rejected")]
    AuthFailure,

    #[error("bus is not running")]
    NotRunning,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_render_hex() {
        let e = ProtocolError::BadCheck {
            found: 0xdead_beef,
            expected: 0x8765_4321,
        };
        assert!(e.to_string().contains("0xdeadbeef"));
        assert!(e.to_string().contains("0x87654321"));
    }

    #[test]
    fn duplicate_registration_names_type() {
        let e = Error::DuplicateRegistration(0x0201);
        assert!(e.to_string().contains("0x0201"));
    }
}
