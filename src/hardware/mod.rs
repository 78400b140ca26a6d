//! Hardware Communication
//!
//! Low-level serial transports and the shared-connection layer that lets several device
//! drivers multiplex one physical port.

pub mod connection;
pub mod mock;
pub mod transport;

pub use connection::{
    ConnectionEntry, ConnectionRegistry, PortLease, PortLink, DEFAULT_SETTLE_DELAY,
};
pub use transport::{PortOpener, PortSettings, SerialOpener, Transport};
