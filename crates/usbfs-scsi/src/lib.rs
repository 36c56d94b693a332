#![doc = include_str!("../README.md")]

pub mod block;
pub mod bot;
pub mod commands;
pub mod transport;

pub use block::{ScsiBlockDevice, ScsiError, ScsiOptions};
pub use bot::BulkOnlyTransport;
pub use transport::{
    EndpointSession, InterfaceFilter, InterfaceId, InterfaceSession, TransportError, UsbTransport,
};
