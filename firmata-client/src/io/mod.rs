//! The Firmata protocol core: codecs, framing, listener registry, writer, reader and client.

mod client;
pub mod codec;
pub mod constants;
mod data;
mod frame;
mod pending;
mod reader;
mod registry;
mod transports;
mod writer;

pub use client::*;
pub use data::*;
pub use frame::Frame;
pub use pending::PendingReply;
pub use registry::{Listener, ListenerKind};
pub use transports::serial::Serial;
pub use transports::IoTransport;
pub use writer::Fault;
