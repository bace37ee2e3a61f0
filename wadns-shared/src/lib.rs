#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod error;
pub mod tcp_framing;
pub(crate) mod transport;

pub use transport::{
    StreamId, TaggedBytesMut, TransportContext, TransportMessage, TransportProtocol,
};
