//! RSocket responder engine
//!
//! This crate implements the server side of an RSocket-style multiplexed
//! request/response protocol over a single ordered duplex connection. The core
//! is the per-connection stream multiplexer ([`Server`]) that dispatches
//! inbound frames, paces response producers against peer credit and local
//! send capacity, and propagates cancellation and termination.
//!
//! ```no_run
//! use rsocket_responder::{producer, Payload, Responder, ResponderError, ServerBuilder};
//! use rsocket_responder::producer::BoxProducer;
//! use rsocket_responder::connection::IoConnection;
//! use std::net::TcpStream;
//!
//! struct Echo;
//!
//! impl Responder for Echo {
//!     fn request_response(&self, payload: Payload) -> Result<BoxProducer, ResponderError> {
//!         Ok(producer::once(payload))
//!     }
//! }
//!
//! # fn main() -> rsocket_responder::Result<()> {
//! let socket = TcpStream::connect("127.0.0.1:7878")?;
//! let connection = IoConnection::new(socket.try_clone()?, socket)?;
//! let server = ServerBuilder::new().build(connection, Echo);
//! server.serve();
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frames;
mod inbound;
pub mod payload;
pub mod producer;
pub mod responder;
pub mod server;
pub mod stream;

pub use config::{ServerConfig, ServerConfigBuilder};
pub use connection::DuplexConnection;
pub use error::{Error, ErrorCode, ResponderError, Result};
pub use frames::{Frame, FrameFlags, FrameType};
pub use payload::{DefaultPayloadFactory, Payload, PayloadFactory, ZeroCopyPayloadFactory};
pub use producer::{BoxProducer, Producer, ProducerHandle, Sink};
pub use responder::Responder;
pub use server::{Server, ServerBuilder, WindowGrant, WindowHandle};
pub use stream::{StreamKind, StreamState, Termination};

/// Stream ID type (31 bits on the wire)
pub type StreamId = u32;

/// Stream ID reserved for connection-level frames
pub const CONNECTION_STREAM_ID: StreamId = 0;

/// Largest valid stream ID
pub const MAX_STREAM_ID: StreamId = 0x7FFF_FFFF;

/// Largest REQUEST_N value; this value means "unbounded"
pub const MAX_REQUEST_N: u32 = 0x7FFF_FFFF;

/// Size of the frame length prefix on byte-stream transports
pub const FRAME_LENGTH_SIZE: usize = 3;

/// Largest frame the length prefix can describe
pub const MAX_FRAME_LENGTH: usize = 0x00FF_FFFF;

/// Default per-stream send window, in frames
pub const DEFAULT_SEND_WINDOW: u64 = 256;

/// Protocol major version
pub const MAJOR_VERSION: u16 = 1;

/// Protocol minor version
pub const MINOR_VERSION: u16 = 0;
