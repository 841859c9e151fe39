//! Hub-device communication protocol.
//!
//! This module implements the binary protocol spoken between the Lighthouse
//! hub and the devices it controls: the packet codec, the connection
//! handshake, keepalive, and the request/response correlation that lets a
//! hub issue commands to a device and wait for their outcome.
//!
//! # Overview
//!
//! Devices dial the hub over TCP and hold the connection open. The first
//! packet on every connection is a CONNECT naming the device's client ID; the
//! hub answers with a CONNACK and, when accepted, registers a [`Session`]
//! under that ID. From then on either side may write at any time:
//!
//! - SEND / SENDRESP carry opaque application data, optionally answered.
//! - PING / PONG check liveness, in both directions.
//! - EXECUTE / EXECUTE_RESPONSE issue a device command with JSON parameters
//!   and return its status and resulting JSON state.
//!
//! Responses are correlated to requests by a 16-bit ID. Any number of
//! requests may be in flight per connection; a response with an ID nobody is
//! waiting for is logged and dropped.
//!
//! # Key Components
//!
//! - [`Packet`]: One decoded frame.
//! - [`Server`]: Accepts devices, one thread per connection.
//! - [`ServerHandle`]: Routes commands to connected devices by client ID.
//! - [`Client`]: The device side of a connection.
//! - [`SessionRegistry`]: Live sessions keyed by client ID.
//!
//! # Binary Format
//!
//! Every frame is a 3-byte header followed by its payload:
//!
//! ```text
//! +--------+----------------+-----------------+
//! | opcode | length (u16)   | payload         |
//! | 1 byte | 2 bytes, BE    | `length` bytes  |
//! +--------+----------------+-----------------+
//! ```
//!
//! - All integers are big-endian.
//! - Strings and JSON documents inside payloads carry their own big-endian
//!   length prefix; the CONNECT client ID uses a single-byte prefix.
//! - A payload must be consumed exactly; trailing bytes are a decode error.
//!
//! An unknown opcode or a truncated frame ends the connection, since the
//! stream can no longer be resynchronized. A payload that fails to decode
//! inside an intact frame is skipped and the connection stays up.
mod codec;
mod connection;
mod packet;
mod payload;
mod pending;
mod registry;
mod transport;

pub mod client;
pub mod server;

pub use client::{Client, ClientConfig, ClientError, ExecuteHandler};
pub use codec::{CodecError, MAX_PAYLOAD_SIZE};
pub use connection::{Connection, ConnectionError, DEFAULT_WRITE_TIMEOUT, SendHandler};
pub use packet::{OpCode, Packet};
pub use payload::*;
pub use registry::{RegistryEntry, RegistryError, SessionRegistry};
pub use server::{DEFAULT_ADDRESS, Server, ServerConfig, ServerError, ServerHandle, Session};
pub use transport::{PacketReader, PacketWriter, TransportError};
