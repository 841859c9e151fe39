//! Packet framing.
//!
//! A packet on the wire is `[OpCode:1][PayloadLength:2, big-endian][Payload]`.
//! [`Packet`] is a closed enum over every payload type, so handling a new
//! opcode is a change the compiler checks at every `match`.
use std::fmt;

use bincode::{Decode, Encode};

use super::{
    codec::{self, CodecError},
    payload::*,
};

/// Size of the opcode plus length header.
pub const HEADER_SIZE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Client asks to open a session. Client to server.
    Connect,
    /// Handshake verdict. Server to client.
    ConnAck,
    /// Application data. Either direction.
    Send,
    /// Reply to a SEND. Either direction.
    SendResponse,
    /// Keepalive probe. Either direction.
    Ping,
    /// Keepalive reply. Either direction.
    Pong,
    /// Device command. Server to client.
    Execute,
    /// Device command outcome. Client to server.
    ExecuteResponse,
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x1 => Ok(OpCode::Connect),
            0x2 => Ok(OpCode::ConnAck),
            0x3 => Ok(OpCode::Send),
            0x4 => Ok(OpCode::SendResponse),
            0x5 => Ok(OpCode::Ping),
            0x6 => Ok(OpCode::Pong),
            0x7 => Ok(OpCode::Execute),
            0x8 => Ok(OpCode::ExecuteResponse),
            unknown => Err(unknown),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(value: OpCode) -> Self {
        match value {
            OpCode::Connect => 0x1,
            OpCode::ConnAck => 0x2,
            OpCode::Send => 0x3,
            OpCode::SendResponse => 0x4,
            OpCode::Ping => 0x5,
            OpCode::Pong => 0x6,
            OpCode::Execute => 0x7,
            OpCode::ExecuteResponse => 0x8,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpCode::Connect => "CONNECT",
            OpCode::ConnAck => "CONNACK",
            OpCode::Send => "SEND",
            OpCode::SendResponse => "SENDRESP",
            OpCode::Ping => "PING",
            OpCode::Pong => "PONG",
            OpCode::Execute => "EXECUTE",
            OpCode::ExecuteResponse => "EXECUTE_RESPONSE",
        };
        f.write_str(name)
    }
}

/// Fixed frame header. Encodes to exactly [`HEADER_SIZE`] bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub(crate) struct Header {
    pub opcode: u8,
    pub length: u16,
}

impl Header {
    pub fn decode(bytes: [u8; HEADER_SIZE]) -> Result<Self, CodecError> {
        codec::decode(&mut &bytes[..])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(ConnectPayload),
    ConnAck(ConnAckPayload),
    Send(SendPayload),
    SendResponse(SendResponsePayload),
    Ping(PingPayload),
    Pong(PongPayload),
    Execute(ExecutePayload),
    ExecuteResponse(ExecuteResponsePayload),
}

impl Packet {
    pub fn opcode(&self) -> OpCode {
        match self {
            Packet::Connect(_) => OpCode::Connect,
            Packet::ConnAck(_) => OpCode::ConnAck,
            Packet::Send(_) => OpCode::Send,
            Packet::SendResponse(_) => OpCode::SendResponse,
            Packet::Ping(_) => OpCode::Ping,
            Packet::Pong(_) => OpCode::Pong,
            Packet::Execute(_) => OpCode::Execute,
            Packet::ExecuteResponse(_) => OpCode::ExecuteResponse,
        }
    }

    /// Encodes the complete frame. Fails before producing anything if the
    /// payload would not fit the 16-bit length field.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut payload = Vec::new();
        match self {
            Packet::Connect(p) => p.write_to(&mut payload)?,
            Packet::ConnAck(p) => p.write_to(&mut payload)?,
            Packet::Send(p) => p.write_to(&mut payload)?,
            Packet::SendResponse(p) => p.write_to(&mut payload)?,
            Packet::Ping(p) => p.write_to(&mut payload)?,
            Packet::Pong(p) => p.write_to(&mut payload)?,
            Packet::Execute(p) => p.write_to(&mut payload)?,
            Packet::ExecuteResponse(p) => p.write_to(&mut payload)?,
        };
        let length =
            u16::try_from(payload.len()).map_err(|_| CodecError::PayloadTooLarge(payload.len()))?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        codec::encode(
            Header {
                opcode: self.opcode().into(),
                length,
            },
            &mut frame,
        )?;
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decodes a payload of exactly `bytes.len()` bytes for `opcode`.
    pub fn decode(opcode: OpCode, bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = bytes;
        let packet = match opcode {
            OpCode::Connect => Packet::Connect(ConnectPayload::read_from(&mut reader)?),
            OpCode::ConnAck => Packet::ConnAck(ConnAckPayload::read_from(&mut reader)?),
            OpCode::Send => Packet::Send(SendPayload::read_from(&mut reader)?),
            OpCode::SendResponse => {
                Packet::SendResponse(SendResponsePayload::read_from(&mut reader)?)
            }
            OpCode::Ping => Packet::Ping(PingPayload::read_from(&mut reader)?),
            OpCode::Pong => Packet::Pong(PongPayload::read_from(&mut reader)?),
            OpCode::Execute => Packet::Execute(ExecutePayload::read_from(&mut reader)?),
            OpCode::ExecuteResponse => {
                Packet::ExecuteResponse(ExecuteResponsePayload::read_from(&mut reader)?)
            }
        };

        if !reader.is_empty() {
            return Err(CodecError::TrailingBytes(reader.len()));
        }
        Ok(packet)
    }
}
