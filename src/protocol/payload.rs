//! Payload types carried by each opcode.
//!
//! Every payload reads itself from a reader already bounded to the packet's
//! declared length and writes itself to any writer, returning the number of
//! bytes produced. Framing (opcode and length header) lives in
//! [`packet`](super::packet).
use std::io::{Read, Write};

use serde_json::{Map, Value};

use super::codec::{self, CodecError};

/// JSON object used for `Params` and `State`.
pub type JsonObject = Map<String, Value>;

/// CONNACK return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnCode {
    ConnectionAccepted,
    UnsupportedProtocol,
    ServerUnavailable,
    MalformedPayload,
    Unauthorized,
}

impl TryFrom<u8> for ReturnCode {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x1 => Ok(ReturnCode::ConnectionAccepted),
            0x2 => Ok(ReturnCode::UnsupportedProtocol),
            0x3 => Ok(ReturnCode::ServerUnavailable),
            0x4 => Ok(ReturnCode::MalformedPayload),
            0x5 => Ok(ReturnCode::Unauthorized),
            value => Err(CodecError::UnknownValue {
                kind: "return code",
                value,
            }),
        }
    }
}

impl From<ReturnCode> for u8 {
    fn from(value: ReturnCode) -> Self {
        match value {
            ReturnCode::ConnectionAccepted => 0x1,
            ReturnCode::UnsupportedProtocol => 0x2,
            ReturnCode::ServerUnavailable => 0x3,
            ReturnCode::MalformedPayload => 0x4,
            ReturnCode::Unauthorized => 0x5,
        }
    }
}

/// Outcome of an EXECUTE, mirroring the fulfillment layer's status vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecuteStatus {
    /// Command succeeded.
    Success,
    /// Command is enqueued and expected to succeed.
    Pending,
    /// Device is offline or unreachable.
    Offline,
    /// Command ran but raised an alert worth reporting.
    Exceptions,
    /// Device could not perform the command.
    Error,
}

impl TryFrom<u8> for ExecuteStatus {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0x1 => Ok(ExecuteStatus::Success),
            0x2 => Ok(ExecuteStatus::Pending),
            0x3 => Ok(ExecuteStatus::Offline),
            0x4 => Ok(ExecuteStatus::Exceptions),
            0x5 => Ok(ExecuteStatus::Error),
            value => Err(CodecError::UnknownValue {
                kind: "execute status",
                value,
            }),
        }
    }
}

impl From<ExecuteStatus> for u8 {
    fn from(value: ExecuteStatus) -> Self {
        match value {
            ExecuteStatus::Success => 0x1,
            ExecuteStatus::Pending => 0x2,
            ExecuteStatus::Offline => 0x3,
            ExecuteStatus::Exceptions => 0x4,
            ExecuteStatus::Error => 0x5,
        }
    }
}

/// CONNECT: the client's identifier, one-byte length prefixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPayload {
    pub client_id: String,
}

impl ConnectPayload {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, CodecError> {
        let bytes = codec::read_short_prefixed(reader)?;
        let client_id =
            String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8("client_id"))?;
        Ok(Self { client_id })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<usize, CodecError> {
        codec::write_short_prefixed(writer, "client_id", self.client_id.as_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAckPayload {
    pub return_code: ReturnCode,
}

impl ConnAckPayload {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, CodecError> {
        let return_code = codec::read_u8(reader)?.try_into()?;
        Ok(Self { return_code })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<usize, CodecError> {
        codec::write_u8(writer, self.return_code.into())
    }
}

/// SEND: opaque application data. `data` runs to the end of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendPayload {
    pub id: u16,
    pub flags: u8,
    pub data: Vec<u8>,
}

impl SendPayload {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, CodecError> {
        let id = codec::read_u16(reader)?;
        let flags = codec::read_u8(reader)?;
        let data = codec::read_remaining(reader)?;
        Ok(Self { id, flags, data })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<usize, CodecError> {
        let mut n = codec::write_u16(writer, self.id)?;
        n += codec::write_u8(writer, self.flags)?;
        writer.write_all(&self.data)?;
        Ok(n + self.data.len())
    }
}

/// SENDRESP: reply to the SEND with the same `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResponsePayload {
    pub id: u16,
    pub data: Vec<u8>,
}

impl SendResponsePayload {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, CodecError> {
        let id = codec::read_u16(reader)?;
        let data = codec::read_remaining(reader)?;
        Ok(Self { id, data })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<usize, CodecError> {
        let n = codec::write_u16(writer, self.id)?;
        writer.write_all(&self.data)?;
        Ok(n + self.data.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPayload {
    pub id: u16,
}

impl PingPayload {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, CodecError> {
        Ok(Self {
            id: codec::read_u16(reader)?,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<usize, CodecError> {
        codec::write_u16(writer, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongPayload {
    pub id: u16,
}

impl PongPayload {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, CodecError> {
        Ok(Self {
            id: codec::read_u16(reader)?,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<usize, CodecError> {
        codec::write_u16(writer, self.id)
    }
}

/// EXECUTE: a device command with JSON parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutePayload {
    pub id: u16,
    pub command: u32,
    pub params: JsonObject,
}

impl ExecutePayload {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, CodecError> {
        let id = codec::read_u16(reader)?;
        let command = codec::read_u32(reader)?;
        let params = read_json(reader, "params")?;
        Ok(Self {
            id,
            command,
            params,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<usize, CodecError> {
        let params = write_json(&self.params, "params")?;
        let mut n = codec::write_u16(writer, self.id)?;
        n += codec::write_u32(writer, self.command)?;
        n += codec::write_length_prefixed(writer, "params", &params)?;
        Ok(n)
    }
}

/// EXECUTE_RESPONSE: outcome and resulting device state.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteResponsePayload {
    pub id: u16,
    pub status: ExecuteStatus,
    pub state: JsonObject,
}

impl ExecuteResponsePayload {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, CodecError> {
        let id = codec::read_u16(reader)?;
        let status = codec::read_u8(reader)?.try_into()?;
        let state = read_json(reader, "state")?;
        Ok(Self { id, status, state })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<usize, CodecError> {
        let state = write_json(&self.state, "state")?;
        let mut n = codec::write_u16(writer, self.id)?;
        n += codec::write_u8(writer, self.status.into())?;
        n += codec::write_length_prefixed(writer, "state", &state)?;
        Ok(n)
    }
}

// A JSON `null` object is accepted as empty.
fn read_json<R: Read>(reader: &mut R, field: &'static str) -> Result<JsonObject, CodecError> {
    let bytes = codec::read_length_prefixed(reader)?;
    let object: Option<JsonObject> =
        serde_json::from_slice(&bytes).map_err(|source| CodecError::Json { field, source })?;
    Ok(object.unwrap_or_default())
}

fn write_json(object: &JsonObject, field: &'static str) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(object).map_err(|source| CodecError::Json { field, source })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn object(value: Value) -> JsonObject {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn connect_layout() {
        let mut buf = Vec::new();
        let p = ConnectPayload {
            client_id: "dev-1".into(),
        };
        assert_eq!(p.write_to(&mut buf).unwrap(), 6);
        assert_eq!(buf, b"\x05dev-1");
        assert_eq!(ConnectPayload::read_from(&mut buf.as_slice()).unwrap(), p);
    }

    #[test]
    fn connect_rejects_invalid_utf8() {
        let buf = [2u8, 0xff, 0xfe];
        let err = ConnectPayload::read_from(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidUtf8("client_id")));
    }

    #[test]
    fn connack_rejects_unknown_code() {
        for code in [0u8, 6, 0xff] {
            assert!(ConnAckPayload::read_from(&mut &[code][..]).is_err());
        }
        for code in 1u8..=5 {
            let p = ConnAckPayload::read_from(&mut &[code][..]).unwrap();
            assert_eq!(u8::from(p.return_code), code);
        }
    }

    #[test]
    fn execute_layout() {
        let p = ExecutePayload {
            id: 7,
            command: 1,
            params: object(json!({"on": true})),
        };
        let mut buf = Vec::new();
        let n = p.write_to(&mut buf).unwrap();
        assert_eq!(n, buf.len());

        let params = br#"{"on":true}"#;
        let mut expected = vec![0, 7, 0, 0, 0, 1, 0, params.len() as u8];
        expected.extend_from_slice(params);
        assert_eq!(buf, expected);
        assert_eq!(ExecutePayload::read_from(&mut buf.as_slice()).unwrap(), p);
    }

    #[test]
    fn execute_response_round_trip() {
        let p = ExecuteResponsePayload {
            id: u16::MAX,
            status: ExecuteStatus::Exceptions,
            state: object(json!({"on": true, "online": true, "brightness": 40})),
        };
        let mut buf = Vec::new();
        p.write_to(&mut buf).unwrap();
        assert_eq!(buf[2], 4);
        assert_eq!(
            ExecuteResponsePayload::read_from(&mut buf.as_slice()).unwrap(),
            p
        );
    }

    #[test]
    fn execute_accepts_null_params() {
        let mut buf = vec![0, 1, 0, 0, 0, 2, 0, 4];
        buf.extend_from_slice(b"null");
        let p = ExecutePayload::read_from(&mut buf.as_slice()).unwrap();
        assert!(p.params.is_empty());
    }

    #[test]
    fn execute_rejects_non_object_params() {
        let mut buf = vec![0, 1, 0, 0, 0, 2, 0, 3];
        buf.extend_from_slice(b"[1]");
        let err = ExecutePayload::read_from(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, CodecError::Json { field: "params", .. }));
    }

    #[test]
    fn execute_response_rejects_unknown_status() {
        let buf = [0u8, 1, 9, 0, 2, b'{', b'}'];
        assert!(ExecuteResponsePayload::read_from(&mut &buf[..]).is_err());
    }

    #[test]
    fn send_data_runs_to_end() {
        let p = SendPayload {
            id: 0,
            flags: 0x80,
            data: vec![],
        };
        let mut buf = Vec::new();
        assert_eq!(p.write_to(&mut buf).unwrap(), 3);
        assert_eq!(SendPayload::read_from(&mut buf.as_slice()).unwrap(), p);

        let buf = [0u8, 9, b'h', b'i'];
        let p = SendResponsePayload::read_from(&mut &buf[..]).unwrap();
        assert_eq!(p.id, 9);
        assert_eq!(p.data, b"hi");
    }
}
