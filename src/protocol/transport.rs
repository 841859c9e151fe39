use std::io::{self, ErrorKind, Read, Write};

use log::trace;
use thiserror::Error;

use super::{
    codec::CodecError,
    packet::{HEADER_SIZE, Header, OpCode, Packet},
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    Closed,
    #[error("transport IO error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpCode(u8),
    #[error("malformed frame header: {0}")]
    Header(CodecError),
    #[error("malformed {opcode} payload: {source}")]
    Payload { opcode: OpCode, source: CodecError },
    #[error("failed to encode {opcode} packet: {source}")]
    Encode { opcode: OpCode, source: CodecError },
}

impl TransportError {
    /// Whether the stream can no longer be trusted to be frame-aligned.
    ///
    /// A payload error leaves the stream intact since its declared length was
    /// consumed in full, and a failed encode never touched the stream.
    /// Everything else desynchronizes or ends the connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Payload { .. } | Self::Encode { .. })
    }

    /// True for read timeouts configured on the socket.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Io(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut))
    }
}

/// Read half of a protocol stream. Decodes one packet at a time, always
/// consuming exactly the declared payload length.
pub struct PacketReader<R: Read> {
    stream: R,
}

impl<R: Read> PacketReader<R> {
    pub fn new(stream: R) -> Self {
        Self { stream }
    }

    pub fn read_packet(&mut self) -> Result<Packet, TransportError> {
        let header = self.read_header()?;
        let opcode = OpCode::try_from(header.opcode).map_err(TransportError::UnknownOpCode)?;
        self.read_payload(opcode, header.length)
    }

    /// Reads the header and returns the opcode without touching the payload.
    /// Used by the handshake, which must reject a wrong first opcode before
    /// trusting anything else on the stream.
    pub fn read_opcode(&mut self) -> Result<(OpCode, u16), TransportError> {
        let header = self.read_header()?;
        let opcode = OpCode::try_from(header.opcode).map_err(TransportError::UnknownOpCode)?;
        Ok((opcode, header.length))
    }

    pub fn read_payload(&mut self, opcode: OpCode, length: u16) -> Result<Packet, TransportError> {
        let mut payload = vec![0; length as usize];
        self.stream.read_exact(&mut payload)?;
        trace!("read {opcode} packet, {length} byte payload");

        Packet::decode(opcode, &payload)
            .map_err(|source| TransportError::Payload { opcode, source })
    }

    fn read_header(&mut self) -> Result<Header, TransportError> {
        let mut buf = [0; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Err(TransportError::Closed),
                Ok(0) => return Err(io::Error::from(ErrorKind::UnexpectedEof).into()),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Header::decode(buf).map_err(TransportError::Header)
    }
}

/// Write half of a protocol stream. Each packet is encoded in full before a
/// single `write_all`, so an encode failure never leaves a partial frame.
pub struct PacketWriter<W: Write> {
    stream: W,
}

impl<W: Write> PacketWriter<W> {
    pub fn new(stream: W) -> Self {
        Self { stream }
    }

    pub fn write_packet(&mut self, packet: &Packet) -> Result<usize, TransportError> {
        let opcode = packet.opcode();
        let frame = packet
            .encode()
            .map_err(|source| TransportError::Encode { opcode, source })?;
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        trace!("wrote {opcode} packet, {} bytes", frame.len());
        Ok(frame.len())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek};

    use super::*;
    use crate::protocol::payload::*;

    #[test]
    fn read_write_packets() {
        let mut writer = PacketWriter::new(Cursor::new(Vec::new()));
        writer
            .write_packet(&Packet::Ping(PingPayload { id: 42 }))
            .unwrap();
        writer
            .write_packet(&Packet::Send(SendPayload {
                id: 1,
                flags: 0,
                data: b"hello".to_vec(),
            }))
            .unwrap();
        writer.stream.seek(std::io::SeekFrom::Start(0)).unwrap();

        let mut reader = PacketReader::new(writer.stream);
        assert_eq!(
            reader.read_packet().unwrap(),
            Packet::Ping(PingPayload { id: 42 })
        );
        assert!(matches!(reader.read_packet().unwrap(), Packet::Send(p) if p.data == b"hello"));
        assert!(matches!(reader.read_packet(), Err(TransportError::Closed)));
    }

    #[test]
    fn truncated_stream_is_fatal() {
        let frame = Packet::Execute(ExecutePayload {
            id: 3,
            command: 2,
            params: JsonObject::new(),
        })
        .encode()
        .unwrap();

        for cut in 1..frame.len() {
            let mut reader = PacketReader::new(&frame[..cut]);
            let err = reader.read_packet().unwrap_err();
            assert!(err.is_fatal(), "cut at {cut}: {err}");
        }
    }

    #[test]
    fn unknown_opcode_is_fatal() {
        let mut reader = PacketReader::new(&[0x42u8, 0, 0][..]);
        let err = reader.read_packet().unwrap_err();
        assert!(matches!(err, TransportError::UnknownOpCode(0x42)));
        assert!(err.is_fatal());
    }

    #[test]
    fn malformed_payload_keeps_stream_aligned() {
        // PING with a one-byte payload, followed by a valid PONG.
        let mut stream = vec![5u8, 0, 1, 9];
        stream.extend(Packet::Pong(PongPayload { id: 8 }).encode().unwrap());

        let mut reader = PacketReader::new(stream.as_slice());
        let err = reader.read_packet().unwrap_err();
        assert!(matches!(err, TransportError::Payload { opcode: OpCode::Ping, .. }));
        assert!(!err.is_fatal());
        assert_eq!(
            reader.read_packet().unwrap(),
            Packet::Pong(PongPayload { id: 8 })
        );
    }

    #[test]
    fn oversized_packet_writes_nothing() {
        let mut writer = PacketWriter::new(Vec::new());
        let err = writer
            .write_packet(&Packet::SendResponse(SendResponsePayload {
                id: 0,
                data: vec![0; u16::MAX as usize],
            }))
            .unwrap_err();
        assert!(matches!(err, TransportError::Encode { .. }));
        assert!(writer.stream.is_empty());
    }
}
