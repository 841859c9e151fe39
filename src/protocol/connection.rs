//! Connection core shared by both ends of the protocol.
//!
//! A [`Connection`] owns the write half of a socket, lent to one writer at a
//! time so frames never interleave, and the correlation tables for every
//! request type either side can issue. Every write is bounded: by the
//! caller's deadline for requests, by the connection's write timeout
//! otherwise. The read half is
//! driven by [`read_loop`] on the connection's own thread, which hands each
//! packet to a role-specific [`PacketHandler`].
use std::{
    fmt,
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, error, info, trace, warn};
use thiserror::Error;

use super::{
    packet::{OpCode, Packet},
    payload::*,
    pending::{PendingRequests, Waiter},
    transport::{PacketReader, PacketWriter, TransportError},
};

/// Bound on writes that carry no deadline of their own, such as PONG replies
/// and fire-and-forget SENDs.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("timed out waiting for response")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error("request id {0} is already in flight")]
    DuplicateRequestId(u16),
    #[error("every request id is in flight")]
    IdsExhausted,
    #[error("unexpected {0} packet")]
    UnexpectedPacket(OpCode),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ConnectionError {
    /// Execute status reported upstream when a device command fails with
    /// this error instead of a response.
    pub fn status(&self) -> ExecuteStatus {
        match self {
            ConnectionError::Timeout | ConnectionError::Closed => ExecuteStatus::Offline,
            ConnectionError::Transport(e) if e.is_fatal() => ExecuteStatus::Offline,
            _ => ExecuteStatus::Error,
        }
    }
}

/// Callback receiving SEND packets. Returning `Some` answers with a SENDRESP
/// carrying the same ID.
pub trait SendHandler: Send + Sync {
    fn on_send(&self, peer: &str, payload: SendPayload) -> Option<Vec<u8>>;
}

impl<F> SendHandler for F
where
    F: Fn(&str, SendPayload) -> Option<Vec<u8>> + Send + Sync,
{
    fn on_send(&self, peer: &str, payload: SendPayload) -> Option<Vec<u8>> {
        self(peer, payload)
    }
}

/// Role-specific dispatch for packets read off a connection. An `Err` ends
/// the connection.
pub(crate) trait PacketHandler {
    fn handle(&self, connection: &Connection, packet: Packet) -> Result<(), ConnectionError>;
}

pub struct Connection {
    peer: SocketAddr,
    name: String,
    stream: TcpStream,
    // `None` while a writer has it checked out.
    writer: Mutex<Option<PacketWriter<TcpStream>>>,
    writer_returned: Condvar,
    write_timeout: Duration,
    closed: AtomicBool,
    send_responses: PendingRequests<SendResponsePayload>,
    pongs: PendingRequests<PongPayload>,
    execute_responses: PendingRequests<ExecuteResponsePayload>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Splits `stream` into a shared connection and the reader its read loop
    /// will own.
    pub(crate) fn new(stream: TcpStream) -> std::io::Result<(Self, PacketReader<TcpStream>)> {
        let peer = stream.peer_addr()?;
        let reader = PacketReader::new(stream.try_clone()?);
        let writer = PacketWriter::new(stream.try_clone()?);
        let connection = Self {
            peer,
            name: peer.to_string(),
            stream,
            writer: Mutex::new(Some(writer)),
            writer_returned: Condvar::new(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            closed: AtomicBool::new(false),
            send_responses: PendingRequests::new("SEND"),
            pongs: PendingRequests::new("PING"),
            execute_responses: PendingRequests::new("EXECUTE"),
        };
        Ok((connection, reader))
    }

    /// Labels the connection in logs, normally with the peer's client ID.
    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    /// Bound for writes without a caller deadline. A write still blocked
    /// after it closes the connection.
    pub(crate) fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = timeout.max(Duration::from_millis(1));
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Writes one packet within the connection's write timeout.
    pub fn write_packet(&self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_packet_until(packet, Instant::now() + self.write_timeout)
    }

    /// Writes one packet, giving up at `deadline`.
    ///
    /// Running out of time while waiting for another writer leaves the
    /// stream untouched and returns `Timeout`. Running out of time mid-write
    /// leaves an unknown number of bytes on the wire, so the connection is
    /// shut down rather than reused, as after any other failed write.
    pub(crate) fn write_packet_until(
        &self,
        packet: &Packet,
        deadline: Instant,
    ) -> Result<(), ConnectionError> {
        let mut writer = self.checkout_writer(deadline)?;
        let result = match deadline.checked_duration_since(Instant::now()) {
            Some(remaining) if !remaining.is_zero() => self
                .stream
                .set_write_timeout(Some(remaining))
                .map_err(TransportError::from)
                .and_then(|()| writer.write_packet(packet)),
            _ => {
                self.return_writer(writer);
                return Err(ConnectionError::Timeout);
            }
        };
        self.return_writer(writer);

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal() => {
                warn!("[{}] write failed, closing: {e}", self.name);
                self.close();
                if e.is_timeout() {
                    Err(ConnectionError::Timeout)
                } else {
                    Err(e.into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn checkout_writer(
        &self,
        deadline: Instant,
    ) -> Result<PacketWriter<TcpStream>, ConnectionError> {
        let mut slot = self.lock_writer();
        loop {
            if self.is_closed() {
                return Err(ConnectionError::Closed);
            }
            if let Some(writer) = slot.take() {
                return Ok(writer);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ConnectionError::Timeout);
            }
            slot = self
                .writer_returned
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn return_writer(&self, writer: PacketWriter<TcpStream>) {
        *self.lock_writer() = Some(writer);
        self.writer_returned.notify_one();
    }

    fn lock_writer(&self) -> MutexGuard<'_, Option<PacketWriter<TcpStream>>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fire-and-forget SEND.
    pub fn send(&self, data: Vec<u8>) -> Result<(), ConnectionError> {
        self.write_packet(&Packet::Send(SendPayload {
            id: rand::random(),
            flags: 0,
            data,
        }))
    }

    /// SEND and wait for the SENDRESP with the same ID.
    pub fn send_with_response(
        &self,
        data: Vec<u8>,
        deadline: Instant,
    ) -> Result<SendResponsePayload, ConnectionError> {
        if Instant::now() >= deadline {
            return Err(ConnectionError::Timeout);
        }
        let waiter = self.send_responses.register()?;
        let send = Packet::Send(SendPayload {
            id: waiter.id(),
            flags: 0,
            data,
        });
        self.write_packet_until(&send, deadline)?;
        waiter.wait(deadline)
    }

    /// PING with a fresh ID and wait for its PONG. Returns the ID used.
    pub fn ping(&self, deadline: Instant) -> Result<u16, ConnectionError> {
        if Instant::now() >= deadline {
            return Err(ConnectionError::Timeout);
        }
        let waiter = self.pongs.register()?;
        self.await_pong(waiter, deadline)
    }

    /// PING with a caller-chosen ID.
    pub fn ping_with_id(&self, id: u16, deadline: Instant) -> Result<u16, ConnectionError> {
        if Instant::now() >= deadline {
            return Err(ConnectionError::Timeout);
        }
        let waiter = self.pongs.register_id(id)?;
        self.await_pong(waiter, deadline)
    }

    fn await_pong(
        &self,
        waiter: Waiter<'_, PongPayload>,
        deadline: Instant,
    ) -> Result<u16, ConnectionError> {
        let id = waiter.id();
        let sent = Instant::now();
        self.write_packet_until(&Packet::Ping(PingPayload { id }), deadline)?;
        let pong = waiter.wait(deadline)?;
        debug!("[{}] PONG {} after {:?}", self.name, pong.id, sent.elapsed());
        Ok(pong.id)
    }

    /// Writes an EXECUTE without waiting for the outcome.
    pub fn send_execute(&self, payload: ExecutePayload) -> Result<(), ConnectionError> {
        self.write_packet(&Packet::Execute(payload))
    }

    /// Writes an EXECUTE and waits for the EXECUTE_RESPONSE correlated to
    /// `payload.id`.
    pub fn execute(
        &self,
        payload: ExecutePayload,
        deadline: Instant,
    ) -> Result<ExecuteResponsePayload, ConnectionError> {
        if Instant::now() >= deadline {
            return Err(ConnectionError::Timeout);
        }
        let waiter = self.execute_responses.register_id(payload.id)?;
        self.write_packet_until(&Packet::Execute(payload), deadline)?;
        waiter.wait(deadline)
    }

    /// Shuts the socket down in both directions, ending the read loop, and
    /// fails every pending request. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("[{}] closing connection to {}", self.name, self.peer);
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            trace!("[{}] shutdown: {e}", self.name);
        }
        // Wake writers queued behind a blocked one.
        drop(self.lock_writer());
        self.writer_returned.notify_all();
        self.send_responses.close();
        self.pongs.close();
        self.execute_responses.close();
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.send_responses.in_flight() + self.pongs.in_flight() + self.execute_responses.in_flight()
    }

    // Handlers for the packets both roles treat the same way.

    pub(crate) fn on_ping(&self, ping: PingPayload) -> Result<(), ConnectionError> {
        trace!("[{}] PING {}", self.name, ping.id);
        self.write_packet(&Packet::Pong(PongPayload { id: ping.id }))
    }

    pub(crate) fn on_pong(&self, pong: PongPayload) {
        if !self.pongs.complete(pong.id, pong) {
            warn!("[{}] dropping unsolicited PONG {}", self.name, pong.id);
        }
    }

    pub(crate) fn on_send(
        &self,
        handler: Option<&dyn SendHandler>,
        send: SendPayload,
    ) -> Result<(), ConnectionError> {
        let id = send.id;
        trace!("[{}] SEND {id}, {} bytes", self.name, send.data.len());
        let Some(handler) = handler else {
            debug!("[{}] no SEND handler, ignoring SEND {id}", self.name);
            return Ok(());
        };
        match handler.on_send(&self.name, send) {
            Some(data) => {
                let reply = Packet::SendResponse(SendResponsePayload { id, data });
                match self.write_packet(&reply) {
                    // An oversized reply is the handler's fault, not the peer's.
                    Err(ConnectionError::Transport(e)) if !e.is_fatal() => {
                        warn!("[{}] dropping SENDRESP {id}: {e}", self.name);
                        Ok(())
                    }
                    result => result,
                }
            }
            None => Ok(()),
        }
    }

    pub(crate) fn on_send_response(&self, response: SendResponsePayload) {
        let id = response.id;
        if !self.send_responses.complete(id, response) {
            warn!("[{}] dropping SENDRESP {id} with no pending SEND", self.name);
        }
    }

    pub(crate) fn on_execute_response(&self, response: ExecuteResponsePayload) {
        let id = response.id;
        if !self.execute_responses.complete(id, response) {
            warn!(
                "[{}] dropping EXECUTE_RESPONSE {id} with no pending EXECUTE",
                self.name
            );
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reads and dispatches packets until the peer disconnects or a fatal error
/// occurs, then closes the connection. Malformed payloads inside well-formed
/// frames are logged and skipped.
pub(crate) fn read_loop<H: PacketHandler>(
    connection: &Connection,
    mut reader: PacketReader<TcpStream>,
    handler: &H,
) -> Result<(), ConnectionError> {
    let result = loop {
        match reader.read_packet() {
            Ok(packet) => {
                if let Err(e) = handler.handle(connection, packet) {
                    break Err(e);
                }
            }
            Err(TransportError::Closed) => break Ok(()),
            Err(e) if e.is_fatal() => break Err(e.into()),
            Err(e) => warn!("[{}] {e}", connection.name()),
        }
    };

    match &result {
        // A local close() also ends the loop with a read error.
        Err(_) if connection.is_closed() => debug!("[{}] read loop stopped", connection.name()),
        Err(ConnectionError::Transport(e)) if e.is_timeout() => {
            info!("[{}] no traffic within read timeout", connection.name())
        }
        Err(e) => error!("[{}] connection failed: {e}", connection.name()),
        Ok(()) => debug!("[{}] peer disconnected", connection.name()),
    }
    connection.close();
    result
}
