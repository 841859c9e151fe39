use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use thiserror::Error;

use super::{
    connection::{
        Connection, ConnectionError, DEFAULT_WRITE_TIMEOUT, PacketHandler, SendHandler, read_loop,
    },
    packet::{OpCode, Packet},
    payload::*,
    registry::{RegistryEntry, RegistryError, SessionRegistry},
    transport::{PacketReader, TransportError},
};

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:7070";
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server IO error: {0}")]
    Io(#[from] io::Error),
    #[error("client '{0}' is not connected")]
    NotConnected(String),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl ServerError {
    /// Execute status reported upstream in place of this error.
    pub fn status(&self) -> ExecuteStatus {
        match self {
            ServerError::NotConnected(_) => ExecuteStatus::Offline,
            ServerError::Connection(e) => e.status(),
            ServerError::Io(_) => ExecuteStatus::Error,
        }
    }
}

#[derive(Debug, Error)]
enum HandshakeError {
    #[error("connection must start with CONNECT, got {0}")]
    UnexpectedOpCode(OpCode),
    #[error("rejected with {code:?}: {reason}")]
    Rejected { code: ReturnCode, reason: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: SocketAddr,
    /// Read deadline for the CONNECT packet.
    pub handshake_timeout: Option<Duration>,
    /// Read deadline once connected. Silence beyond it closes the session.
    pub idle_timeout: Option<Duration>,
    /// Bound on writes made without a caller deadline. A session whose
    /// writes stall beyond it is closed.
    pub write_timeout: Duration,
    pub max_sessions: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 7070)),
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            idle_timeout: None,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_sessions: None,
        }
    }
}

/// Server-side record of one connected client.
#[derive(Debug)]
pub struct Session {
    client_id: String,
    connection: Arc<Connection>,
}

impl RegistryEntry for Session {
    fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl Session {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The session's connection, for SEND and PING in the server's direction.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Writes an EXECUTE packet to this session.
    pub fn send_execute(&self, payload: ExecutePayload) -> Result<(), ConnectionError> {
        self.connection.send_execute(payload)
    }

    /// Writes an EXECUTE packet and waits for the device's response.
    pub fn execute(
        &self,
        payload: ExecutePayload,
        deadline: Instant,
    ) -> Result<ExecuteResponsePayload, ConnectionError> {
        self.connection.execute(payload, deadline)
    }
}

pub type Registry = SessionRegistry<Session>;

struct Shared {
    registry: Arc<Registry>,
    handshake_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    write_timeout: Duration,
    send_handler: Option<Arc<dyn SendHandler>>,
}

pub struct Server {
    listener: TcpListener,
    shared: Shared,
}

impl Server {
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.address)?;
        let registry = match config.max_sessions {
            Some(max) => Registry::with_capacity(max),
            None => Registry::new(),
        };
        Ok(Self {
            listener,
            shared: Shared {
                registry: Arc::new(registry),
                handshake_timeout: config.handshake_timeout,
                idle_timeout: config.idle_timeout,
                write_timeout: config.write_timeout,
                send_handler: None,
            },
        })
    }

    /// Sets the callback for SEND packets from clients.
    pub fn with_send_handler<H: SendHandler + 'static>(mut self, handler: H) -> Self {
        self.shared.send_handler = Some(Arc::new(handler));
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle for reaching sessions from other threads.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            registry: Arc::clone(&self.shared.registry),
        }
    }

    /// Accepts connections until the listener fails, serving each on its
    /// own thread.
    pub fn listen(self) -> Result<(), ServerError> {
        info!("listening at {}", self.local_addr()?);
        let shared = Arc::new(self.shared);

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let shared = Arc::clone(&shared);
                    let name = match stream.peer_addr() {
                        Ok(peer) => format!("conn-{peer}"),
                        Err(_) => "conn".to_string(),
                    };
                    // The stream is dropped with the closure if no thread starts.
                    if let Err(e) = thread::Builder::new()
                        .name(name)
                        .spawn(move || handle_connection(stream, &shared))
                    {
                        error!("failed to spawn connection thread: {e}");
                    }
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
        Ok(())
    }
}

fn handle_connection(stream: TcpStream, shared: &Shared) {
    if let Err(e) = stream.set_read_timeout(shared.handshake_timeout) {
        warn!("failed to set handshake timeout: {e}");
        return;
    }
    let (mut connection, mut reader) = match Connection::new(stream) {
        Ok(parts) => parts,
        Err(e) => {
            warn!("failed to set up connection: {e}");
            return;
        }
    };
    connection.set_write_timeout(shared.write_timeout);
    let peer = connection.peer_addr();
    debug!("accepted connection from {peer}");

    let session = match handshake(connection, &mut reader, &shared.registry) {
        Ok(session) => session,
        Err(e) => {
            warn!("handshake with {peer} failed: {e}");
            return;
        }
    };
    info!("[{}] session started from {peer}", session.client_id);

    if let Err(e) = session.connection.stream().set_read_timeout(shared.idle_timeout) {
        warn!("[{}] failed to set idle timeout: {e}", session.client_id);
    }
    let handler = SessionHandler {
        send_handler: shared.send_handler.as_deref(),
    };
    // read_loop logs its own outcome and closes the connection.
    let _ = read_loop(&session.connection, reader, &handler);

    shared.registry.delete(&session.client_id);
    info!("[{}] session closed", session.client_id);
}

/// Runs `AwaitingConnect`: reads CONNECT, registers the session and answers
/// with CONNACK. Every error path drops the connection, closing it.
fn handshake(
    mut connection: Connection,
    reader: &mut PacketReader<TcpStream>,
    registry: &Registry,
) -> Result<Arc<Session>, HandshakeError> {
    let (opcode, length) = reader.read_opcode()?;
    if opcode != OpCode::Connect {
        return Err(HandshakeError::UnexpectedOpCode(opcode));
    }

    let client_id = match reader.read_payload(opcode, length) {
        Ok(Packet::Connect(connect)) if !connect.client_id.is_empty() => connect.client_id,
        Ok(_) => return Err(reject(&connection, ReturnCode::MalformedPayload, "empty client id")),
        Err(e) if e.is_fatal() => return Err(e.into()),
        Err(e) => return Err(reject(&connection, ReturnCode::MalformedPayload, e)),
    };

    connection.set_name(&client_id);
    let session = Arc::new(Session {
        client_id,
        connection: Arc::new(connection),
    });

    if let Err(e) = registry.add(Arc::clone(&session)) {
        let code = match e {
            RegistryError::AlreadyExists(_) => ReturnCode::Unauthorized,
            RegistryError::CapacityExceeded(_) => ReturnCode::ServerUnavailable,
        };
        return Err(reject(&session.connection, code, e));
    }

    let accepted = Packet::ConnAck(ConnAckPayload {
        return_code: ReturnCode::ConnectionAccepted,
    });
    if let Err(e) = session.connection.write_packet(&accepted) {
        registry.delete(&session.client_id);
        return Err(e.into());
    }
    Ok(session)
}

// Best effort: the connection is closed whether or not the CONNACK lands.
fn reject(connection: &Connection, code: ReturnCode, reason: impl ToString) -> HandshakeError {
    let connack = Packet::ConnAck(ConnAckPayload { return_code: code });
    if let Err(e) = connection.write_packet(&connack) {
        debug!("[{}] failed to send {code:?}: {e}", connection.name());
    }
    HandshakeError::Rejected {
        code,
        reason: reason.to_string(),
    }
}

struct SessionHandler<'a> {
    send_handler: Option<&'a dyn SendHandler>,
}

impl PacketHandler for SessionHandler<'_> {
    fn handle(&self, connection: &Connection, packet: Packet) -> Result<(), ConnectionError> {
        match packet {
            Packet::Ping(ping) => connection.on_ping(ping),
            Packet::Pong(pong) => {
                connection.on_pong(pong);
                Ok(())
            }
            Packet::Send(send) => connection.on_send(self.send_handler, send),
            Packet::SendResponse(response) => {
                connection.on_send_response(response);
                Ok(())
            }
            Packet::ExecuteResponse(response) => {
                debug!(
                    "[{}] EXECUTE_RESPONSE {} {:?}",
                    connection.name(),
                    response.id,
                    response.status
                );
                connection.on_execute_response(response);
                Ok(())
            }
            Packet::Connect(_) | Packet::ConnAck(_) | Packet::Execute(_) => {
                Err(ConnectionError::UnexpectedPacket(packet.opcode()))
            }
        }
    }
}

/// Cloneable access to the server's sessions, for the layers that route
/// device commands.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    registry: Arc<Registry>,
}

impl ServerHandle {
    pub fn session(&self, client_id: &str) -> Option<Arc<Session>> {
        self.registry.get(client_id)
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.registry.client_ids()
    }

    pub fn send_execute(&self, client_id: &str, payload: ExecutePayload) -> Result<(), ServerError> {
        Ok(self.require(client_id)?.send_execute(payload)?)
    }

    pub fn execute(
        &self,
        client_id: &str,
        payload: ExecutePayload,
        deadline: Instant,
    ) -> Result<ExecuteResponsePayload, ServerError> {
        Ok(self.require(client_id)?.execute(payload, deadline)?)
    }

    pub fn ping(&self, client_id: &str, deadline: Instant) -> Result<u16, ServerError> {
        Ok(self.require(client_id)?.connection().ping(deadline)?)
    }

    /// Closes the client's connection. Its session is removed once the read
    /// loop notices. Returns false if the client was not connected.
    pub fn disconnect(&self, client_id: &str) -> bool {
        match self.registry.get(client_id) {
            Some(session) => {
                session.connection().close();
                true
            }
            None => false,
        }
    }

    fn require(&self, client_id: &str) -> Result<Arc<Session>, ServerError> {
        self.registry
            .get(client_id)
            .ok_or_else(|| ServerError::NotConnected(client_id.to_string()))
    }
}
