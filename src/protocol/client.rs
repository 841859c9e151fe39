use std::{
    fmt, io,
    net::{SocketAddr, TcpStream},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
        mpsc::{RecvTimeoutError, SyncSender, sync_channel},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use thiserror::Error;

use super::{
    connection::{
        Connection, ConnectionError, DEFAULT_WRITE_TIMEOUT, PacketHandler, SendHandler, read_loop,
    },
    packet::{OpCode, Packet},
    payload::*,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect: {0}")]
    Io(#[from] io::Error),
    #[error("server refused connection: {0:?}")]
    Refused(ReturnCode),
    #[error("timed out waiting for CONNACK")]
    HandshakeTimeout,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Device-side handler turning an EXECUTE into its response.
pub trait ExecuteHandler: Send + Sync {
    fn execute(&self, payload: ExecutePayload) -> ExecuteResponsePayload;
}

impl<F> ExecuteHandler for F
where
    F: Fn(ExecutePayload) -> ExecuteResponsePayload + Send + Sync,
{
    fn execute(&self, payload: ExecutePayload) -> ExecuteResponsePayload {
        self(payload)
    }
}

#[derive(Clone)]
pub struct ClientConfig {
    pub address: SocketAddr,
    pub client_id: String,
    /// Interval between keepalive PINGs. A PING left unanswered for a whole
    /// interval closes the connection.
    pub keepalive: Option<Duration>,
    /// Bound on writes made without a caller deadline.
    pub write_timeout: Duration,
    execute_handler: Option<Arc<dyn ExecuteHandler>>,
    send_handler: Option<Arc<dyn SendHandler>>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("address", &self.address)
            .field("client_id", &self.client_id)
            .field("keepalive", &self.keepalive)
            .field("write_timeout", &self.write_timeout)
            .field("execute_handler", &self.execute_handler.is_some())
            .field("send_handler", &self.send_handler.is_some())
            .finish()
    }
}

impl ClientConfig {
    pub fn new(address: SocketAddr, client_id: impl Into<String>) -> Self {
        Self {
            address,
            client_id: client_id.into(),
            keepalive: None,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            execute_handler: None,
            send_handler: None,
        }
    }

    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = Some(interval);
        self
    }

    pub fn with_execute_handler<H: ExecuteHandler + 'static>(mut self, handler: H) -> Self {
        self.execute_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_send_handler<H: SendHandler + 'static>(mut self, handler: H) -> Self {
        self.send_handler = Some(Arc::new(handler));
        self
    }
}

/// One session to the server.
///
/// Requests block the calling thread until their response, the deadline, or
/// the connection's end, whichever comes first. A dedicated thread reads the
/// socket and routes responses to their callers by ID. Nothing is retried:
/// after any write failure the connection is closed and the caller decides
/// whether to dial again.
#[derive(Debug)]
pub struct Client {
    client_id: String,
    connection: Arc<Connection>,
    reader: Option<JoinHandle<()>>,
}

impl Client {
    /// Dials the server and completes the CONNECT/CONNACK handshake before
    /// `deadline`.
    pub fn connect(config: ClientConfig, deadline: Instant) -> Result<Self, ClientError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ClientError::HandshakeTimeout);
        }
        let stream = TcpStream::connect_timeout(&config.address, remaining)?;
        stream.set_nodelay(true)?;

        let (mut connection, reader) = Connection::new(stream)?;
        connection.set_name(&config.client_id);
        connection.set_write_timeout(config.write_timeout);
        let connection = Arc::new(connection);

        let (connack_tx, connack_rx) = sync_channel(1);
        let handler = ClientHandler {
            connack: Mutex::new(Some(connack_tx)),
            acknowledged: AtomicBool::new(false),
            execute_handler: config.execute_handler,
            send_handler: config.send_handler,
        };

        // The read loop must be running before CONNECT goes out so the
        // CONNACK is never missed.
        let reader = {
            let connection = Arc::clone(&connection);
            thread::Builder::new()
                .name(format!("lighthouse-{}", config.client_id))
                .spawn(move || {
                    let _ = read_loop(&connection, reader, &handler);
                })?
        };
        let mut client = Self {
            client_id: config.client_id,
            connection,
            reader: Some(reader),
        };

        // From here on, an early return drops `client`, closing the connection.
        let connect = Packet::Connect(ConnectPayload {
            client_id: client.client_id.clone(),
        });
        match client.connection.write_packet_until(&connect, deadline) {
            Err(ConnectionError::Timeout) => return Err(ClientError::HandshakeTimeout),
            result => result?,
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let ack = match connack_rx.recv_timeout(remaining) {
            Ok(ack) => ack,
            Err(RecvTimeoutError::Timeout) => return Err(ClientError::HandshakeTimeout),
            Err(RecvTimeoutError::Disconnected) => return Err(ConnectionError::Closed.into()),
        };
        if ack.return_code != ReturnCode::ConnectionAccepted {
            return Err(ClientError::Refused(ack.return_code));
        }
        info!("[{}] connected to {}", client.client_id, config.address);

        if let Some(interval) = config.keepalive {
            client.spawn_keepalive(interval)?;
        }
        Ok(client)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_connected(&self) -> bool {
        !self.connection.is_closed()
    }

    /// Fire-and-forget SEND. Only write errors are reported.
    pub fn send(&self, data: Vec<u8>) -> Result<(), ConnectionError> {
        self.connection.send(data)
    }

    /// SEND, then wait for the SENDRESP carrying the same ID. A response
    /// arriving after `deadline` is dropped.
    pub fn send_with_response(
        &self,
        data: Vec<u8>,
        deadline: Instant,
    ) -> Result<SendResponsePayload, ConnectionError> {
        self.connection.send_with_response(data, deadline)
    }

    /// PING and wait for the matching PONG. Returns the PING's ID.
    pub fn ping(&self, deadline: Instant) -> Result<u16, ConnectionError> {
        self.connection.ping(deadline)
    }

    pub fn ping_with_id(&self, id: u16, deadline: Instant) -> Result<u16, ConnectionError> {
        self.connection.ping_with_id(id, deadline)
    }

    pub fn close(&self) {
        self.connection.close();
    }

    /// Blocks until the connection ends, e.g. the server goes away.
    pub fn wait(mut self) {
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("[{}] read loop panicked", self.client_id);
            }
        }
    }

    fn spawn_keepalive(&self, interval: Duration) -> io::Result<()> {
        let connection = Arc::downgrade(&self.connection);
        thread::Builder::new()
            .name(format!("lighthouse-{}-keepalive", self.client_id))
            .spawn(move || {
                loop {
                    thread::sleep(interval);
                    let Some(connection) = connection.upgrade() else {
                        break;
                    };
                    if connection.is_closed() {
                        break;
                    }
                    if let Err(e) = connection.ping(Instant::now() + interval) {
                        warn!("[{}] keepalive failed: {e}", connection.name());
                        connection.close();
                        break;
                    }
                }
            })?;
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.connection.close();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

struct ClientHandler {
    connack: Mutex<Option<SyncSender<ConnAckPayload>>>,
    acknowledged: AtomicBool,
    execute_handler: Option<Arc<dyn ExecuteHandler>>,
    send_handler: Option<Arc<dyn SendHandler>>,
}

impl ClientHandler {
    fn on_connack(&self, ack: ConnAckPayload) -> Result<(), ConnectionError> {
        let sender = self
            .connack
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(sender) = sender else {
            return Err(ConnectionError::UnexpectedPacket(OpCode::ConnAck));
        };
        if ack.return_code == ReturnCode::ConnectionAccepted {
            self.acknowledged.store(true, Ordering::Release);
        }
        // Connect may have given up already.
        let _ = sender.try_send(ack);
        Ok(())
    }

    fn on_execute(
        &self,
        connection: &Connection,
        execute: ExecutePayload,
    ) -> Result<(), ConnectionError> {
        let id = execute.id;
        debug!(
            "[{}] EXECUTE {id} command {}",
            connection.name(),
            execute.command
        );
        let mut response = match &self.execute_handler {
            Some(handler) => handler.execute(execute),
            None => {
                warn!("[{}] no EXECUTE handler, failing {id}", connection.name());
                failed(id)
            }
        };
        response.id = id;

        match connection.write_packet(&Packet::ExecuteResponse(response)) {
            Err(ConnectionError::Transport(e)) if !e.is_fatal() => {
                warn!("[{}] cannot encode EXECUTE_RESPONSE {id}: {e}", connection.name());
                connection.write_packet(&Packet::ExecuteResponse(failed(id)))
            }
            result => result,
        }
    }
}

fn failed(id: u16) -> ExecuteResponsePayload {
    ExecuteResponsePayload {
        id,
        status: ExecuteStatus::Error,
        state: JsonObject::new(),
    }
}

impl PacketHandler for ClientHandler {
    fn handle(&self, connection: &Connection, packet: Packet) -> Result<(), ConnectionError> {
        let is_connack = matches!(packet, Packet::ConnAck(_));
        if !is_connack && !self.acknowledged.load(Ordering::Acquire) {
            return Err(ConnectionError::UnexpectedPacket(packet.opcode()));
        }

        match packet {
            Packet::ConnAck(ack) => self.on_connack(ack),
            Packet::Ping(ping) => connection.on_ping(ping),
            Packet::Pong(pong) => {
                connection.on_pong(pong);
                Ok(())
            }
            Packet::Send(send) => connection.on_send(self.send_handler.as_deref(), send),
            Packet::SendResponse(response) => {
                connection.on_send_response(response);
                Ok(())
            }
            Packet::Execute(execute) => self.on_execute(connection, execute),
            Packet::Connect(_) | Packet::ExecuteResponse(_) => {
                Err(ConnectionError::UnexpectedPacket(packet.opcode()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, sync::mpsc};

    use serde_json::json;

    use super::*;
    use crate::protocol::{
        server::{
            Server, ServerConfig,
            tests::{local, start, start_with, wait_until},
        },
        transport::{PacketReader, PacketWriter},
    };

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    fn object(value: serde_json::Value) -> JsonObject {
        value.as_object().cloned().unwrap()
    }

    /// Serves one connection with a hand-written script instead of the real
    /// server.
    fn scripted<F>(script: F) -> SocketAddr
    where
        F: FnOnce(PacketReader<TcpStream>, PacketWriter<TcpStream>) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let reader = PacketReader::new(stream.try_clone().unwrap());
            let writer = PacketWriter::new(stream);
            script(reader, writer);
        });
        addr
    }

    fn accept(reader: &mut PacketReader<TcpStream>, writer: &mut PacketWriter<TcpStream>) {
        assert!(matches!(reader.read_packet().unwrap(), Packet::Connect(_)));
        writer
            .write_packet(&Packet::ConnAck(ConnAckPayload {
                return_code: ReturnCode::ConnectionAccepted,
            }))
            .unwrap();
    }

    #[test]
    fn execute_round_trip() {
        let (addr, handle) = start(local());
        let config = ClientConfig::new(addr, "dev-1").with_execute_handler(
            |execute: ExecutePayload| {
                let mut state = execute.params;
                state.insert("online".into(), true.into());
                ExecuteResponsePayload {
                    id: execute.id,
                    status: ExecuteStatus::Success,
                    state,
                }
            },
        );
        let _client = Client::connect(config, soon()).unwrap();
        assert!(wait_until(|| handle.session("dev-1").is_some()));

        let response = handle
            .execute(
                "dev-1",
                ExecutePayload {
                    id: 7,
                    command: 1,
                    params: object(json!({"on": true})),
                },
                soon(),
            )
            .unwrap();
        assert_eq!(
            response,
            ExecuteResponsePayload {
                id: 7,
                status: ExecuteStatus::Success,
                state: object(json!({"on": true, "online": true})),
            }
        );
    }

    #[test]
    fn execute_response_keeps_request_id() {
        let (addr, handle) = start(local());
        let config = ClientConfig::new(addr, "dev-1")
            .with_execute_handler(|_: ExecutePayload| failed(999));
        let _client = Client::connect(config, soon()).unwrap();
        assert!(wait_until(|| handle.session("dev-1").is_some()));

        let execute = ExecutePayload {
            id: 12,
            command: 4,
            params: JsonObject::new(),
        };
        let response = handle.execute("dev-1", execute, soon()).unwrap();
        assert_eq!(response.id, 12);
        assert_eq!(response.status, ExecuteStatus::Error);
    }

    #[test]
    fn ping_reusing_id() {
        let (addr, _handle) = start(local());
        let client = Client::connect(ClientConfig::new(addr, "dev-1"), soon()).unwrap();
        assert_eq!(client.ping_with_id(42, soon()).unwrap(), 42);
        assert_eq!(client.ping_with_id(42, soon()).unwrap(), 42);
        client.ping(soon()).unwrap();
        assert_eq!(client.connection.in_flight(), 0);
    }

    #[test]
    fn server_pings_client() {
        let (addr, handle) = start(local());
        let _client = Client::connect(ClientConfig::new(addr, "dev-1"), soon()).unwrap();
        assert!(wait_until(|| handle.session("dev-1").is_some()));
        handle.ping("dev-1", soon()).unwrap();
    }

    #[test]
    fn send_with_response_from_server() {
        let server = Server::bind(local())
            .unwrap()
            .with_send_handler(|_: &str, send: SendPayload| Some(send.data));
        let (addr, _handle) = start_with(server);
        let client = Client::connect(ClientConfig::new(addr, "dev-1"), soon()).unwrap();

        let response = client.send_with_response(b"echo".to_vec(), soon()).unwrap();
        assert_eq!(response.data, b"echo");
    }

    #[test]
    fn send_is_delivered_to_server() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let server = Server::bind(local())
            .unwrap()
            .with_send_handler(move |client: &str, send: SendPayload| {
                let _ = tx.lock().unwrap().send((client.to_string(), send.data));
                None
            });
        let (addr, _handle) = start_with(server);
        let client = Client::connect(ClientConfig::new(addr, "dev-1"), soon()).unwrap();

        client.send(b"state".to_vec()).unwrap();
        let (from, data) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(from, "dev-1");
        assert_eq!(data, b"state");
    }

    #[test]
    fn server_sends_to_client() {
        let (addr, handle) = start(local());
        let config = ClientConfig::new(addr, "dev-1")
            .with_send_handler(|_: &str, send: SendPayload| Some(send.data.repeat(2)));
        let _client = Client::connect(config, soon()).unwrap();
        assert!(wait_until(|| handle.session("dev-1").is_some()));

        let session = handle.session("dev-1").unwrap();
        let response = session
            .connection()
            .send_with_response(b"ab".to_vec(), soon())
            .unwrap();
        assert_eq!(response.data, b"abab");
    }

    #[test]
    fn unrelated_response_does_not_complete_request() {
        let addr = scripted(|mut reader, mut writer| {
            accept(&mut reader, &mut writer);
            let Packet::Send(send) = reader.read_packet().unwrap() else {
                panic!("expected SEND");
            };
            for (id, data) in [(send.id.wrapping_add(1), "wrong"), (send.id, "right")] {
                writer
                    .write_packet(&Packet::SendResponse(SendResponsePayload {
                        id,
                        data: data.into(),
                    }))
                    .unwrap();
            }
            // Hold the connection open until the client leaves.
            let _ = reader.read_packet();
        });
        let client = Client::connect(ClientConfig::new(addr, "dev-1"), soon()).unwrap();
        let response = client.send_with_response(b"q".to_vec(), soon()).unwrap();
        assert_eq!(response.data, b"right");
    }

    #[test]
    fn only_unrelated_response_times_out() {
        let addr = scripted(|mut reader, mut writer| {
            accept(&mut reader, &mut writer);
            let Packet::Send(send) = reader.read_packet().unwrap() else {
                panic!("expected SEND");
            };
            writer
                .write_packet(&Packet::SendResponse(SendResponsePayload {
                    id: send.id.wrapping_add(1),
                    data: vec![],
                }))
                .unwrap();
            let _ = reader.read_packet();
        });
        let client = Client::connect(ClientConfig::new(addr, "dev-1"), soon()).unwrap();
        let err = client
            .send_with_response(vec![], Instant::now() + Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout));
        assert_eq!(client.connection.in_flight(), 0);
        assert!(client.is_connected());
    }

    #[test]
    fn expired_deadline_returns_immediately() {
        let (addr, _handle) = start(local());
        let client = Client::connect(ClientConfig::new(addr, "dev-1"), soon()).unwrap();

        let expired = Instant::now();
        let started = Instant::now();
        assert!(matches!(
            client.send_with_response(b"x".to_vec(), expired),
            Err(ConnectionError::Timeout)
        ));
        assert!(matches!(client.ping(expired), Err(ConnectionError::Timeout)));
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(client.connection.in_flight(), 0);
    }

    #[test]
    fn server_close_releases_waiters() {
        let addr = scripted(|mut reader, mut writer| {
            accept(&mut reader, &mut writer);
            let _ = reader.read_packet();
            // Dropping both halves closes the socket.
        });
        let client = Client::connect(ClientConfig::new(addr, "dev-1"), soon()).unwrap();

        let started = Instant::now();
        let err = client
            .send_with_response(vec![], Instant::now() + Duration::from_secs(10))
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Closed));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(wait_until(|| !client.is_connected()));
        assert!(matches!(client.send(vec![]), Err(ConnectionError::Closed)));
    }

    #[test]
    fn duplicate_client_is_refused() {
        let (addr, handle) = start(local());
        let first = Client::connect(ClientConfig::new(addr, "dev-1"), soon()).unwrap();

        let err = Client::connect(ClientConfig::new(addr, "dev-1"), soon()).unwrap_err();
        assert!(matches!(err, ClientError::Refused(ReturnCode::Unauthorized)));

        first.ping(soon()).unwrap();
        assert!(handle.session("dev-1").is_some());
        Client::connect(ClientConfig::new(addr, "dev-2"), soon()).unwrap();
    }

    #[test]
    fn silent_server_times_out_handshake() {
        let addr = scripted(|mut reader, _writer| {
            let _ = reader.read_packet();
            let _ = reader.read_packet();
        });
        let started = Instant::now();
        let err = Client::connect(
            ClientConfig::new(addr, "dev-1"),
            Instant::now() + Duration::from_millis(200),
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::HandshakeTimeout));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn packet_before_connack_is_fatal() {
        let addr = scripted(|mut reader, mut writer| {
            let _ = reader.read_packet();
            writer
                .write_packet(&Packet::Ping(PingPayload { id: 1 }))
                .unwrap();
            let _ = reader.read_packet();
        });
        let err = Client::connect(ClientConfig::new(addr, "dev-1"), soon()).unwrap_err();
        assert!(matches!(err, ClientError::Connection(ConnectionError::Closed)));
    }

    #[test]
    fn keepalive_holds_idle_session() {
        let (addr, handle) = start(ServerConfig {
            idle_timeout: Some(Duration::from_millis(300)),
            ..local()
        });
        let config = ClientConfig::new(addr, "dev-1").with_keepalive(Duration::from_millis(50));
        let client = Client::connect(config, soon()).unwrap();

        thread::sleep(Duration::from_millis(800));
        assert!(client.is_connected());
        assert!(handle.session("dev-1").is_some());
    }

    #[test]
    fn closing_client_removes_session() {
        let (addr, handle) = start(local());
        let client = Client::connect(ClientConfig::new(addr, "dev-1"), soon()).unwrap();
        assert!(wait_until(|| handle.session("dev-1").is_some()));
        drop(client);
        assert!(wait_until(|| handle.session("dev-1").is_none()));
    }

    #[test]
    fn stalled_server_does_not_hold_requests_past_deadline() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let addr = scripted(move |mut reader, mut writer| {
            accept(&mut reader, &mut writer);
            // Stop reading; the socket buffers fill up behind us.
            let _ = release_rx.recv();
        });
        let mut config = ClientConfig::new(addr, "dev-1");
        config.write_timeout = Duration::from_millis(500);
        let client = Arc::new(Client::connect(config, soon()).unwrap());

        let filler = {
            let client = Arc::clone(&client);
            thread::spawn(move || while client.send(vec![0; 60_000]).is_ok() {})
        };
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        let err = client
            .ping(Instant::now() + Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout | ConnectionError::Closed));
        assert!(started.elapsed() < Duration::from_secs(2));

        // The stalled fire-and-forget write gives up and closes the connection.
        filler.join().unwrap();
        assert!(wait_until(|| !client.is_connected()));
        let _ = release_tx.send(());
    }
}
