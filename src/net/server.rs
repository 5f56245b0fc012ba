use crate::entities::session::SessionId;
use crate::net::client;
use crate::net::codec::{self, FrameBuffer};
use crate::net::ws;
use crate::telemetry::logging;
use crate::world::hub::HubState;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Poll interval for blocking reads; doubles as the outbox flush
/// cadence.
const READ_POLL: Duration = Duration::from_millis(100);
const TICK_INTERVAL: Duration = Duration::from_millis(50);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
const READ_CHUNK_BYTES: usize = 2048;
const WS_MAX_PAYLOAD: usize = 16384;
const WS_RATE_LIMIT_FRAMES: usize = 200;
const WS_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct ServerControl {
    shutdown: AtomicBool,
}

impl ServerControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub ws_bind_addr: Option<String>,
    pub ws_allowed_origins: Option<Vec<String>>,
    /// A session that never sends the keepalive within this window is
    /// dropped.
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:27016".to_string(),
            ws_bind_addr: None,
            ws_allowed_origins: None,
            idle_timeout: Duration::from_secs(180),
            write_timeout: Duration::from_secs(5),
        }
    }
}

enum ReadOutcome {
    Data(Vec<u8>),
    Timeout,
    Closed,
}

/// The byte-level face of one connection; TCP and WebSocket both feed
/// the same frame buffer.
trait FrameTransport {
    fn peer_ip(&self) -> Option<IpAddr>;
    fn prepare(&mut self, read_poll: Duration, write_timeout: Duration) -> Result<(), String>;
    fn read_chunk(&mut self) -> Result<ReadOutcome, String>;
    fn write_frame(&mut self, frame: &str) -> Result<(), String>;
}

struct TcpFrameTransport {
    stream: TcpStream,
}

impl TcpFrameTransport {
    fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl FrameTransport for TcpFrameTransport {
    fn peer_ip(&self) -> Option<IpAddr> {
        self.stream.peer_addr().ok().map(|addr| addr.ip())
    }

    fn prepare(&mut self, read_poll: Duration, write_timeout: Duration) -> Result<(), String> {
        self.stream
            .set_read_timeout(Some(read_poll))
            .map_err(|err| format!("read timeout set failed: {}", err))?;
        self.stream
            .set_write_timeout(Some(write_timeout))
            .map_err(|err| format!("write timeout set failed: {}", err))
    }

    fn read_chunk(&mut self) -> Result<ReadOutcome, String> {
        let mut buf = [0u8; READ_CHUNK_BYTES];
        match self.stream.read(&mut buf) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(read) => Ok(ReadOutcome::Data(buf[..read].to_vec())),
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Ok(ReadOutcome::Timeout)
            }
            Err(err) => Err(format!("read failed: {}", err)),
        }
    }

    fn write_frame(&mut self, frame: &str) -> Result<(), String> {
        self.stream
            .write_all(frame.as_bytes())
            .map_err(|err| format!("write failed: {}", err))
    }
}

struct WsFrameTransport {
    stream: TcpStream,
    rate_limiter: ws::WsRateLimiter,
}

impl WsFrameTransport {
    fn accept(mut stream: TcpStream, config: &ws::WsHandshakeConfig) -> Result<Self, String> {
        ws::accept_handshake(&mut stream, config)?;
        Ok(Self {
            stream,
            rate_limiter: ws::WsRateLimiter::new(WS_RATE_LIMIT_FRAMES, WS_RATE_LIMIT_WINDOW),
        })
    }
}

impl FrameTransport for WsFrameTransport {
    fn peer_ip(&self) -> Option<IpAddr> {
        self.stream.peer_addr().ok().map(|addr| addr.ip())
    }

    fn prepare(&mut self, read_poll: Duration, write_timeout: Duration) -> Result<(), String> {
        self.stream
            .set_read_timeout(Some(read_poll))
            .map_err(|err| format!("read timeout set failed: {}", err))?;
        self.stream
            .set_write_timeout(Some(write_timeout))
            .map_err(|err| format!("write timeout set failed: {}", err))
    }

    fn read_chunk(&mut self) -> Result<ReadOutcome, String> {
        let frame = match ws::read_frame(&mut self.stream, WS_MAX_PAYLOAD) {
            Ok(frame) => frame,
            Err(ws::WsFrameError::Timeout) => return Ok(ReadOutcome::Timeout),
            Err(ws::WsFrameError::Closed) => return Ok(ReadOutcome::Closed),
            Err(ws::WsFrameError::Io(err)) => return Err(format!("websocket read: {}", err)),
            Err(ws::WsFrameError::Protocol(reason)) => return Err(reason),
        };
        match frame.opcode {
            ws::OPCODE_TEXT | ws::OPCODE_BINARY => {
                self.rate_limiter.check()?;
                Ok(ReadOutcome::Data(frame.payload))
            }
            ws::OPCODE_PING => {
                ws::write_frame(&mut self.stream, ws::OPCODE_PONG, &frame.payload)?;
                Ok(ReadOutcome::Timeout)
            }
            ws::OPCODE_CLOSE => Ok(ReadOutcome::Closed),
            _ => Ok(ReadOutcome::Timeout),
        }
    }

    fn write_frame(&mut self, frame: &str) -> Result<(), String> {
        ws::write_frame(&mut self.stream, ws::OPCODE_TEXT, frame.as_bytes())
    }
}

/// Removes the session from the hub however the connection ends:
/// clean close, protocol violation, idle timeout or kick.
struct SessionGuard {
    hub: Arc<Mutex<HubState>>,
    id: SessionId,
}

impl SessionGuard {
    fn new(hub: Arc<Mutex<HubState>>, id: SessionId) -> Self {
        Self { hub, id }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Ok(mut hub) = self.hub.lock() {
            hub.handle_disconnect(self.id);
        }
    }
}

/// Fires deferred work (timers, jukebox chains) while the server runs.
pub fn spawn_tick_loop(
    hub: Arc<Mutex<HubState>>,
    control: Arc<ServerControl>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while control.is_running() {
            if let Ok(mut hub) = hub.lock() {
                hub.run_due_tasks(Instant::now());
            }
            thread::sleep(TICK_INTERVAL);
        }
    })
}

/// Accept loop for the plain TCP listener. Blocks until shutdown is
/// requested.
pub fn run_server(
    config: ServerConfig,
    hub: Arc<Mutex<HubState>>,
    control: Arc<ServerControl>,
) -> Result<(), String> {
    let listener = TcpListener::bind(&config.bind_addr)
        .map_err(|err| format!("bind {} failed: {}", config.bind_addr, err))?;
    listener
        .set_nonblocking(true)
        .map_err(|err| format!("listener nonblocking failed: {}", err))?;

    logging::log_server(&format!("listening on {}", config.bind_addr));
    println!("oyez: listening on {}", config.bind_addr);

    while control.is_running() {
        match listener.accept() {
            Ok((stream, addr)) => {
                println!("oyez: connection from {}", addr);
                let config = config.clone();
                let hub = Arc::clone(&hub);
                let control = Arc::clone(&control);
                thread::spawn(move || {
                    let mut transport = TcpFrameTransport::new(stream);
                    if let Err(err) = handle_session(&mut transport, &config, &hub, &control) {
                        logging::log_error(&format!("connection error: {}", err));
                        eprintln!("oyez: connection error: {}", err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_BACKOFF);
            }
            Err(err) => {
                logging::log_error(&format!("accept error: {}", err));
                eprintln!("oyez: accept error: {}", err);
            }
        }
    }
    Ok(())
}

/// Accept loop for the WebSocket listener; payloads feed the same
/// frame buffer as raw TCP bytes.
pub fn run_ws_server(
    config: ServerConfig,
    hub: Arc<Mutex<HubState>>,
    control: Arc<ServerControl>,
) -> Result<(), String> {
    let Some(bind_addr) = config.ws_bind_addr.clone() else {
        return Ok(());
    };
    let listener = TcpListener::bind(&bind_addr)
        .map_err(|err| format!("bind {} failed: {}", bind_addr, err))?;
    listener
        .set_nonblocking(true)
        .map_err(|err| format!("ws listener nonblocking failed: {}", err))?;

    logging::log_server(&format!("websocket listening on {}", bind_addr));
    println!("oyez: websocket listening on {}", bind_addr);

    let ws_config = ws::WsHandshakeConfig {
        allowed_origins: config.ws_allowed_origins.clone(),
        ..ws::WsHandshakeConfig::default()
    };

    while control.is_running() {
        match listener.accept() {
            Ok((stream, addr)) => {
                println!("oyez: websocket connection from {}", addr);
                let config = config.clone();
                let ws_config = ws_config.clone();
                let hub = Arc::clone(&hub);
                let control = Arc::clone(&control);
                thread::spawn(move || {
                    let result = WsFrameTransport::accept(stream, &ws_config).and_then(
                        |mut transport| handle_session(&mut transport, &config, &hub, &control),
                    );
                    if let Err(err) = result {
                        logging::log_error(&format!("ws connection error: {}", err));
                        eprintln!("oyez: ws connection error: {}", err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_BACKOFF);
            }
            Err(err) => {
                logging::log_error(&format!("ws accept error: {}", err));
                eprintln!("oyez: ws accept error: {}", err);
            }
        }
    }
    Ok(())
}

/// One connection's lifetime: register, pump frames in arrival order,
/// flush the outbox each poll, tear down via the guard.
fn handle_session<T: FrameTransport>(
    transport: &mut T,
    config: &ServerConfig,
    hub: &Arc<Mutex<HubState>>,
    control: &Arc<ServerControl>,
) -> Result<(), String> {
    transport.prepare(READ_POLL, config.write_timeout)?;
    let ip = transport
        .peer_ip()
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let id = {
        let mut hub = hub.lock().map_err(|_| "hub lock poisoned".to_string())?;
        hub.register_session(ip)
    };
    let _guard = SessionGuard::new(Arc::clone(hub), id);

    let mut buffer = FrameBuffer::new();
    let mut last_keepalive = Instant::now();
    loop {
        if !control.is_running() {
            return Ok(());
        }
        // Flush first so the greeting and any queued broadcasts go out
        // before the next poll.
        let (frames, close) = {
            let mut hub = hub.lock().map_err(|_| "hub lock poisoned".to_string())?;
            hub.take_outbox(id)
        };
        for frame in &frames {
            transport.write_frame(frame)?;
        }
        if close {
            return Ok(());
        }
        if last_keepalive.elapsed() >= config.idle_timeout {
            return Err("idle timeout".to_string());
        }
        match transport.read_chunk()? {
            ReadOutcome::Closed => return Ok(()),
            ReadOutcome::Timeout => {}
            ReadOutcome::Data(bytes) => {
                buffer
                    .push_bytes(&bytes)
                    .map_err(|err| format!("protocol violation: {}", err))?;
                let raw_messages = buffer.drain_messages();
                if !raw_messages.is_empty() {
                    let now = Instant::now();
                    let mut hub = hub.lock().map_err(|_| "hub lock poisoned".to_string())?;
                    for raw in raw_messages {
                        let Some(message) = codec::decode_message(&raw) else {
                            continue;
                        };
                        let outcome = client::handle_message(&mut hub, id, &message, now);
                        if outcome.keepalive {
                            last_keepalive = now;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::hub::sample_hub;
    use std::sync::mpsc;

    fn read_until(stream: &mut TcpStream, needle: &str, budget: Duration) -> String {
        let deadline = Instant::now() + budget;
        let mut collected = String::new();
        let mut buf = [0u8; 1024];
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .expect("read timeout");
        while Instant::now() < deadline {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => {
                    collected.push_str(&String::from_utf8_lossy(&buf[..read]));
                    if collected.contains(needle) {
                        return collected;
                    }
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(err) => panic!("read failed: {}", err),
            }
        }
        panic!("never saw '{}' in '{}'", needle, collected);
    }

    fn serve_one_tcp(config: ServerConfig) -> (std::net::SocketAddr, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let hub = Arc::new(Mutex::new(sample_hub()));
            let control = Arc::new(ServerControl::new());
            let mut transport = TcpFrameTransport::new(stream);
            let _ = handle_session(&mut transport, &config, &hub, &control);
        });
        (addr, handle)
    }

    #[test]
    fn tcp_session_walks_the_join_handshake() {
        let (addr, server) = serve_one_tcp(ServerConfig::default());
        let mut client = TcpStream::connect(addr).expect("connect");

        let greeting = read_until(&mut client, "#%", Duration::from_secs(2));
        assert!(greeting.starts_with("decryptor#"));

        client.write_all(b"HI#cafebabe#%").expect("send HI");
        let reply = read_until(&mut client, "PN#", Duration::from_secs(2));
        assert!(reply.contains("ID#0#oyez#"));

        client.write_all(b"RD#%").expect("send RD");
        let done = read_until(&mut client, "DONE#%", Duration::from_secs(2));
        assert!(done.contains("CharsCheck#"));

        drop(client);
        server.join().expect("server thread");
    }

    #[test]
    fn partial_writes_reassemble_into_one_message() {
        let (addr, server) = serve_one_tcp(ServerConfig::default());
        let mut client = TcpStream::connect(addr).expect("connect");
        read_until(&mut client, "#%", Duration::from_secs(2));

        client.write_all(b"HI#ca").expect("first half");
        client.flush().expect("flush");
        thread::sleep(Duration::from_millis(150));
        client.write_all(b"fe99#%").expect("second half");
        let reply = read_until(&mut client, "PN#", Duration::from_secs(2));
        assert!(reply.contains("ID#0#oyez#"));

        drop(client);
        server.join().expect("server thread");
    }

    #[test]
    fn idle_session_is_dropped_after_timeout() {
        let config = ServerConfig {
            idle_timeout: Duration::from_millis(300),
            ..ServerConfig::default()
        };
        let (addr, server) = serve_one_tcp(config);
        let mut client = TcpStream::connect(addr).expect("connect");
        read_until(&mut client, "#%", Duration::from_secs(2));

        // Stay silent; the server must hang up on its own.
        client
            .set_read_timeout(Some(Duration::from_secs(3)))
            .expect("read timeout");
        let mut buf = [0u8; 64];
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    assert!(Instant::now() < deadline, "server never closed");
                }
                Err(_) => break,
            }
        }
        server.join().expect("server thread");
    }

    #[test]
    fn ws_session_speaks_the_same_protocol() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind ws test listener");
        let addr = listener.local_addr().expect("listener addr");
        let (tx, rx) = mpsc::channel();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let hub = Arc::new(Mutex::new(sample_hub()));
            let control = Arc::new(ServerControl::new());
            let config = ServerConfig::default();
            let ws_config = ws::WsHandshakeConfig::default();
            let result = WsFrameTransport::accept(stream, &ws_config).and_then(|mut transport| {
                handle_session(&mut transport, &config, &hub, &control)
            });
            tx.send(result).expect("send result");
        });

        let mut client = TcpStream::connect(addr).expect("connect");
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("read timeout");
        client
            .write_all(
                b"GET / HTTP/1.1\r\n\
Host: test\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Version: 13\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
            )
            .expect("handshake");
        let response = read_until(&mut client, "\r\n\r\n", Duration::from_secs(2));
        assert!(response.contains("101 Switching Protocols"));

        let frame = ws::read_frame(&mut client, WS_MAX_PAYLOAD).expect("greeting frame");
        assert!(String::from_utf8_lossy(&frame.payload).starts_with("decryptor#"));

        // Send HI as a masked text frame, the way browsers do.
        let payload = b"HI#websock01#%";
        let mask = [9u8, 8, 7, 6];
        let mut wire = vec![0x80 | ws::OPCODE_TEXT, 0x80 | payload.len() as u8];
        wire.extend_from_slice(&mask);
        for (idx, byte) in payload.iter().enumerate() {
            wire.push(byte ^ mask[idx % 4]);
        }
        client.write_all(&wire).expect("send HI frame");

        let mut seen = String::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !seen.contains("PN#") && Instant::now() < deadline {
            match ws::read_frame(&mut client, WS_MAX_PAYLOAD) {
                Ok(frame) => seen.push_str(&String::from_utf8_lossy(&frame.payload)),
                Err(ws::WsFrameError::Timeout) => {}
                Err(err) => panic!("ws read failed: {:?}", err),
            }
        }
        assert!(seen.contains("ID#0#oyez#"));
        assert!(seen.contains("PN#"));

        drop(client);
        server.join().expect("server thread");
        let result = rx.recv_timeout(Duration::from_secs(2)).expect("result");
        assert!(result.is_ok());
    }
}
