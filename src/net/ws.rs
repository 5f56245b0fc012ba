use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine as _;
use sha1::{Digest, Sha1};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const OPCODE_TEXT: u8 = 0x1;
pub const OPCODE_BINARY: u8 = 0x2;
pub const OPCODE_CLOSE: u8 = 0x8;
pub const OPCODE_PING: u8 = 0x9;
pub const OPCODE_PONG: u8 = 0xa;

#[derive(Debug, Clone)]
pub struct WsHandshakeConfig {
    pub allowed_origins: Option<Vec<String>>,
    pub max_request_bytes: usize,
}

impl Default for WsHandshakeConfig {
    fn default() -> Self {
        Self {
            allowed_origins: None,
            max_request_bytes: 8192,
        }
    }
}

#[derive(Debug)]
pub struct WsFrame {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub enum WsFrameError {
    Timeout,
    Closed,
    Io(std::io::Error),
    Protocol(String),
}

/// Performs the server half of the upgrade handshake, enforcing the
/// origin allow-list when one is configured.
pub fn accept_handshake<S: Read + Write>(
    stream: &mut S,
    config: &WsHandshakeConfig,
) -> Result<(), String> {
    let request = read_http_request(stream, config.max_request_bytes)?;
    let headers = parse_headers(&request)?;
    let origin = headers.get("origin").cloned();

    if !matches!(
        headers.get("upgrade").map(|value| value.to_ascii_lowercase()),
        Some(value) if value == "websocket"
    ) {
        reject_handshake(stream, 400, "Missing Upgrade: websocket")?;
        return Err("websocket upgrade missing".to_string());
    }
    let connection = headers
        .get("connection")
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    if !connection.contains("upgrade") {
        reject_handshake(stream, 400, "Missing Connection: Upgrade")?;
        return Err("websocket connection upgrade missing".to_string());
    }
    let version = headers
        .get("sec-websocket-version")
        .map(|value| value.trim())
        .unwrap_or("");
    if version != "13" {
        reject_handshake(stream, 400, "Unsupported WebSocket version")?;
        return Err(format!("unsupported websocket version '{version}'"));
    }
    let key = headers
        .get("sec-websocket-key")
        .ok_or_else(|| "missing sec-websocket-key".to_string())?;

    if let Some(allowed) = config.allowed_origins.as_ref() {
        let origin_value = origin
            .as_ref()
            .map(|value| value.trim().to_string())
            .unwrap_or_default();
        let allow_all = allowed.iter().any(|value| value == "*");
        if !allow_all && !allowed.iter().any(|value| value == &origin_value) {
            reject_handshake(stream, 403, "Origin not allowed")?;
            return Err("websocket origin rejected".to_string());
        }
    }

    let mut sha1 = Sha1::new();
    sha1.update(key.trim().as_bytes());
    sha1.update(WS_GUID.as_bytes());
    let accept = BASE64_ENGINE.encode(sha1.finalize());

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Accept: {accept}\r\n\
\r\n"
    );
    stream
        .write_all(response.as_bytes())
        .map_err(|err| format!("websocket handshake write failed: {err}"))?;
    Ok(())
}

pub fn read_frame<S: Read>(stream: &mut S, max_payload: usize) -> Result<WsFrame, WsFrameError> {
    let mut header = [0u8; 2];
    if let Err(err) = stream.read_exact(&mut header) {
        return Err(map_ws_read_error(err));
    }

    let fin = (header[0] & 0x80) != 0;
    let opcode = header[0] & 0x0f;
    if !fin {
        return Err(WsFrameError::Protocol(
            "fragmented frames not supported".to_string(),
        ));
    }
    let masked = (header[1] & 0x80) != 0;
    let mut len = (header[1] & 0x7f) as u64;
    if len == 126 {
        let mut ext = [0u8; 2];
        if let Err(err) = stream.read_exact(&mut ext) {
            return Err(map_ws_read_error(err));
        }
        len = u16::from_be_bytes(ext) as u64;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        if let Err(err) = stream.read_exact(&mut ext) {
            return Err(map_ws_read_error(err));
        }
        len = u64::from_be_bytes(ext);
    }

    if opcode >= OPCODE_CLOSE && len > 125 {
        return Err(WsFrameError::Protocol(
            "control frame payload too large".to_string(),
        ));
    }
    if len as usize > max_payload {
        return Err(WsFrameError::Protocol(format!(
            "websocket payload {} exceeds max {}",
            len, max_payload
        )));
    }

    let mut mask = [0u8; 4];
    if masked {
        if let Err(err) = stream.read_exact(&mut mask) {
            return Err(map_ws_read_error(err));
        }
    }

    let mut payload = vec![0u8; len as usize];
    if !payload.is_empty() {
        if let Err(err) = stream.read_exact(&mut payload) {
            return Err(map_ws_read_error(err));
        }
        if masked {
            for (idx, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[idx % 4];
            }
        }
    }

    Ok(WsFrame { opcode, payload })
}

pub fn write_frame<S: Write>(stream: &mut S, opcode: u8, payload: &[u8]) -> Result<(), String> {
    let len = payload.len();
    let mut header = Vec::with_capacity(10);
    header.push(0x80 | (opcode & 0x0f));
    if len < 126 {
        header.push(len as u8);
    } else if len <= u16::MAX as usize {
        header.push(126);
        header.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        header.push(127);
        header.extend_from_slice(&(len as u64).to_be_bytes());
    }
    stream
        .write_all(&header)
        .map_err(|err| format!("websocket header write failed: {err}"))?;
    if !payload.is_empty() {
        stream
            .write_all(payload)
            .map_err(|err| format!("websocket payload write failed: {err}"))?;
    }
    Ok(())
}

/// Caps inbound frames per window; web clients gone haywire get cut
/// off instead of starving the hub lock.
#[derive(Debug)]
pub struct WsRateLimiter {
    window_start: Instant,
    window: Duration,
    max_frames: usize,
    frames: usize,
}

impl WsRateLimiter {
    pub fn new(max_frames: usize, window: Duration) -> Self {
        Self {
            window_start: Instant::now(),
            window,
            max_frames,
            frames: 0,
        }
    }

    pub fn check(&mut self) -> Result<(), String> {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.frames = 0;
        }
        if self.frames >= self.max_frames {
            return Err(format!(
                "websocket rate limit exceeded ({} frames per {:?})",
                self.max_frames, self.window
            ));
        }
        self.frames += 1;
        Ok(())
    }
}

fn read_http_request<S: Read>(stream: &mut S, max_bytes: usize) -> Result<String, String> {
    let mut data = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let read = stream
            .read(&mut buf)
            .map_err(|err| format!("handshake read failed: {err}"))?;
        if read == 0 {
            return Err("handshake closed".to_string());
        }
        data.extend_from_slice(&buf[..read]);
        if data.len() > max_bytes {
            return Err("handshake exceeded max bytes".to_string());
        }
        if data.windows(4).any(|chunk| chunk == b"\r\n\r\n") {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&data).to_string())
}

fn parse_headers(request: &str) -> Result<HashMap<String, String>, String> {
    let mut lines = request.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| "empty handshake request".to_string())?;
    let method = request_line.split_whitespace().next().unwrap_or("");
    if method.to_ascii_uppercase() != "GET" {
        return Err(format!("unexpected method '{method}'"));
    }
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok(headers)
}

fn reject_handshake<S: Write>(stream: &mut S, code: u16, message: &str) -> Result<(), String> {
    let response = format!("HTTP/1.1 {code} {message}\r\n\r\n");
    stream
        .write_all(response.as_bytes())
        .map_err(|err| format!("handshake reject write failed: {err}"))?;
    Ok(())
}

fn map_ws_read_error(err: std::io::Error) -> WsFrameError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => WsFrameError::Timeout,
        std::io::ErrorKind::UnexpectedEof => WsFrameError::Closed,
        _ => WsFrameError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reads from a scripted input, collects writes separately.
    struct ScriptedStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl ScriptedStream {
        fn new(input: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(input),
                output: Vec::new(),
            }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn upgrade_request(origin: Option<&str>) -> Vec<u8> {
        let mut request = String::from(
            "GET / HTTP/1.1\r\n\
Host: example\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Version: 13\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n",
        );
        if let Some(origin) = origin {
            request.push_str(&format!("Origin: {origin}\r\n"));
        }
        request.push_str("\r\n");
        request.into_bytes()
    }

    #[test]
    fn handshake_computes_rfc_accept_key() {
        let mut stream = ScriptedStream::new(upgrade_request(None));
        accept_handshake(&mut stream, &WsHandshakeConfig::default()).expect("handshake");
        let response = String::from_utf8_lossy(&stream.output);
        assert!(response.starts_with("HTTP/1.1 101"));
        // RFC 6455 sample key and its published accept value.
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[test]
    fn handshake_rejects_disallowed_origin() {
        let config = WsHandshakeConfig {
            allowed_origins: Some(vec!["https://ok.example".to_string()]),
            ..WsHandshakeConfig::default()
        };
        let mut stream = ScriptedStream::new(upgrade_request(Some("https://evil.example")));
        assert!(accept_handshake(&mut stream, &config).is_err());
        assert!(String::from_utf8_lossy(&stream.output).starts_with("HTTP/1.1 403"));

        let mut stream = ScriptedStream::new(upgrade_request(Some("https://ok.example")));
        accept_handshake(&mut stream, &config).expect("allowed origin");
    }

    #[test]
    fn masked_text_frame_roundtrips() {
        let payload = b"HI#abc#%";
        let mask = [0x11u8, 0x22, 0x33, 0x44];
        let mut wire = vec![0x80 | OPCODE_TEXT, 0x80 | payload.len() as u8];
        wire.extend_from_slice(&mask);
        for (idx, byte) in payload.iter().enumerate() {
            wire.push(byte ^ mask[idx % 4]);
        }
        let mut cursor = Cursor::new(wire);
        let frame = read_frame(&mut cursor, 1024).expect("frame");
        assert_eq!(frame.opcode, OPCODE_TEXT);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn write_then_read_unmasked_frame() {
        let mut out = Vec::new();
        write_frame(&mut out, OPCODE_TEXT, b"CT#a#b#%").expect("write");
        let mut cursor = Cursor::new(out);
        let frame = read_frame(&mut cursor, 1024).expect("read");
        assert_eq!(frame.opcode, OPCODE_TEXT);
        assert_eq!(frame.payload, b"CT#a#b#%");
    }

    #[test]
    fn extended_length_frames_roundtrip() {
        let payload = vec![0x41u8; 300];
        let mut out = Vec::new();
        write_frame(&mut out, OPCODE_BINARY, &payload).expect("write");
        let mut cursor = Cursor::new(out);
        let frame = read_frame(&mut cursor, 1024).expect("read");
        assert_eq!(frame.payload.len(), 300);
    }

    #[test]
    fn oversized_payload_is_a_protocol_error() {
        let mut out = Vec::new();
        write_frame(&mut out, OPCODE_BINARY, &[0u8; 256]).expect("write");
        let mut cursor = Cursor::new(out);
        match read_frame(&mut cursor, 100) {
            Err(WsFrameError::Protocol(_)) => {}
            other => panic!("expected protocol error, got {:?}", other.map(|f| f.opcode)),
        }
    }

    #[test]
    fn rate_limiter_trips_after_burst() {
        let mut limiter = WsRateLimiter::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            limiter.check().expect("within budget");
        }
        assert!(limiter.check().is_err());
    }
}
