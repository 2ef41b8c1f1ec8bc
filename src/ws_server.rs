use crate::artifact::Artifact;
use byteorder::{BigEndian, WriteBytesExt};
use crossbeam_channel::Receiver;
use log::{error, info, warn};
use serde::Serialize;
use sha1_smol::Sha1;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

/// Combined HTTP + WebSocket server.
///
/// - `GET /` → serves the embedded canvas viewer page
/// - WebSocket upgrade → a JSON hello, then binary RGBA frames
///
/// Single port, no separate HTTP server needed.
pub struct WsServer {
    frame_rx: Receiver<Arc<Artifact>>,
    addr: String,
}

/// First message on a new WebSocket connection, describing the stream.
#[derive(Serialize)]
struct Hello {
    #[serde(rename = "type")]
    kind: &'static str,
    format: &'static str,
}

struct WsClient {
    stream: TcpStream,
    alive: bool,
}

impl WsClient {
    fn new(stream: TcpStream) -> Self {
        let _ = stream.set_nonblocking(true);
        let _ = stream.set_nodelay(true);
        Self {
            stream,
            alive: true,
        }
    }

    fn send_ws_frame(&mut self, opcode: u8, payload: &[u8]) -> bool {
        let len = payload.len();
        let mut frame = Vec::with_capacity(10 + len);
        frame.push(0x80 | opcode); // FIN + opcode
        if len < 126 {
            frame.push(len as u8);
        } else if len < 65536 {
            frame.push(126);
            frame.push((len >> 8) as u8);
            frame.push((len & 0xFF) as u8);
        } else {
            frame.push(127);
            for i in (0..8).rev() {
                frame.push(((len >> (i * 8)) & 0xFF) as u8);
            }
        }
        frame.extend_from_slice(payload);
        match self.stream.write_all(&frame) {
            Ok(()) => true,
            Err(_) => {
                self.alive = false;
                false
            }
        }
    }

    fn send_text(&mut self, text: &str) -> bool {
        self.send_ws_frame(0x1, text.as_bytes())
    }

    fn send_binary(&mut self, payload: &[u8]) -> bool {
        self.send_ws_frame(0x2, payload)
    }
}

type ClientList = Arc<Mutex<Vec<WsClient>>>;

/// Parsed HTTP request — enough to decide WS vs HTTP.
struct HttpRequest {
    path: String,
    is_upgrade: bool,
    ws_key: Option<String>,
}

fn parse_request(stream: &mut TcpStream) -> Result<HttpRequest, String> {
    let mut reader = BufReader::new(stream.try_clone().map_err(|e| e.to_string())?);
    let mut path = String::from("/");
    let mut is_upgrade = false;
    let mut ws_key = None;
    let mut first = true;

    loop {
        let mut line = String::new();
        reader.read_line(&mut line).map_err(|e| e.to_string())?;
        let trimmed = line.trim().to_string();
        if trimmed.is_empty() {
            break;
        }
        if first {
            // Parse "GET /path HTTP/1.1"
            let parts: Vec<&str> = trimmed.split_whitespace().collect();
            if parts.len() >= 2 {
                path = parts[1].to_string();
            }
            first = false;
        }
        let lower = trimmed.to_lowercase();
        if lower.starts_with("upgrade:") && lower.contains("websocket") {
            is_upgrade = true;
        }
        if lower.starts_with("sec-websocket-key:") {
            ws_key = Some(trimmed[18..].trim().to_string());
        }
    }
    Ok(HttpRequest {
        path,
        is_upgrade,
        ws_key,
    })
}

fn ws_handshake(stream: &mut TcpStream, key: &str) -> Result<(), String> {
    let magic = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
    let mut hasher = Sha1::new();
    hasher.update(format!("{}{}", key, magic).as_bytes());
    let hash = hasher.digest().bytes();
    let accept = base64_encode(&hash);
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept
    );
    stream
        .write_all(response.as_bytes())
        .map_err(|e| e.to_string())
}

fn serve_html(stream: &mut TcpStream, content: &[u8]) {
    let header = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         Cache-Control: no-cache\r\n\
         \r\n",
        content.len()
    );
    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(content);
}

fn serve_404(stream: &mut TcpStream) {
    let body = b"<h1>404</h1><p>Open <a href=\"/\">/</a> for the viewer</p>";
    let header = format!(
        "HTTP/1.1 404 Not Found\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        body.len()
    );
    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(body);
}

fn base64_encode(data: &[u8]) -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut result = String::new();
    let mut i = 0;
    while i < data.len() {
        let b0 = data[i] as u32;
        let b1 = if i + 1 < data.len() {
            data[i + 1] as u32
        } else {
            0
        };
        let b2 = if i + 2 < data.len() {
            data[i + 2] as u32
        } else {
            0
        };
        let triple = (b0 << 16) | (b1 << 8) | b2;
        result.push(CHARS[((triple >> 18) & 0x3F) as usize] as char);
        result.push(CHARS[((triple >> 12) & 0x3F) as usize] as char);
        if i + 1 < data.len() {
            result.push(CHARS[((triple >> 6) & 0x3F) as usize] as char);
        } else {
            result.push('=');
        }
        if i + 2 < data.len() {
            result.push(CHARS[(triple & 0x3F) as usize] as char);
        } else {
            result.push('=');
        }
        i += 3;
    }
    result
}

/// One binary frame: width and height as big-endian u32, then raw RGBA.
fn encode_frame(artifact: &Artifact) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + artifact.pixels().len());
    // Writing to a Vec cannot fail.
    payload.write_u32::<BigEndian>(artifact.width()).unwrap();
    payload.write_u32::<BigEndian>(artifact.height()).unwrap();
    payload.extend_from_slice(artifact.pixels());
    payload
}

impl WsServer {
    pub fn new(frame_rx: Receiver<Arc<Artifact>>, addr: String) -> Self {
        Self { frame_rx, addr }
    }

    /// Run the server: acceptor thread plus the broadcast loop. Blocks until
    /// the frame channel closes.
    pub fn run(self) {
        let clients: ClientList = Arc::new(Mutex::new(Vec::new()));

        // Spawn acceptor thread
        let accept_clients = clients.clone();
        let addr = self.addr.clone();
        let accept = thread::Builder::new()
            .name("ws-accept".into())
            .spawn(move || {
                let listener = match TcpListener::bind(&addr) {
                    Ok(l) => l,
                    Err(e) => {
                        error!("Server failed to bind {}: {}", addr, e);
                        return;
                    }
                };
                info!("Server listening on http://{}", addr);
                info!("  Open http://{} in your browser", addr);

                for stream in listener.incoming() {
                    match stream {
                        Ok(mut stream) => {
                            let cl = accept_clients.clone();
                            // Handle each connection in a short-lived thread
                            // (HTTP connections close immediately; WS
                            //  connections get moved to the client list)
                            thread::spawn(move || match parse_request(&mut stream) {
                                Ok(req) if req.is_upgrade => {
                                    if let Some(key) = req.ws_key {
                                        match ws_handshake(&mut stream, &key) {
                                            Ok(()) => {
                                                info!("WebSocket client connected");
                                                let mut client = WsClient::new(stream);
                                                let hello = Hello {
                                                    kind: "hello",
                                                    format: "rgba8",
                                                };
                                                match serde_json::to_string(&hello) {
                                                    Ok(json) => {
                                                        client.send_text(&json);
                                                    }
                                                    Err(e) => {
                                                        warn!("Hello serialize error: {}", e)
                                                    }
                                                }
                                                cl.lock().unwrap().push(client);
                                            }
                                            Err(e) => warn!("WS handshake failed: {}", e),
                                        }
                                    }
                                }
                                Ok(req) => match req.path.as_str() {
                                    "/" | "/index.html" => {
                                        serve_html(&mut stream, VIEWER_HTML.as_bytes())
                                    }
                                    _ => serve_404(&mut stream),
                                },
                                Err(e) => warn!("Request parse error: {}", e),
                            });
                        }
                        Err(e) => warn!("TCP accept error: {}", e),
                    }
                }
            });
        if let Err(e) = accept {
            error!("Failed to spawn acceptor thread: {}", e);
            return;
        }

        // Broadcast loop
        for artifact in self.frame_rx.iter() {
            let mut cl = clients.lock().unwrap();
            if cl.is_empty() {
                continue;
            }
            let payload = encode_frame(&artifact);
            for client in cl.iter_mut() {
                client.send_binary(&payload);
            }
            cl.retain(|c| c.alive);
        }
        info!("Frame channel closed, server shutting down");
    }
}

/// Minimal canvas viewer: connects back to this server and paints each
/// binary frame via ImageData.
const VIEWER_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>pulsetrail</title>
<style>
  body { margin: 0; background: #000; display: flex; justify-content: center; }
  canvas { image-rendering: pixelated; margin-top: 1em; }
</style>
</head>
<body>
<canvas id="view"></canvas>
<script>
  const canvas = document.getElementById('view');
  const ctx = canvas.getContext('2d');
  const ws = new WebSocket('ws://' + location.host + '/');
  ws.binaryType = 'arraybuffer';
  ws.onmessage = (ev) => {
    if (typeof ev.data === 'string') {
      console.log('server:', ev.data);
      return;
    }
    const view = new DataView(ev.data);
    const width = view.getUint32(0);
    const height = view.getUint32(4);
    if (canvas.width !== width || canvas.height !== height) {
      canvas.width = width;
      canvas.height = height;
    }
    const pixels = new Uint8ClampedArray(ev.data, 8);
    ctx.putImageData(new ImageData(pixels, width, height), 0, 0);
  };
  ws.onclose = () => console.log('connection closed');
</script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_rfc_vectors() {
        assert_eq!(base64_encode(b""), "");
        assert_eq!(base64_encode(b"f"), "Zg==");
        assert_eq!(base64_encode(b"fo"), "Zm8=");
        assert_eq!(base64_encode(b"foo"), "Zm9v");
        assert_eq!(base64_encode(b"foobar"), "Zm9vYmFy");
    }

    #[test]
    fn test_handshake_accept_value() {
        // Key/accept pair from RFC 6455 section 1.3.
        let mut hasher = Sha1::new();
        hasher.update(b"dGhlIHNhbXBsZSBub25jZQ==258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
        let accept = base64_encode(&hasher.digest().bytes());
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_encode_frame_header() {
        let artifact = Artifact::new(3, 2);
        let payload = encode_frame(&artifact);
        assert_eq!(&payload[..8], &[0, 0, 0, 3, 0, 0, 0, 2]);
        assert_eq!(payload.len(), 8 + 3 * 2 * 4);
    }
}
