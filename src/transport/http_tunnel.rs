//! RTSP-over-HTTP tunneling: a GET connection carries server→client RTSP
//! bytes, a paired POST connection (same `x-sessioncookie` header) carries
//! client→server RTSP bytes, base64-encoded so both pass through HTTP
//! proxies that would otherwise reject a raw RTSP byte stream.
//!
//! The server pairs the two connections by cookie, feeds decoded POST
//! bytes into a [`MethodHandler`] exactly as [`crate::transport::tcp`]
//! does for a plain RTSP connection, and writes responses out on the GET
//! connection.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use base64::prelude::{BASE64_STANDARD, Engine as _};
use parking_lot::Mutex;

use crate::mount::MountRegistry;
use crate::protocol::{MethodHandler, RtspRequest};
use crate::server::ServerConfig;
use crate::session::SessionManager;

/// Cookie -> the GET connection's writer half, shared with the POST
/// connection that pairs with it.
#[derive(Clone, Default)]
struct TunnelRegistry {
    writers: Arc<Mutex<HashMap<String, Arc<Mutex<TcpStream>>>>>,
}

impl TunnelRegistry {
    fn register(&self, cookie: String, writer: Arc<Mutex<TcpStream>>) {
        self.writers.lock().insert(cookie, writer);
    }

    fn get(&self, cookie: &str) -> Option<Arc<Mutex<TcpStream>>> {
        self.writers.lock().get(cookie).cloned()
    }

    fn remove(&self, cookie: &str) {
        self.writers.lock().remove(cookie);
    }
}

/// Accept loop for the HTTP tunnel port, mirroring
/// [`crate::transport::tcp::accept_loop`]'s non-blocking poll pattern.
pub fn accept_loop(
    listener: TcpListener,
    session_manager: SessionManager,
    mounts: MountRegistry,
    config: Arc<ServerConfig>,
    udp_socket: Arc<UdpSocket>,
    running: Arc<AtomicBool>,
) {
    let tunnels = TunnelRegistry::default();

    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let sm = session_manager.clone();
                let m = mounts.clone();
                let c = config.clone();
                let t = tunnels.clone();
                let u = udp_socket.clone();
                thread::spawn(move || handle_connection(stream, sm, m, c, u, t));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "HTTP tunnel accept error");
                }
            }
        }
    }
    tracing::debug!("HTTP tunnel accept loop exited");
}

/// Reads the HTTP request line and headers (through the blank line),
/// returning `(method, headers)` with lowercase header keys.
fn read_http_headers(reader: &mut BufReader<TcpStream>) -> Option<(String, HashMap<String, String>)> {
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).ok()? == 0 {
        return None;
    }
    let method = request_line.split_whitespace().next()?.to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).ok()? == 0 {
            return None;
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Some((method, headers))
}

fn handle_connection(
    stream: TcpStream,
    session_manager: SessionManager,
    mounts: MountRegistry,
    config: Arc<ServerConfig>,
    udp_socket: Arc<UdpSocket>,
    tunnels: TunnelRegistry,
) {
    let Ok(peer_addr) = stream.peer_addr() else {
        return;
    };
    let Ok(reader_stream) = stream.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(reader_stream);

    let Some((method, headers)) = read_http_headers(&mut reader) else {
        return;
    };

    let Some(cookie) = headers.get("x-sessioncookie").cloned() else {
        tracing::warn!(%peer_addr, method, "HTTP tunnel request missing x-sessioncookie");
        return;
    };

    match method.as_str() {
        "GET" => handle_get(stream, reader, cookie, tunnels, peer_addr),
        "POST" => handle_post(reader, cookie, tunnels, session_manager, mounts, config, udp_socket, peer_addr),
        other => tracing::warn!(%peer_addr, method = other, "unsupported HTTP tunnel method"),
    }
}

/// GET half: replies `200` with `application/x-rtsp-tunnelled` and
/// registers this socket as the cookie's response channel, then just
/// blocks reading (discarding anything received) until the client closes
/// the connection.
fn handle_get(
    stream: TcpStream,
    mut reader: BufReader<TcpStream>,
    cookie: String,
    tunnels: TunnelRegistry,
    peer_addr: SocketAddr,
) {
    let writer = Arc::new(Mutex::new(stream));
    let greeting = b"HTTP/1.0 200 OK\r\nServer: rtsp-rs\r\nCache-Control: no-cache\r\nContent-Type: application/x-rtsp-tunnelled\r\n\r\n";
    if writer.lock().write_all(greeting).is_err() {
        return;
    }

    tunnels.register(cookie.clone(), writer);
    tracing::info!(%peer_addr, cookie, "HTTP tunnel GET connected");

    let mut buf = [0u8; 256];
    while matches!(reader.read(&mut buf), Ok(n) if n > 0) {}

    tunnels.remove(&cookie);
    tracing::info!(%peer_addr, cookie, "HTTP tunnel GET disconnected");
}

/// POST half: base64-decodes the streamed body into RTSP request text,
/// dispatches each complete request (terminated by a blank line) through a
/// [`MethodHandler`], and writes responses to the paired GET connection.
fn handle_post(
    mut reader: BufReader<TcpStream>,
    cookie: String,
    tunnels: TunnelRegistry,
    session_manager: SessionManager,
    mounts: MountRegistry,
    config: Arc<ServerConfig>,
    udp_socket: Arc<UdpSocket>,
    peer_addr: SocketAddr,
) {
    tracing::info!(%peer_addr, cookie, "HTTP tunnel POST connected");

    let mut handler = MethodHandler::new(session_manager.clone(), peer_addr, mounts.clone(), config, udp_socket);

    let mut base64_buf = String::new();
    let mut decoded_text = String::new();
    let mut read_buf = [0u8; 4096];

    loop {
        let n = match reader.read(&mut read_buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        base64_buf.push_str(
            std::str::from_utf8(&read_buf[..n])
                .unwrap_or_default()
                .trim(),
        );

        let usable_len = (base64_buf.len() / 4) * 4;
        if usable_len == 0 {
            continue;
        }
        let chunk: String = base64_buf.drain(..usable_len).collect();
        match BASE64_STANDARD.decode(chunk.as_bytes()) {
            Ok(bytes) => decoded_text.push_str(&String::from_utf8_lossy(&bytes)),
            Err(e) => {
                tracing::warn!(%peer_addr, error = %e, "malformed base64 in HTTP tunnel POST body");
                continue;
            }
        }

        while let Some(end) = decoded_text.find("\r\n\r\n") {
            let request_text: String = decoded_text.drain(..end + 4).collect();

            let Ok(request) = RtspRequest::parse(&request_text) else {
                tracing::warn!(%peer_addr, "failed to parse tunnelled RTSP request");
                continue;
            };

            tracing::debug!(%peer_addr, method = %request.method, uri = %request.uri, "tunnelled request");
            let response = handler.handle(&request);

            match tunnels.get(&cookie) {
                Some(writer) => {
                    if writer.lock().write_all(response.serialize().as_bytes()).is_err() {
                        tracing::warn!(%peer_addr, cookie, "failed to write tunnelled response");
                    }
                }
                None => tracing::warn!(%peer_addr, cookie, "no paired GET connection for tunnel response"),
            }
        }
    }

    let orphaned = handler.session_ids().to_vec();
    if !orphaned.is_empty() {
        for id in &orphaned {
            mounts.unsubscribe_all(id);
        }
        session_manager.remove_sessions(&orphaned);
    }

    tracing::info!(%peer_addr, cookie, "HTTP tunnel POST disconnected");
}
