//! WebSocket observer feed
//!
//! Every connected observer receives each broadcast event as a JSON text
//! frame. Connections on `CONTROL_PATH` are control clients instead: they
//! send requests and get replies, and are not subscribed to the feed.
//! Control clients must connect from loopback.
//! One thread accepts connections, one thread serves each peer.

use crossbeam_channel::{Receiver, TryRecvError};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::{accept_hdr, Message, WebSocket};

use crate::core::broadcast::EventBroadcaster;
use crate::core::protocol::BroadcastEvent;

use super::control::{RequestHandler, ServiceReply, ServiceRequest, CONTROL_PATH};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const ACCEPT_INTERVAL: Duration = Duration::from_millis(50);

// =============================================================================
// SERVER
// =============================================================================

pub struct ObserverServer {
    local_addr: SocketAddr,
    shutdown_flag: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl ObserverServer {
    /// Bind `addr` and start accepting observers and control clients
    pub fn start(
        addr: &str,
        broadcaster: Arc<EventBroadcaster>,
        handler: Arc<dyn RequestHandler>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "[WS] Observer feed listening");

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown_flag);
        let handle = thread::Builder::new()
            .name("observer-accept".to_string())
            .spawn(move || accept_loop(listener, broadcaster, handler, flag))?;

        Ok(Self {
            local_addr,
            shutdown_flag,
            thread_handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&mut self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ObserverServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: TcpListener,
    broadcaster: Arc<EventBroadcaster>,
    handler: Arc<dyn RequestHandler>,
    shutdown_flag: Arc<AtomicBool>,
) {
    while !shutdown_flag.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let broadcaster = Arc::clone(&broadcaster);
                let handler = Arc::clone(&handler);
                let flag = Arc::clone(&shutdown_flag);
                let spawned = thread::Builder::new()
                    .name(format!("observer-{peer}"))
                    .spawn(move || serve_peer(stream, peer, &broadcaster, &*handler, &flag));
                if let Err(e) = spawned {
                    error!(error = %e, "[WS] Could not start observer thread");
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_INTERVAL),
            Err(e) => {
                warn!(error = %e, "[WS] Accept failed");
                thread::sleep(ACCEPT_INTERVAL);
            }
        }
    }
    debug!("[WS] Observer feed stopped");
}

// =============================================================================
// PEER THREAD
// =============================================================================

fn serve_peer(
    stream: TcpStream,
    peer: SocketAddr,
    broadcaster: &EventBroadcaster,
    handler: &dyn RequestHandler,
    shutdown_flag: &Arc<AtomicBool>,
) {
    // Handshake in blocking mode
    if let Err(e) = stream.set_nonblocking(false) {
        warn!(%peer, error = %e, "[WS] Socket setup failed");
        return;
    }
    let mut path = String::new();
    let record_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        path = request.uri().path().to_string();
        if path == CONTROL_PATH && !peer.ip().is_loopback() {
            let mut refusal = ErrorResponse::new(Some("control channel is local only".to_string()));
            *refusal.status_mut() = StatusCode::FORBIDDEN;
            return Err(refusal);
        }
        Ok(response)
    };
    let mut socket = match accept_hdr(stream, record_path) {
        Ok(socket) => socket,
        Err(e) => {
            warn!(%peer, error = %e, "[WS] Handshake failed");
            return;
        }
    };

    let result = if path == CONTROL_PATH {
        info!(%peer, "[WS] Control client connected");
        control_loop(&mut socket, handler, shutdown_flag)
    } else {
        info!(%peer, "[WS] Observer connected");
        let events = broadcaster.subscribe();
        message_loop(&mut socket, &events, shutdown_flag)
    };
    match &result {
        Ok(()) => info!(%peer, "[WS] Peer left"),
        Err(e) => info!(%peer, error = %e, "[WS] Peer dropped"),
    }
    let _ = socket.close(None);
    let _ = socket.flush();
}

/// Answer requests one at a time until the client leaves. Replies are
/// written blocking; a failed write drops the remaining replies, which
/// cancels an unfinished probe.
fn control_loop(
    socket: &mut WebSocket<TcpStream>,
    handler: &dyn RequestHandler,
    shutdown_flag: &Arc<AtomicBool>,
) -> Result<(), String> {
    socket
        .get_ref()
        .set_read_timeout(Some(ACCEPT_INTERVAL))
        .map_err(|e| e.to_string())?;

    loop {
        if shutdown_flag.load(Ordering::SeqCst) {
            return Ok(());
        }

        let text = match socket.read() {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => return Ok(()),
            Ok(_) => continue,
            Err(tungstenite::Error::Io(ref e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                continue
            }
            Err(tungstenite::Error::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(format!("Read: {e}")),
        };

        let replies: Box<dyn Iterator<Item = ServiceReply>> =
            match serde_json::from_str::<ServiceRequest>(&text) {
                Ok(request) => handler.handle(request),
                Err(e) => Box::new(std::iter::once(ServiceReply::Error {
                    message: format!("bad request: {e}"),
                })),
            };
        for reply in replies {
            let json = serde_json::to_string(&reply).map_err(|e| e.to_string())?;
            socket
                .send(Message::Text(json))
                .map_err(|e| format!("Send: {e}"))?;
            if shutdown_flag.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
    }
}

fn message_loop(
    socket: &mut WebSocket<TcpStream>,
    events: &Receiver<BroadcastEvent>,
    shutdown_flag: &Arc<AtomicBool>,
) -> Result<(), String> {
    socket
        .get_ref()
        .set_nonblocking(true)
        .map_err(|e| e.to_string())?;

    loop {
        if shutdown_flag.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Handle outgoing
        match events.try_recv() {
            Ok(event) => {
                let json = serde_json::to_string(&event).map_err(|e| e.to_string())?;
                match socket.send(Message::Text(json)) {
                    Ok(()) => {}
                    // Queued; flushed on a later write
                    Err(tungstenite::Error::Io(ref e)) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(e) => return Err(format!("Send: {e}")),
                }
                continue;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return Err("Broadcaster gone".to_string()),
        }

        // Handle incoming (observers only listen; pings are answered by tungstenite)
        match socket.read() {
            Ok(Message::Close(_)) => return Ok(()),
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e)) if e.kind() == ErrorKind::WouldBlock => {}
            Err(tungstenite::Error::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(format!("Read: {e}")),
        }

        thread::sleep(POLL_INTERVAL);
    }
}
