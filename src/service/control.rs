//! Control channel into a running `serve` process
//!
//! `serve` owns the race engine: the leaderboard cache, the directories and
//! the broadcaster its observers are subscribed to. Other processes reach
//! it by opening a WebSocket on `CONTROL_PATH` and sending one JSON request
//! per text frame. Each request is answered by one reply frame, except a
//! probe, which is answered by one `probe` frame per event up to `end`.
//!
//! Closing the connection during a probe cancels it.

use std::iter;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::core::model::{Challenge, Participant};
use crate::core::orchestrator::ProbeRequest;
use crate::core::protocol::ProbeEvent;

use super::directory::NewChallenge;
use super::RaceService;

/// Request path that selects the control channel; any other path observes
pub const CONTROL_PATH: &str = "/control";

// =============================================================================
// WIRE FORMAT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceRequest {
    Register {
        player_id: Option<String>,
        name: String,
    },
    CreateChallenge {
        challenge: NewChallenge,
    },
    SetChallengeMode {
        enabled: bool,
    },
    Probe {
        target: String,
        player_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceReply {
    Participant { participant: Participant },
    Challenge { challenge: Challenge },
    ChallengeMode { enabled: bool },
    Probe { event: ProbeEvent },
    Error { message: String },
}

impl ServiceReply {
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceReply::Participant { .. } => "participant",
            ServiceReply::Challenge { .. } => "challenge",
            ServiceReply::ChallengeMode { .. } => "challenge_mode",
            ServiceReply::Probe { .. } => "probe",
            ServiceReply::Error { .. } => "error",
        }
    }
}

// =============================================================================
// SERVER SIDE
// =============================================================================

/// Replies to one request, in send order. Dropping it early abandons the
/// rest of the work (a probe is cancelled).
pub type ReplyStream = Box<dyn Iterator<Item = ServiceReply>>;

pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: ServiceRequest) -> ReplyStream;
}

impl RequestHandler for RaceService {
    fn handle(&self, request: ServiceRequest) -> ReplyStream {
        let reply = match request {
            ServiceRequest::Register { player_id, name } => self
                .register(player_id.as_deref(), &name)
                .map(|participant| ServiceReply::Participant { participant }),
            ServiceRequest::CreateChallenge { challenge } => self
                .create_challenge(challenge)
                .map(|challenge| ServiceReply::Challenge { challenge }),
            ServiceRequest::SetChallengeMode { enabled } => self
                .set_challenge_mode(enabled)
                .map(|()| ServiceReply::ChallengeMode { enabled }),
            ServiceRequest::Probe { target, player_id } => {
                let request = ProbeRequest {
                    target,
                    participant_id: player_id,
                };
                match self.probe(request) {
                    Ok(events) => {
                        return Box::new(
                            events
                                .into_iter()
                                .map(|event| ServiceReply::Probe { event }),
                        )
                    }
                    Err(e) => Err(e),
                }
            }
        };
        let reply = reply.unwrap_or_else(|e| ServiceReply::Error {
            message: e.to_string(),
        });
        Box::new(iter::once(reply))
    }
}

// =============================================================================
// CLIENT SIDE
// =============================================================================

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("malformed reply: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server refused: {0}")]
    Remote(String),
    #[error("unexpected {0} reply")]
    Unexpected(&'static str),
    #[error("server closed the connection")]
    Closed,
}

pub struct ControlClient {
    socket: WebSocket<MaybeTlsStream<TcpStream>>,
}

impl ControlClient {
    /// Connect to the control channel of a `serve` bound to `bind`
    pub fn connect(bind: &str) -> Result<Self, ControlError> {
        let url = format!("ws://{}{CONTROL_PATH}", dial_address(bind));
        let (socket, _) = tungstenite::connect(url.as_str())?;
        debug!(%url, "[CTL] Connected to running server");
        Ok(Self { socket })
    }

    pub fn register(
        &mut self,
        player_id: Option<&str>,
        name: &str,
    ) -> Result<Participant, ControlError> {
        let request = ServiceRequest::Register {
            player_id: player_id.map(str::to_string),
            name: name.to_string(),
        };
        match self.call(&request)? {
            ServiceReply::Participant { participant } => Ok(participant),
            other => Err(ControlError::Unexpected(other.kind())),
        }
    }

    pub fn create_challenge(&mut self, challenge: NewChallenge) -> Result<Challenge, ControlError> {
        match self.call(&ServiceRequest::CreateChallenge { challenge })? {
            ServiceReply::Challenge { challenge } => Ok(challenge),
            other => Err(ControlError::Unexpected(other.kind())),
        }
    }

    pub fn set_challenge_mode(&mut self, enabled: bool) -> Result<(), ControlError> {
        match self.call(&ServiceRequest::SetChallengeMode { enabled })? {
            ServiceReply::ChallengeMode { .. } => Ok(()),
            other => Err(ControlError::Unexpected(other.kind())),
        }
    }

    /// Start a probe on the server; the iterator ends after `end`
    pub fn probe(&mut self, request: ProbeRequest) -> Result<RemoteProbe<'_>, ControlError> {
        self.send(&ServiceRequest::Probe {
            target: request.target,
            player_id: request.participant_id,
        })?;
        Ok(RemoteProbe {
            client: self,
            done: false,
        })
    }

    fn call(&mut self, request: &ServiceRequest) -> Result<ServiceReply, ControlError> {
        self.send(request)?;
        match self.next_reply()? {
            ServiceReply::Error { message } => Err(ControlError::Remote(message)),
            reply => Ok(reply),
        }
    }

    fn send(&mut self, request: &ServiceRequest) -> Result<(), ControlError> {
        let json = serde_json::to_string(request)?;
        self.socket.send(Message::Text(json))?;
        Ok(())
    }

    fn next_reply(&mut self) -> Result<ServiceReply, ControlError> {
        loop {
            match self.socket.read()? {
                Message::Text(text) => return Ok(serde_json::from_str(&text)?),
                Message::Close(_) => return Err(ControlError::Closed),
                _ => {}
            }
        }
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        let _ = self.socket.close(None);
        let _ = self.socket.flush();
    }
}

/// Probe events relayed from the server
pub struct RemoteProbe<'a> {
    client: &'a mut ControlClient,
    done: bool,
}

impl Iterator for RemoteProbe<'_> {
    type Item = Result<ProbeEvent, ControlError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = match self.client.next_reply() {
            Ok(ServiceReply::Probe { event }) => {
                self.done = event.is_end();
                return Some(Ok(event));
            }
            Ok(ServiceReply::Error { message }) => Err(ControlError::Remote(message)),
            Ok(other) => Err(ControlError::Unexpected(other.kind())),
            Err(e) => Err(e),
        };
        self.done = true;
        Some(item)
    }
}

/// A wildcard bind address is dialled on loopback
fn dial_address(bind: &str) -> String {
    match bind.parse::<SocketAddr>() {
        Ok(addr) if addr.ip().is_unspecified() => {
            let ip = match addr.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };
            SocketAddr::new(ip, addr.port()).to_string()
        }
        _ => bind.to_string(),
    }
}
