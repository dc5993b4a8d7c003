//! In-process relay for tests
//!
//! Speaks just enough of the relay protocol to exercise real connections:
//! it answers the WebSocket upgrade, sends CONNECT_SUCCESS_SID and echoes
//! DATA frames back, standing in for an echo server on the target instance.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use iaptun_proto::RelayMessage;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// How the relay answers new connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayBehavior {
    /// Establish the session and echo DATA back
    Echo,
    /// Accept the upgrade, then close with this status before the session id
    CloseWith(u16),
    /// Refuse the upgrade with this HTTP status
    RejectHttp(u16),
    /// Accept the upgrade and never send a session id
    Stall,
}

/// Headers and URI of one upgrade request
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub uri: String,
    pub authorization: Option<String>,
    pub origin: Option<String>,
}

#[derive(Debug)]
struct RelayState {
    behavior: Mutex<RelayBehavior>,
    requests: Mutex<Vec<RecordedRequest>>,
    sessions: AtomicUsize,
}

/// Relay server bound to an ephemeral loopback port
#[derive(Debug)]
pub struct TestRelay {
    addr: SocketAddr,
    state: Arc<RelayState>,
    accept_task: JoinHandle<()>,
}

impl TestRelay {
    pub async fn start(behavior: RelayBehavior) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let state = Arc::new(RelayState {
            behavior: Mutex::new(behavior),
            requests: Mutex::new(Vec::new()),
            sessions: AtomicUsize::new(0),
        });

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                debug!("Test relay accepted {}", peer);
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });

        Ok(Self {
            addr,
            state,
            accept_task,
        })
    }

    /// Base URL to put into `RelayConfig::url`
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn set_behavior(&self, behavior: RelayBehavior) {
        *lock(&self.state.behavior) = behavior;
    }

    /// Upgrade requests that reached the relay, oldest first
    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.state.requests).clone()
    }

    /// Number of sessions that completed the WebSocket upgrade
    pub fn connection_count(&self) -> usize {
        self.state.sessions.load(Ordering::SeqCst)
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn serve(stream: TcpStream, state: Arc<RelayState>) {
    let behavior = *lock(&state.behavior);

    let callback = |req: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let header_string = |name: header::HeaderName| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        lock(&state.requests).push(RecordedRequest {
            uri: req.uri().to_string(),
            authorization: header_string(header::AUTHORIZATION),
            origin: header_string(header::ORIGIN),
        });

        if let RelayBehavior::RejectHttp(status) = behavior {
            let mut rejection = ErrorResponse::new(None);
            *rejection.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN);
            return Err(rejection);
        }

        // The client insists on getting its subprotocol back
        if let Some(protocol) = req.headers().get(header::SEC_WEBSOCKET_PROTOCOL) {
            response
                .headers_mut()
                .insert(header::SEC_WEBSOCKET_PROTOCOL, protocol.clone());
        }
        Ok(response)
    };

    let mut ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Test relay handshake ended: {}", e);
            return;
        }
    };
    let session = state.sessions.fetch_add(1, Ordering::SeqCst) + 1;

    match behavior {
        RelayBehavior::Echo => {
            let hello = RelayMessage::ConnectSuccessSid {
                sid: format!("sid-{}", session),
            };
            let Ok(hello) = hello.encode() else { return };
            if ws.send(Message::Binary(hello.to_vec())).await.is_err() {
                return;
            }

            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Binary(data) => {
                        let decoded = RelayMessage::decode(Bytes::from(data));
                        if let Ok(RelayMessage::Data { data }) = decoded {
                            let Ok(echo) = RelayMessage::data(data).encode() else { break };
                            if ws.send(Message::Binary(echo.to_vec())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
        RelayBehavior::CloseWith(code) => {
            let frame = CloseFrame {
                code: WsCloseCode::from(code),
                reason: "closed by test relay".into(),
            };
            let _ = ws.close(Some(frame)).await;
            while let Some(Ok(_)) = ws.next().await {}
        }
        RelayBehavior::Stall | RelayBehavior::RejectHttp(_) => {
            while let Some(Ok(_)) = ws.next().await {}
        }
    }
}
