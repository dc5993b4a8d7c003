//! A single relay session bridged to a local TCP stream

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use iaptun_proto::{CloseCode, RelayMessage, MAX_DATA_PAYLOAD};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::error::{RelayError, RelayResult};
use crate::stats::RelayStatistics;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Established relay session (CONNECT_SUCCESS_SID received)
pub struct RelayConnection {
    sid: String,
    ws: WsStream,
    stats: Arc<RelayStatistics>,
    half_close_timeout: Duration,
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("sid", &self.sid)
            .finish()
    }
}

impl RelayConnection {
    pub(crate) fn new(
        ws: WsStream,
        sid: String,
        stats: Arc<RelayStatistics>,
        half_close_timeout: Duration,
    ) -> Self {
        Self {
            sid,
            ws,
            stats,
            half_close_timeout,
        }
    }

    /// Session id assigned by the relay
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Close the session without exchanging payload
    pub async fn close(mut self) {
        if let Err(e) = self.ws.close(Some(normal_close())).await {
            debug!("[{}] Error closing relay session: {}", self.sid, e);
        }
    }

    /// Bridge `tcp` and the relay until either side closes or `cancel` fires.
    ///
    /// The relay has no half-close. After local EOF, data from the backend is
    /// still delivered for up to `half_close_timeout` or until the relay closes.
    /// Dropped relay sessions are not resumed, so losing the relay ends the
    /// local connection.
    ///
    /// Returns `Ok` when the session ended normally: local EOF, cancellation,
    /// or a relay close status that means the backend hung up.
    pub async fn pump(self, tcp: TcpStream, cancel: CancellationToken) -> RelayResult<()> {
        let RelayConnection {
            sid,
            ws,
            stats,
            half_close_timeout,
        } = self;

        let (ws_sink, mut ws_source) = ws.split();
        let (frame_tx, frame_rx) = mpsc::channel::<Message>(64);
        let writer = tokio::spawn(Self::writer_task(ws_sink, frame_rx, sid.clone()));

        let (mut tcp_read, mut tcp_write) = tcp.into_split();

        let bridge = async {
            let local = Self::local_to_relay(&mut tcp_read, &frame_tx, &stats, &sid);
            let remote =
                Self::relay_to_local(&mut ws_source, &mut tcp_write, &frame_tx, &stats, &sid);
            tokio::pin!(local, remote);

            tokio::select! {
                result = &mut remote => result,
                result = &mut local => match result {
                    Ok(()) => match tokio::time::timeout(half_close_timeout, remote).await {
                        Ok(result) => result,
                        Err(_) => {
                            debug!("[{}] No relay close after local EOF, ending session", sid);
                            Ok(())
                        }
                    },
                    Err(e) => Err(e),
                },
            }
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("[{}] Relay session cancelled", sid);
                Ok(())
            }
            result = bridge => result,
        };

        let _ = frame_tx.send(Message::Close(Some(normal_close()))).await;
        drop(frame_tx);

        if let Err(e) = writer.await {
            error!("[{}] Relay writer task failed: {}", sid, e);
        }

        debug!(
            "[{}] Relay session ended (sent {} / received {} bytes total)",
            sid,
            stats.bytes_sent(),
            stats.bytes_received()
        );
        result
    }

    /// Writer task - sends frames to the relay
    async fn writer_task(
        mut sink: SplitSink<WsStream, Message>,
        mut rx: mpsc::Receiver<Message>,
        sid: String,
    ) {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));

            if let Err(e) = sink.send(message).await {
                debug!("[{}] Relay send stopped: {}", sid, e);
                break;
            }
            if closing {
                break;
            }
        }

        let _ = sink.close().await;
        trace!("[{}] Relay writer task ended", sid);
    }

    async fn local_to_relay(
        tcp_read: &mut OwnedReadHalf,
        frame_tx: &mpsc::Sender<Message>,
        stats: &RelayStatistics,
        sid: &str,
    ) -> RelayResult<()> {
        let mut buffer = vec![0u8; MAX_DATA_PAYLOAD];

        loop {
            let n = tcp_read.read(&mut buffer).await?;
            if n == 0 {
                debug!("[{}] Local client closed connection", sid);
                return Ok(());
            }

            let frame = RelayMessage::data(Bytes::copy_from_slice(&buffer[..n])).encode()?;
            send_frame(frame_tx, frame).await?;
            stats.record_sent(n);
        }
    }

    async fn relay_to_local(
        source: &mut SplitStream<WsStream>,
        tcp_write: &mut OwnedWriteHalf,
        frame_tx: &mpsc::Sender<Message>,
        stats: &RelayStatistics,
        sid: &str,
    ) -> RelayResult<()> {
        let mut total_received: u64 = 0;

        while let Some(message) = source.next().await {
            match message? {
                Message::Binary(data) => match RelayMessage::decode(Bytes::from(data))? {
                    RelayMessage::Data { data } => {
                        tcp_write.write_all(&data).await?;
                        stats.record_received(data.len());

                        total_received += data.len() as u64;
                        send_frame(frame_tx, RelayMessage::ack(total_received).encode()?).await?;
                    }
                    RelayMessage::Ack { ack } => {
                        trace!("[{}] Relay acknowledged {} bytes", sid, ack);
                    }
                    RelayMessage::LongClose { code, reason } => {
                        let code = u16::try_from(code)
                            .map(CloseCode::from)
                            .unwrap_or(CloseCode::ErrorUnknown);
                        return close_result(code, reason);
                    }
                    other => trace!("[{}] Ignoring relay message {:?}", sid, other),
                },
                Message::Close(Some(frame)) => {
                    return close_result(
                        CloseCode::from(u16::from(frame.code)),
                        frame.reason.to_string(),
                    );
                }
                Message::Close(None) => return Ok(()),
                Message::Ping(_) | Message::Pong(_) => {
                    trace!("[{}] Received ping/pong", sid);
                }
                _ => {}
            }
        }

        debug!("[{}] Relay stream ended", sid);
        Ok(())
    }
}

async fn send_frame(frame_tx: &mpsc::Sender<Message>, frame: Bytes) -> RelayResult<()> {
    frame_tx
        .send(Message::Binary(frame.to_vec()))
        .await
        .map_err(|_| RelayError::ConnectionError("Relay writer stopped".to_string()))
}

fn close_result(code: CloseCode, reason: String) -> RelayResult<()> {
    if code.is_normal() {
        Ok(())
    } else {
        Err(RelayError::from_close(code, reason))
    }
}

fn normal_close() -> CloseFrame<'static> {
    CloseFrame {
        code: WsCloseCode::Normal,
        reason: "".into(),
    }
}
