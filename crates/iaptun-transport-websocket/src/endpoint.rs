//! Relay endpoint: WebSocket handshake and probing

use bytes::Bytes;
use futures_util::StreamExt;
use iaptun_proto::{CloseCode, RelayMessage, MAX_MESSAGE_SIZE};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

use crate::config::{RelayConfig, RelayTarget};
use crate::connection::RelayConnection;
use crate::error::{RelayError, RelayResult};
use crate::stats::RelayStatistics;
use crate::token::TokenSource;

/// A relay target bound to credentials.
///
/// The endpoint itself holds no network resources; every [`connect`] opens a
/// fresh WebSocket. Connections created from the same endpoint share one set
/// of [`RelayStatistics`].
///
/// [`connect`]: RelayEndpoint::connect
#[derive(Debug)]
pub struct RelayEndpoint {
    config: Arc<RelayConfig>,
    target: RelayTarget,
    tokens: Arc<dyn TokenSource>,
    stats: Arc<RelayStatistics>,
}

impl RelayEndpoint {
    pub fn new(
        config: Arc<RelayConfig>,
        target: RelayTarget,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            config,
            target,
            tokens,
            stats: Arc::new(RelayStatistics::new()),
        }
    }

    pub fn target(&self) -> &RelayTarget {
        &self.target
    }

    pub fn statistics(&self) -> Arc<RelayStatistics> {
        self.stats.clone()
    }

    /// Open a relay connection and wait for the session id
    pub async fn connect(&self) -> RelayResult<RelayConnection> {
        let timeout = self.config.connect_timeout;
        tokio::time::timeout(timeout, self.handshake())
            .await
            .map_err(|_| RelayError::Timeout(timeout))?
    }

    /// Check that the relay accepts a connection to the target.
    ///
    /// The connection is closed again right away; no payload is exchanged.
    pub async fn probe(&self, timeout: Duration) -> RelayResult<()> {
        let connection = tokio::time::timeout(timeout, self.connect())
            .await
            .map_err(|_| RelayError::Timeout(timeout))??;

        debug!(
            "Probe of {}:{} succeeded (sid {})",
            self.target.instance,
            self.target.port,
            connection.sid()
        );
        connection.close().await;
        Ok(())
    }

    async fn handshake(&self) -> RelayResult<RelayConnection> {
        let url = self.config.connect_url(&self.target)?;
        let token = self.tokens.access_token().await?;

        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            header::AUTHORIZATION,
            header_value(&format!("Bearer {}", token))?,
        );
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            header_value(&self.config.subprotocol)?,
        );
        headers.insert(header::ORIGIN, header_value(&self.config.origin)?);

        debug!(
            "Connecting to relay {} for {}:{}",
            self.config.url, self.target.instance, self.target.port
        );

        let (mut ws, _response) =
            tokio_tungstenite::connect_async_with_config(request, Some(ws_config()), false)
                .await?;

        while let Some(message) = ws.next().await {
            match message? {
                Message::Binary(data) => match RelayMessage::decode(Bytes::from(data))? {
                    RelayMessage::ConnectSuccessSid { sid } => {
                        debug!("Relay session {} established", sid);
                        return Ok(RelayConnection::new(
                            ws,
                            sid,
                            self.stats.clone(),
                            self.config.half_close_timeout,
                        ));
                    }
                    RelayMessage::LongClose { code, reason } => {
                        let code = u16::try_from(code)
                            .map(CloseCode::from)
                            .unwrap_or(CloseCode::ErrorUnknown);
                        return Err(RelayError::from_close(code, reason));
                    }
                    other => trace!("Ignoring {:?} before session id", other),
                },
                Message::Close(Some(frame)) => {
                    return Err(RelayError::from_close(
                        CloseCode::from(u16::from(frame.code)),
                        frame.reason.to_string(),
                    ));
                }
                Message::Close(None) => break,
                _ => {}
            }
        }

        Err(RelayError::ConnectionError(
            "Relay closed connection before session was established".to_string(),
        ))
    }
}

/// Nothing the relay sends is larger than one full DATA message
fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(MAX_MESSAGE_SIZE);
    config
}

fn header_value(value: &str) -> RelayResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| RelayError::Configuration(format!("Invalid header value: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RelayBehavior, TestRelay};
    use crate::token::StaticTokenSource;

    fn endpoint_for(relay: &TestRelay) -> RelayEndpoint {
        let config = RelayConfig::default()
            .with_url(relay.url())
            .with_connect_timeout(Duration::from_secs(5));
        RelayEndpoint::new(
            Arc::new(config),
            RelayTarget::new("my-project", "us-central1-a", "vm-1", 22),
            Arc::new(StaticTokenSource::new("test-token")),
        )
    }

    #[test]
    fn test_ws_config_limits_message_size() {
        let config = ws_config();
        assert_eq!(config.max_message_size, Some(MAX_MESSAGE_SIZE));
        assert_eq!(config.max_frame_size, Some(MAX_MESSAGE_SIZE));
    }

    #[tokio::test]
    async fn test_connect_receives_session_id() {
        let relay = TestRelay::start(RelayBehavior::Echo).await.unwrap();
        let endpoint = endpoint_for(&relay);

        let connection = endpoint.connect().await.unwrap();
        assert!(connection.sid().starts_with("sid-"));

        let requests = relay.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].authorization.as_deref(), Some("Bearer test-token"));
        assert_eq!(requests[0].origin.as_deref(), Some("bot:iap-tunneler"));
        assert!(requests[0].uri.contains("instance=vm-1"));
        assert!(requests[0].uri.contains("port=22"));

        connection.close().await;
    }

    #[tokio::test]
    async fn test_probe_success() {
        let relay = TestRelay::start(RelayBehavior::Echo).await.unwrap();
        let endpoint = endpoint_for(&relay);

        endpoint.probe(Duration::from_secs(5)).await.unwrap();
        assert_eq!(relay.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_probe_not_authorized() {
        let relay = TestRelay::start(RelayBehavior::CloseWith(4033))
            .await
            .unwrap();
        let endpoint = endpoint_for(&relay);

        let result = endpoint.probe(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(RelayError::AccessDenied(_))));
    }

    #[tokio::test]
    async fn test_probe_backend_unreachable() {
        let relay = TestRelay::start(RelayBehavior::CloseWith(4003))
            .await
            .unwrap();
        let endpoint = endpoint_for(&relay);

        let result = endpoint.probe(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(RelayError::BackendUnreachable(_))));
    }

    #[tokio::test]
    async fn test_http_rejections() {
        let relay = TestRelay::start(RelayBehavior::RejectHttp(403))
            .await
            .unwrap();
        let endpoint = endpoint_for(&relay);
        assert!(matches!(
            endpoint.connect().await,
            Err(RelayError::AccessDenied(_))
        ));

        relay.set_behavior(RelayBehavior::RejectHttp(404));
        assert!(matches!(
            endpoint.connect().await,
            Err(RelayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_probe_times_out() {
        let relay = TestRelay::start(RelayBehavior::Stall).await.unwrap();
        let endpoint = endpoint_for(&relay);

        let result = endpoint.probe(Duration::from_millis(200)).await;
        assert!(matches!(result, Err(RelayError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let relay = TestRelay::start(RelayBehavior::Echo).await.unwrap();
        let url = relay.url();
        drop(relay);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let endpoint = RelayEndpoint::new(
            Arc::new(RelayConfig::default().with_url(url)),
            RelayTarget::new("p", "z", "i", 22),
            Arc::new(StaticTokenSource::new("t")),
        );
        assert!(endpoint.probe(Duration::from_secs(5)).await.is_err());
    }
}
