//! WebSocket connection to the broker's real-time endpoint.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, timeout};
use tokio_tungstenite::tungstenite::{Error as WsError, protocol::Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::{ConnectionError, FramePoll, StreamConnection, StreamConnector, Subscription};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens authenticated connections with a fixed approval key.
#[derive(Clone)]
pub struct KisWsConnector {
    url: String,
    approval_key: String,
    ping_interval: Duration,
    connect_timeout: Duration,
}

impl std::fmt::Debug for KisWsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KisWsConnector")
            .field("url", &self.url)
            .field("ping_interval", &self.ping_interval)
            .finish_non_exhaustive()
    }
}

impl KisWsConnector {
    pub fn new(
        url: impl Into<String>,
        approval_key: impl Into<String>,
        ping_interval: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            url: url.into(),
            approval_key: approval_key.into(),
            ping_interval: ping_interval.max(Duration::from_millis(1)),
            connect_timeout,
        }
    }

    fn subscribe_request(&self, subscription: &Subscription) -> String {
        json!({
            "header": {
                "approval_key": self.approval_key,
                "custtype": "P",
                "tr_type": "1",
                "content-type": "utf-8",
            },
            "body": {
                "input": {
                    "tr_id": subscription.tr_id,
                    "tr_key": subscription.tr_key,
                }
            }
        })
        .to_string()
    }
}

#[async_trait]
impl StreamConnector for KisWsConnector {
    async fn connect(
        &self,
        subscriptions: &[Subscription],
    ) -> Result<Box<dyn StreamConnection>, ConnectionError> {
        let connected = timeout(self.connect_timeout, connect_async(self.url.as_str())).await;
        let (mut socket, _response) = match connected {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(ConnectionError::Connect(e.to_string())),
            Err(_) => {
                return Err(ConnectionError::Connect(format!(
                    "timed out after {:?}",
                    self.connect_timeout
                )));
            }
        };

        for subscription in subscriptions {
            socket
                .send(Message::Text(self.subscribe_request(subscription).into()))
                .await
                .map_err(|e| {
                    ConnectionError::Subscribe(format!(
                        "{}/{}: {e}",
                        subscription.tr_id, subscription.tr_key
                    ))
                })?;
            debug!(tr_id = %subscription.tr_id, tr_key = %subscription.tr_key, "subscribe sent");
        }
        info!(url = %self.url, channels = subscriptions.len(), "stream connected");

        let mut ping = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Ok(Box::new(KisWsConnection { socket, ping }))
    }
}

struct KisWsConnection {
    socket: Socket,
    ping: Interval,
}

enum Wake {
    Deadline,
    Ping,
    Message(Option<Result<Message, WsError>>),
}

#[async_trait]
impl StreamConnection for KisWsConnection {
    async fn next_frame(&mut self, wait: Duration) -> Result<FramePoll, ConnectionError> {
        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);

        loop {
            let wake = tokio::select! {
                _ = &mut deadline => Wake::Deadline,
                _ = self.ping.tick() => Wake::Ping,
                msg = self.socket.next() => Wake::Message(msg),
            };

            match wake {
                Wake::Deadline => return Ok(FramePoll::Idle),
                Wake::Ping => {
                    self.socket
                        .send(Message::Ping(Default::default()))
                        .await
                        .map_err(|e| ConnectionError::Transport(e.to_string()))?;
                }
                Wake::Message(msg) => return self.on_message(msg).await,
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.socket.close(None).await {
            debug!(error = %e, "close handshake failed");
        }
    }
}

impl KisWsConnection {
    async fn on_message(
        &mut self,
        msg: Option<Result<Message, WsError>>,
    ) -> Result<FramePoll, ConnectionError> {
        match msg {
            Some(Ok(Message::Text(text))) => Ok(FramePoll::Frame(text.to_string())),
            Some(Ok(Message::Binary(bytes))) => String::from_utf8(bytes.to_vec())
                .map(FramePoll::Frame)
                .map_err(|_| ConnectionError::Transport("binary frame is not UTF-8".into())),
            Some(Ok(Message::Ping(data))) => {
                self.socket
                    .send(Message::Pong(data))
                    .await
                    .map_err(|e| ConnectionError::Transport(e.to_string()))?;
                Ok(FramePoll::KeepAlive)
            }
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => Ok(FramePoll::KeepAlive),
            Some(Ok(Message::Close(frame))) => {
                warn!(?frame, "stream closed by server");
                Err(ConnectionError::Closed)
            }
            Some(Err(e)) => Err(ConnectionError::Transport(e.to_string())),
            None => Err(ConnectionError::Closed),
        }
    }
}
