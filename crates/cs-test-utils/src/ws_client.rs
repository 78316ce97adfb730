//! WebSocket client for E2E tests.
//!
//! Speaks the JSON protocol over `tokio-tungstenite`, skipping transport
//! ping/pong frames so tests only see protocol messages.

use call_signaling::protocol::{ClientRequest, ServerMessage};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// How long `recv` waits before failing the test.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Client side of one signaling channel.
pub struct TestSignalingClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestSignalingClient {
    /// Connect to `ws_url`, passing `token` as the `access_token` query
    /// parameter.
    pub async fn connect(ws_url: &str, token: &str) -> Result<Self, anyhow::Error> {
        let url = format!("{ws_url}?access_token={token}");
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;
        Ok(Self { stream })
    }

    /// Attempt a connection that is expected to be refused, returning the
    /// HTTP status of the refusal.
    pub async fn connect_rejected(ws_url: &str, token: Option<&str>) -> Option<u16> {
        let url = match token {
            Some(token) => format!("{ws_url}?access_token={token}"),
            None => ws_url.to_string(),
        };
        match connect_async(url).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                Some(response.status().as_u16())
            }
            _ => None,
        }
    }

    /// Send a request with `request_id` attached.
    pub async fn request(
        &mut self,
        request_id: u64,
        request: &ClientRequest,
    ) -> Result<(), anyhow::Error> {
        let mut value = serde_json::to_value(request)?;
        if let Some(object) = value.as_object_mut() {
            object.insert("requestId".to_string(), serde_json::json!(request_id));
        }
        self.send_raw(&value.to_string()).await
    }

    /// Send a request without a request id.
    pub async fn send(&mut self, request: &ClientRequest) -> Result<(), anyhow::Error> {
        let text = serde_json::to_string(request)?;
        self.send_raw(&text).await
    }

    /// Send an arbitrary text frame.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), anyhow::Error> {
        self.stream.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    /// Send a binary frame.
    pub async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), anyhow::Error> {
        self.stream.send(Message::Binary(bytes)).await?;
        Ok(())
    }

    /// Next protocol message, failing after [`DEFAULT_RECV_TIMEOUT`].
    pub async fn recv(&mut self) -> Result<ServerMessage, anyhow::Error> {
        self.recv_within(DEFAULT_RECV_TIMEOUT)
            .await?
            .ok_or_else(|| anyhow::anyhow!("No message within {:?}", DEFAULT_RECV_TIMEOUT))
    }

    /// Next protocol message, or `None` if nothing arrives within `wait`.
    pub async fn recv_within(
        &mut self,
        wait: Duration,
    ) -> Result<Option<ServerMessage>, anyhow::Error> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let frame = match tokio::time::timeout_at(deadline, self.stream.next()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(anyhow::anyhow!("Channel closed")),
                Ok(Some(frame)) => frame?,
            };

            match frame {
                Message::Text(text) => return Ok(Some(serde_json::from_str(&text)?)),
                Message::Close(_) => return Err(anyhow::anyhow!("Channel closed")),
                _ => {}
            }
        }
    }

    /// Read messages until one matches `predicate`, discarding the rest.
    pub async fn recv_until<F>(&mut self, mut predicate: F) -> Result<ServerMessage, anyhow::Error>
    where
        F: FnMut(&ServerMessage) -> bool,
    {
        loop {
            let message = self.recv().await?;
            if predicate(&message) {
                return Ok(message);
            }
        }
    }

    /// Wait until the server closes the channel.
    pub async fn expect_closed(&mut self) -> Result<(), anyhow::Error> {
        loop {
            match tokio::time::timeout(DEFAULT_RECV_TIMEOUT, self.stream.next()).await {
                Err(_) => return Err(anyhow::anyhow!("Channel still open")),
                Ok(None | Some(Err(_)) | Some(Ok(Message::Close(_)))) => return Ok(()),
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    /// Close the channel politely.
    pub async fn close(mut self) -> Result<(), anyhow::Error> {
        self.stream.close(None).await?;
        Ok(())
    }

    /// Drop the TCP connection without a Close frame, as a vanished client
    /// would.
    pub fn abort(self) {
        drop(self.stream);
    }
}
