//! セッション用の双方向トランスポート
//!
//! セッションの状態機械は `SessionTransport` だけに依存し、
//! 本番では axum の WebSocket、テストではチャネルベースの実装を使います。
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("channel send failed")]
    Send,
}

/// クライアントから届いたフレーム
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Binary(Vec<u8>),
    Text(String),
    Close,
}

#[async_trait]
pub trait SessionTransport: Send {
    /// None は切断
    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>>;

    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

// =============================================================================
// axum WebSocket
// =============================================================================

pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl SessionTransport for WsTransport {
    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>> {
        loop {
            let message = match self.socket.recv().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            };

            // Ping への Pong は axum 側が返す
            let inbound = match message {
                Message::Binary(bytes) => Inbound::Binary(bytes.to_vec()),
                Message::Text(text) => Inbound::Text(text.as_str().to_string()),
                Message::Close(_) => Inbound::Close,
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            return Some(Ok(inbound));
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| TransportError::Send)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        self.socket
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|_| TransportError::Send)
    }
}

// =============================================================================
// In-memory (tests / embedding)
// =============================================================================

/// サーバーからクライアントへ送られたもの
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

pub struct InMemoryTransport {
    inbound: mpsc::Receiver<Inbound>,
    outbound: mpsc::Sender<Outbound>,
}

/// `InMemoryTransport` の相手側
pub struct InMemoryClient {
    inbound: mpsc::Sender<Inbound>,
    outbound: mpsc::Receiver<Outbound>,
}

impl InMemoryTransport {
    pub fn pair(capacity: usize) -> (InMemoryTransport, InMemoryClient) {
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        (
            InMemoryTransport {
                inbound: in_rx,
                outbound: out_tx,
            },
            InMemoryClient {
                inbound: in_tx,
                outbound: out_rx,
            },
        )
    }
}

#[async_trait]
impl SessionTransport for InMemoryTransport {
    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(Outbound::Text(text))
            .await
            .map_err(|_| TransportError::Send)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.outbound
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .await
            .map_err(|_| TransportError::Send)
    }
}

impl InMemoryClient {
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.inbound
            .send(Inbound::Text(text.into()))
            .await
            .map_err(|_| TransportError::Send)
    }

    pub async fn send_binary(&self, bytes: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        self.inbound
            .send(Inbound::Binary(bytes.into()))
            .await
            .map_err(|_| TransportError::Send)
    }

    pub async fn send_close(&self) -> Result<(), TransportError> {
        self.inbound.send(Inbound::Close).await.map_err(|_| TransportError::Send)
    }

    /// None はサーバー側がトランスポートを破棄した
    pub async fn next(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    /// 次のテキストフレームを JSON として読む（Close や不正 JSON は None）
    pub async fn next_json(&mut self) -> Option<serde_json::Value> {
        match self.next().await? {
            Outbound::Text(text) => serde_json::from_str(&text).ok(),
            Outbound::Close { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_pair_carries_frames_both_ways() {
        let (mut server, mut client) = InMemoryTransport::pair(8);

        client.send_binary(vec![1u8, 2, 3]).await.unwrap();
        client.send_text("{}").await.unwrap();
        assert_eq!(server.recv().await.unwrap().unwrap(), Inbound::Binary(vec![1, 2, 3]));
        assert_eq!(server.recv().await.unwrap().unwrap(), Inbound::Text("{}".to_string()));

        server.send_text(r#"{"ok":true}"#.to_string()).await.unwrap();
        assert_eq!(client.next_json().await.unwrap()["ok"], true);

        server.close(1013, "Model not ready").await.unwrap();
        assert_eq!(
            client.next().await,
            Some(Outbound::Close {
                code: 1013,
                reason: "Model not ready".to_string()
            })
        );
    }

    #[tokio::test]
    async fn dropping_the_client_is_a_disconnect() {
        let (mut server, client) = InMemoryTransport::pair(8);
        drop(client);
        assert!(server.recv().await.is_none());
        assert!(server.send_text("late".to_string()).await.is_err());
    }
}
