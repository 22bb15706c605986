//! Socket seam for shards: the real websocket, or a scripted fake in tests.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::trace;

use crate::Error;

#[async_trait]
pub trait ShardSocket: Send {
    async fn send_text(&mut self, text: String) -> Result<(), Error>;

    /// Next text frame. `None` once the peer closed the connection.
    async fn next_text(&mut self) -> Option<Result<String, Error>>;

    async fn close(&mut self);
}

#[async_trait]
pub trait ShardConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn ShardSocket>, Error>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl ShardConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn ShardSocket>, Error> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocket(format!("connect to {url}: {e}")))?;
        Ok(Box::new(TungsteniteSocket { ws }))
    }
}

struct TungsteniteSocket {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl ShardSocket for TungsteniteSocket {
    async fn send_text(&mut self, text: String) -> Result<(), Error> {
        self.ws
            .send(Message::text(text))
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))
    }

    async fn next_text(&mut self) -> Option<Result<String, Error>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(txt)) => return Some(Ok(txt.as_str().to_owned())),
                Ok(Message::Close(frame)) => {
                    trace!("websocket close frame: {:?}", frame);
                    return None;
                }
                // Control frames are answered by tungstenite itself.
                Ok(_) => continue,
                Err(e) => return Some(Err(Error::WebSocket(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}
