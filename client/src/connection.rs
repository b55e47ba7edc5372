//! WebSocket link to the relay server, one per run.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use say_protocol::{Request, Response};

use crate::error::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub enum Incoming {
    /// Part of the relay byte stream; boundaries carry no meaning
    Stream(Vec<u8>),
    Reply(Response),
}

pub struct Outbound {
    sender: SplitSink<WsStream, Message>,
    closed: bool,
}

pub struct Inbound {
    receiver: SplitStream<WsStream>,
}

pub async fn connect(url: &str) -> Result<(Outbound, Inbound), ClientError> {
    info!("Connecting to {}", url);
    let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
    let (sender, receiver) = ws_stream.split();
    info!("Connected!");
    Ok((
        Outbound {
            sender,
            closed: false,
        },
        Inbound { receiver },
    ))
}

impl Outbound {
    pub async fn send(&mut self, request: &Request) -> Result<(), ClientError> {
        let json = serde_json::to_string(request)?;
        self.sender.send(Message::Text(json)).await?;
        Ok(())
    }

    /// Close the socket once. Audio already received is unaffected.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.sender.send(Message::Close(None)).await {
            debug!("Close handshake failed: {}", e);
        }
    }
}

impl Inbound {
    /// Next message of interest; `None` once the server has closed.
    pub async fn next(&mut self) -> Option<Result<Incoming, ClientError>> {
        loop {
            let msg = match self.receiver.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(e.into())),
            };
            match msg {
                Message::Binary(data) => return Some(Ok(Incoming::Stream(data))),
                Message::Text(text) => match serde_json::from_str::<Response>(&text) {
                    Ok(response) => return Some(Ok(Incoming::Reply(response))),
                    Err(e) => warn!("Unreadable reply from server: {}", e),
                },
                Message::Close(_) => return None,
                _ => {}
            }
        }
    }
}
