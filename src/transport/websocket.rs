// WebSocket transport built on tokio-tungstenite
// Each open link runs a write loop and a read loop bridged to the link channels

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use url::Url;

use super::{CloseReason, Frame, Link, Transport, TransportError};
use crate::models::Payload;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Opens `ws://` links. `wss://` needs one of tokio-tungstenite's TLS features.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        WebSocketTransport
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &Url) -> Result<Link, TransportError> {
        let (ws_stream, response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(map_ws_error)?;
        info!(
            "WebSocket handshake with {} completed ({})",
            url.host_str().unwrap_or("?"),
            response.status()
        );

        let (ws_write, ws_read) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(run_write_loop(ws_write, out_rx));
        let reader = tokio::spawn(run_read_loop(ws_read, in_tx));

        Ok(Link::new(out_tx, in_rx).with_pumps(vec![writer, reader]))
    }
}

/// Drains outbound frames into the socket. Stops after a close frame.
async fn run_write_loop(
    mut ws_write: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = outbound.recv().await {
        let (message, closing) = match frame {
            Frame::Data(Payload::Text(text)) => (Message::Text(text.into()), false),
            Frame::Data(Payload::Binary(bytes)) => (Message::Binary(bytes.into()), false),
            Frame::Close(reason) => {
                let close_frame = reason.map(|r| CloseFrame {
                    code: CloseCode::from(r.code),
                    reason: r.reason.into(),
                });
                (Message::Close(close_frame), true)
            }
        };

        if let Err(e) = ws_write.send(message).await {
            warn!("WebSocket write failed, closing write loop: {}", e);
            break;
        }
        if closing {
            break;
        }
    }

    // Flushes pending frames and sends a close frame if none was sent yet
    if let Err(e) = ws_write.close().await {
        debug!("WebSocket close after write loop: {}", e);
    }
}

/// Forwards socket frames until the socket ends or nobody listens anymore.
async fn run_read_loop(
    mut ws_read: SplitStream<WsStream>,
    inbound: mpsc::UnboundedSender<Result<Frame, TransportError>>,
) {
    loop {
        let next = tokio::select! {
            next = ws_read.next() => next,
            _ = inbound.closed() => break,
        };

        let frame = match next {
            None => break,
            Some(Err(e)) => {
                let _ = inbound.send(Err(map_ws_error(e)));
                break;
            }
            Some(Ok(Message::Text(text))) => Frame::Data(Payload::Text(text.as_str().to_string())),
            Some(Ok(Message::Binary(bytes))) => Frame::Data(Payload::Binary(bytes.to_vec())),
            Some(Ok(Message::Close(close_frame))) => {
                let reason = close_frame
                    .map(|cf| CloseReason::new(u16::from(cf.code), cf.reason.as_str().to_string()));
                debug!("WebSocket received close frame: {:?}", reason);
                let _ = inbound.send(Ok(Frame::Close(reason)));
                break;
            }
            // Ping/pong are answered by tungstenite itself
            Some(Ok(_)) => continue,
        };

        if inbound.send(Ok(frame)).is_err() {
            break;
        }
    }
}

fn map_ws_error(e: tungstenite::Error) -> TransportError {
    match e {
        tungstenite::Error::Io(io_err) => TransportError::from(io_err),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Reset("connection closed".to_string())
        }
        tungstenite::Error::Http(response) => {
            TransportError::Refused(format!("server answered HTTP {}", response.status()))
        }
        other => TransportError::Protocol(other.to_string()),
    }
}
