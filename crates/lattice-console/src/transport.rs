use crate::session::{SessionTarget, StreamPurpose};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use lattice_core::stream_protocol::{
    decode_frame, encode_frame, ClientFrame, ServerFrame, Viewport, DEFAULT_MAX_FRAME_BYTES,
};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

/// How a transport ended. Closes are session events, not errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportClose {
    /// Normal close handshake from the server.
    Clean,
    Abnormal { code: Option<u16>, reason: String },
    Failed(String),
    /// The upgrade was refused with an HTTP status.
    Rejected { status: u16 },
    TimedOut,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Frame(ServerFrame),
    Closed(TransportClose),
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, TransportClose>;
}

#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: &ClientFrame) -> Result<(), TransportClose>;
    /// Next decoded frame, or the close that ended the stream.
    async fn next_event(&mut self) -> TransportEvent;
    async fn close(&mut self);
}

#[derive(Clone, Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, TransportClose> {
        match connect_async(url.as_str()).await {
            Ok((stream, _response)) => Ok(Box::new(WsTransport { stream })),
            Err(WsError::Http(response)) => Err(TransportClose::Rejected {
                status: response.status().as_u16(),
            }),
            Err(err) => Err(TransportClose::Failed(err.to_string())),
        }
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: &ClientFrame) -> Result<(), TransportClose> {
        let text = encode_frame(frame, DEFAULT_MAX_FRAME_BYTES)
            .map_err(|err| TransportClose::Failed(err.to_string()))?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|err| TransportClose::Failed(err.to_string()))
    }

    async fn next_event(&mut self) -> TransportEvent {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(WsError::ConnectionClosed)) => {
                    return TransportEvent::Closed(TransportClose::Clean)
                }
                Some(Err(err)) => return TransportEvent::Closed(TransportClose::Failed(err.to_string())),
                None => {
                    return TransportEvent::Closed(TransportClose::Abnormal {
                        code: None,
                        reason: "stream ended".to_string(),
                    })
                }
            };
            let text = match message {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!(event = "stream_binary_frame_dropped");
                        continue;
                    }
                },
                Message::Close(frame) => {
                    let close = match frame {
                        None => TransportClose::Clean,
                        Some(frame) if frame.code == CloseCode::Normal => TransportClose::Clean,
                        Some(frame) => TransportClose::Abnormal {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.to_string(),
                        },
                    };
                    return TransportEvent::Closed(close);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            match decode_frame::<ServerFrame>(&text, DEFAULT_MAX_FRAME_BYTES) {
                Ok(frame) => return TransportEvent::Frame(frame),
                Err(err) => {
                    debug!(event = "stream_decode_error", error = %err);
                    continue;
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// `ws(s)://{master}/ws/nodes/{node}[/vms/{vm}|/containers/{id}]/{terminal|logs}`.
/// Terminal URLs carry the initial viewport.
pub fn stream_url(master: &Url, target: &SessionTarget, viewport: Viewport) -> Result<Url, url::ParseError> {
    let scheme = if master.scheme() == "https" { "wss" } else { "ws" };
    let host = master.host_str().ok_or(url::ParseError::EmptyHost)?;
    let authority = match master.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let mut url = Url::parse(&format!("{scheme}://{authority}/"))?;
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.clear();
        segments.extend(master.path().split('/').filter(|segment| !segment.is_empty()));
        segments.push("ws");
        segments.extend(target.subject.path_segments());
        segments.push(target.purpose.as_str());
    }
    if target.purpose == StreamPurpose::Terminal {
        url.query_pairs_mut()
            .append_pair("cols", &viewport.cols.to_string())
            .append_pair("rows", &viewport.rows.to_string());
    }
    Ok(url)
}
