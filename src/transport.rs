use std::pin::Pin;

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    http::{header::AUTHORIZATION, HeaderValue},
    Message,
};
use tracing::debug;

use crate::session::Session;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("handshake refused with status {0}")]
    Refused(u16),
    #[error("invalid authorization header")]
    InvalidToken,
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    Closed(Option<String>),
    Error(String),
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// An open duplex connection: text frames out, transport events in.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens transports. Injected so the client can run without a live server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str, session: Option<&Session>) -> Result<Link, TransportError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str, session: Option<&Session>) -> Result<Link, TransportError> {
        let mut request = endpoint.into_client_request()?;
        if let Some(session) = session {
            let value = HeaderValue::from_str(&session.bearer())
                .map_err(|_| TransportError::InvalidToken)?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _response) = match connect_async(request).await {
            Ok(pair) => pair,
            Err(tungstenite::Error::Http(response)) => {
                return Err(TransportError::Refused(response.status().as_u16()));
            }
            Err(e) => return Err(e.into()),
        };
        debug!(%endpoint, "websocket handshake complete");

        let (sink, stream) = ws.split();
        let sink = sink.with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text))));
        let stream = stream.filter_map(|msg| future::ready(map_message(msg)));

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

fn map_message(msg: Result<Message, tungstenite::Error>) -> Option<TransportEvent> {
    match msg {
        Ok(Message::Text(text)) => Some(TransportEvent::Text(text)),
        Ok(Message::Close(frame)) => Some(TransportEvent::Closed(
            frame
                .map(|f| f.reason.to_string())
                .filter(|reason| !reason.is_empty()),
        )),
        // pings are answered by tungstenite itself
        Ok(_) => None,
        Err(e) => Some(TransportEvent::Error(e.to_string())),
    }
}
