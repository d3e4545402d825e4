//! WebSocket plumbing shared by the session and the relay.

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client request for `url`, with `Authorization: Bearer` when a token is given.
pub fn request(url: &str, bearer_token: Option<&str>) -> Result<Request, WsError> {
    let mut request = url.into_client_request()?;
    if let Some(token) = bearer_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| WsError::HttpFormat(e.into()))?;
        request.headers_mut().insert("Authorization", value);
    }
    Ok(request)
}

pub async fn connect(url: &str, bearer_token: Option<&str>) -> Result<WsStream, WsError> {
    let (ws, response) = connect_async(request(url, bearer_token)?).await?;
    debug!("WebSocket handshake status: {}", response.status());
    Ok(ws)
}

pub fn close_frame(code: CloseCode, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}

pub fn normal_close() -> Message {
    close_frame(CloseCode::Normal, "")
}
