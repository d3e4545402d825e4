//! Error types shared across the crate.
//!
//! Only [`SessionError::Connection`] and transport failures are fatal to a
//! session. Everything else is isolated to the operation that produced it.

use tokio_tungstenite::tungstenite::Error as WsError;

use crate::session::SessionState;

/// Errors raised by the session state machine.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Session is not active (state: {0})")]
    NotActive(SessionState),

    #[error("Cannot {op} while session is {state}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Outbound queue is full")]
    Backpressure,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timeout")]
    Timeout,
}

/// Microphone / camera / screen failures. Fatal to the producing capture
/// thread only.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Unsupported input: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Malformed inbound audio payload. The offending chunk is dropped.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PCM payload has odd length {0}")]
    OddLength(usize),

    #[error("Empty audio payload")]
    Empty,

    #[error("Unsupported sample rate {0}")]
    SampleRate(u32),
}

/// Outbound encoding failures (JPEG, raster).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Image encoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid raster {width}x{height}")]
    Raster { width: u32, height: u32 },
}

/// Tool handler failure. Always converted into an error tool response.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {source}")]
    InvalidArguments {
        tool: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    Failed(String),

    #[error("Tool handler panicked")]
    Panicked,
}

/// Unrecognised or malformed server message. Logged and ignored.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed server message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unrecognized server message: {0}")]
    Unrecognized(String),

    #[error("Binary frame is not UTF-8 JSON ({0} bytes)")]
    NotJson(usize),
}

/// Output device / scheduling failures.
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("Invalid sample rate {0}")]
    InvalidRate(u32),

    #[error("Output device error: {0}")]
    Device(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

/// Relay failures. Scoped to a single proxied connection.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("Token unavailable: {0}")]
    Token(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
