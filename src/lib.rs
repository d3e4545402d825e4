//! Real-time voice sessions against the Gemini Live API.
//!
//! A [`Session`] streams microphone audio and still frames up a single
//! WebSocket, plays the model's audio back gaplessly, honours barge-in
//! interruptions and answers the model's tool calls on the same channel.
//! [`relay`] holds the credential-injecting proxy that sits between clients
//! and the upstream service.

#![forbid(unsafe_code)]

pub mod capture;
pub mod codec;
pub mod error;
pub mod media;
pub mod playback;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod tools;

pub use error::{CaptureError, CodecError, DecodeError, PlaybackError, ProtocolError, RelayError, SessionError, ToolError};
pub use media::{AudioChunk, AudioDirection, VideoFrame};
pub use playback::Playback;
pub use session::{Endpoint, MediaSender, Session, SessionConfig, SessionEvent, SessionState};
pub use tools::{Illustration, Illustrator, ToolDispatcher};
