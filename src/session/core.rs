//! Synchronous half of the session control loop.
//!
//! `SessionCore` consumes inbound frames and local commands one at a time and
//! never touches the socket. Anything that has to go out lands in the outbox,
//! and tool calls are queued for the loop to run, so all of the session's
//! behaviour can be exercised without a network.

use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::events::SessionEvent;
use super::transcript::TranscriptAccumulator;
use crate::codec::{decode_pcm_base64, pcm_rate_from_mime};
use crate::error::{DecodeError, ProtocolError};
use crate::media::{AudioChunk, VideoFrame, OUTPUT_SAMPLE_RATE};
use crate::playback::{PlaybackScheduler, SourceId};
use crate::protocol::{parse_server_message, ClientMessage, FunctionCall, Inbound, ToolResponse};

/// Work queued for the transport by producers.
#[derive(Debug, Clone)]
pub enum Outbound {
    Audio(AudioChunk),
    Frame(VideoFrame),
    Text(String),
}

pub struct SessionCore {
    scheduler: PlaybackScheduler,
    transcript: TranscriptAccumulator,
    events: UnboundedSender<SessionEvent>,
    outbox: Vec<Message>,
    tool_calls: Vec<Vec<FunctionCall>>,
    failure: Option<String>,
}

impl SessionCore {
    /// Events go straight to `events`; wire messages collect in the outbox.
    pub fn new(scheduler: PlaybackScheduler, events: UnboundedSender<SessionEvent>) -> Self {
        Self {
            scheduler,
            transcript: TranscriptAccumulator::default(),
            events,
            outbox: Vec::new(),
            tool_calls: Vec::new(),
            failure: None,
        }
    }

    /// A text frame from the server.
    pub fn on_text(&mut self, text: &str) {
        match parse_server_message(text) {
            Ok(batch) => {
                for inbound in batch {
                    self.on_inbound(inbound);
                }
            }
            Err(e) => warn!("Ignoring server message: {}", e),
        }
    }

    /// The service sometimes delivers JSON in binary frames.
    pub fn on_binary(&mut self, bytes: &[u8]) {
        match std::str::from_utf8(bytes) {
            Ok(text) => self.on_text(text),
            Err(_) => warn!("Ignoring server message: {}", ProtocolError::NotJson(bytes.len())),
        }
    }

    pub fn on_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::SetupComplete => debug!("Duplicate setupComplete ignored"),
            Inbound::Audio { data, mime_type } => {
                if let Err(e) = self.play(&data, mime_type.as_deref()) {
                    warn!("Dropping audio chunk: {}", e);
                }
            }
            Inbound::Text(text) => self.emit(SessionEvent::ModelText(text)),
            Inbound::Transcript { direction, text } => {
                let text_so_far = self.transcript.append(direction, &text).to_string();
                self.emit(SessionEvent::Transcript {
                    direction,
                    fragment: text,
                    text_so_far,
                });
            }
            Inbound::TurnComplete => {
                let (input, output) = self.transcript.finish_turn();
                debug!("Turn complete");
                self.emit(SessionEvent::TurnComplete { input, output });
            }
            Inbound::Interrupted => {
                info!("Server interrupted playback");
                self.interrupt();
            }
            Inbound::ToolCall(calls) => {
                debug!("Queueing {} tool call(s)", calls.len());
                self.tool_calls.push(calls);
            }
            Inbound::ToolCallCancellation(ids) => {
                // Responses for these ids are still sent when their handlers finish
                info!("Server cancelled tool calls {:?}", ids);
            }
            Inbound::GoAway { time_left } => {
                warn!("Server going away (time left: {:?})", time_left);
                self.emit(SessionEvent::GoAway { time_left });
            }
            Inbound::Error(reason) => {
                self.failure.get_or_insert(reason);
            }
        }
    }

    fn play(&mut self, data: &str, mime_type: Option<&str>) -> Result<(), DecodeError> {
        let rate = mime_type.and_then(pcm_rate_from_mime).unwrap_or(OUTPUT_SAMPLE_RATE);
        if rate == 0 {
            return Err(DecodeError::SampleRate(rate));
        }
        let samples = decode_pcm_base64(data)?;
        self.scheduler.enqueue(samples, rate);
        Ok(())
    }

    /// Silence everything queued so far.
    pub fn interrupt(&mut self) {
        self.scheduler.interrupt();
        self.emit(SessionEvent::Interrupted);
    }

    /// Stop playback without announcing it, used when the session winds down.
    pub fn stop_playback(&mut self) {
        self.scheduler.interrupt();
    }

    /// A playback source ran to its end.
    pub fn on_source_finished(&mut self, id: SourceId) {
        self.scheduler.on_source_finished(id);
    }

    /// Encode locally produced media or text for the server.
    pub fn on_outbound(&mut self, item: Outbound) {
        let message = match item {
            Outbound::Audio(chunk) => ClientMessage::audio(&chunk),
            Outbound::Frame(frame) => ClientMessage::frame(&frame),
            Outbound::Text(text) => ClientMessage::user_text(text),
        };
        self.push(&message);
    }

    pub fn on_tool_response(&mut self, response: ToolResponse) {
        debug!("Sending {} tool response(s)", response.function_responses.len());
        self.push(&ClientMessage::ToolResponse(response));
    }

    fn push(&mut self, message: &ClientMessage) {
        match message.to_json() {
            Ok(json) => self.outbox.push(Message::text(json)),
            Err(e) => warn!("Failed to serialize {} message: {}", message.kind(), e),
        }
    }

    /// Messages to write to the socket, oldest first.
    pub fn take_outbox(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbox)
    }

    /// One batch per `toolCall` message, in arrival order.
    pub fn take_tool_calls(&mut self) -> Vec<Vec<FunctionCall>> {
        std::mem::take(&mut self.tool_calls)
    }

    /// Set once the server reported an error; the session must end.
    pub fn take_failure(&mut self) -> Option<String> {
        self.failure.take()
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
