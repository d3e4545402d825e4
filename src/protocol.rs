//! Live API wire protocol.
//!
//! Client messages are serialized as an externally tagged enum so each one
//! lands as `{"setup": {...}}`, `{"realtime_input": {...}}` and so on.
//! Server messages are parsed into a flat list of [`Inbound`] events; the
//! service accepts and emits both camelCase and snake_case field names, so
//! every inbound field carries a snake_case alias.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::codec;
use crate::error::ProtocolError;
use crate::media::{AudioChunk, VideoFrame};

/// Response modality requested in the setup message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modality {
    #[serde(rename = "AUDIO")]
    Audio,
    #[serde(rename = "TEXT")]
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
}

impl SpeechConfig {
    pub fn voice(name: impl Into<String>) -> Self {
        Self {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: name.into(),
                },
            },
            language_code: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<TextPart>,
}

impl Content {
    pub fn text(role: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            role: role.map(str::to_string),
            parts: vec![TextPart { text: text.into() }],
        }
    }
}

/// Presence enables transcription; the service takes an empty object.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TranscriptionConfig {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDeclarations {
    #[serde(rename = "functionDeclarations")]
    pub function_declarations: Vec<FunctionDeclaration>,
}

/// Session setup message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<TranscriptionConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDeclarations>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

/// Streamed media. Audio goes in `media_chunks`, frames in `media`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RealtimeInput {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_chunks: Vec<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<Blob>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

/// Message sent from client to server.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
    ToolResponse(ToolResponse),
}

impl ClientMessage {
    pub fn audio(chunk: &AudioChunk) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: chunk.mime_type(),
                data: codec::encode_pcm_base64(chunk.samples()),
            }],
            media: None,
        })
    }

    pub fn frame(frame: &VideoFrame) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: Vec::new(),
            media: Some(Blob {
                mime_type: frame.mime_type().to_string(),
                data: codec::encode_base64(&frame.jpeg),
            }),
        })
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::ClientContent(ClientContent {
            turns: vec![Content::text(Some("user"), text)],
            turn_complete: true,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Setup(_) => "setup",
            Self::RealtimeInput(input) if input.media.is_some() => "video",
            Self::RealtimeInput(_) => "audio",
            Self::ClientContent(_) => "text",
            Self::ToolResponse(_) => "tool_response",
        }
    }
}

/// A function call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptDirection {
    Input,
    Output,
}

/// One demultiplexed unit of server traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    SetupComplete,
    /// Base64 PCM, decoded by the session so decode errors stay local.
    Audio {
        data: String,
        mime_type: Option<String>,
    },
    Text(String),
    Transcript {
        direction: TranscriptDirection,
        text: String,
    },
    TurnComplete,
    Interrupted,
    ToolCall(Vec<FunctionCall>),
    ToolCallCancellation(Vec<String>),
    GoAway {
        time_left: Option<String>,
    },
    Error(String),
}

/// Most frames carry one or two events.
pub type InboundBatch = SmallVec<[Inbound; 4]>;

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerEnvelope {
    #[serde(default, alias = "setup_complete")]
    setup_complete: Option<serde_json::Value>,
    #[serde(default, alias = "server_content")]
    server_content: Option<ServerContent>,
    #[serde(default, alias = "tool_call")]
    tool_call: Option<ToolCallPayload>,
    #[serde(default, alias = "tool_call_cancellation")]
    tool_call_cancellation: Option<ToolCallCancellation>,
    #[serde(default, alias = "go_away")]
    go_away: Option<GoAway>,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default, alias = "usage_metadata")]
    usage_metadata: Option<serde_json::Value>,
    #[serde(default, alias = "session_resumption_update")]
    session_resumption_update: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default, alias = "model_turn")]
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default, alias = "turn_complete")]
    turn_complete: bool,
    #[serde(default, alias = "input_transcription")]
    input_transcription: Option<TranscriptionFragment>,
    #[serde(default, alias = "output_transcription")]
    output_transcription: Option<TranscriptionFragment>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<ServerPart>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerPart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, alias = "inline_data")]
    inline_data: Option<InlineData>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default, alias = "mime_type")]
    mime_type: Option<String>,
    data: String,
}

#[derive(Debug, Deserialize, Default)]
struct TranscriptionFragment {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ToolCallPayload {
    #[serde(default, alias = "function_calls")]
    function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Deserialize, Default)]
struct ToolCallCancellation {
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    #[serde(default, alias = "time_left")]
    time_left: Option<String>,
}

/// Parse one server frame into its events, in processing order.
///
/// Within a server-content envelope the interruption flag is emitted first
/// so stale audio is cleared before anything carried alongside it.
pub fn parse_server_message(text: &str) -> Result<InboundBatch, ProtocolError> {
    let envelope: ServerEnvelope = serde_json::from_str(text)?;
    let mut out = InboundBatch::new();

    if envelope.setup_complete.is_some() {
        out.push(Inbound::SetupComplete);
    }

    if let Some(content) = envelope.server_content {
        if content.interrupted {
            out.push(Inbound::Interrupted);
        }
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if part.thought {
                    continue;
                }
                if let Some(inline) = part.inline_data {
                    out.push(Inbound::Audio {
                        data: inline.data,
                        mime_type: inline.mime_type,
                    });
                } else if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    out.push(Inbound::Text(text));
                }
            }
        }
        if let Some(text) = content.input_transcription.and_then(|t| t.text).filter(|t| !t.is_empty()) {
            out.push(Inbound::Transcript {
                direction: TranscriptDirection::Input,
                text,
            });
        }
        if let Some(text) = content.output_transcription.and_then(|t| t.text).filter(|t| !t.is_empty()) {
            out.push(Inbound::Transcript {
                direction: TranscriptDirection::Output,
                text,
            });
        }
        if content.turn_complete {
            out.push(Inbound::TurnComplete);
        }
    }

    if let Some(call) = envelope.tool_call {
        out.push(Inbound::ToolCall(call.function_calls));
    }

    if let Some(cancel) = envelope.tool_call_cancellation {
        out.push(Inbound::ToolCallCancellation(cancel.ids));
    }

    if let Some(go_away) = envelope.go_away {
        out.push(Inbound::GoAway {
            time_left: go_away.time_left,
        });
    }

    if let Some(error) = envelope.error {
        let reason = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        out.push(Inbound::Error(reason));
    }

    let bookkeeping_only = envelope.usage_metadata.is_some() || envelope.session_resumption_update.is_some();
    if out.is_empty() && !bookkeeping_only {
        let preview: String = text.chars().take(120).collect();
        return Err(ProtocolError::Unrecognized(preview));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn setup_serializes_under_setup_key() {
        let setup = Setup {
            model: "models/gemini-live-2.5-flash-native-audio".to_string(),
            generation_config: GenerationConfig {
                response_modalities: vec![Modality::Audio],
                speech_config: Some(SpeechConfig::voice("Kore")),
                temperature: None,
            },
            system_instruction: Some(Content::text(None, "Be kind.")),
            input_audio_transcription: Some(TranscriptionConfig {}),
            output_audio_transcription: None,
            tools: vec![ToolDeclarations {
                function_declarations: vec![FunctionDeclaration {
                    name: "awardBadge".to_string(),
                    description: "Award a badge".to_string(),
                    parameters: json!({"type": "object"}),
                }],
            }],
        };

        let value: serde_json::Value = serde_json::from_str(&ClientMessage::Setup(setup).to_json().unwrap()).unwrap();
        assert_eq!(value["setup"]["model"], "models/gemini-live-2.5-flash-native-audio");
        assert_eq!(value["setup"]["generation_config"]["response_modalities"][0], "AUDIO");
        assert_eq!(
            value["setup"]["generation_config"]["speech_config"]["voice_config"]["prebuilt_voice_config"]["voice_name"],
            "Kore"
        );
        assert_eq!(value["setup"]["input_audio_transcription"], json!({}));
        assert!(value["setup"].get("output_audio_transcription").is_none());
        assert_eq!(value["setup"]["tools"][0]["functionDeclarations"][0]["name"], "awardBadge");
        assert_eq!(value["setup"]["system_instruction"]["parts"][0]["text"], "Be kind.");
    }

    #[test]
    fn audio_and_frame_messages() {
        let chunk = AudioChunk::capture(vec![1, -1]);
        let value: serde_json::Value = serde_json::from_str(&ClientMessage::audio(&chunk).to_json().unwrap()).unwrap();
        assert_eq!(value["realtime_input"]["media_chunks"][0]["mime_type"], "audio/pcm;rate=16000");
        assert_eq!(value["realtime_input"]["media_chunks"][0]["data"], codec::encode_pcm_base64(&[1, -1]));
        assert!(value["realtime_input"].get("media").is_none());

        let frame = VideoFrame {
            jpeg: vec![0xFF, 0xD8, 0xFF],
            width: 320,
            height: 240,
            quality: 50,
            captured_at: std::time::Instant::now(),
        };
        let msg = ClientMessage::frame(&frame);
        assert_eq!(msg.kind(), "video");
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["realtime_input"]["media"]["mime_type"], "image/jpeg");
        assert_eq!(value["realtime_input"]["media"]["data"], "/9j/");
    }

    #[test]
    fn text_turn_and_tool_response() {
        let value: serde_json::Value = serde_json::from_str(&ClientMessage::user_text("left door").to_json().unwrap()).unwrap();
        assert_eq!(value["client_content"]["turns"][0]["parts"][0]["text"], "left door");
        assert_eq!(value["client_content"]["turn_complete"], true);

        let msg = ClientMessage::ToolResponse(ToolResponse {
            function_responses: vec![FunctionResponse {
                id: "42".to_string(),
                name: "awardBadge".to_string(),
                response: json!({"result": "Awarded"}),
            }],
        });
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"tool_response": {"function_responses": [{"id": "42", "name": "awardBadge", "response": {"result": "Awarded"}}]}})
        );
    }

    #[test]
    fn server_content_demux_order() {
        let text = json!({
            "serverContent": {
                "interrupted": true,
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAAA"}},
                    {"text": "hello"},
                    {"text": "pondering", "thought": true}
                ]},
                "outputTranscription": {"text": "hel"},
                "turnComplete": true
            }
        })
        .to_string();

        let events = parse_server_message(&text).unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(events[0], Inbound::Interrupted);
        assert!(matches!(&events[1], Inbound::Audio { data, mime_type: Some(m) } if data == "AAAA" && m == "audio/pcm;rate=24000"));
        assert_eq!(events[2], Inbound::Text("hello".to_string()));
        assert_eq!(
            events[3],
            Inbound::Transcript {
                direction: TranscriptDirection::Output,
                text: "hel".to_string()
            }
        );
        assert_eq!(events[4], Inbound::TurnComplete);
    }

    #[test]
    fn snake_case_envelopes_are_accepted() {
        let events = parse_server_message(r#"{"setup_complete": {}}"#).unwrap();
        assert_eq!(events.as_slice(), &[Inbound::SetupComplete]);

        let events = parse_server_message(
            r#"{"tool_call": {"function_calls": [{"id": "7", "name": "presentChoices", "args": {"choices": ["a"]}}]}}"#,
        )
        .unwrap();
        match &events[0] {
            Inbound::ToolCall(calls) => {
                assert_eq!(calls[0].id, "7");
                assert_eq!(calls[0].args["choices"][0], "a");
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn unknown_shapes_are_protocol_errors() {
        assert!(matches!(parse_server_message(r#"{"mystery": 1}"#), Err(ProtocolError::Unrecognized(_))));
        assert!(matches!(parse_server_message("not json"), Err(ProtocolError::Malformed(_))));
        assert!(parse_server_message(r#"{"usageMetadata": {"totalTokenCount": 5}}"#).unwrap().is_empty());
    }

    #[test]
    fn go_away_and_error() {
        let events = parse_server_message(r#"{"goAway": {"timeLeft": "10s"}}"#).unwrap();
        assert_eq!(events[0], Inbound::GoAway { time_left: Some("10s".to_string()) });

        let events = parse_server_message(r#"{"error": {"code": 400, "message": "bad setup"}}"#).unwrap();
        assert_eq!(events[0], Inbound::Error("bad setup".to_string()));
    }
}
