//! Session configuration and the setup message built from it.

use std::time::Duration;

use crate::playback::DEFAULT_LOOKAHEAD_SECS;
use crate::protocol::{Content, GenerationConfig, Modality, Setup, SpeechConfig, ToolDeclarations, TranscriptionConfig};

pub const DEFAULT_MODEL: &str = "models/gemini-live-2.5-flash-native-audio";
pub const DEFAULT_VOICE: &str = "Kore";
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8000/ws/proxy";

const GEMINI_LIVE_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

pub const NARRATOR_SYSTEM_PROMPT: &str = "You are a warm, patient, and imaginative narrator reading a children's story.

Your job:
1. Read the story text provided to you at the start of the session naturally and engagingly, as if telling it to a child aged 5-10.
2. You MUST pause and listen whenever the child speaks. They can interrupt you at any time (barge-in).
3. When the child asks a question or makes a comment, respond kindly and in simple language, then offer to continue the story.
4. Keep your voice gentle, expressive, and full of wonder. Use dramatic pauses and vary your pace.
5. Never lecture. If the child goes off-topic, gently steer back to the story in a fun way.
6. Speak in the same language the child uses.";

/// Where the session's WebSocket goes.
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    /// A relay that injects credentials and forwards frames verbatim.
    Relay { url: String },
    /// Straight to the public Live endpoint with an API key.
    ApiKey { key: String },
    /// Any endpoint that takes a bearer token.
    Bearer { url: String, token: String },
}

impl Endpoint {
    pub fn relay(url: impl Into<String>) -> Self {
        Self::Relay { url: url.into() }
    }

    pub fn api_key(key: impl Into<String>) -> Self {
        Self::ApiKey { key: key.into() }
    }

    pub fn url(&self) -> String {
        match self {
            Self::Relay { url } | Self::Bearer { url, .. } => url.clone(),
            Self::ApiKey { key } => format!("{GEMINI_LIVE_URL}?key={key}"),
        }
    }

    pub fn bearer_token(&self) -> Option<&str> {
        match self {
            Self::Bearer { token, .. } => Some(token),
            _ => None,
        }
    }

    /// URL safe for logs: query string stripped.
    pub fn redacted(&self) -> String {
        let url = self.url();
        match url.split_once('?') {
            Some((base, _)) => base.to_string(),
            None => url,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: Endpoint,
    pub model: String,
    pub voice: Option<String>,
    pub modality: Modality,
    pub system_instruction: Option<String>,
    pub temperature: Option<f32>,
    pub input_transcription: bool,
    pub output_transcription: bool,
    /// Advertise the story tools in the setup message.
    pub enable_tools: bool,
    pub setup_timeout: Duration,
    pub close_timeout: Duration,
    /// How far ahead of the output clock playback is scheduled, in seconds.
    pub playback_lookahead: f64,
    /// Capacity of the outbound media queue.
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::relay(DEFAULT_RELAY_URL),
            model: DEFAULT_MODEL.to_string(),
            voice: Some(DEFAULT_VOICE.to_string()),
            modality: Modality::Audio,
            system_instruction: None,
            temperature: None,
            input_transcription: true,
            output_transcription: true,
            enable_tools: true,
            setup_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(2),
            playback_lookahead: DEFAULT_LOOKAHEAD_SECS,
            outbound_capacity: 64,
        }
    }
}

impl SessionConfig {
    /// Story narration: the story text is embedded in the system instruction
    /// and the model opens by greeting the listener.
    pub fn narrator(story: &str) -> Self {
        let instruction = format!(
            "{NARRATOR_SYSTEM_PROMPT}\n\n--- STORY TO READ ---\n{story}\n--- END OF STORY ---\n\n\
             Begin by warmly greeting the child and then start reading the story from the beginning."
        );
        Self {
            system_instruction: Some(instruction),
            ..Self::default()
        }
    }

    /// Defaults overridden from `TALELIVE_RELAY_URL`, `GEMINI_API_KEY`
    /// (or `GOOGLE_API_KEY`), `LIVE_MODEL` and `LIVE_VOICE`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("TALELIVE_RELAY_URL") {
            config.endpoint = Endpoint::relay(url);
        } else if let Ok(key) = std::env::var("GEMINI_API_KEY").or_else(|_| std::env::var("GOOGLE_API_KEY")) {
            config.endpoint = Endpoint::api_key(key);
        }
        if let Ok(model) = std::env::var("LIVE_MODEL") {
            config.model = model;
        }
        if let Ok(voice) = std::env::var("LIVE_VOICE") {
            config.voice = Some(voice);
        }
        config
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    /// Fully-qualified model name for the Vertex AI endpoint.
    pub fn vertex_model(project: &str, location: &str, model: &str) -> String {
        let model = model.trim_start_matches("models/");
        format!("projects/{project}/locations/{location}/publishers/google/models/{model}")
    }

    /// Model names without a resource prefix get `models/`.
    fn qualified_model(&self) -> String {
        if self.model.contains('/') {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }

    pub(crate) fn setup(&self, tools: Option<ToolDeclarations>) -> Setup {
        let speech_config = match (self.modality, &self.voice) {
            (Modality::Audio, Some(voice)) => Some(SpeechConfig::voice(voice.clone())),
            _ => None,
        };
        Setup {
            model: self.qualified_model(),
            generation_config: GenerationConfig {
                response_modalities: vec![self.modality],
                speech_config,
                temperature: self.temperature,
            },
            system_instruction: self.system_instruction.as_ref().map(|text| Content::text(None, text.clone())),
            input_audio_transcription: self.input_transcription.then(TranscriptionConfig::default),
            output_audio_transcription: self.output_transcription.then(TranscriptionConfig::default),
            tools: tools.into_iter().collect(),
        }
    }
}
