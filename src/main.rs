//! talelive - narrate a story over a live audio session.
//!
//! Speaks to the Live endpoint either through a relay (the default) or
//! directly with an API key, plays model audio through the chosen output and
//! streams microphone, WAV or image input back.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info, warn};

use talelive::capture::{spawn_audio_capture, spawn_video_capture, CaptureHandle, StillImageSource, VideoCaptureConfig, WavFileSource};
use talelive::media::{DEFAULT_CHUNK_SAMPLES, OUTPUT_SAMPLE_RATE};
use talelive::playback::{DeviceHandle, MixerRenderer, NullDevice, WavDevice};
use talelive::session::DEFAULT_RELAY_URL;
use talelive::{Endpoint, Playback, Session, SessionConfig, SessionEvent, SessionState};

/// Live story narration client
#[derive(Parser, Debug)]
#[command(name = "talelive")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Relay to connect through
    #[arg(long, env = "TALELIVE_RELAY_URL", default_value = DEFAULT_RELAY_URL)]
    relay_url: String,

    /// Connect straight to the Live API with this key instead of the relay
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = "LIVE_MODEL")]
    model: Option<String>,

    #[arg(long, env = "LIVE_VOICE")]
    voice: Option<String>,

    /// Story text to narrate
    #[arg(long, value_name = "FILE")]
    story: Option<PathBuf>,

    /// Send one text turn once the session is ready
    #[arg(long)]
    text: Option<String>,

    /// Stream a WAV file as microphone input
    #[arg(long, value_name = "FILE")]
    wav: Option<PathBuf>,

    /// Send this image as the video stream
    #[arg(long, value_name = "FILE")]
    image: Option<PathBuf>,

    /// Seconds between video frames (1-4)
    #[arg(long, default_value_t = 1)]
    frame_interval: u64,

    /// Stream the primary monitor
    #[cfg(feature = "screen")]
    #[arg(long)]
    screen: bool,

    /// Record from the default PulseAudio source
    #[cfg(feature = "pulse")]
    #[arg(long)]
    mic: bool,

    /// Play through the default PulseAudio sink
    #[cfg(feature = "pulse")]
    #[arg(long)]
    speaker: bool,

    /// Write model audio to a WAV file
    #[arg(long, value_name = "FILE")]
    record: Option<PathBuf>,

    /// Seconds to wait for the server to confirm setup
    #[arg(long, default_value_t = 10)]
    setup_timeout: u64,
}

impl Cli {
    fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let mut config = match &self.story {
            Some(path) => {
                let story = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
                SessionConfig::narrator(&story)
            }
            None => SessionConfig::default(),
        };
        config = match &self.api_key {
            Some(key) => config.with_endpoint(Endpoint::api_key(key.clone())),
            None => config.with_endpoint(Endpoint::relay(self.relay_url.clone())),
        };
        if let Some(model) = &self.model {
            config = config.with_model(model.clone());
        }
        if let Some(voice) = &self.voice {
            config = config.with_voice(voice.clone());
        }
        Ok(config.with_setup_timeout(Duration::from_secs(self.setup_timeout)))
    }

    fn start_output(&self, renderer: MixerRenderer) -> anyhow::Result<DeviceHandle> {
        if let Some(path) = &self.record {
            info!("Recording model audio to {}", path.display());
            return Ok(WavDevice::new(path.clone()).spawn(renderer)?);
        }
        #[cfg(feature = "pulse")]
        if self.speaker {
            return Ok(talelive::playback::PulseDevice::spawn("talelive", renderer)?);
        }
        Ok(NullDevice::spawn(renderer)?)
    }

    fn start_capture(&self, session: &Session) -> anyhow::Result<Vec<CaptureHandle>> {
        let mut handles = Vec::new();

        if let Some(path) = &self.wav {
            let source = WavFileSource::open(path)?;
            handles.push(spawn_audio_capture(source, DEFAULT_CHUNK_SAMPLES, session.media_sender())?);
        }
        #[cfg(feature = "pulse")]
        if self.mic {
            if self.wav.is_some() {
                bail!("--mic and --wav are mutually exclusive");
            }
            let source = talelive::capture::PulseMicrophone::open("talelive", None)?;
            handles.push(spawn_audio_capture(source, DEFAULT_CHUNK_SAMPLES, session.media_sender())?);
        }

        let video = VideoCaptureConfig::default().with_interval(Duration::from_secs(self.frame_interval));
        if let Some(path) = &self.image {
            let source = StillImageSource::open(path)?;
            handles.push(spawn_video_capture(source, video, session.media_sender())?);
        }
        #[cfg(feature = "screen")]
        if self.screen {
            if self.image.is_some() {
                bail!("--screen and --image are mutually exclusive");
            }
            let source = talelive::capture::ScreenSource::primary()?;
            handles.push(spawn_video_capture(source, video, session.media_sender())?);
        }
        Ok(handles)
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Ready { session_id } => println!("[ready] session {session_id}"),
        SessionEvent::Transcript { direction, fragment, .. } => println!("[{direction:?}] {fragment}"),
        SessionEvent::TurnComplete { input, output } => {
            if !input.is_empty() {
                println!("[you] {input}");
            }
            if !output.is_empty() {
                println!("[narrator] {output}");
            }
        }
        SessionEvent::ModelText(text) => println!("[text] {text}"),
        SessionEvent::Interrupted => println!("[interrupted]"),
        SessionEvent::ToolCalled { name, .. } => println!("[tool] {name}"),
        SessionEvent::BadgeAwarded { badge_id } => println!("[badge] {badge_id}"),
        SessionEvent::ChoicesPresented { prompt, choices } => {
            if let Some(prompt) = prompt {
                println!("[choices] {prompt}");
            }
            for (n, choice) in choices.iter().enumerate() {
                println!("  {}. {}", n + 1, choice);
            }
        }
        SessionEvent::IllustrationReady { prompt, .. } => println!("[illustration] {prompt}"),
        SessionEvent::GoAway { time_left } => {
            println!("[go away] {}", time_left.as_deref().unwrap_or("soon"))
        }
        SessionEvent::Error { reason } => println!("[error] {reason}"),
        SessionEvent::Closed => println!("[closed]"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.session_config()?;
    info!("Connecting to {}", config.endpoint.redacted());

    let (playback, renderer) = Playback::mixer(OUTPUT_SAMPLE_RATE);
    let device = cli.start_output(renderer)?;

    let mut session = Session::new(config, playback);
    let mut events = session.take_events().context("event stream already taken")?;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    session.connect().await?;
    let captures = cli.start_capture(&session)?;

    if let Some(text) = &cli.text {
        session.send_text(text.clone())?;
    }

    let finished = tokio::select! {
        state = session.finished() => Some(state),
        _ = tokio::signal::ctrl_c() => None,
    };
    let outcome = match finished {
        Some(state) => state,
        None => {
            info!("Interrupted, closing session");
            if let Err(e) = session.close().await {
                warn!("Close failed: {}", e);
            }
            session.state()
        }
    };

    for handle in captures {
        handle.stop();
        let name = handle.name();
        if let Err(e) = handle.join() {
            warn!("{} capture ended with: {}", name, e);
        }
    }
    drop(session);
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;

    if let Err(e) = device.join() {
        error!("Audio output failed: {}", e);
    }

    match outcome {
        SessionState::Error { reason } => bail!("session failed: {reason}"),
        state => {
            info!("Session ended: {}", state);
            Ok(())
        }
    }
}
