//! Live session: lifecycle, outbound media and the control loop.
//!
//! A [`Session`] owns at most one transport for its whole life. After the
//! setup handshake a single tokio task owns the socket and multiplexes, in
//! priority order, local commands, server frames, finished tool calls,
//! playback completions and queued media. Producers never touch the socket;
//! they hand work to the task through a bounded queue via [`MediaSender`].

mod config;
mod core;
mod events;
mod state;
mod transcript;
pub mod transport;

pub use self::config::{Endpoint, SessionConfig, DEFAULT_MODEL, DEFAULT_RELAY_URL, DEFAULT_VOICE, NARRATOR_SYSTEM_PROMPT};
pub use self::core::{Outbound, SessionCore};
pub use self::events::SessionEvent;
pub use self::state::SessionState;
pub use self::transcript::TranscriptAccumulator;

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::FuturesOrdered;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use self::transport::WsStream;
use crate::error::SessionError;
use crate::media::{AudioChunk, VideoFrame};
use crate::playback::{Playback, PlaybackScheduler, SourceId};
use crate::protocol::{parse_server_message, ClientMessage, Inbound, ToolResponse};
use crate::tools::{Illustrator, ToolDispatcher};

enum Control {
    Interrupt,
    Close,
}

/// Move to `next` unless the state is already terminal.
fn transition(state: &watch::Sender<SessionState>, next: SessionState) -> bool {
    state.send_if_modified(|current| {
        if current.is_terminal() || *current == next {
            return false;
        }
        debug!("Session state {} -> {}", current, next);
        *current = next;
        true
    })
}

/// Cloneable, non-blocking producer handle. Safe to use from capture threads.
#[derive(Clone)]
pub struct MediaSender {
    state: watch::Receiver<SessionState>,
    tx: mpsc::Sender<Outbound>,
}

impl MediaSender {
    /// Session state as this handle last saw it.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// True while media is accepted.
    pub fn is_active(&self) -> bool {
        self.state.borrow().is_active()
    }

    /// Queue a microphone chunk. Dropped with a warning if the queue is full.
    pub fn send_audio(&self, chunk: AudioChunk) -> Result<(), SessionError> {
        self.send_media(Outbound::Audio(chunk))
    }

    /// Queue a video frame. Dropped with a warning if the queue is full.
    pub fn send_frame(&self, frame: VideoFrame) -> Result<(), SessionError> {
        self.send_media(Outbound::Frame(frame))
    }

    /// Queue a synthetic user turn.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.ensure_active()?;
        self.tx.try_send(Outbound::Text(text.into())).map_err(|e| match e {
            TrySendError::Full(_) => SessionError::Backpressure,
            TrySendError::Closed(_) => SessionError::ChannelClosed,
        })
    }

    fn send_media(&self, item: Outbound) -> Result<(), SessionError> {
        self.ensure_active()?;
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue full, dropping media");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(SessionError::ChannelClosed),
        }
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        let state = self.state.borrow();
        if state.is_active() {
            Ok(())
        } else {
            Err(SessionError::NotActive(state.clone()))
        }
    }
}

pub struct Session {
    id: String,
    config: SessionConfig,
    state: Arc<watch::Sender<SessionState>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    media: MediaSender,
    media_rx: Option<mpsc::Receiver<Outbound>>,
    playback: Option<Playback>,
    tools: ToolDispatcher,
    control: Option<mpsc::UnboundedSender<Control>>,
    task: Option<JoinHandle<()>>,
}

impl Session {
    /// An idle session with a fresh random id. Nothing touches the network
    /// until [`Session::connect`]; `playback` is moved into the control loop
    /// at that point.
    pub fn new(config: SessionConfig, playback: Playback) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let mut tools = ToolDispatcher::default();
        tools.set_events(events_tx.clone());

        Self {
            id: format!("{:016x}", rand::random::<u64>()),
            config,
            state: Arc::new(state_tx),
            events_tx,
            events_rx: Some(events_rx),
            media: MediaSender {
                state: state_rx,
                tx: media_tx,
            },
            media_rx: Some(media_rx),
            playback: Some(playback),
            tools,
            control: None,
            task: None,
        }
    }

    /// Route `generateIllustration` calls to `illustrator`.
    pub fn with_illustrator(mut self, illustrator: Arc<dyn Illustrator>) -> Self {
        self.tools = ToolDispatcher::new(illustrator).with_events(self.events_tx.clone());
        self
    }

    /// Random 16-hex-digit id, also sent in [`SessionEvent::Ready`].
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Follow state transitions without polling.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// The event stream. Can be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.take()
    }

    /// A producer handle for capture threads.
    pub fn media_sender(&self) -> MediaSender {
        self.media.clone()
    }

    /// Tool state shared with the control loop, e.g. awarded badges.
    pub fn tools(&self) -> &ToolDispatcher {
        &self.tools
    }

    /// Open the transport, send setup and wait for the server to confirm it.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        let current = self.state();
        if current != SessionState::Idle {
            return Err(SessionError::InvalidState {
                op: "connect",
                state: current,
            });
        }
        let (Some(playback), Some(media_rx)) = (self.playback.take(), self.media_rx.take()) else {
            return Err(SessionError::InvalidState {
                op: "connect",
                state: current,
            });
        };

        transition(&self.state, SessionState::Connecting);
        info!("Session {} connecting to {}", self.id, self.config.endpoint.redacted());

        let (ws, early) = match self.handshake().await {
            Ok(connected) => connected,
            Err(e) => {
                let reason = match e {
                    SessionError::Connection(reason) => reason,
                    other => other.to_string(),
                };
                error!("Session {} failed to connect: {}", self.id, reason);
                transition(
                    &self.state,
                    SessionState::Error {
                        reason: reason.clone(),
                    },
                );
                let _ = self.events_tx.send(SessionEvent::Error {
                    reason: reason.clone(),
                });
                return Err(SessionError::Connection(reason));
            }
        };

        transition(&self.state, SessionState::Active);
        info!("Session {} active", self.id);
        let _ = self.events_tx.send(SessionEvent::Ready {
            session_id: self.id.clone(),
        });

        let scheduler = PlaybackScheduler::new(playback.output).with_lookahead(self.config.playback_lookahead);
        let mut core = SessionCore::new(scheduler, self.events_tx.clone());
        for inbound in early {
            core.on_inbound(inbound);
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let control_loop = ControlLoop {
            id: self.id.clone(),
            core,
            ws,
            control: control_rx,
            media: media_rx,
            completions: playback.completions,
            tools: self.tools.clone(),
            state: self.state.clone(),
            events: self.events_tx.clone(),
            close_timeout: self.config.close_timeout,
        };
        self.task = Some(tokio::spawn(control_loop.run()));
        self.control = Some(control_tx);
        Ok(())
    }

    async fn handshake(&self) -> Result<(WsStream, Vec<Inbound>), SessionError> {
        let endpoint = &self.config.endpoint;
        let mut ws = transport::connect(&endpoint.url(), endpoint.bearer_token()).await?;

        let tools = self.config.enable_tools.then(ToolDispatcher::declarations);
        let setup = ClientMessage::Setup(self.config.setup(tools));
        ws.send(Message::text(setup.to_json()?)).await?;
        debug!("Setup sent for model {}", self.config.model);

        match tokio::time::timeout(self.config.setup_timeout, await_setup_complete(&mut ws)).await {
            Ok(Ok(early)) => Ok((ws, early)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SessionError::Connection(format!(
                "setup not confirmed within {:?}",
                self.config.setup_timeout
            ))),
        }
    }

    pub fn send_audio(&self, chunk: AudioChunk) -> Result<(), SessionError> {
        self.media.send_audio(chunk)
    }

    pub fn send_frame(&self, frame: VideoFrame) -> Result<(), SessionError> {
        self.media.send_frame(frame)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.media.send_text(text)
    }

    /// Local barge-in: cut playback as if the server had interrupted.
    pub fn interrupt(&self) -> Result<(), SessionError> {
        self.media.ensure_active()?;
        match &self.control {
            Some(control) => control.send(Control::Interrupt).map_err(|_| SessionError::ChannelClosed),
            None => Err(SessionError::ChannelClosed),
        }
    }

    /// Stop playback, close the transport and wait for the loop to finish.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        let current = self.state();
        if current.is_terminal() {
            return Err(SessionError::InvalidState {
                op: "close",
                state: current,
            });
        }

        match self.control.take() {
            Some(control) => {
                transition(&self.state, SessionState::Closing);
                let _ = control.send(Control::Close);
                if let Some(task) = self.task.take() {
                    if let Err(e) = task.await {
                        warn!("Session {} loop ended abnormally: {}", self.id, e);
                    }
                }
                transition(&self.state, SessionState::Closed);
            }
            None => {
                transition(&self.state, SessionState::Closed);
                let _ = self.events_tx.send(SessionEvent::Closed);
            }
        }
        info!("Session {} closed", self.id);
        Ok(())
    }

    /// Resolves once the session reaches `Closed` or `Error`.
    pub async fn finished(&self) -> SessionState {
        let mut rx = self.state.subscribe();
        let result = rx.wait_for(SessionState::is_terminal).await.map(|state| (*state).clone());
        match result {
            Ok(state) => state,
            Err(_) => self.state(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(control) = self.control.take() {
            let _ = control.send(Control::Close);
        }
    }
}

async fn await_setup_complete(ws: &mut WsStream) -> Result<Vec<Inbound>, SessionError> {
    while let Some(frame) = ws.next().await {
        let text = match frame? {
            Message::Text(text) => text.as_str().to_owned(),
            Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => text.to_string(),
                Err(_) => continue,
            },
            Message::Close(frame) => {
                return Err(SessionError::Connection(format!(
                    "server closed the connection during setup{}",
                    describe_close(frame.as_ref())
                )))
            }
            _ => continue,
        };

        let batch = match parse_server_message(&text) {
            Ok(batch) => batch,
            Err(e) => {
                warn!("Ignoring server message during setup: {}", e);
                continue;
            }
        };
        let mut confirmed = false;
        let mut early = Vec::new();
        for inbound in batch {
            match inbound {
                Inbound::SetupComplete if !confirmed => confirmed = true,
                Inbound::Error(reason) => return Err(SessionError::Connection(reason)),
                other if confirmed => early.push(other),
                _ => debug!("Ignoring server message sent before setup completed"),
            }
        }
        if confirmed {
            return Ok(early);
        }
    }
    Err(SessionError::Connection(
        "connection closed before setup completed".to_string(),
    ))
}

fn describe_close(frame: Option<&CloseFrame>) -> String {
    match frame {
        Some(frame) if !frame.reason.is_empty() => format!(" ({}: {})", u16::from(frame.code), frame.reason.as_str()),
        Some(frame) => format!(" ({})", u16::from(frame.code)),
        None => String::new(),
    }
}

enum Exit {
    Close,
    Failed(String),
}

struct ControlLoop {
    id: String,
    core: SessionCore,
    ws: WsStream,
    control: mpsc::UnboundedReceiver<Control>,
    media: mpsc::Receiver<Outbound>,
    completions: mpsc::UnboundedReceiver<SourceId>,
    tools: ToolDispatcher,
    state: Arc<watch::Sender<SessionState>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    close_timeout: Duration,
}

impl ControlLoop {
    async fn run(self) {
        let ControlLoop {
            id,
            mut core,
            ws,
            mut control,
            mut media,
            mut completions,
            tools,
            state,
            events,
            close_timeout,
        } = self;
        let (mut sink, mut stream) = ws.split();
        // answered in the order the toolCall messages arrived
        let mut pending_tools: FuturesOrdered<JoinHandle<ToolResponse>> = FuturesOrdered::new();
        debug!("Session {} control loop started", id);

        let exit = 'run: loop {
            for message in core.take_outbox() {
                if let Err(e) = sink.send(message).await {
                    break 'run Exit::Failed(format!("send failed: {e}"));
                }
            }
            for calls in core.take_tool_calls() {
                let tools = tools.clone();
                pending_tools.push_back(tokio::spawn(async move { tools.dispatch_all(calls).await }));
            }
            if let Some(reason) = core.take_failure() {
                break 'run Exit::Failed(format!("server error: {reason}"));
            }

            tokio::select! {
                biased;

                command = control.recv() => match command {
                    Some(Control::Interrupt) => core.interrupt(),
                    Some(Control::Close) | None => break 'run Exit::Close,
                },

                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => core.on_text(text.as_str()),
                    Some(Ok(Message::Binary(bytes))) => core.on_binary(&bytes),
                    Some(Ok(Message::Close(frame))) => {
                        break 'run Exit::Failed(format!(
                            "server closed the connection{}",
                            describe_close(frame.as_ref())
                        ));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break 'run Exit::Failed(format!("transport error: {e}")),
                    None => break 'run Exit::Failed("transport closed".to_string()),
                },

                Some(joined) = pending_tools.next() => match joined {
                    Ok(response) => core.on_tool_response(response),
                    Err(e) => warn!("Session {}: tool batch lost: {}", id, e),
                },

                Some(source) = completions.recv() => core.on_source_finished(source),

                Some(item) = media.recv() => core.on_outbound(item),
            }
        };

        core.stop_playback();
        match exit {
            Exit::Close => {
                transition(&state, SessionState::Closing);
                if let Err(e) = sink.send(transport::normal_close()).await {
                    debug!("Close frame not sent: {}", e);
                }
                let confirmed = tokio::time::timeout(close_timeout, async {
                    while let Some(frame) = stream.next().await {
                        if matches!(frame, Ok(Message::Close(_)) | Err(_)) {
                            break;
                        }
                    }
                })
                .await
                .is_ok();
                if !confirmed {
                    warn!("Session {}: close not confirmed within {:?}", id, close_timeout);
                }
                transition(&state, SessionState::Closed);
                let _ = events.send(SessionEvent::Closed);
                info!("Session {} transport closed", id);
            }
            Exit::Failed(reason) => {
                error!("Session {} failed: {}", id, reason);
                transition(
                    &state,
                    SessionState::Error {
                        reason: reason.clone(),
                    },
                );
                let _ = events.send(SessionEvent::Error { reason });
                let _ = sink.close().await;
            }
        }
    }
}
