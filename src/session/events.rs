use crate::protocol::TranscriptDirection;
use crate::tools::Illustration;

/// Notifications for the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Setup acknowledged; media may flow.
    Ready { session_id: String },
    Transcript {
        direction: TranscriptDirection,
        fragment: String,
        /// Everything heard in this direction since the last turn boundary.
        text_so_far: String,
    },
    TurnComplete { input: String, output: String },
    ModelText(String),
    /// Playback was cut short, by the server or locally.
    Interrupted,
    ToolCalled { id: String, name: String },
    BadgeAwarded { badge_id: String },
    ChoicesPresented { prompt: Option<String>, choices: Vec<String> },
    IllustrationReady { prompt: String, illustration: Illustration },
    /// The server will drop the connection soon.
    GoAway { time_left: Option<String> },
    Error { reason: String },
    Closed,
}
