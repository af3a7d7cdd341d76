//! QuizCall coordinates a two-party trivia call. It should handle the
//! following:
//! - establishing the peer connection through a shared session document
//! - mirroring shared state (unmute lock, playback, captions, grading)
//! - reading questions aloud and arbitrating who may produce audio
//! - capturing a spoken answer during an unmute window and grading it
//!
use async_trait::async_trait;
use derive_more::Display;
use futures::stream::BoxStream;

use crate::error::Error;

pub mod session;

use session::{AnswerValidation, SessionId, TtsStatus};

/// Provides two-party trivia call sessions
#[async_trait]
pub trait QuizCall {
    // ------ Misc ------
    /// The event stream notifies the UI of session related events
    async fn get_event_stream(&mut self) -> Result<QuizCallEventStream, Error>;

    // ------ Create/Join a session ------

    /// capture local media and prime the question pool. must be called
    /// before start_session or join_session.
    async fn enable_media(&mut self) -> Result<(), Error>;
    /// create a session and produce the offer. returns the identifier the
    /// other party joins with. only one session may be active at a time.
    async fn start_session(&mut self) -> Result<SessionId, Error>;
    /// join a session created by the other party. the session must already
    /// carry an offer.
    async fn join_session(&mut self, session: SessionId) -> Result<(), Error>;
    /// end the current session and release media. safe to call when no
    /// session is active.
    async fn hang_up(&mut self) -> Result<(), Error>;

    // ------ Turn controls ------

    /// read the next question aloud
    async fn read_question(&mut self) -> Result<(), Error>;
    /// stop playback and discard any paused position
    async fn stop_reading(&mut self) -> Result<(), Error>;
    /// claim the shared unmute window to speak an answer
    async fn request_unmute(&mut self) -> Result<(), Error>;

    // ------ Utility Functions ------

    /// Returns the ID of the current session, or None if
    /// a session is not in progress
    fn current_session(&self) -> Option<SessionId>;
}

/// Drives the UI
#[derive(Clone, Debug, Display, PartialEq)]
pub enum QuizCallEventKind {
    /// A session was created and is waiting for the other party
    #[display(fmt = "SessionStarted")]
    SessionStarted { session: SessionId },
    /// Joined a session created by the other party
    #[display(fmt = "SessionJoined")]
    SessionJoined { session: SessionId },
    /// The session ended locally
    #[display(fmt = "SessionEnded")]
    SessionEnded,
    /// The peer connection reached the connected state
    #[display(fmt = "PeerConnected")]
    PeerConnected,
    /// The peer connection dropped
    #[display(fmt = "PeerDisconnected")]
    PeerDisconnected,
    /// The peer added a media track
    #[display(fmt = "RemoteTrackAdded")]
    RemoteTrackAdded { kind: String },
    /// A question is being read aloud on this device
    #[display(fmt = "QuestionReading")]
    QuestionReading { text: String },
    /// Playback finished on its own
    #[display(fmt = "ReadingFinished")]
    ReadingFinished,
    /// Playback was stopped explicitly
    #[display(fmt = "ReadingStopped")]
    ReadingStopped,
    /// Playback failed
    #[display(fmt = "ReadingFailed")]
    ReadingFailed { reason: String },
    /// Playback resumed after an interruption
    #[display(fmt = "ReadingResumed")]
    ReadingResumed { offset: usize },
    /// The shared playback record changed
    #[display(fmt = "TtsStateChanged")]
    TtsStateChanged { status: TtsStatus },
    /// An unmute window opened; `local` is true when this device holds it
    #[display(fmt = "UnmuteWindowOpened")]
    UnmuteWindowOpened { local: bool },
    /// Seconds left in the current unmute window
    #[display(fmt = "UnmuteCountdown")]
    UnmuteCountdown { seconds_left: u32 },
    /// The unmute window closed
    #[display(fmt = "UnmuteWindowClosed")]
    UnmuteWindowClosed,
    /// This device lost the race for the unmute window; its UI should revert
    #[display(fmt = "UnmuteDenied")]
    UnmuteDenied,
    /// Captions changed. interim captions are local-only and not yet shared
    #[display(fmt = "CaptionsUpdated")]
    CaptionsUpdated { text: String, interim: bool },
    /// Captions aged out
    #[display(fmt = "CaptionsCleared")]
    CaptionsCleared,
    /// A spoken answer was graded
    #[display(fmt = "AnswerGraded")]
    AnswerGraded { validation: AnswerValidation },
}

pub struct QuizCallEventStream(pub BoxStream<'static, QuizCallEventKind>);

impl core::ops::Deref for QuizCallEventStream {
    type Target = BoxStream<'static, QuizCallEventKind>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for QuizCallEventStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
