//! Speech engine seams: synthesis for reading questions aloud and
//! continuous recognition for capturing spoken answers. Engines run on
//! their own schedule; completion and failure arrive on event streams.

use async_trait::async_trait;
use derive_more::Display;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::Error;

/// Parameters for one synthesized utterance.
#[derive(Clone, Debug, PartialEq)]
pub struct Utterance {
    pub id: Uuid,
    pub text: String,
    /// Playback rate, 1.0 is the engine default.
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
    pub lang: String,
    /// Voice name, or None for the engine default.
    pub voice: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoiceInfo {
    pub name: String,
    pub lang: String,
}

/// Best-effort voice selection: the first preference found among the
/// available voices, then any English voice that sounds reasonable, then
/// whatever the engine lists first.
pub fn pick_voice<'a>(voices: &'a [VoiceInfo], preferences: &[String]) -> Option<&'a VoiceInfo> {
    preferences
        .iter()
        .find_map(|wanted| voices.iter().find(|v| v.name.contains(wanted.as_str())))
        .or_else(|| {
            voices.iter().find(|v| {
                v.lang.starts_with("en")
                    && (v.name.contains("Female") || v.name.contains("natural"))
            })
        })
        .or_else(|| voices.first())
}

#[derive(Clone, Debug, Display, PartialEq, Eq)]
pub enum SynthesizerEvent {
    /// The engine began playing the utterance
    #[display(fmt = "Started")]
    Started { utterance: Uuid },
    /// The utterance ran to its natural end. Not emitted for cancelled
    /// utterances
    #[display(fmt = "Finished")]
    Finished { utterance: Uuid },
    /// The utterance could not be played
    #[display(fmt = "Failed")]
    Failed { utterance: Uuid, reason: String },
}

pub struct SynthesizerEventStream(pub BoxStream<'static, SynthesizerEvent>);

impl core::ops::Deref for SynthesizerEventStream {
    type Target = BoxStream<'static, SynthesizerEvent>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for SynthesizerEventStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Text-to-speech engine.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn voices(&self) -> Result<Vec<VoiceInfo>, Error>;
    /// Queues the utterance for playback. Start and finish arrive on the
    /// event stream.
    async fn speak(&self, utterance: Utterance) -> Result<(), Error>;
    /// Stops playback and flushes anything queued. Idempotent.
    async fn cancel(&self) -> Result<(), Error>;
    /// Halts playback without flushing. Engines that cannot pause reliably
    /// may implement this as cancel; the session layer re-speaks from an
    /// estimated offset instead of trusting engine resume.
    async fn pause(&self) -> Result<(), Error>;
    async fn get_event_stream(&self) -> Result<SynthesizerEventStream, Error>;
}

#[derive(Clone, Debug, Display, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    /// The engine heard nothing. Expected while nobody speaks; never
    /// restarts the recognizer
    #[display(fmt = "NoSpeech")]
    NoSpeech,
    #[display(fmt = "Aborted")]
    Aborted,
    #[display(fmt = "AudioCapture")]
    AudioCapture,
    #[display(fmt = "Network")]
    Network,
    #[display(fmt = "NotAllowed")]
    NotAllowed,
    #[display(fmt = "Other")]
    Other(String),
}

#[derive(Clone, Debug, Display, PartialEq, Eq)]
pub enum RecognizerEvent {
    /// Interim transcript, may still change
    #[display(fmt = "Partial")]
    Partial { text: String },
    /// Final transcript for one phrase
    #[display(fmt = "Final")]
    Final { text: String },
    /// The engine stopped on its own
    #[display(fmt = "Ended")]
    Ended,
    #[display(fmt = "Failed")]
    Failed { kind: RecognitionErrorKind },
}

pub struct RecognizerEventStream(pub BoxStream<'static, RecognizerEvent>);

impl core::ops::Deref for RecognizerEventStream {
    type Target = BoxStream<'static, RecognizerEvent>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for RecognizerEventStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Continuous speech recognizer emitting interim and final transcripts.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn start(&self) -> Result<(), Error>;
    async fn stop(&self) -> Result<(), Error>;
    async fn get_event_stream(&self) -> Result<RecognizerEventStream, Error>;
}
