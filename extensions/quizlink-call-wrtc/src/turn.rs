//! Turn control for the unmute window and question narration.
//!
//! `TurnMachine` is a plain transition function. It never spawns tasks,
//! touches the store, or talks to an engine; it consumes one `TurnEvent`
//! together with the current wall clock and returns the `TurnAction`s the
//! caller must carry out. All timing is expressed as deadline fields
//! re-evaluated on a periodic `Tick`, so cancelling a timer is just
//! clearing a field and a skewed clock cannot accumulate drift.
//!
//! The unmute lock itself lives in the shared session record. A party
//! holds the lock exactly when the record says `button_locked` and
//! `last_unmute_time` equals the stamp of its own claim; on a write race
//! the store's last write wins and the loser notices on the next update.

use chrono::{DateTime, Duration, Utc};
use derive_more::Display;
use uuid::Uuid;

use quizlink::call::session::{AnswerValidation, SessionDocument, SessionPatch, TtsStatus};
use quizlink::call::QuizCallEventKind;
use quizlink::error::Error;
use quizlink::speech::RecognitionErrorKind;

use crate::config::{SpeechConfig, TurnTiming};

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum TurnState {
    #[display(fmt = "Idle")]
    Idle,
    /// A question is being narrated on this device
    #[display(fmt = "Speaking")]
    Speaking,
    /// Narration was cut off by an unmute window and waits for its end
    #[display(fmt = "PausedForInterrupt")]
    PausedForInterrupt,
    /// This device holds the unmute lock and is capturing an answer
    #[display(fmt = "UnmutedWindow")]
    UnmutedWindow,
    /// The window just closed; narration resumes after a settle delay
    #[display(fmt = "Cooldown")]
    Cooldown,
}

/// Everything that can advance the machine.
#[derive(Clone, Debug)]
pub enum TurnEvent {
    /// Narrate `text` from the start
    ReadRequested { text: String },
    /// Stop narration and, if a window is open locally, close it early
    StopRequested,
    /// Claim the unmute lock and open the capture window
    UnmuteRequested,
    /// A session record arrived from the store (possibly our own echo)
    DocUpdated { doc: SessionDocument },
    SpeechStarted { utterance: Uuid },
    SpeechFinished { utterance: Uuid },
    SpeechFailed { utterance: Uuid, reason: String },
    CaptionPartial { text: String },
    CaptionFinal { text: String },
    RecognizerEnded,
    RecognizerFailed { kind: RecognitionErrorKind },
    /// The grading oracle answered for the most recent final transcript
    Graded { validation: AnswerValidation },
    /// Periodic deadline sweep
    Tick,
    /// The session is going away; stop engines and release the lock
    Reset,
}

/// Side effects the caller performs in order.
#[derive(Clone, Debug)]
pub enum TurnAction {
    Speak { utterance: Uuid, text: String },
    CancelSpeech,
    /// Enable or disable the outgoing audio track
    SetCapture(bool),
    StartRecognizer,
    StopRecognizer,
    Publish(SessionPatch),
    /// Hand the transcript to the grading pipeline; its verdict comes
    /// back as `TurnEvent::Graded`
    Grade { transcript: String },
    Emit(QuizCallEventKind),
}

struct Reading {
    utterance: Uuid,
    /// Full question text; the active utterance narrates from `offset`
    text: String,
    offset: usize,
    started_at: Option<DateTime<Utc>>,
}

pub struct TurnMachine {
    state: TurnState,
    window: Duration,
    resume_settle: Duration,
    recognizer_restart: Duration,
    caption_clear: Duration,
    /// Estimated narrated chars per wall-clock second at the configured rate
    chars_per_second: f32,

    /// Mirror of the last session record seen from the store
    doc: SessionDocument,
    reading: Option<Reading>,
    /// Stamp written with our latest lock claim. Holding the lock means
    /// the record echoes this exact value back.
    my_attempt_stamp: Option<DateTime<Utc>>,
    capture_enabled: bool,
    remote_window_open: bool,

    // deadlines, swept on Tick
    resume_at: Option<DateTime<Utc>>,
    recognizer_restart_at: Option<DateTime<Utc>>,
    captions_clear_at: Option<DateTime<Utc>>,

    last_countdown: Option<u32>,
    /// Last playback record we wrote, used to tell our own echo apart
    /// from a remote change
    published_tts: TtsStatus,
    last_captions_shown: String,
    last_validation_shown: Option<AnswerValidation>,
}

fn chrono_dur(d: std::time::Duration) -> Duration {
    Duration::milliseconds(d.as_millis() as i64)
}

impl TurnMachine {
    pub fn new(timing: &TurnTiming, speech: &SpeechConfig) -> Self {
        Self {
            state: TurnState::Idle,
            window: chrono_dur(timing.unmute_window),
            resume_settle: chrono_dur(timing.resume_settle),
            recognizer_restart: chrono_dur(timing.recognizer_restart),
            caption_clear: chrono_dur(timing.caption_clear),
            chars_per_second: speech.chars_per_second * speech.rate,
            doc: SessionDocument::default(),
            reading: None,
            my_attempt_stamp: None,
            capture_enabled: false,
            remote_window_open: false,
            resume_at: None,
            recognizer_restart_at: None,
            captions_clear_at: None,
            last_countdown: None,
            published_tts: TtsStatus::default(),
            last_captions_shown: String::new(),
            last_validation_shown: None,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn handle(
        &mut self,
        event: TurnEvent,
        now: DateTime<Utc>,
    ) -> Result<Vec<TurnAction>, Error> {
        match event {
            TurnEvent::ReadRequested { text } => self.on_read_requested(text),
            TurnEvent::StopRequested => Ok(self.on_stop_requested()),
            TurnEvent::UnmuteRequested => self.on_unmute_requested(now),
            TurnEvent::DocUpdated { doc } => Ok(self.on_doc_updated(doc, now)),
            TurnEvent::SpeechStarted { utterance } => Ok(self.on_speech_started(utterance, now)),
            TurnEvent::SpeechFinished { utterance } => Ok(self.on_speech_finished(utterance)),
            TurnEvent::SpeechFailed { utterance, reason } => {
                Ok(self.on_speech_failed(utterance, reason))
            }
            TurnEvent::CaptionPartial { text } => Ok(self.on_caption_partial(text)),
            TurnEvent::CaptionFinal { text } => Ok(self.on_caption_final(text)),
            TurnEvent::RecognizerEnded => Ok(self.on_recognizer_ended()),
            TurnEvent::RecognizerFailed { kind } => Ok(self.on_recognizer_failed(kind, now)),
            TurnEvent::Graded { validation } => Ok(self.on_graded(validation, now)),
            TurnEvent::Tick => Ok(self.on_tick(now)),
            TurnEvent::Reset => Ok(self.on_reset()),
        }
    }

    fn stamp_matches(&self, doc: &SessionDocument) -> bool {
        self.my_attempt_stamp.is_some() && doc.last_unmute_time == self.my_attempt_stamp
    }

    /// True while any party holds the unmute lock. Narration requests are
    /// refused for as long as this holds.
    pub fn lock_engaged(&self) -> bool {
        self.doc.button_locked || self.state == TurnState::UnmutedWindow
    }

    /// Guess how far narration got, in characters from the start of the
    /// full text.
    fn estimate_offset(&self, now: DateTime<Utc>) -> usize {
        let Some(reading) = &self.reading else {
            return 0;
        };
        let total = reading.text.chars().count();
        let spoken = match reading.started_at {
            Some(at) => {
                let elapsed_ms = (now - at).num_milliseconds().max(0);
                (elapsed_ms as f32 / 1000.0 * self.chars_per_second) as usize
            }
            None => 0,
        };
        (reading.offset + spoken).min(total)
    }

    fn publish_tts(&mut self, status: TtsStatus, patch: &mut SessionPatch) {
        self.published_tts = status;
        patch.tts_state = Some(status);
    }

    fn on_read_requested(&mut self, text: String) -> Result<Vec<TurnAction>, Error> {
        if self.lock_engaged() {
            return Err(Error::MuteLockHeld);
        }
        let mut actions = vec![];
        if self.reading.is_some() {
            actions.push(TurnAction::CancelSpeech);
        }
        self.resume_at = None;
        let utterance = Uuid::new_v4();
        self.reading = Some(Reading {
            utterance,
            text: text.clone(),
            offset: 0,
            started_at: None,
        });
        self.state = TurnState::Speaking;
        actions.push(TurnAction::Speak {
            utterance,
            text: text.clone(),
        });
        actions.push(TurnAction::Emit(QuizCallEventKind::QuestionReading {
            text,
        }));
        Ok(actions)
    }

    fn on_stop_requested(&mut self) -> Vec<TurnAction> {
        let mut actions = vec![];
        let mut patch = SessionPatch::default();

        if self.state == TurnState::UnmutedWindow {
            self.end_capture(&mut actions);
            self.my_attempt_stamp = None;
            self.last_countdown = None;
            patch.button_locked = Some(false);
            actions.push(TurnAction::Emit(QuizCallEventKind::UnmuteWindowClosed));
        }

        if self.reading.take().is_some() {
            actions.push(TurnAction::CancelSpeech);
            let mut status = self.published_tts;
            status.finish();
            self.publish_tts(status, &mut patch);
            actions.push(TurnAction::Emit(QuizCallEventKind::ReadingStopped));
        }

        self.resume_at = None;
        self.state = TurnState::Idle;
        if !patch.is_empty() {
            actions.push(TurnAction::Publish(patch));
        }
        actions
    }

    fn on_unmute_requested(&mut self, now: DateTime<Utc>) -> Result<Vec<TurnAction>, Error> {
        if self.state == TurnState::UnmutedWindow {
            return Ok(vec![]);
        }
        if self.doc.button_locked {
            return Err(Error::MuteLockHeld);
        }

        let mut actions = vec![];
        let mut patch = SessionPatch {
            button_locked: Some(true),
            last_unmute_time: Some(Some(now)),
            ..Default::default()
        };
        self.my_attempt_stamp = Some(now);

        if self.state == TurnState::Speaking {
            let offset = self.estimate_offset(now);
            if let Some(reading) = &mut self.reading {
                actions.push(TurnAction::CancelSpeech);
                reading.offset = offset;
                reading.started_at = None;
            }
            let mut status = self.published_tts;
            status.interrupt();
            self.publish_tts(status, &mut patch);
        }
        // a pending resume waits until this window is over too
        self.resume_at = None;

        self.state = TurnState::UnmutedWindow;
        actions.push(TurnAction::Publish(patch));
        actions.push(TurnAction::SetCapture(true));
        self.capture_enabled = true;
        actions.push(TurnAction::StartRecognizer);
        actions.push(TurnAction::Emit(QuizCallEventKind::UnmuteWindowOpened {
            local: true,
        }));
        self.emit_countdown(now, now, &mut actions);
        Ok(actions)
    }

    fn on_doc_updated(&mut self, doc: SessionDocument, now: DateTime<Utc>) -> Vec<TurnAction> {
        let prev = std::mem::replace(&mut self.doc, doc);
        let mut actions = vec![];

        let locked_by_remote = self.doc.button_locked && !self.stamp_matches(&self.doc);

        if self.state == TurnState::UnmutedWindow {
            // in a write race the later claim overwrites the earlier one,
            // so a foreign stamp older than ours is a claim our own
            // in-flight write has already beaten. only a newer stamp loses.
            let lost = locked_by_remote && self.doc.last_unmute_time > self.my_attempt_stamp;
            if lost {
                log::debug!("unmute lock taken by the other party. abandoning local window");
                self.end_capture(&mut actions);
                self.my_attempt_stamp = None;
                self.last_countdown = None;
                actions.push(TurnAction::Emit(QuizCallEventKind::UnmuteDenied));
                self.state = if self.reading.is_some() {
                    TurnState::PausedForInterrupt
                } else {
                    TurnState::Idle
                };
                self.remote_window_open = true;
                actions.push(TurnAction::Emit(QuizCallEventKind::UnmuteWindowOpened {
                    local: false,
                }));
            }
            // a record without the lock, or with an older stamp, can only
            // be one committed before our claim; keep the window
        } else {
            if locked_by_remote && !self.remote_window_open {
                self.remote_window_open = true;
                if self.state == TurnState::Speaking {
                    let offset = self.estimate_offset(now);
                    if let Some(reading) = &mut self.reading {
                        actions.push(TurnAction::CancelSpeech);
                        reading.offset = offset;
                        reading.started_at = None;
                    }
                    let mut status = self.published_tts;
                    status.interrupt();
                    let mut patch = SessionPatch::default();
                    self.publish_tts(status, &mut patch);
                    actions.push(TurnAction::Publish(patch));
                    self.state = TurnState::PausedForInterrupt;
                } else if self.state == TurnState::Cooldown {
                    // the settle delay lost the race with a new claim
                    self.resume_at = None;
                    self.state = TurnState::PausedForInterrupt;
                }
                actions.push(TurnAction::Emit(QuizCallEventKind::UnmuteWindowOpened {
                    local: false,
                }));
                self.emit_countdown(self.doc.last_unmute_time.unwrap_or(now), now, &mut actions);
            }
            if !self.doc.button_locked {
                if self.remote_window_open {
                    self.remote_window_open = false;
                    self.last_countdown = None;
                    actions.push(TurnAction::Emit(QuizCallEventKind::UnmuteWindowClosed));
                }
                // the expiry tick may have closed the display already; the
                // resume keys off the lock itself, not the display
                if self.state == TurnState::PausedForInterrupt {
                    self.state = TurnState::Cooldown;
                    self.resume_at = Some(now + self.resume_settle);
                }
            }
        }

        if self.doc.tts_state != prev.tts_state && self.doc.tts_state != self.published_tts {
            actions.push(TurnAction::Emit(QuizCallEventKind::TtsStateChanged {
                status: self.doc.tts_state,
            }));
        }

        if self.doc.captions != prev.captions {
            if self.doc.captions.is_empty() {
                if !self.last_captions_shown.is_empty() {
                    self.last_captions_shown.clear();
                    actions.push(TurnAction::Emit(QuizCallEventKind::CaptionsCleared));
                }
            } else if self.doc.captions != self.last_captions_shown {
                self.last_captions_shown = self.doc.captions.clone();
                actions.push(TurnAction::Emit(QuizCallEventKind::CaptionsUpdated {
                    text: self.doc.captions.clone(),
                    interim: false,
                }));
            }
        }

        if let Some(validation) = &self.doc.answer_validation {
            if self.doc.answer_validation != prev.answer_validation
                && self.last_validation_shown.as_ref() != Some(validation)
            {
                self.last_validation_shown = Some(validation.clone());
                actions.push(TurnAction::Emit(QuizCallEventKind::AnswerGraded {
                    validation: validation.clone(),
                }));
            }
        }

        actions
    }

    fn on_speech_started(&mut self, utterance: Uuid, now: DateTime<Utc>) -> Vec<TurnAction> {
        if self.state != TurnState::Speaking {
            return vec![];
        }
        let Some(reading) = &mut self.reading else {
            return vec![];
        };
        if reading.utterance != utterance {
            return vec![];
        }
        reading.started_at = Some(now);
        let mut status = self.published_tts;
        status.begin();
        let mut patch = SessionPatch::default();
        self.publish_tts(status, &mut patch);
        vec![TurnAction::Publish(patch)]
    }

    fn on_speech_finished(&mut self, utterance: Uuid) -> Vec<TurnAction> {
        if self.state != TurnState::Speaking
            || self.reading.as_ref().map(|r| r.utterance) != Some(utterance)
        {
            return vec![];
        }
        self.reading = None;
        self.state = TurnState::Idle;
        let mut status = self.published_tts;
        status.finish();
        let mut patch = SessionPatch::default();
        self.publish_tts(status, &mut patch);
        vec![
            TurnAction::Publish(patch),
            TurnAction::Emit(QuizCallEventKind::ReadingFinished),
        ]
    }

    fn on_speech_failed(&mut self, utterance: Uuid, reason: String) -> Vec<TurnAction> {
        if self.state != TurnState::Speaking
            || self.reading.as_ref().map(|r| r.utterance) != Some(utterance)
        {
            return vec![];
        }
        log::error!("speech synthesis failed: {reason}");
        self.reading = None;
        self.state = TurnState::Idle;
        let mut status = self.published_tts;
        status.finish();
        let mut patch = SessionPatch::default();
        self.publish_tts(status, &mut patch);
        vec![
            TurnAction::Publish(patch),
            TurnAction::Emit(QuizCallEventKind::ReadingFailed { reason }),
        ]
    }

    fn on_caption_partial(&mut self, text: String) -> Vec<TurnAction> {
        if !self.capture_enabled {
            return vec![];
        }
        vec![TurnAction::Emit(QuizCallEventKind::CaptionsUpdated {
            text,
            interim: true,
        })]
    }

    fn on_caption_final(&mut self, text: String) -> Vec<TurnAction> {
        if !self.capture_enabled {
            return vec![];
        }
        let transcript = text.trim().to_string();
        if transcript.is_empty() {
            return vec![];
        }
        self.last_captions_shown = transcript.clone();
        vec![
            TurnAction::Emit(QuizCallEventKind::CaptionsUpdated {
                text: transcript.clone(),
                interim: false,
            }),
            TurnAction::Grade { transcript },
        ]
    }

    fn on_recognizer_ended(&mut self) -> Vec<TurnAction> {
        if self.capture_enabled && self.recognizer_restart_at.is_none() {
            return vec![TurnAction::StartRecognizer];
        }
        vec![]
    }

    fn on_recognizer_failed(
        &mut self,
        kind: RecognitionErrorKind,
        now: DateTime<Utc>,
    ) -> Vec<TurnAction> {
        if !self.capture_enabled {
            return vec![];
        }
        if matches!(kind, RecognitionErrorKind::NoSpeech) {
            // benign while nobody talks; the engine's own end event follows
            return vec![];
        }
        log::warn!("speech recognition error: {kind}. restarting shortly");
        self.recognizer_restart_at = Some(now + self.recognizer_restart);
        vec![TurnAction::StopRecognizer]
    }

    fn on_graded(&mut self, validation: AnswerValidation, now: DateTime<Utc>) -> Vec<TurnAction> {
        self.last_validation_shown = Some(validation.clone());
        self.last_captions_shown = validation.answer.clone();
        let patch = SessionPatch {
            captions: Some(validation.answer.clone()),
            answer_validation: Some(Some(validation.clone())),
            timestamp: Some(now),
            ..Default::default()
        };
        vec![
            TurnAction::Publish(patch),
            TurnAction::Emit(QuizCallEventKind::AnswerGraded { validation }),
        ]
    }

    fn on_tick(&mut self, now: DateTime<Utc>) -> Vec<TurnAction> {
        let mut actions = vec![];

        if self.state == TurnState::UnmutedWindow {
            if let Some(stamp) = self.my_attempt_stamp {
                if now >= stamp + self.window {
                    self.close_own_window(now, &mut actions);
                } else {
                    self.emit_countdown(stamp, now, &mut actions);
                }
            }
        } else if self.remote_window_open {
            if let Some(stamp) = self.doc.last_unmute_time {
                if now >= stamp + self.window {
                    // hide the display; the lock release itself may lag
                    self.remote_window_open = false;
                    self.last_countdown = None;
                    actions.push(TurnAction::Emit(QuizCallEventKind::UnmuteWindowClosed));
                } else {
                    self.emit_countdown(stamp, now, &mut actions);
                }
            }
        }

        if let Some(at) = self.resume_at {
            if now >= at {
                self.resume_at = None;
                self.resume_reading(&mut actions);
            }
        }

        if let Some(at) = self.recognizer_restart_at {
            if now >= at {
                self.recognizer_restart_at = None;
                if self.capture_enabled {
                    actions.push(TurnAction::StartRecognizer);
                }
            }
        }

        if let Some(at) = self.captions_clear_at {
            if now >= at {
                self.captions_clear_at = None;
                actions.push(TurnAction::Publish(SessionPatch {
                    captions: Some(String::new()),
                    ..Default::default()
                }));
                if !self.last_captions_shown.is_empty() {
                    self.last_captions_shown.clear();
                    actions.push(TurnAction::Emit(QuizCallEventKind::CaptionsCleared));
                }
            }
        }

        actions
    }

    fn on_reset(&mut self) -> Vec<TurnAction> {
        let mut actions = vec![];
        if self.reading.is_some() {
            actions.push(TurnAction::CancelSpeech);
        }
        actions.push(TurnAction::StopRecognizer);
        if self.capture_enabled {
            actions.push(TurnAction::SetCapture(false));
        }
        actions.push(TurnAction::Publish(SessionPatch {
            button_locked: Some(false),
            last_unmute_time: Some(None),
            captions: Some(String::new()),
            ..Default::default()
        }));

        self.state = TurnState::Idle;
        self.doc = SessionDocument::default();
        self.reading = None;
        self.my_attempt_stamp = None;
        self.capture_enabled = false;
        self.remote_window_open = false;
        self.resume_at = None;
        self.recognizer_restart_at = None;
        self.captions_clear_at = None;
        self.last_countdown = None;
        self.published_tts = TtsStatus::default();
        self.last_captions_shown.clear();
        self.last_validation_shown = None;
        actions
    }

    fn end_capture(&mut self, actions: &mut Vec<TurnAction>) {
        actions.push(TurnAction::SetCapture(false));
        self.capture_enabled = false;
        actions.push(TurnAction::StopRecognizer);
        self.recognizer_restart_at = None;
    }

    fn close_own_window(&mut self, now: DateTime<Utc>, actions: &mut Vec<TurnAction>) {
        self.end_capture(actions);
        self.my_attempt_stamp = None;
        self.last_countdown = None;
        actions.push(TurnAction::Publish(SessionPatch {
            button_locked: Some(false),
            ..Default::default()
        }));
        actions.push(TurnAction::Emit(QuizCallEventKind::UnmuteWindowClosed));
        self.captions_clear_at = Some(now + self.caption_clear);
        if self.reading.is_some() {
            self.state = TurnState::Cooldown;
            self.resume_at = Some(now + self.resume_settle);
        } else {
            self.state = TurnState::Idle;
        }
    }

    fn resume_reading(&mut self, actions: &mut Vec<TurnAction>) {
        if self.state != TurnState::Cooldown {
            return;
        }
        let Some(reading) = &mut self.reading else {
            self.state = TurnState::Idle;
            return;
        };
        let total = reading.text.chars().count();
        if reading.offset >= total {
            // nothing left to say
            self.reading = None;
            self.state = TurnState::Idle;
            let mut status = self.published_tts;
            status.finish();
            let mut patch = SessionPatch::default();
            self.publish_tts(status, &mut patch);
            actions.push(TurnAction::Publish(patch));
            actions.push(TurnAction::Emit(QuizCallEventKind::ReadingFinished));
            return;
        }
        let utterance = Uuid::new_v4();
        reading.utterance = utterance;
        reading.started_at = None;
        let text: String = reading.text.chars().skip(reading.offset).collect();
        let offset = reading.offset;
        self.state = TurnState::Speaking;
        actions.push(TurnAction::Speak { utterance, text });
        actions.push(TurnAction::Emit(QuizCallEventKind::ReadingResumed {
            offset,
        }));
    }

    /// Countdown display derived from the shared stamp so both parties
    /// agree even with skewed clocks. Fires only when the whole-second
    /// value changes.
    fn emit_countdown(
        &mut self,
        stamp: DateTime<Utc>,
        now: DateTime<Utc>,
        actions: &mut Vec<TurnAction>,
    ) {
        let left_ms = ((stamp + self.window) - now).num_milliseconds();
        if left_ms <= 0 {
            return;
        }
        let window_secs = (self.window.num_milliseconds() / 1000).max(0) as u32;
        let seconds_left = (((left_ms + 999) / 1000) as u32).min(window_secs.max(1));
        if self.last_countdown != Some(seconds_left) {
            self.last_countdown = Some(seconds_left);
            actions.push(TurnAction::Emit(QuizCallEventKind::UnmuteCountdown {
                seconds_left,
            }));
        }
    }
}
