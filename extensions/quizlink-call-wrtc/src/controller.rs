//! Owns the session loop. Commands come in over an unbounded channel,
//! engine and store events over another, and every cycle feeds exactly one
//! `TurnEvent` to the `TurnMachine` and carries out the actions it returns.

use std::collections::VecDeque;

use chrono::Utc;
use futures::channel::oneshot;
use futures::StreamExt;
use tokio::{
    sync::{
        broadcast,
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        Notify,
    },
    time::Instant,
};
use uuid::Uuid;

use quizlink::call::session::{SessionDocument, SessionId};
use quizlink::call::QuizCallEventKind;
use quizlink::error::Error;
use quizlink::quiz::{QuestionRecord, QuestionSource};
use quizlink::rtc::{LinkState, PeerLinkEvent};
use quizlink::speech::{
    pick_voice, Recognizer, RecognizerEvent, Synthesizer, SynthesizerEvent, Utterance,
};
use quizlink::sync::{Arc, RwLock};

use crate::answers::{AnswerPipeline, PendingAnswer};
use crate::config::SessionConfig;
use crate::question_pool::{QuestionPool, FALLBACK_QUESTION};
use crate::signaling::SignalingController;
use crate::sync::Synchronizer;
use crate::turn::{TurnAction, TurnEvent, TurnMachine};

#[derive(Debug)]
enum Cmd {
    EnableMedia {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    StartSession {
        rsp: oneshot::Sender<Result<SessionId, Error>>,
    },
    JoinSession {
        session: SessionId,
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    HangUp {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    ReadQuestion {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    StopReading {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    RequestUnmute {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
}

/// Everything that can wake the session loop besides a command.
pub enum LoopEvent {
    /// A session record delivered by the store watch
    Doc(SessionDocument),
    /// Peer link activity other than locally gathered candidates
    Link(PeerLinkEvent),
    Synth(SynthesizerEvent),
    Recognizer(RecognizerEvent),
}

/// Stops the session loop when the last controller handle is dropped.
struct NotifyWrapper {
    notify: Arc<Notify>,
}

impl Drop for NotifyWrapper {
    fn drop(&mut self) {
        self.notify.notify_waiters();
    }
}

#[derive(Clone)]
pub struct SessionController {
    ch: UnboundedSender<Cmd>,
    notify: Arc<NotifyWrapper>,
}

pub struct Args {
    pub config: SessionConfig,
    pub connector: Arc<dyn quizlink::rtc::PeerConnector>,
    pub store: Arc<dyn quizlink::store::SessionStore>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub recognizer: Arc<dyn Recognizer>,
    pub questions: Arc<dyn QuestionSource>,
    pub grader: Arc<dyn quizlink::quiz::AnswerGrader>,
    pub ui_event_ch: broadcast::Sender<QuizCallEventKind>,
    /// Mirror of the attached session id, readable without going through
    /// the command channel
    pub active_session: Arc<RwLock<Option<SessionId>>>,
}

impl SessionController {
    pub fn new(args: Args) -> Self {
        let (tx, cmd_rx) = mpsc::unbounded_channel();
        let notify = Arc::new(Notify::new());
        let notify2 = notify.clone();
        tokio::spawn(async move {
            run(args, cmd_rx, notify2).await;
        });
        Self {
            ch: tx,
            notify: Arc::new(NotifyWrapper { notify }),
        }
    }

    pub async fn enable_media(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::EnableMedia { rsp: tx })
            .map_err(|x| Error::OtherWithContext(x.to_string()))?;
        rx.await
            .map_err(|x| Error::OtherWithContext(x.to_string()))?
    }

    pub async fn start_session(&self) -> Result<SessionId, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::StartSession { rsp: tx })
            .map_err(|x| Error::OtherWithContext(x.to_string()))?;
        rx.await
            .map_err(|x| Error::OtherWithContext(x.to_string()))?
    }

    pub async fn join_session(&self, session: SessionId) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::JoinSession { session, rsp: tx })
            .map_err(|x| Error::OtherWithContext(x.to_string()))?;
        rx.await
            .map_err(|x| Error::OtherWithContext(x.to_string()))?
    }

    pub async fn hang_up(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::HangUp { rsp: tx })
            .map_err(|x| Error::OtherWithContext(x.to_string()))?;
        rx.await
            .map_err(|x| Error::OtherWithContext(x.to_string()))?
    }

    pub async fn read_question(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::ReadQuestion { rsp: tx })
            .map_err(|x| Error::OtherWithContext(x.to_string()))?;
        rx.await
            .map_err(|x| Error::OtherWithContext(x.to_string()))?
    }

    pub async fn stop_reading(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::StopReading { rsp: tx })
            .map_err(|x| Error::OtherWithContext(x.to_string()))?;
        rx.await
            .map_err(|x| Error::OtherWithContext(x.to_string()))?
    }

    pub async fn request_unmute(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::RequestUnmute { rsp: tx })
            .map_err(|x| Error::OtherWithContext(x.to_string()))?;
        rx.await
            .map_err(|x| Error::OtherWithContext(x.to_string()))?
    }
}

struct SessionTask {
    config: SessionConfig,
    machine: TurnMachine,
    signaling: SignalingController,
    synchronizer: Synchronizer,
    pipeline: AnswerPipeline,
    synthesizer: Arc<dyn Synthesizer>,
    recognizer: Arc<dyn Recognizer>,
    questions: Arc<dyn QuestionSource>,
    ui_event_ch: broadcast::Sender<QuizCallEventKind>,
    active_session: Arc<RwLock<Option<SessionId>>>,

    pool: Option<QuestionPool>,
    bank: Vec<QuestionRecord>,
    /// The question whose narration or answer is currently in flight
    current_question: Option<QuestionRecord>,
    /// Voice name resolved against the engine on first use
    voice: Option<String>,
}

async fn run(args: Args, mut cmd_rx: UnboundedReceiver<Cmd>, notify: Arc<Notify>) {
    let Args {
        config,
        connector,
        store,
        synthesizer,
        recognizer,
        questions,
        grader,
        ui_event_ch,
        active_session,
    } = args;

    let mut synth_events = match synthesizer.get_event_stream().await {
        Ok(r) => r,
        Err(e) => {
            log::error!("failed to get synthesizer events. quitting session controller: {e}");
            return;
        }
    };
    let mut recognizer_events = match recognizer.get_event_stream().await {
        Ok(r) => r,
        Err(e) => {
            log::error!("failed to get recognizer events. quitting session controller: {e}");
            return;
        }
    };

    let (loop_tx, mut loop_rx) = mpsc::unbounded_channel();

    // engine events ride the same channel as store updates so the select
    // below stays a single consumer
    let tx = loop_tx.clone();
    let pump_notify = notify.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = pump_notify.notified() => {
                    log::debug!("synthesizer pump terminated by notify");
                    break;
                }
                opt = synth_events.next() => match opt {
                    Some(ev) => {
                        let _ = tx.send(LoopEvent::Synth(ev));
                    }
                    None => {
                        log::debug!("synthesizer event stream closed");
                        break;
                    }
                }
            }
        }
    });

    let tx = loop_tx.clone();
    let pump_notify = notify.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = pump_notify.notified() => {
                    log::debug!("recognizer pump terminated by notify");
                    break;
                }
                opt = recognizer_events.next() => match opt {
                    Some(ev) => {
                        let _ = tx.send(LoopEvent::Recognizer(ev));
                    }
                    None => {
                        log::debug!("recognizer event stream closed");
                        break;
                    }
                }
            }
        }
    });

    let mut tick_timer = tokio::time::interval_at(
        Instant::now() + config.timing.tick,
        config.timing.tick,
    );

    let mut task = SessionTask {
        machine: TurnMachine::new(&config.timing, &config.speech),
        signaling: SignalingController::new(connector, store.clone(), loop_tx.clone()),
        synchronizer: Synchronizer::new(store, loop_tx),
        pipeline: AnswerPipeline::new(grader),
        config,
        synthesizer,
        recognizer,
        questions,
        ui_event_ch,
        active_session,
        pool: None,
        bank: Vec::new(),
        current_question: None,
        voice: None,
    };

    loop {
        tokio::select! {
            _ = notify.notified() => {
                log::debug!("quitting session controller");
                break;
            },
            _ = tick_timer.tick() => {
                task.advance(TurnEvent::Tick).await;
            },
            opt = cmd_rx.recv() => {
                let cmd = match opt {
                    Some(c) => c,
                    None => {
                        log::debug!("the session controller was dropped. quitting");
                        break;
                    }
                };
                task.handle_cmd(cmd).await;
            },
            opt = loop_rx.recv() => {
                let ev = match opt {
                    Some(ev) => ev,
                    None => {
                        log::debug!("loop event channel closed. quitting");
                        break;
                    }
                };
                task.handle_loop_event(ev).await;
            },
        }
    }

    task.shutdown().await;
}

impl SessionTask {
    /// Runs one transition and every follow-up it spawns, logging failures.
    async fn advance(&mut self, event: TurnEvent) {
        if let Err(e) = self.try_advance(event).await {
            log::error!("turn transition failed: {e}");
        }
    }

    /// Runs one transition, reporting its error to the caller. Follow-up
    /// events produced while carrying out the actions only log.
    async fn try_advance(&mut self, event: TurnEvent) -> Result<(), Error> {
        let actions = self.machine.handle(event, Utc::now())?;
        let mut queue: VecDeque<TurnEvent> = self.execute(actions).await.into();
        while let Some(event) = queue.pop_front() {
            match self.machine.handle(event, Utc::now()) {
                Ok(actions) => queue.extend(self.execute(actions).await),
                Err(e) => log::error!("follow-up transition failed: {e}"),
            }
        }
        Ok(())
    }

    async fn execute(&mut self, actions: Vec<TurnAction>) -> Vec<TurnEvent> {
        let mut followups = Vec::new();
        for action in actions {
            match action {
                TurnAction::Speak { utterance, text } => {
                    let utt = self.build_utterance(utterance, text).await;
                    if let Err(e) = self.synthesizer.speak(utt).await {
                        log::error!("failed to start narration: {e}");
                        followups.push(TurnEvent::SpeechFailed {
                            utterance,
                            reason: e.to_string(),
                        });
                    }
                }
                TurnAction::CancelSpeech => {
                    if let Err(e) = self.synthesizer.cancel().await {
                        log::error!("failed to cancel narration: {e}");
                    }
                }
                TurnAction::SetCapture(enabled) => match self.signaling.media() {
                    Some(media) => media.set_microphone_enabled(enabled),
                    None => log::warn!("no captured media to set the microphone on"),
                },
                TurnAction::StartRecognizer => {
                    if let Err(e) = self.recognizer.start().await {
                        log::error!("failed to start the recognizer: {e}");
                    }
                }
                TurnAction::StopRecognizer => {
                    if let Err(e) = self.recognizer.stop().await {
                        log::error!("failed to stop the recognizer: {e}");
                    }
                }
                TurnAction::Publish(patch) => {
                    let session = match self.signaling.session() {
                        Some(s) => s,
                        None => {
                            log::debug!("no attached session. dropping the update");
                            continue;
                        }
                    };
                    if let Err(e) = self.synchronizer.publish(&session, patch).await {
                        log::error!("failed to publish a session update: {e}");
                    }
                }
                TurnAction::Grade { transcript } => {
                    if let Some(event) = self.grade(transcript).await {
                        followups.push(event);
                    }
                }
                TurnAction::Emit(event) => {
                    let _ = self.ui_event_ch.send(event);
                }
            }
        }
        followups
    }

    async fn grade(&mut self, transcript: String) -> Option<TurnEvent> {
        let question = match self.current_question.clone() {
            Some(q) => q,
            None => {
                log::warn!("got a transcript without an active question. dropping it");
                return None;
            }
        };
        let pending = PendingAnswer {
            transcript,
            at: Utc::now(),
        };
        match self.pipeline.submit(&question, &pending.transcript).await {
            Ok(validation) => {
                log::debug!(
                    "graded an answer in {}ms",
                    (Utc::now() - pending.at).num_milliseconds()
                );
                Some(TurnEvent::Graded { validation })
            }
            Err(e) => {
                log::error!("failed to grade the answer: {e}");
                None
            }
        }
    }

    async fn build_utterance(&mut self, id: Uuid, text: String) -> Utterance {
        // engines report an empty voice list until they finish loading, so
        // keep asking until a pick sticks
        if self.voice.is_none() {
            match self.synthesizer.voices().await {
                Ok(available) => {
                    self.voice = pick_voice(&available, &self.config.speech.voice_preferences)
                        .map(|v| v.name.clone());
                    match self.voice.as_deref() {
                        Some(name) => log::debug!("narrating with voice: {name}"),
                        None => log::debug!("no voices offered. using the engine default"),
                    }
                }
                Err(e) => log::warn!("could not list voices: {e}"),
            }
        }
        Utterance {
            id,
            text,
            rate: self.config.speech.rate,
            pitch: self.config.speech.pitch,
            volume: self.config.speech.volume,
            lang: self.config.speech.lang.clone(),
            voice: self.voice.clone(),
        }
    }

    async fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::EnableMedia { rsp } => {
                let result = self.signaling.capture_media().await;
                if result.is_ok() {
                    // prime the bank and hold a first question, so an answer
                    // spoken before this device ever reads still grades
                    // against something
                    self.ensure_bank().await;
                    if self.current_question.is_none() {
                        self.current_question = Some(self.draw_question().await);
                    }
                }
                let _ = rsp.send(result);
            }
            Cmd::StartSession { rsp } => {
                let _ = rsp.send(self.start_session().await);
            }
            Cmd::JoinSession { session, rsp } => {
                let _ = rsp.send(self.join_session(session).await);
            }
            Cmd::HangUp { rsp } => {
                self.hang_up().await;
                let _ = rsp.send(Ok(()));
            }
            Cmd::ReadQuestion { rsp } => {
                let _ = rsp.send(self.read_question().await);
            }
            Cmd::StopReading { rsp } => {
                let _ = rsp.send(self.try_advance(TurnEvent::StopRequested).await);
            }
            Cmd::RequestUnmute { rsp } => {
                let _ = rsp.send(self.try_advance(TurnEvent::UnmuteRequested).await);
            }
        }
    }

    async fn start_session(&mut self) -> Result<SessionId, Error> {
        let session = self.signaling.start_session().await?;
        if let Err(e) = self.synchronizer.attach(&session).await {
            log::error!("failed to watch the new session: {e}");
            self.signaling.close_link().await;
            return Err(e);
        }
        *self.active_session.write() = Some(session.clone());
        let _ = self.ui_event_ch.send(QuizCallEventKind::SessionStarted {
            session: session.clone(),
        });
        Ok(session)
    }

    async fn join_session(&mut self, session: SessionId) -> Result<(), Error> {
        self.signaling.join_session(session.clone()).await?;
        if let Err(e) = self.synchronizer.attach(&session).await {
            log::error!("failed to watch the joined session: {e}");
            self.signaling.close_link().await;
            return Err(e);
        }
        *self.active_session.write() = Some(session.clone());
        let _ = self
            .ui_event_ch
            .send(QuizCallEventKind::SessionJoined { session });
        Ok(())
    }

    /// Ends the session if one is active. Safe to call repeatedly.
    async fn hang_up(&mut self) {
        let had_session = self.signaling.session().is_some();
        // release the lock and stop the engines while the record can still
        // be written
        self.advance(TurnEvent::Reset).await;
        self.synchronizer.detach();
        self.signaling.teardown().await;
        *self.active_session.write() = None;
        self.pool = None;
        self.bank.clear();
        self.current_question = None;
        if had_session {
            let _ = self.ui_event_ch.send(QuizCallEventKind::SessionEnded);
        }
    }

    async fn read_question(&mut self) -> Result<(), Error> {
        if self.signaling.session().is_none() {
            return Err(Error::CallNotInProgress);
        }
        // checked before drawing so a refused request does not consume a
        // question from the pool
        if self.machine.lock_engaged() {
            return Err(Error::MuteLockHeld);
        }
        let question = self.draw_question().await;
        let text = question.prompt.clone();
        self.current_question = Some(question);
        self.try_advance(TurnEvent::ReadRequested { text }).await
    }

    /// Loads the question bank if it isn't loaded yet. Failures only log;
    /// drawing falls back to a canned question until a later attempt
    /// succeeds.
    async fn ensure_bank(&mut self) {
        if self.pool.is_some() {
            return;
        }
        match self.questions.fetch_all().await {
            Ok(all) if !all.is_empty() => {
                log::debug!("loaded {} questions", all.len());
                self.pool = Some(QuestionPool::new(all.len()));
                self.bank = all;
            }
            Ok(_) => log::warn!("the question source returned nothing"),
            Err(e) => log::warn!("the question source is unavailable: {e}"),
        }
    }

    async fn draw_question(&mut self) -> QuestionRecord {
        self.ensure_bank().await;
        let idx = match self.pool.as_mut().and_then(|pool| pool.next()) {
            Some(idx) => idx,
            None => return QuestionRecord::new(FALLBACK_QUESTION),
        };
        match self.bank.get(idx) {
            Some(question) => question.clone(),
            None => QuestionRecord::new(FALLBACK_QUESTION),
        }
    }

    async fn handle_loop_event(&mut self, ev: LoopEvent) {
        match ev {
            LoopEvent::Doc(doc) => {
                if let Err(e) = self.signaling.apply_remote_answer(&doc).await {
                    log::error!("failed to apply the remote answer: {e}");
                }
                self.advance(TurnEvent::DocUpdated { doc }).await;
            }
            LoopEvent::Link(ev) => self.handle_link_event(ev),
            LoopEvent::Synth(ev) => {
                let event = match ev {
                    SynthesizerEvent::Started { utterance } => {
                        TurnEvent::SpeechStarted { utterance }
                    }
                    SynthesizerEvent::Finished { utterance } => {
                        TurnEvent::SpeechFinished { utterance }
                    }
                    SynthesizerEvent::Failed { utterance, reason } => {
                        TurnEvent::SpeechFailed { utterance, reason }
                    }
                };
                self.advance(event).await;
            }
            LoopEvent::Recognizer(ev) => {
                let event = match ev {
                    RecognizerEvent::Partial { text } => TurnEvent::CaptionPartial { text },
                    RecognizerEvent::Final { text } => TurnEvent::CaptionFinal { text },
                    RecognizerEvent::Ended => TurnEvent::RecognizerEnded,
                    RecognizerEvent::Failed { kind } => TurnEvent::RecognizerFailed { kind },
                };
                self.advance(event).await;
            }
        }
    }

    fn handle_link_event(&mut self, ev: PeerLinkEvent) {
        match ev {
            PeerLinkEvent::ConnectionState { state } => {
                log::debug!("peer connection state: {state}");
                match state {
                    LinkState::Connected => {
                        let _ = self.ui_event_ch.send(QuizCallEventKind::PeerConnected);
                    }
                    LinkState::Disconnected | LinkState::Failed | LinkState::Closed => {
                        let _ = self.ui_event_ch.send(QuizCallEventKind::PeerDisconnected);
                    }
                    _ => {}
                }
            }
            PeerLinkEvent::IceState { state } => {
                log::debug!("ice connection state: {state}");
            }
            PeerLinkEvent::RemoteTrack { kind } => {
                let _ = self
                    .ui_event_ch
                    .send(QuizCallEventKind::RemoteTrackAdded { kind });
            }
            // locally gathered candidates go to the store in the signaling
            // pump and never reach this loop
            PeerLinkEvent::Candidate { .. } => {}
        }
    }

    async fn shutdown(&mut self) {
        self.hang_up().await;
    }
}
