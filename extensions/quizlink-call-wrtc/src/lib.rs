//! A QuizCall implementation relying on Mozilla's WebRTC library (hence the name
//! quizlink-call-wrtc)
//!
//! Signaling rides the shared session record: the offerer writes its descriptor
//! into the record, the answerer writes its answer back, and both sides append
//! reachability candidates to their own sub-collection while watching the
//! other's. Everything else (narration, the unmute window, captions, grading)
//! is mirrored through the same record by a single controller task per client.
//!
//! `SessionClient::new` wires the webrtc-rs transport. Speech engines, the
//! question source and the grading oracle are injected; they live at the
//! process boundary and vary per platform.

pub mod answers;
pub mod config;
mod controller;
pub mod question_pool;
mod signaling;
pub mod simple_rtc;
mod sync;
pub mod turn;

use async_trait::async_trait;
use tokio::sync::broadcast;

use quizlink::call::session::SessionId;
use quizlink::call::{QuizCall, QuizCallEventKind, QuizCallEventStream};
use quizlink::error::Error;
use quizlink::quiz::{AnswerGrader, QuestionSource};
use quizlink::rtc::PeerConnector;
use quizlink::speech::{Recognizer, Synthesizer};
use quizlink::store::SessionStore;
use quizlink::sync::{Arc, RwLock};

use crate::config::SessionConfig;
use crate::controller::SessionController;

// implements QuizCall
#[derive(Clone)]
pub struct SessionClient {
    controller: SessionController,
    ui_event_ch: broadcast::Sender<QuizCallEventKind>,
    active_session: Arc<RwLock<Option<SessionId>>>,
}

impl SessionClient {
    /// Builds a client on the webrtc-rs transport.
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn SessionStore>,
        synthesizer: Arc<dyn Synthesizer>,
        recognizer: Arc<dyn Recognizer>,
        questions: Arc<dyn QuestionSource>,
        grader: Arc<dyn AnswerGrader>,
    ) -> Result<Self, Error> {
        let connector = Arc::new(simple_rtc::RtcConnector::new(config.rtc.clone())?);
        Ok(Self::with_connector(
            config,
            connector,
            store,
            synthesizer,
            recognizer,
            questions,
            grader,
        ))
    }

    /// Builds a client on an explicit transport. Used by tests and by
    /// platforms that bring their own peer connection.
    pub fn with_connector(
        config: SessionConfig,
        connector: Arc<dyn PeerConnector>,
        store: Arc<dyn SessionStore>,
        synthesizer: Arc<dyn Synthesizer>,
        recognizer: Arc<dyn Recognizer>,
        questions: Arc<dyn QuestionSource>,
        grader: Arc<dyn AnswerGrader>,
    ) -> Self {
        let (ui_event_ch, _rx) = broadcast::channel(1024);
        let active_session = Arc::new(RwLock::new(None));
        let controller = SessionController::new(controller::Args {
            config,
            connector,
            store,
            synthesizer,
            recognizer,
            questions,
            grader,
            ui_event_ch: ui_event_ch.clone(),
            active_session: active_session.clone(),
        });
        Self {
            controller,
            ui_event_ch,
            active_session,
        }
    }
}

#[async_trait]
impl QuizCall for SessionClient {
    // ------ Misc ------

    async fn get_event_stream(&mut self) -> Result<QuizCallEventStream, Error> {
        let mut rx = self.ui_event_ch.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(_) => {}
                };
            }
        };
        Ok(QuizCallEventStream(Box::pin(stream)))
    }

    // ------ Create/Join a session ------

    async fn enable_media(&mut self) -> Result<(), Error> {
        self.controller.enable_media().await
    }

    async fn start_session(&mut self) -> Result<SessionId, Error> {
        self.controller.start_session().await
    }

    async fn join_session(&mut self, session: SessionId) -> Result<(), Error> {
        self.controller.join_session(session).await
    }

    async fn hang_up(&mut self) -> Result<(), Error> {
        self.controller.hang_up().await
    }

    // ------ Turn controls ------

    async fn read_question(&mut self) -> Result<(), Error> {
        self.controller.read_question().await
    }

    async fn stop_reading(&mut self) -> Result<(), Error> {
        self.controller.stop_reading().await
    }

    async fn request_unmute(&mut self) -> Result<(), Error> {
        self.controller.request_unmute().await
    }

    // ------ Utility Functions ------

    fn current_session(&self) -> Option<SessionId> {
        self.active_session.read().clone()
    }
}
