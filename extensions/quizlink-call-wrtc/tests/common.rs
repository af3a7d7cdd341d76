use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use uuid::Uuid;

use quizlink::call::session::SessionId;
use quizlink::call::{QuizCall, QuizCallEventKind, QuizCallEventStream};
use quizlink::error::Error;
use quizlink::quiz::{AnswerGrader, QuestionRecord, QuestionSource};
use quizlink::rtc::{
    CandidateRecord, DescriptorKind, LinkState, LocalMedia, PeerConnector, PeerLink,
    PeerLinkEvent, PeerLinkEventStream, SessionDescriptor,
};
use quizlink::speech::{
    RecognitionErrorKind, Recognizer, RecognizerEvent, RecognizerEventStream, Synthesizer,
    SynthesizerEvent, SynthesizerEventStream, Utterance, VoiceInfo,
};
use quizlink::sync::{Arc, Mutex};
use quizlink_call_wrtc::config::{RtcConfig, SessionConfig, SpeechConfig, TurnTiming};
use quizlink_call_wrtc::SessionClient;
use quizlink_store_memory::MemoryStore;

#[allow(dead_code)]
pub const QUESTION: &str = "What is the capital of France?";

/// Timings shrunk so a whole unmute cycle fits in well under a second.
pub fn test_config() -> SessionConfig {
    SessionConfig {
        rtc: RtcConfig::default(),
        timing: TurnTiming {
            unmute_window: Duration::from_millis(400),
            tick: Duration::from_millis(20),
            resume_settle: Duration::from_millis(60),
            recognizer_restart: Duration::from_millis(80),
            caption_clear: Duration::from_millis(150),
        },
        speech: SpeechConfig {
            rate: 1.0,
            chars_per_second: 20.0,
            voice_preferences: vec!["Test Voice".into()],
            ..SpeechConfig::default()
        },
    }
}

#[derive(Default)]
pub struct FakeMedia {
    mic: AtomicBool,
    released: AtomicBool,
}

#[allow(dead_code)]
impl FakeMedia {
    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalMedia for FakeMedia {
    fn set_microphone_enabled(&self, enabled: bool) {
        self.mic.store(enabled, Ordering::SeqCst);
    }

    fn microphone_enabled(&self) -> bool {
        self.mic.load(Ordering::SeqCst)
    }

    async fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Stands in for a peer connection. Descriptors are labeled strings, and
/// setting a local description "discovers" two candidates tagged with the
/// descriptor kind so tests can tell the two directions apart.
pub struct FakeLink {
    event_ch: broadcast::Sender<PeerLinkEvent>,
    local: Mutex<Option<SessionDescriptor>>,
    remote: Mutex<Option<SessionDescriptor>>,
    remote_candidates: Mutex<Vec<CandidateRecord>>,
    set_remote_calls: AtomicUsize,
    closed: AtomicBool,
}

impl FakeLink {
    fn new() -> Self {
        let (event_ch, _rx) = broadcast::channel(64);
        Self {
            event_ch,
            local: Mutex::new(None),
            remote: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            set_remote_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }
}

#[allow(dead_code)]
impl FakeLink {
    pub fn remote_candidates(&self) -> Vec<CandidateRecord> {
        self.remote_candidates.lock().clone()
    }

    pub fn set_remote_calls(&self) -> usize {
        self.set_remote_calls.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn create_offer(&self) -> Result<SessionDescriptor, Error> {
        Ok(SessionDescriptor {
            kind: DescriptorKind::Offer,
            sdp: format!("v=0 offer {}", Uuid::new_v4()),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescriptor, Error> {
        Ok(SessionDescriptor {
            kind: DescriptorKind::Answer,
            sdp: format!("v=0 answer {}", Uuid::new_v4()),
        })
    }

    async fn set_local_description(&self, desc: SessionDescriptor) -> Result<(), Error> {
        for n in 0..2 {
            let _ = self.event_ch.send(PeerLinkEvent::Candidate {
                candidate: CandidateRecord {
                    candidate: format!("candidate:{}-{n}", desc.kind),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                },
            });
        }
        *self.local.lock() = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescriptor) -> Result<(), Error> {
        self.set_remote_calls.fetch_add(1, Ordering::SeqCst);
        *self.remote.lock() = Some(desc);
        let _ = self.event_ch.send(PeerLinkEvent::ConnectionState {
            state: LinkState::Connected,
        });
        let _ = self.event_ch.send(PeerLinkEvent::RemoteTrack {
            kind: "audio".into(),
        });
        let _ = self.event_ch.send(PeerLinkEvent::RemoteTrack {
            kind: "video".into(),
        });
        Ok(())
    }

    fn remote_description_set(&self) -> bool {
        self.remote.lock().is_some()
    }

    async fn add_remote_candidate(&self, candidate: CandidateRecord) -> Result<(), Error> {
        self.remote_candidates.lock().push(candidate);
        Ok(())
    }

    async fn get_event_stream(&self) -> Result<PeerLinkEventStream, Error> {
        let mut rx = self.event_ch.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(_) => {}
                };
            }
        };
        Ok(PeerLinkEventStream(Box::pin(stream)))
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnector {
    media: Mutex<Vec<Arc<FakeMedia>>>,
    links: Mutex<Vec<Arc<FakeLink>>>,
}

#[allow(dead_code)]
impl FakeConnector {
    pub fn last_media(&self) -> Option<Arc<FakeMedia>> {
        self.media.lock().last().cloned()
    }

    pub fn last_link(&self) -> Option<Arc<FakeLink>> {
        self.links.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn capture_media(&self) -> Result<Arc<dyn LocalMedia>, Error> {
        let media = Arc::new(FakeMedia::default());
        self.media.lock().push(media.clone());
        Ok(media)
    }

    async fn open(&self, _media: Arc<dyn LocalMedia>) -> Result<Arc<dyn PeerLink>, Error> {
        let link = Arc::new(FakeLink::new());
        self.links.lock().push(link.clone());
        Ok(link)
    }
}

/// Plays an utterance for `char_ms` per character and then reports it
/// finished, unless it was cancelled in the meantime.
pub struct FakeSynthesizer {
    event_ch: broadcast::Sender<SynthesizerEvent>,
    char_ms: u64,
    current: Arc<Mutex<Option<Uuid>>>,
    spoken: Arc<Mutex<Vec<Utterance>>>,
}

impl FakeSynthesizer {
    pub fn new() -> Self {
        let (event_ch, _rx) = broadcast::channel(64);
        Self {
            event_ch,
            char_ms: 20,
            current: Arc::new(Mutex::new(None)),
            spoken: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[allow(dead_code)]
impl FakeSynthesizer {
    /// Every utterance handed to `speak`, in order.
    pub fn spoken(&self) -> Vec<Utterance> {
        self.spoken.lock().clone()
    }
}

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn voices(&self) -> Result<Vec<VoiceInfo>, Error> {
        Ok(vec![VoiceInfo {
            name: "Test Voice".into(),
            lang: "en-US".into(),
        }])
    }

    async fn speak(&self, utterance: Utterance) -> Result<(), Error> {
        self.spoken.lock().push(utterance.clone());
        *self.current.lock() = Some(utterance.id);
        let _ = self.event_ch.send(SynthesizerEvent::Started {
            utterance: utterance.id,
        });
        let ch = self.event_ch.clone();
        let current = self.current.clone();
        let playing = Duration::from_millis(self.char_ms * utterance.text.chars().count() as u64);
        tokio::spawn(async move {
            tokio::time::sleep(playing).await;
            let ran_to_end = {
                let mut current = current.lock();
                if *current == Some(utterance.id) {
                    *current = None;
                    true
                } else {
                    false
                }
            };
            if ran_to_end {
                let _ = ch.send(SynthesizerEvent::Finished {
                    utterance: utterance.id,
                });
            }
        });
        Ok(())
    }

    async fn cancel(&self) -> Result<(), Error> {
        *self.current.lock() = None;
        Ok(())
    }

    // cancel without flush is close enough here; the session layer
    // re-speaks from an offset instead of resuming the engine
    async fn pause(&self) -> Result<(), Error> {
        *self.current.lock() = None;
        Ok(())
    }

    async fn get_event_stream(&self) -> Result<SynthesizerEventStream, Error> {
        let mut rx = self.event_ch.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(_) => {}
                };
            }
        };
        Ok(SynthesizerEventStream(Box::pin(stream)))
    }
}

/// Recognizer driven by the test: call `hear_partial`/`hear_final` to feed
/// transcripts to whoever is listening.
pub struct FakeRecognizer {
    event_ch: broadcast::Sender<RecognizerEvent>,
    active: AtomicBool,
    starts: AtomicUsize,
}

impl FakeRecognizer {
    pub fn new() -> Self {
        let (event_ch, _rx) = broadcast::channel(64);
        Self {
            event_ch,
            active: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
        }
    }
}

#[allow(dead_code)]
impl FakeRecognizer {
    pub fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn hear_partial(&self, text: &str) {
        let _ = self
            .event_ch
            .send(RecognizerEvent::Partial { text: text.into() });
    }

    pub fn hear_final(&self, text: &str) {
        let _ = self
            .event_ch
            .send(RecognizerEvent::Final { text: text.into() });
    }

    pub fn end_on_its_own(&self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.event_ch.send(RecognizerEvent::Ended);
    }

    pub fn fail(&self, kind: RecognitionErrorKind) {
        let _ = self.event_ch.send(RecognizerEvent::Failed { kind });
    }
}

#[async_trait]
impl Recognizer for FakeRecognizer {
    async fn start(&self) -> Result<(), Error> {
        self.active.store(true, Ordering::SeqCst);
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), Error> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_event_stream(&self) -> Result<RecognizerEventStream, Error> {
        let mut rx = self.event_ch.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(_) => {}
                };
            }
        };
        Ok(RecognizerEventStream(Box::pin(stream)))
    }
}

pub struct StaticQuestions {
    deck: Vec<QuestionRecord>,
    available: bool,
}

#[allow(dead_code)]
impl StaticQuestions {
    pub fn deck(questions: Vec<QuestionRecord>) -> Self {
        Self {
            deck: questions,
            available: true,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            deck: vec![],
            available: false,
        }
    }
}

#[async_trait]
impl QuestionSource for StaticQuestions {
    async fn fetch_all(&self) -> Result<Vec<QuestionRecord>, Error> {
        if !self.available {
            return Err(Error::QuestionSourceUnavailable);
        }
        Ok(self.deck.clone())
    }

    async fn fetch_by_id(&self, id: u64) -> Result<QuestionRecord, Error> {
        if !self.available {
            return Err(Error::QuestionSourceUnavailable);
        }
        self.deck
            .iter()
            .find(|q| q.id == Some(id))
            .cloned()
            .ok_or(Error::QuestionNotFound)
    }
}

/// Hands out queued verdicts in order, repeating a "Correct!" verdict once
/// the queue runs dry, and records every (question, answer) pair it saw.
pub struct ScriptedGrader {
    verdicts: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedGrader {
    pub fn new() -> Self {
        Self {
            verdicts: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[allow(dead_code)]
impl ScriptedGrader {
    pub fn with_verdicts(verdicts: Vec<&str>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into_iter().map(String::from).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl AnswerGrader for ScriptedGrader {
    async fn grade(&self, question: &str, answer: &str) -> Result<String, Error> {
        self.calls.lock().push((question.into(), answer.into()));
        Ok(self
            .verdicts
            .lock()
            .pop_front()
            .unwrap_or_else(|| "Correct! That is the answer I have too.".into()))
    }
}

pub struct TestClient {
    pub client: SessionClient,
    pub events: QuizCallEventStream,
    pub connector: Arc<FakeConnector>,
    pub synthesizer: Arc<FakeSynthesizer>,
    pub recognizer: Arc<FakeRecognizer>,
    pub grader: Arc<ScriptedGrader>,
}

pub async fn test_client(store: Arc<MemoryStore>) -> anyhow::Result<TestClient> {
    let questions = Arc::new(StaticQuestions::deck(vec![QuestionRecord {
        id: Some(1),
        prompt: QUESTION.into(),
    }]));
    test_client_with(store, questions).await
}

#[allow(dead_code)]
pub async fn test_client_with(
    store: Arc<MemoryStore>,
    questions: Arc<dyn QuestionSource>,
) -> anyhow::Result<TestClient> {
    let connector = Arc::new(FakeConnector::default());
    let synthesizer = Arc::new(FakeSynthesizer::new());
    let recognizer = Arc::new(FakeRecognizer::new());
    let grader = Arc::new(ScriptedGrader::new());
    let mut client = SessionClient::with_connector(
        test_config(),
        connector.clone(),
        store,
        synthesizer.clone(),
        recognizer.clone(),
        questions,
        grader.clone(),
    );
    let events = client.get_event_stream().await?;
    Ok(TestClient {
        client,
        events,
        connector,
        synthesizer,
        recognizer,
        grader,
    })
}

/// Two clients on one store, through the handshake and connected.
#[allow(dead_code)]
pub async fn connect_pair(
    store: Arc<MemoryStore>,
) -> anyhow::Result<(TestClient, TestClient, SessionId)> {
    let mut a = test_client(store.clone()).await?;
    let mut b = test_client(store).await?;

    a.client.enable_media().await?;
    b.client.enable_media().await?;

    let session = a.client.start_session().await?;
    b.client.join_session(session.clone()).await?;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(QuizCallEventKind::PeerConnected) = a.events.next().await {
                break;
            }
        }
    })
    .await?;
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(QuizCallEventKind::PeerConnected) = b.events.next().await {
                break;
            }
        }
    })
    .await?;

    Ok((a, b, session))
}

/// Polls until `cond` holds.
#[allow(dead_code)]
pub async fn wait_until<F: Fn() -> bool>(cond: F) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;
    Ok(())
}

/// Drains events until `dur` elapses.
#[allow(dead_code)]
pub async fn collect_for(
    events: &mut QuizCallEventStream,
    dur: Duration,
) -> Vec<QuizCallEventKind> {
    let mut out = vec![];
    let _ = tokio::time::timeout(dur, async {
        while let Some(event) = events.next().await {
            out.push(event);
        }
    })
    .await;
    out
}
