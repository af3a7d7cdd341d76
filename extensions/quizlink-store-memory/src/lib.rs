//! In-process implementation of the session store. Documents live in a
//! map guarded by a RwLock; watchers are fed over broadcast channels.
//! Matches the semantics the session layer expects from a real document
//! store: update order is commit order, a new document watcher sees the
//! current record first, and a new candidate watcher replays everything
//! appended so far.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use quizlink::call::session::{SessionDocument, SessionId, SessionPatch};
use quizlink::error::Error;
use quizlink::rtc::CandidateRecord;
use quizlink::store::{
    CandidateSide, CandidateWatchStream, SessionStore, SessionWatchStream,
};

const DOC_CHANNEL_CAPACITY: usize = 64;
const CANDIDATE_CHANNEL_CAPACITY: usize = 256;

struct CandidateLog {
    records: Vec<CandidateRecord>,
    tx: broadcast::Sender<CandidateRecord>,
}

impl CandidateLog {
    fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CANDIDATE_CHANNEL_CAPACITY);
        Self {
            records: Vec::new(),
            tx,
        }
    }
}

struct SessionSlot {
    document: SessionDocument,
    tx: broadcast::Sender<SessionDocument>,
    offer_candidates: CandidateLog,
    answer_candidates: CandidateLog,
}

impl SessionSlot {
    fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DOC_CHANNEL_CAPACITY);
        let document = SessionDocument {
            timestamp: Some(Utc::now()),
            ..Default::default()
        };
        Self {
            document,
            tx,
            offer_candidates: CandidateLog::new(),
            answer_candidates: CandidateLog::new(),
        }
    }

    fn candidates(&self, side: CandidateSide) -> &CandidateLog {
        match side {
            CandidateSide::Offer => &self.offer_candidates,
            CandidateSide::Answer => &self.answer_candidates,
        }
    }

    fn candidates_mut(&mut self, side: CandidateSide) -> &mut CandidateLog {
        match side {
            CandidateSide::Offer => &mut self.offer_candidates,
            CandidateSide::Answer => &mut self.answer_candidates,
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    sessions: Arc<RwLock<HashMap<SessionId, SessionSlot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed document, for assertions in tests.
    pub fn snapshot(&self, session: &SessionId) -> Option<SessionDocument> {
        self.sessions
            .read()
            .get(session)
            .map(|slot| slot.document.clone())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self) -> Result<SessionId, Error> {
        let id = Uuid::new_v4().to_string();
        self.sessions.write().insert(id.clone(), SessionSlot::new());
        log::debug!("created session {id}");
        Ok(id)
    }

    async fn get_session(&self, session: &SessionId) -> Result<Option<SessionDocument>, Error> {
        Ok(self
            .sessions
            .read()
            .get(session)
            .map(|slot| slot.document.clone()))
    }

    async fn update_session(&self, session: &SessionId, patch: SessionPatch) -> Result<(), Error> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut sessions = self.sessions.write();
        let slot = sessions.get_mut(session).ok_or(Error::SessionNotFound)?;
        patch.apply(&mut slot.document);
        // send while the write guard is held so watchers observe commit order
        let _ = slot.tx.send(slot.document.clone());
        Ok(())
    }

    async fn watch_session(&self, session: &SessionId) -> Result<SessionWatchStream, Error> {
        let (current, mut rx) = {
            let sessions = self.sessions.read();
            let slot = sessions.get(session).ok_or(Error::SessionNotFound)?;
            (slot.document.clone(), slot.tx.subscribe())
        };
        let stream = async_stream::stream! {
            yield current;
            loop {
                match rx.recv().await {
                    Ok(doc) => yield doc,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(_) => {}
                };
            }
        };
        Ok(SessionWatchStream(Box::pin(stream)))
    }

    async fn append_candidate(
        &self,
        session: &SessionId,
        side: CandidateSide,
        candidate: CandidateRecord,
    ) -> Result<(), Error> {
        let mut sessions = self.sessions.write();
        let slot = sessions.get_mut(session).ok_or(Error::SessionNotFound)?;
        let log = slot.candidates_mut(side);
        log.records.push(candidate.clone());
        let _ = log.tx.send(candidate);
        Ok(())
    }

    async fn watch_candidates(
        &self,
        session: &SessionId,
        side: CandidateSide,
    ) -> Result<CandidateWatchStream, Error> {
        let (existing, mut rx) = {
            let sessions = self.sessions.read();
            let slot = sessions.get(session).ok_or(Error::SessionNotFound)?;
            let log = slot.candidates(side);
            (log.records.clone(), log.tx.subscribe())
        };
        let stream = async_stream::stream! {
            for record in existing {
                yield record;
            }
            loop {
                match rx.recv().await {
                    Ok(record) => yield record,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(_) => {}
                };
            }
        };
        Ok(CandidateWatchStream(Box::pin(stream)))
    }
}
