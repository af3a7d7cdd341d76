//! Session document store. The store is the single source of cross-party
//! truth: clients never signal each other directly after connecting, they
//! watch the session document and its two candidate sub-collections.

use async_trait::async_trait;
use derive_more::Display;
use futures::stream::BoxStream;

use crate::call::session::{SessionDocument, SessionId, SessionPatch};
use crate::error::Error;
use crate::rtc::CandidateRecord;

/// Which candidate sub-collection a record belongs to.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
pub enum CandidateSide {
    #[display(fmt = "offerCandidates")]
    Offer,
    #[display(fmt = "answerCandidates")]
    Answer,
}

impl CandidateSide {
    /// The sub-collection the other party writes to.
    pub fn opposite(&self) -> Self {
        match self {
            CandidateSide::Offer => CandidateSide::Answer,
            CandidateSide::Answer => CandidateSide::Offer,
        }
    }
}

pub struct SessionWatchStream(pub BoxStream<'static, SessionDocument>);

impl core::ops::Deref for SessionWatchStream {
    type Target = BoxStream<'static, SessionDocument>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for SessionWatchStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

pub struct CandidateWatchStream(pub BoxStream<'static, CandidateRecord>);

impl core::ops::Deref for CandidateWatchStream {
    type Target = BoxStream<'static, CandidateRecord>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for CandidateWatchStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// External document store holding one record per session plus two ordered,
/// append-only candidate sub-collections.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Creates a session record with default fields, returning its id.
    async fn create_session(&self) -> Result<SessionId, Error>;
    async fn get_session(&self, session: &SessionId) -> Result<Option<SessionDocument>, Error>;
    /// Merges the present fields of `patch` into the stored record. Fields
    /// the patch does not carry keep their committed value.
    async fn update_session(&self, session: &SessionId, patch: SessionPatch) -> Result<(), Error>;
    /// Delivers the current record first, then every committed change in
    /// commit order. Updates superseded before the subscriber catches up
    /// may be dropped.
    async fn watch_session(&self, session: &SessionId) -> Result<SessionWatchStream, Error>;
    async fn append_candidate(
        &self,
        session: &SessionId,
        side: CandidateSide,
        candidate: CandidateRecord,
    ) -> Result<(), Error>;
    /// Replays candidates already appended to `side`, then new ones, in
    /// append order.
    async fn watch_candidates(
        &self,
        session: &SessionId,
        side: CandidateSide,
    ) -> Result<CandidateWatchStream, Error>;
}
