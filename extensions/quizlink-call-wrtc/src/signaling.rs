use futures::StreamExt;
use tokio::sync::{mpsc::UnboundedSender, Notify};

use quizlink::call::session::{SessionDocument, SessionId, SessionPatch};
use quizlink::error::Error;
use quizlink::rtc::{LocalMedia, PeerConnector, PeerLink, PeerLinkEvent};
use quizlink::store::{CandidateSide, SessionStore};
use quizlink::sync::Arc;

use crate::controller::LoopEvent;

/// Negotiates the peer link through the session store: one party persists
/// an offer, the other a matching answer, and both forward their ICE
/// candidates to their own sub-collection while draining the other side's.
///
/// All pumps spawned for a link terminate together through one notify,
/// which `teardown` replaces for the next session.
pub struct SignalingController {
    connector: Arc<dyn PeerConnector>,
    store: Arc<dyn SessionStore>,
    ch: UnboundedSender<LoopEvent>,
    media: Option<Arc<dyn LocalMedia>>,
    link: Option<Arc<dyn PeerLink>>,
    session: Option<SessionId>,
    side: Option<CandidateSide>,
    pump_notify: Arc<Notify>,
}

impl SignalingController {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        store: Arc<dyn SessionStore>,
        ch: UnboundedSender<LoopEvent>,
    ) -> Self {
        Self {
            connector,
            store,
            ch,
            media: None,
            link: None,
            session: None,
            side: None,
            pump_notify: Arc::new(Notify::new()),
        }
    }

    /// Captures camera and microphone. The microphone starts disabled;
    /// only the unmute window enables it.
    pub async fn capture_media(&mut self) -> Result<(), Error> {
        if self.media.is_some() {
            return Ok(());
        }
        let media = self.connector.capture_media().await?;
        media.set_microphone_enabled(false);
        self.media = Some(media);
        Ok(())
    }

    pub fn media(&self) -> Option<Arc<dyn LocalMedia>> {
        self.media.clone()
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session.clone()
    }

    pub async fn start_session(&mut self) -> Result<SessionId, Error> {
        if self.link.is_some() {
            return Err(Error::CallAlreadyInProgress);
        }
        let media = self.media.clone().ok_or(Error::MediaNotReady)?;
        let link = self.connector.open(media).await?;
        self.link = Some(link.clone());
        match self.create_and_offer(&link).await {
            Ok(session) => {
                self.session = Some(session.clone());
                self.side = Some(CandidateSide::Offer);
                Ok(session)
            }
            Err(e) => {
                self.close_link().await;
                Err(e)
            }
        }
    }

    async fn create_and_offer(&mut self, link: &Arc<dyn PeerLink>) -> Result<SessionId, Error> {
        let session = self.store.create_session().await?;
        // forward candidates from the moment negotiation starts
        self.spawn_link_pump(&session, CandidateSide::Offer, link)
            .await?;
        let offer = link.create_offer().await?;
        link.set_local_description(offer.clone()).await?;
        self.store
            .update_session(
                &session,
                SessionPatch {
                    offer: Some(offer),
                    ..Default::default()
                },
            )
            .await?;
        self.spawn_candidate_pump(&session, CandidateSide::Answer, link)
            .await?;
        Ok(session)
    }

    pub async fn join_session(&mut self, session: SessionId) -> Result<(), Error> {
        if self.link.is_some() {
            return Err(Error::CallAlreadyInProgress);
        }
        let media = self.media.clone().ok_or(Error::MediaNotReady)?;
        let doc = self
            .store
            .get_session(&session)
            .await?
            .ok_or(Error::SessionNotFound)?;
        let offer = doc.offer.ok_or(Error::OfferUnavailable)?;

        let link = self.connector.open(media).await?;
        self.link = Some(link.clone());
        match self.answer_offer(&session, offer, &link).await {
            Ok(()) => {
                self.session = Some(session);
                self.side = Some(CandidateSide::Answer);
                Ok(())
            }
            Err(e) => {
                self.close_link().await;
                Err(e)
            }
        }
    }

    async fn answer_offer(
        &mut self,
        session: &SessionId,
        offer: quizlink::rtc::SessionDescriptor,
        link: &Arc<dyn PeerLink>,
    ) -> Result<(), Error> {
        self.spawn_link_pump(session, CandidateSide::Answer, link)
            .await?;
        link.set_remote_description(offer).await?;
        let answer = link.create_answer().await?;
        link.set_local_description(answer.clone()).await?;
        self.store
            .update_session(
                session,
                SessionPatch {
                    answer: Some(answer),
                    ..Default::default()
                },
            )
            .await?;
        self.spawn_candidate_pump(session, CandidateSide::Offer, link)
            .await?;
        Ok(())
    }

    /// Applies an incoming answer from the session record, at most once.
    /// Only meaningful for the offering side.
    pub async fn apply_remote_answer(&self, doc: &SessionDocument) -> Result<(), Error> {
        if self.side != Some(CandidateSide::Offer) {
            return Ok(());
        }
        let Some(link) = &self.link else {
            return Ok(());
        };
        if link.remote_description_set() {
            return Ok(());
        }
        let Some(answer) = &doc.answer else {
            return Ok(());
        };
        link.set_remote_description(answer.clone()).await
    }

    /// Forwards locally discovered candidates to `local_side` and every
    /// other link event into the controller loop.
    async fn spawn_link_pump(
        &mut self,
        session: &SessionId,
        local_side: CandidateSide,
        link: &Arc<dyn PeerLink>,
    ) -> Result<(), Error> {
        let mut events = link.get_event_stream().await?;
        let store = self.store.clone();
        let ch = self.ch.clone();
        let notify = self.pump_notify.clone();
        let session = session.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = notify.notified() => {
                        log::debug!("link event pump terminated by notify");
                        break;
                    }
                    opt = events.next() => match opt {
                        Some(PeerLinkEvent::Candidate { candidate }) => {
                            if let Err(e) = store.append_candidate(&session, local_side, candidate).await {
                                log::error!("failed to forward ice candidate to {local_side}: {e}");
                            }
                        }
                        Some(ev) => {
                            let _ = ch.send(LoopEvent::Link(ev));
                        }
                        None => {
                            log::debug!("link event stream closed");
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Drains the other party's candidate sub-collection into the link,
    /// replaying records appended before we subscribed.
    async fn spawn_candidate_pump(
        &mut self,
        session: &SessionId,
        remote_side: CandidateSide,
        link: &Arc<dyn PeerLink>,
    ) -> Result<(), Error> {
        let mut stream = self.store.watch_candidates(session, remote_side).await?;
        let link = link.clone();
        let notify = self.pump_notify.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = notify.notified() => {
                        log::debug!("candidate pump for {remote_side} terminated by notify");
                        break;
                    }
                    opt = stream.next() => match opt {
                        Some(candidate) => {
                            if let Err(e) = link.add_remote_candidate(candidate).await {
                                log::error!("failed to add candidate from {remote_side}: {e}");
                            }
                        }
                        None => {
                            log::debug!("candidate stream for {remote_side} closed");
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Stops pumps and closes the link while keeping captured media, so a
    /// failed attempt can be retried without capturing again.
    pub async fn close_link(&mut self) {
        self.pump_notify.notify_waiters();
        self.pump_notify = Arc::new(Notify::new());
        if let Some(link) = self.link.take() {
            if let Err(e) = link.close().await {
                log::error!("failed to close peer link: {e}");
            }
        }
        self.session = None;
        self.side = None;
    }

    /// Stops pumps, closes the link and releases captured media. Safe to
    /// call repeatedly.
    pub async fn teardown(&mut self) {
        self.close_link().await;
        if let Some(media) = self.media.take() {
            media.release().await;
        }
    }
}
