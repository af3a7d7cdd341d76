use futures::StreamExt;
use tokio::sync::{mpsc::UnboundedSender, Notify};

use quizlink::call::session::{SessionId, SessionPatch};
use quizlink::error::Error;
use quizlink::store::SessionStore;
use quizlink::sync::Arc;

use crate::controller::LoopEvent;

/// Keeps one store subscription alive for the attached session and fans
/// every delivered record into the controller loop. Writes go out as
/// field-level patches; the record as a whole is never overwritten.
pub struct Synchronizer {
    store: Arc<dyn SessionStore>,
    ch: UnboundedSender<LoopEvent>,
    watch_notify: Option<Arc<Notify>>,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn SessionStore>, ch: UnboundedSender<LoopEvent>) -> Self {
        Self {
            store,
            ch,
            watch_notify: None,
        }
    }

    /// Subscribes to the session record. The store delivers the current
    /// record first, so an attach right after a write still observes it.
    pub async fn attach(&mut self, session: &SessionId) -> Result<(), Error> {
        self.detach();
        let mut stream = self.store.watch_session(session).await?;
        let notify = Arc::new(Notify::new());
        self.watch_notify = Some(notify.clone());
        let ch = self.ch.clone();
        let id = session.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = notify.notified() => {
                        log::debug!("session watch for {id} terminated by notify");
                        break;
                    }
                    opt = stream.next() => match opt {
                        Some(doc) => {
                            let _ = ch.send(LoopEvent::Doc(doc));
                        }
                        None => {
                            log::debug!("session watch for {id} closed by the store");
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    pub fn detach(&mut self) {
        if let Some(notify) = self.watch_notify.take() {
            notify.notify_waiters();
        }
    }

    pub async fn publish(&self, session: &SessionId, patch: SessionPatch) -> Result<(), Error> {
        if patch.is_empty() {
            return Ok(());
        }
        self.store.update_session(session, patch).await
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        self.detach();
    }
}
