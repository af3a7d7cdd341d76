//! Seam between the session layer and the peer-connection/media-transport
//! primitive. The session layer only drives the handshake (descriptors and
//! reachability candidates) and gates the microphone; capturing samples and
//! moving them through the connection is the implementation's concern.

use std::sync::Arc;

use async_trait::async_trait;
use derive_more::Display;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Which half of the handshake a description belongs to.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum DescriptorKind {
    #[display(fmt = "offer")]
    #[serde(rename = "offer")]
    Offer,
    #[display(fmt = "answer")]
    #[serde(rename = "answer")]
    Answer,
}

/// A session description produced by one side of the handshake, in the
/// shape the shared document stores it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SessionDescriptor {
    #[serde(rename = "type")]
    pub kind: DescriptorKind,
    pub sdp: String,
}

/// One discovered reachability descriptor. Append-only once exchanged;
/// never updated in place.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CandidateRecord {
    pub candidate: String,
    #[serde(
        default,
        rename = "sdpMid",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum LinkState {
    #[display(fmt = "New")]
    New,
    #[display(fmt = "Connecting")]
    Connecting,
    #[display(fmt = "Connected")]
    Connected,
    #[display(fmt = "Disconnected")]
    Disconnected,
    #[display(fmt = "Failed")]
    Failed,
    #[display(fmt = "Closed")]
    Closed,
}

#[derive(Clone, Debug, Display)]
pub enum PeerLinkEvent {
    /// A locally discovered candidate that must be forwarded to the peer.
    #[display(fmt = "Candidate")]
    Candidate { candidate: CandidateRecord },
    /// Overall connection state changed. Informational; never fatal to the
    /// session layer.
    #[display(fmt = "ConnectionState")]
    ConnectionState { state: LinkState },
    /// ICE transport state changed.
    #[display(fmt = "IceState")]
    IceState { state: String },
    /// The peer added a media track. The calling application is responsible
    /// for reading from it.
    #[display(fmt = "RemoteTrack")]
    RemoteTrack { kind: String },
}

pub struct PeerLinkEventStream(pub BoxStream<'static, PeerLinkEvent>);

impl core::ops::Deref for PeerLinkEventStream {
    type Target = BoxStream<'static, PeerLinkEvent>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for PeerLinkEventStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Captured local media with a microphone gate. Capture starts muted; the
/// turn controller is the only thing that flips the gate.
#[async_trait]
pub trait LocalMedia: Send + Sync {
    fn set_microphone_enabled(&self, enabled: bool);
    fn microphone_enabled(&self) -> bool;
    /// Stops the captured tracks. Idempotent.
    async fn release(&self);
}

/// Opens peer links. One link per call; teardown drops the link and the
/// next start/join opens a fresh one.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Captures local media ahead of start/join.
    async fn capture_media(&self) -> Result<Arc<dyn LocalMedia>, Error>;
    /// Opens a fresh peer link with the captured tracks attached.
    async fn open(&self, media: Arc<dyn LocalMedia>) -> Result<Arc<dyn PeerLink>, Error>;
}

/// One peer connection.
///
/// Candidates received before the remote description is applied are held
/// back and added once it is, so callers don't have to order the store
/// subscription against the handshake.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescriptor, Error>;
    async fn create_answer(&self) -> Result<SessionDescriptor, Error>;
    async fn set_local_description(&self, desc: SessionDescriptor) -> Result<(), Error>;
    async fn set_remote_description(&self, desc: SessionDescriptor) -> Result<(), Error>;
    /// True once a remote description has been applied.
    fn remote_description_set(&self) -> bool;
    async fn add_remote_candidate(&self, candidate: CandidateRecord) -> Result<(), Error>;
    async fn get_event_stream(&self) -> Result<PeerLinkEventStream, Error>;
    /// Closes the underlying connection. Idempotent.
    async fn close(&self) -> Result<(), Error>;
}
