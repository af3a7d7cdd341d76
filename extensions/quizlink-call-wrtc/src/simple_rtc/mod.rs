//! simple-rtc
//! This module augments the [webrtc-rs](https://github.com/webrtc-rs/webrtc) library for
//! one-to-one calls: one `RTCPeerConnection` per session, negotiated through whatever
//! carries the `SessionDescriptor` and `CandidateRecord` values it emits.
//!
//! this module moves RTP packets. Turning captured audio/video into RTP packets is the
//! user's responsibility; `webrtc-rs` provides a `rtp::packetizer` for raw samples and a
//! `media::io::sample_builder` for the receive side. The local tracks returned by
//! `RtcMedia` are where those packets get written.
//!
//! The microphone gate never detaches the audio track. It is a flag the sample source
//! consults, mirroring how a muted call keeps its transceiver alive.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::sdp::extmap::AUDIO_LEVEL_URI;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use quizlink::error::Error;
use quizlink::rtc::{
    CandidateRecord, DescriptorKind, LinkState, LocalMedia, PeerConnector, PeerLink,
    PeerLinkEvent, PeerLinkEventStream, SessionDescriptor,
};
use quizlink::sync::{Arc, Mutex};

use crate::config::RtcConfig;

/// Builds the webrtc API once and opens one link per call.
pub struct RtcConnector {
    api: webrtc::api::API,
    config: RtcConfig,
    captured: Mutex<Option<Arc<RtcMedia>>>,
}

impl RtcConnector {
    pub fn new(config: RtcConfig) -> Result<Self, Error> {
        Ok(Self {
            api: create_api()?,
            config,
            captured: Mutex::new(None),
        })
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn capture_media(&self) -> Result<Arc<dyn LocalMedia>, Error> {
        let media = Arc::new(RtcMedia::new());
        *self.captured.lock() = Some(media.clone());
        Ok(media)
    }

    async fn open(&self, _media: Arc<dyn LocalMedia>) -> Result<Arc<dyn PeerLink>, Error> {
        // the concrete handle with the local tracks is kept from
        // capture_media; the argument only proves the caller captured first
        let media = self.captured.lock().clone().ok_or(Error::MediaNotReady)?;
        let link = RtcLink::open(&self.api, &self.config, &media).await?;
        Ok(link)
    }
}

/// Local audio and video tracks plus the microphone gate. Whatever
/// packetizes captured samples writes to these tracks and skips audio
/// while the gate is closed.
pub struct RtcMedia {
    audio: Arc<TrackLocalStaticRTP>,
    video: Arc<TrackLocalStaticRTP>,
    mic_enabled: AtomicBool,
}

impl RtcMedia {
    fn new() -> Self {
        // one stream id for both tracks so the remote side groups them
        let stream_id = Uuid::new_v4().to_string();
        let audio = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            "audio".to_owned(),
            stream_id.clone(),
        ));
        let video = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video".to_owned(),
            stream_id,
        ));
        Self {
            audio,
            video,
            mic_enabled: AtomicBool::new(false),
        }
    }

    pub fn audio_track(&self) -> Arc<TrackLocalStaticRTP> {
        self.audio.clone()
    }

    pub fn video_track(&self) -> Arc<TrackLocalStaticRTP> {
        self.video.clone()
    }
}

#[async_trait]
impl LocalMedia for RtcMedia {
    fn set_microphone_enabled(&self, enabled: bool) {
        self.mic_enabled.store(enabled, Ordering::SeqCst);
        log::debug!(
            "microphone {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    fn microphone_enabled(&self) -> bool {
        self.mic_enabled.load(Ordering::SeqCst)
    }

    async fn release(&self) {
        // the tracks stop flowing when the link closes; the gate is shut
        // here so a future link starts muted again
        self.mic_enabled.store(false, Ordering::SeqCst);
        log::debug!("released captured media");
    }
}

struct RtpSenderGuard {
    _sender: Arc<RTCRtpSender>,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for RtpSenderGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One peer connection with the local tracks attached.
pub struct RtcLink {
    connection: Arc<RTCPeerConnection>,
    event_ch: broadcast::Sender<PeerLinkEvent>,
    remote_set: AtomicBool,
    /// candidates held back until the remote description lands
    pending: Mutex<Vec<CandidateRecord>>,
    _senders: Vec<RtpSenderGuard>,
}

impl RtcLink {
    async fn open(
        api: &webrtc::api::API,
        config: &RtcConfig,
        media: &Arc<RtcMedia>,
    ) -> Result<Arc<Self>, Error> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }],
            ice_candidate_pool_size: config.ice_candidate_pool_size,
            ..Default::default()
        };

        let connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| Error::SignalingFailed(e.to_string()))?,
        );

        let (event_ch, _rx) = broadcast::channel(1024);

        // configure callbacks

        let tx = event_ch.clone();
        connection.on_peer_connection_state_change(Box::new(
            move |c: RTCPeerConnectionState| {
                log::info!("WebRTC connection state has changed {c}");
                let state = match c {
                    RTCPeerConnectionState::Unspecified => None,
                    RTCPeerConnectionState::New => Some(LinkState::New),
                    RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
                    RTCPeerConnectionState::Connected => Some(LinkState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(LinkState::Failed),
                    RTCPeerConnectionState::Closed => Some(LinkState::Closed),
                };
                if let Some(state) = state {
                    if let Err(e) = tx.send(PeerLinkEvent::ConnectionState { state }) {
                        log::error!("failed to send connection state event: {e}");
                    }
                }
                Box::pin(futures::future::ready(()))
            },
        ));

        let tx = event_ch.clone();
        connection.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            if let Some(candidate) = c {
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        log::error!("failed to serialize ice candidate: {e}");
                        return Box::pin(futures::future::ready(()));
                    }
                };
                let candidate = CandidateRecord {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                };
                if let Err(e) = tx.send(PeerLinkEvent::Candidate { candidate }) {
                    log::error!("failed to send ice candidate: {e}");
                }
            }
            Box::pin(futures::future::ready(()))
        }));

        let tx = event_ch.clone();
        connection.on_ice_connection_state_change(Box::new(
            move |connection_state: RTCIceConnectionState| {
                log::info!("ICE connection state has changed {connection_state}");
                let _ = tx.send(PeerLinkEvent::IceState {
                    state: connection_state.to_string(),
                });
                Box::pin(futures::future::ready(()))
            },
        ));

        let tx = event_ch.clone();
        connection.on_track(Box::new(
            move |track: Option<Arc<TrackRemote>>, _receiver: Option<Arc<RTCRtpReceiver>>| {
                if let Some(track) = track {
                    let kind = track.kind().to_string();
                    log::debug!("remote {kind} track added");
                    if let Err(e) = tx.send(PeerLinkEvent::RemoteTrack { kind }) {
                        log::error!("failed to send track added event: {e}");
                    }
                }
                Box::pin(futures::future::ready(()))
            },
        ));

        let mut senders = Vec::new();
        for track in [media.audio_track(), media.video_track()] {
            let rtp_sender = connection
                .add_track(track)
                .await
                .map_err(|e| Error::MediaUnavailable(e.to_string()))?;
            // Read incoming RTCP packets
            // Before these packets are returned they are processed by interceptors. For things
            // like NACK this needs to be called.
            let sender2 = rtp_sender.clone();
            let handle = tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while let Ok((_, _)) = sender2.read(&mut rtcp_buf).await {}
                log::debug!("terminating rtcp reader");
            });
            senders.push(RtpSenderGuard {
                _sender: rtp_sender,
                handle,
            });
        }

        Ok(Arc::new(Self {
            connection,
            event_ch,
            remote_set: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            _senders: senders,
        }))
    }

    async fn apply_candidate(&self, candidate: CandidateRecord) -> Result<(), Error> {
        self.connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::SignalingFailed(e.to_string()))
    }
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn create_offer(&self) -> Result<SessionDescriptor, Error> {
        let offer = self
            .connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SignalingFailed(e.to_string()))?;
        descriptor_from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescriptor, Error> {
        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SignalingFailed(e.to_string()))?;
        descriptor_from_rtc(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescriptor) -> Result<(), Error> {
        let sdp = descriptor_to_rtc(&desc)?;
        // Note: this will start the gathering of ICE candidates
        self.connection
            .set_local_description(sdp)
            .await
            .map_err(|e| Error::SignalingFailed(e.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescriptor) -> Result<(), Error> {
        let sdp = descriptor_to_rtc(&desc)?;
        self.connection
            .set_remote_description(sdp)
            .await
            .map_err(|e| Error::SignalingFailed(e.to_string()))?;
        // the flag flips under the pending lock, so a candidate is either
        // drained here or applied directly by add_remote_candidate
        let held: Vec<CandidateRecord> = {
            let mut pending = self.pending.lock();
            self.remote_set.store(true, Ordering::SeqCst);
            pending.drain(..).collect()
        };
        if !held.is_empty() {
            log::debug!("applying {} held candidates", held.len());
        }
        for candidate in held {
            self.apply_candidate(candidate).await?;
        }
        Ok(())
    }

    fn remote_description_set(&self) -> bool {
        self.remote_set.load(Ordering::SeqCst)
    }

    async fn add_remote_candidate(&self, candidate: CandidateRecord) -> Result<(), Error> {
        {
            let mut pending = self.pending.lock();
            if !self.remote_set.load(Ordering::SeqCst) {
                pending.push(candidate);
                return Ok(());
            }
        }
        self.apply_candidate(candidate).await
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
        self.connection
            .close()
            .await
            .map_err(|e| Error::SignalingFailed(e.to_string()))
    }
}

fn descriptor_from_rtc(desc: &RTCSessionDescription) -> Result<SessionDescriptor, Error> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => DescriptorKind::Offer,
        RTCSdpType::Answer => DescriptorKind::Answer,
        other => {
            return Err(Error::SignalingFailed(format!(
                "unsupported sdp type: {other}"
            )))
        }
    };
    Ok(SessionDescriptor {
        kind,
        sdp: desc.sdp.clone(),
    })
}

fn descriptor_to_rtc(desc: &SessionDescriptor) -> Result<RTCSessionDescription, Error> {
    match desc.kind {
        DescriptorKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        DescriptorKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
    }
    .map_err(|e| Error::SignalingFailed(e.to_string()))
}

// todo: make the codec set configurable
fn create_api() -> anyhow::Result<webrtc::api::API> {
    let mut media = MediaEngine::default();

    media.register_header_extension(
        webrtc::rtp_transceiver::rtp_codec::RTCRtpHeaderExtensionCapability {
            uri: AUDIO_LEVEL_URI.into(),
        },
        RTPCodecType::Audio,
        Some(RTCRtpTransceiverDirection::Sendrecv),
    )?;

    media.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    media.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 1,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: 112,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    media.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    // Create a InterceptorRegistry. This is the user configurable RTP/RTCP Pipeline.
    // This provides NACKs, RTCP Reports and other features. If you use `webrtc.NewPeerConnection`
    // this is enabled by default. If you are manually managing You MUST create a InterceptorRegistry
    // for each PeerConnection.
    let mut registry = Registry::new();

    // Use the default set of Interceptors
    registry = register_default_interceptors(registry, &mut media)?;

    // Create the API object with the MediaEngine
    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}
