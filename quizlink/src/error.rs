use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    //Signaling Errors
    #[error("Local media has not been captured")]
    MediaNotReady,
    #[error("MediaUnavailable: {_0}")]
    MediaUnavailable(String),
    #[error("CallAlreadyInProgress")]
    CallAlreadyInProgress,
    #[error("CallNotInProgress")]
    CallNotInProgress,
    #[error("Session not found")]
    SessionNotFound,
    #[error("Session does not have an offer yet")]
    OfferUnavailable,
    #[error("Remote description has already been applied")]
    RemoteDescriptionAlreadySet,
    #[error("SignalingFailed: {_0}")]
    SignalingFailed(String),

    //Session Store Errors
    #[error("Session store is unavailable")]
    StoreUnavailable,
    #[error("PublishFailed: {_0}")]
    PublishFailed(String),
    #[error("Session subscription closed")]
    WatchClosed,

    //Turn Errors
    #[error("Another party holds the unmute window")]
    MuteLockHeld,

    //Speech Errors
    #[error("SynthesisFailed: {_0}")]
    SynthesisFailed(String),
    #[error("RecognitionFailed: {_0}")]
    RecognitionFailed(String),

    //Grading Errors
    #[error("GradingFailed: {_0}")]
    GradingFailed(String),
    #[error("Grading verdict was malformed")]
    MalformedVerdict,

    //Question Source Errors
    #[error("Question source is unavailable")]
    QuestionSourceUnavailable,
    #[error("Question not found")]
    QuestionNotFound,

    //Misc
    #[error("{0}")]
    OtherWithContext(String),
    #[error("Sender Channel Unavailable")]
    SenderChannelUnavailable,
    #[error("Receiver Channel Unavailable")]
    ReceiverChannelUnavailable,
    #[error("{0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error(transparent)]
    Any(#[from] anyhow::Error),
    #[error("Functionality is not yet implemented")]
    Unimplemented,
    #[error(transparent)]
    Boxed(Box<dyn std::error::Error + Sync + Send>),
    #[error("An unknown error has occurred")]
    Other,
}
