use thiserror::Error;

#[derive(Error, Debug)]
pub enum DvrError {
    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error("Manifest fetch error")]
    ManifestFetchError,

    #[error("Invalid manifest: {0}")]
    ManifestParseError(String),

    #[error("Unknown channel: {0}")]
    UnknownChannel(usize),

    #[error("Segment {index} is not cached")]
    SegmentNotCached { index: u64 },

    #[error("Recording range {start}..={end} is missing segment {missing}")]
    IncompleteRange { start: u64, end: u64, missing: u64 },

    #[error("Requested time is unreachable: {0:?}")]
    Unreachable(crate::timeline::TimelinePoint),

    #[error("Audio decode error: {0}")]
    DecodeError(String),

    #[error("No audio output device available")]
    NoAudioDevice,

    #[error(transparent)]
    SymphoniaError(#[from] symphonia::core::errors::Error),

    #[error(transparent)]
    BuildStreamError(#[from] cpal::BuildStreamError),

    #[error(transparent)]
    PlayStreamError(#[from] cpal::PlayStreamError),

    #[error(transparent)]
    PauseStreamError(#[from] cpal::PauseStreamError),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    JoinError(#[from] tokio::task::JoinError),
}

pub type DvrResult<T> = Result<T, DvrError>;
