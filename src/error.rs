use thiserror::Error;

/// A device field failed validation. Raised only while building a device.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("device name must be 1 to 20 characters long")]
    InvalidName,
    #[error("'{0}' is not a valid ECID")]
    InvalidEcid(String),
    #[error("'{0}' is not a known device identifier")]
    UnknownIdentifier(String),
    #[error("{0} is not a supported device")]
    UnsupportedDevice(String),
    #[error("'{0}' is not a valid board config")]
    InvalidBoardconfig(String),
    #[error("board config {boardconfig} does not belong to {identifier}")]
    BoardMismatch { identifier: String, boardconfig: String },
    #[error("'{0}' is not a valid generator, expected 0x followed by 16 hex digits")]
    InvalidGenerator(String),
    #[error("'{apnonce}' is not a valid ApNonce, expected {expected} hex characters")]
    InvalidApnonce { apnonce: String, expected: usize },
    #[error("a generator is required alongside an ApNonce on this device")]
    GeneratorRequired,
    #[error("ApNonce {apnonce} does not match generator {generator}")]
    NonceMismatch { generator: String, apnonce: String },
    /// Validation needed the firmware metadata API and it failed.
    #[error("could not validate device")]
    Api(#[from] ApiError),
}

/// The firmware metadata API could not be reached or answered unusably.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("failed to decode response from {url}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// A save run could not start or could not read the registry.
#[derive(Debug, Error)]
pub enum SaveError {
    /// Another save run holds the exclusion lock.
    #[error("blobs are currently being saved, please wait")]
    InProgress,
    #[error("failed to read devices")]
    Registry(#[from] autotss_registry::Error),
    #[error("failed to take the save lock")]
    Lock(#[from] std::io::Error),
}
