use thiserror::Error;

/// Why a connection attempt ended. The session only cares that it ended;
/// the variant is for the log.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("connection closed by peer")]
    Eof,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure to turn a finished payload into an image.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload is not a recognised image format")]
    UnknownFormat,

    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("decode worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("failed to open log file: {0}")]
    LogFile(#[from] std::io::Error),

    #[error("failed to install logger: {0}")]
    Install(#[from] log::SetLoggerError),
}
