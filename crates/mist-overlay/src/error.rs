use thiserror::Error;

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("store error: {0}")]
    Store(#[from] mist_store::StoreError),

    #[error("crypto error: {0}")]
    Crypto(#[from] mist_crypto::CryptoError),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("payload of {0} bytes exceeds the frame size")]
    Oversize(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("handshake failed: {0}")]
    Handshake(String),
}

impl From<serde_json::Error> for OverlayError {
    fn from(e: serde_json::Error) -> Self {
        OverlayError::Codec(e.to_string())
    }
}
