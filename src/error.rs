#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("stack error: {0}")]
    Stack(String),

    #[error("dial error: {0}")]
    Dial(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("dns error: {0}")]
    Dns(String),

    #[error("session timeout: {0}")]
    SessionTimeout(String),

    #[error("std::io::Error {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<uuid::Error> for Error {
    fn from(err: uuid::Error) -> Self {
        Self::Config(format!("malformed uuid: {err}"))
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Self::Tls(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<trust_dns_proto::error::ProtoError> for Error {
    fn from(err: trust_dns_proto::error::ProtoError) -> Self {
        Self::Dns(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Dns(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
