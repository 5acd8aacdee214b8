//! Wire vocabulary shared by the uplink client: request/response shapes,
//! the anti-hijacking wrapper, push fragmentation and length tracking.

pub mod constants;
pub mod fragment;
pub mod message;
pub mod track;
pub mod params;
pub mod wrap;

pub use fragment::Fragmenter;
pub use message::{AppError, Invocation, Meta, Redirect, UidlMessage, UidlRequest};
pub use params::{RequestType, service_url, to_websocket};
pub use track::{DecodedMessage, Handshake, MessageDecoder};
pub use wrap::{RefreshToken, find_refresh_token, parse_wrapped, strip_wrapping};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("response is not wrapped in the expected envelope")]
    MissingWrapper,
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed length header: {0:?}")]
    MalformedLength(String),
    #[error("tracked message exceeds {limit} code units")]
    MessageTooLarge { limit: usize },
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}
