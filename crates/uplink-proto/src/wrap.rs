use once_cell::sync::Lazy;
use regex::Regex;

use crate::constants::{JSON_PREFIX, JSON_SUFFIX, UIDL_REFRESH_TOKEN};
use crate::message::UidlMessage;
use crate::ProtoError;

static REFRESH_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"{}(:\s*(.*?))?(\s|$)",
        regex::escape(UIDL_REFRESH_TOKEN)
    ))
    .expect("refresh token pattern is valid")
});

/// Removes the `for(;;);[ ... ]` envelope, returning the inner JSON text.
pub fn strip_wrapping(text: &str) -> Option<&str> {
    text.strip_prefix(JSON_PREFIX)?.strip_suffix(JSON_SUFFIX)
}

pub fn parse_wrapped(text: &str) -> Result<UidlMessage, ProtoError> {
    let inner = strip_wrapping(text).ok_or(ProtoError::MissingWrapper)?;
    Ok(serde_json::from_str(inner)?)
}

/// A refresh marker found in a non-JSON body. `url` is `None` when the marker
/// asks for a plain reload of the current location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshToken {
    pub url: Option<String>,
}

pub fn find_refresh_token(body: &str) -> Option<RefreshToken> {
    let captures = REFRESH_TOKEN.captures(body)?;
    let url = captures
        .get(2)
        .map(|m| m.as_str().to_string())
        .filter(|url| !url.is_empty());
    Some(RefreshToken { url })
}
