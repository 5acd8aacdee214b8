//! Reassembles inbound push messages.
//!
//! With length tracking on, the server prefixes every message with
//! `<length>|`, length in UTF-16 code units. A transport frame may carry a
//! partial message or several whole ones. With the protocol handshake on, the
//! first message is `<tracking-id>|<heartbeat-ms>|<padding>|` rather than a
//! UIDL payload, and later messages equal to the padding are keep-alives.

use crate::constants::MESSAGE_DELIMITER;
use crate::ProtoError;

const DEFAULT_MAX_MESSAGE_UNITS: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub tracking_id: String,
    pub heartbeat_interval_ms: Option<u64>,
    pub padding: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodedMessage {
    Handshake(Handshake),
    KeepAlive,
    Message(String),
}

#[derive(Debug)]
pub struct MessageDecoder {
    track_length: bool,
    enable_protocol: bool,
    max_units: usize,
    buffer: String,
    expected: Option<usize>,
    handshake: Option<Handshake>,
}

impl MessageDecoder {
    pub fn new(track_length: bool, enable_protocol: bool) -> Self {
        Self {
            track_length,
            enable_protocol,
            max_units: DEFAULT_MAX_MESSAGE_UNITS,
            buffer: String::new(),
            expected: None,
            handshake: None,
        }
    }

    pub fn with_max_units(mut self, max_units: usize) -> Self {
        self.max_units = max_units;
        self
    }

    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// Drops partial state; called when the underlying connection is replaced.
    /// A new connection repeats the handshake.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected = None;
        self.handshake = None;
    }

    pub fn ingest(&mut self, frame: &str) -> Result<Vec<DecodedMessage>, ProtoError> {
        if !self.track_length {
            return Ok(vec![self.classify(frame.to_string())]);
        }
        self.buffer.push_str(frame);
        let mut out = Vec::new();
        loop {
            let expected = match self.expected {
                Some(expected) => expected,
                None => match self.take_header() {
                    Ok(Some(expected)) => expected,
                    Ok(None) => break,
                    Err(err) => {
                        self.buffer.clear();
                        return Err(err);
                    }
                },
            };
            match byte_len_for_units(&self.buffer, expected) {
                Some(bytes) => {
                    let body: String = self.buffer.drain(..bytes).collect();
                    self.expected = None;
                    out.push(self.classify(body));
                }
                None => {
                    self.expected = Some(expected);
                    break;
                }
            }
        }
        Ok(out)
    }

    fn take_header(&mut self) -> Result<Option<usize>, ProtoError> {
        let trimmed = self.buffer.trim_start();
        if trimmed.len() != self.buffer.len() {
            self.buffer = trimmed.to_string();
        }
        let Some(position) = self.buffer.find(MESSAGE_DELIMITER) else {
            if self.buffer.chars().all(|c| c.is_ascii_digit()) {
                return Ok(None);
            }
            return Err(ProtoError::MalformedLength(self.buffer.clone()));
        };
        let header = &self.buffer[..position];
        let units: usize = header
            .parse()
            .map_err(|_| ProtoError::MalformedLength(header.to_string()))?;
        if units > self.max_units {
            return Err(ProtoError::MessageTooLarge {
                limit: self.max_units,
            });
        }
        self.buffer.drain(..=position);
        Ok(Some(units))
    }

    fn classify(&mut self, body: String) -> DecodedMessage {
        if self.enable_protocol && self.handshake.is_none() {
            if let Some(handshake) = parse_handshake(&body) {
                tracing::debug!(
                    target: "uplink::proto",
                    tracking_id = %handshake.tracking_id,
                    "push protocol handshake"
                );
                self.handshake = Some(handshake.clone());
                return DecodedMessage::Handshake(handshake);
            }
        }
        let is_padding = self
            .handshake
            .as_ref()
            .and_then(|h| h.padding.as_deref())
            .is_some_and(|padding| body == padding);
        if is_padding || body.trim().is_empty() {
            return DecodedMessage::KeepAlive;
        }
        DecodedMessage::Message(body)
    }
}

fn parse_handshake(body: &str) -> Option<Handshake> {
    if body.starts_with(crate::constants::JSON_PREFIX) {
        return None;
    }
    let mut parts = body.split(MESSAGE_DELIMITER);
    let tracking_id = parts.next().filter(|id| !id.is_empty())?.to_string();
    let heartbeat_interval_ms = parts.next().and_then(|v| v.parse().ok());
    let padding = parts.next().filter(|p| !p.is_empty()).map(str::to_string);
    Some(Handshake {
        tracking_id,
        heartbeat_interval_ms,
        padding,
    })
}

/// Byte length of the prefix of `text` spanning exactly `units` UTF-16 code
/// units, or `None` if `text` is shorter.
fn byte_len_for_units(text: &str, units: usize) -> Option<usize> {
    let mut seen = 0;
    for (index, ch) in text.char_indices() {
        if seen >= units {
            return Some(index);
        }
        seen += ch.len_utf16();
    }
    (seen >= units).then_some(text.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::Fragmenter;

    fn messages(out: Vec<DecodedMessage>) -> Vec<String> {
        out.into_iter()
            .filter_map(|m| match m {
                DecodedMessage::Message(body) => Some(body),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn untracked_frames_pass_through() {
        let mut decoder = MessageDecoder::new(false, false);
        let out = decoder.ingest("for(;;);[{}]").expect("ingest");
        assert_eq!(out, vec![DecodedMessage::Message("for(;;);[{}]".into())]);
    }

    #[test]
    fn handshake_then_batched_messages() {
        let mut decoder = MessageDecoder::new(true, true);
        let out = decoder.ingest("12|abc|60000|X|").expect("handshake");
        assert_eq!(
            out,
            vec![DecodedMessage::Handshake(Handshake {
                tracking_id: "abc".into(),
                heartbeat_interval_ms: Some(60000),
                padding: Some("X".into()),
            })]
        );
        let out = decoder.ingest("3|one1|X3|two").expect("batch");
        assert_eq!(out.len(), 3);
        assert_eq!(out[1], DecodedMessage::KeepAlive);
        assert_eq!(messages(out), vec!["one", "two"]);
    }

    #[test]
    fn message_split_across_frames() {
        let mut decoder = MessageDecoder::new(true, false);
        assert!(decoder.ingest("1").expect("partial header").is_empty());
        assert!(decoder.ingest("0|hello").expect("partial body").is_empty());
        let out = decoder.ingest("world").expect("rest");
        assert_eq!(messages(out), vec!["helloworld"]);
    }

    #[test]
    fn decodes_fragmenter_output() {
        let message = "for(;;);[{\"syncId\":1,\"text\":\"😀 é\"}]";
        let mut decoder = MessageDecoder::new(true, false);
        let mut decoded = Vec::new();
        for fragment in Fragmenter::with_budget(message, 7) {
            decoded.extend(messages(decoder.ingest(&fragment).expect("ingest")));
        }
        assert_eq!(decoded, vec![message.to_string()]);
    }

    #[test]
    fn garbage_header_is_rejected_and_state_cleared() {
        let mut decoder = MessageDecoder::new(true, false);
        assert!(matches!(
            decoder.ingest("xyz|abc"),
            Err(ProtoError::MalformedLength(_))
        ));
        let out = decoder.ingest("2|ok").expect("recovers");
        assert_eq!(messages(out), vec!["ok"]);
    }

    #[test]
    fn oversize_length_is_rejected() {
        let mut decoder = MessageDecoder::new(true, false).with_max_units(4);
        assert!(matches!(
            decoder.ingest("5|abcde"),
            Err(ProtoError::MessageTooLarge { limit: 4 })
        ));
    }
}
