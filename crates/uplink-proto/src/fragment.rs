//! Splits an outgoing push message into frames the server can reassemble.
//!
//! The first fragment starts with `<length>|` where the length is the number
//! of UTF-16 code units in the whole message, the unit the server counts in.
//! The header eats into the first fragment's budget and is never split, so
//! with a budget no larger than the header the first fragment is the header
//! alone and may exceed the budget. Fragments never split a `char`, and every
//! later one carries at least one, so a budget smaller than a single
//! surrogate pair still makes progress.

use crate::constants::{MESSAGE_DELIMITER, WEBSOCKET_FRAGMENT_SIZE};

#[derive(Debug)]
pub struct Fragmenter<'a> {
    message: &'a str,
    budget: usize,
    /// Byte offset of the next unsent char.
    offset: usize,
    header_sent: bool,
}

impl<'a> Fragmenter<'a> {
    pub fn new(message: &'a str) -> Self {
        Self::with_budget(message, WEBSOCKET_FRAGMENT_SIZE)
    }

    pub fn with_budget(message: &'a str, budget: usize) -> Self {
        Self {
            message,
            budget: budget.max(1),
            offset: 0,
            header_sent: false,
        }
    }

    pub fn has_next(&self) -> bool {
        !self.header_sent || self.offset < self.message.len()
    }

    /// Returns the next fragment.
    ///
    /// # Panics
    ///
    /// When called after [`has_next`](Self::has_next) returned `false`.
    pub fn next_fragment(&mut self) -> String {
        assert!(self.has_next(), "next_fragment called on an exhausted fragmenter");

        let mut out = String::new();
        let mut remaining = self.budget;
        if !self.header_sent {
            let total: usize = self.message.encode_utf16().count();
            out.push_str(&total.to_string());
            out.push(MESSAGE_DELIMITER);
            remaining = remaining.saturating_sub(out.len());
            self.header_sent = true;
        }

        let rest = &self.message[self.offset..];
        let mut taken_bytes = 0;
        for ch in rest.chars() {
            let units = ch.len_utf16();
            let can_stop = taken_bytes > 0 || !out.is_empty();
            if can_stop && units > remaining {
                break;
            }
            remaining = remaining.saturating_sub(units);
            taken_bytes += ch.len_utf8();
            if remaining == 0 {
                break;
            }
        }
        out.push_str(&rest[..taken_bytes]);
        self.offset += taken_bytes;
        out
    }
}

impl Iterator for Fragmenter<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.has_next().then(|| self.next_fragment())
    }
}

/// Splits a fragment-0 string into its declared length and first payload.
pub fn split_header(fragment: &str) -> Option<(usize, &str)> {
    let (len, body) = fragment.split_once(MESSAGE_DELIMITER)?;
    Some((len.parse().ok()?, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(fragments: &[String]) -> String {
        let (declared, first) = split_header(&fragments[0]).expect("header");
        let mut out = first.to_string();
        for fragment in &fragments[1..] {
            out.push_str(fragment);
        }
        assert_eq!(declared, out.encode_utf16().count());
        out
    }

    #[test]
    fn empty_message_is_one_header_only_fragment() {
        let fragments: Vec<_> = Fragmenter::with_budget("", 8).collect();
        assert_eq!(fragments, vec!["0|".to_string()]);
        assert_eq!(reassemble(&fragments), "");
    }

    #[test]
    fn round_trip_at_interesting_lengths() {
        let budget = 10;
        for len in [1usize, budget, budget - 2, budget * 3, budget * 5 + 1] {
            let message: String = "abcdefghij".chars().cycle().take(len).collect();
            let fragments: Vec<_> = Fragmenter::with_budget(&message, budget).collect();
            for fragment in &fragments {
                assert!(fragment.encode_utf16().count() <= budget, "{fragment:?}");
            }
            assert_eq!(reassemble(&fragments), message, "length {len}");
        }
    }

    #[test]
    fn header_counts_against_first_budget() {
        let fragments: Vec<_> = Fragmenter::with_budget("abcdefgh", 5).collect();
        assert_eq!(fragments[0], "8|abc");
        assert_eq!(fragments[1], "defgh");
        assert_eq!(fragments.len(), 2);
    }

    #[test]
    fn never_splits_surrogate_pairs() {
        let message = "a😀b😀c";
        let fragments: Vec<_> = Fragmenter::with_budget(message, 3).collect();
        assert_eq!(reassemble(&fragments), message);
        assert!(fragments.iter().all(|f| !f.is_empty()));
        let (declared, _) = split_header(&fragments[0]).expect("header");
        assert_eq!(declared, 7);
    }

    #[test]
    fn tiny_budget_still_progresses() {
        let fragments: Vec<_> = Fragmenter::with_budget("xyz", 1).collect();
        assert_eq!(fragments, vec!["3|", "x", "y", "z"]);
    }

    #[test]
    fn header_filling_the_budget_goes_alone() {
        let message = "abcdefghij";
        let fragments: Vec<_> = Fragmenter::with_budget(message, 3).collect();
        assert_eq!(fragments[0], "10|");
        assert_eq!(fragments[1], "abc");
        for fragment in &fragments[1..] {
            assert!(fragment.encode_utf16().count() <= 3, "{fragment:?}");
        }
        assert_eq!(reassemble(&fragments), message);

        let fragments: Vec<_> = Fragmenter::with_budget(message, 2).collect();
        assert_eq!(fragments[0], "10|", "the header is never split");
        assert_eq!(fragments[1], "ab");
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn next_after_exhaustion_panics() {
        let mut fragmenter = Fragmenter::with_budget("a", 4);
        let _ = fragmenter.next_fragment();
        assert!(!fragmenter.has_next());
        let _ = fragmenter.next_fragment();
    }

    #[test]
    fn default_budget_fits_one_websocket_frame() {
        let message = "x".repeat(WEBSOCKET_FRAGMENT_SIZE * 2);
        let fragments: Vec<_> = Fragmenter::new(&message).collect();
        assert_eq!(fragments.len(), 3);
        assert_eq!(reassemble(&fragments), message);
    }
}
