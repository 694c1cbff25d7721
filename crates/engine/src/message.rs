//! Per-connection message buffer
//!
//! `current_text<tag>` stores a message on the connection; later teach and
//! test commands name the same tag to act on it. The text is tokenized
//! once, when it is stored.

use crate::tokenize::{tokenize, Word};

/// The message a connection is working on.
#[derive(Debug, Clone, Default)]
pub struct Message {
    tag: Option<i32>,
    text: Vec<u8>,
    words: Vec<Word>,
}

impl Message {
    /// A connection's initial, empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the message. NUL bytes become spaces.
    pub fn reinit(&mut self, tag: i32, payload: &[u8]) {
        self.text.clear();
        self.text.reserve_exact(payload.len());
        self.text
            .extend(payload.iter().map(|&b| if b == 0 { b' ' } else { b }));
        self.words = tokenize(&self.text);
        self.tag = Some(tag);
    }

    /// Drop the message, releasing its memory.
    pub fn clear(&mut self) {
        *self = Message::new();
    }

    /// Whether a message with `tag` is stored.
    pub fn matches(&self, tag: i32) -> bool {
        self.tag == Some(tag)
    }

    /// Stored tag.
    pub fn tag(&self) -> Option<i32> {
        self.tag
    }

    /// Message text.
    pub fn text(&self) -> &[u8] {
        &self.text
    }

    /// Distinct words of the message.
    pub fn words(&self) -> &[Word] {
        &self.words
    }

    /// Word hashes of the message.
    pub fn word_hashes(&self) -> Vec<u64> {
        self.words.iter().map(|w| w.hash).collect()
    }

    /// Estimated resident size.
    pub fn memory_bytes(&self) -> usize {
        self.text.capacity() + self.words.iter().map(|w| w.text.capacity() + 40).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reinit_replaces_nul() {
        let mut msg = Message::new();
        msg.reinit(7, b"hello\0world");
        assert_eq!(msg.text(), b"hello world");
        assert!(msg.matches(7));
        assert!(!msg.matches(8));
        assert_eq!(msg.words().len(), 2);
    }

    #[test]
    fn test_reinit_replaces_previous() {
        let mut msg = Message::new();
        msg.reinit(1, b"first message");
        msg.reinit(2, b"second");
        assert!(!msg.matches(1));
        assert_eq!(msg.text(), b"second");
        assert_eq!(msg.words().len(), 1);
    }

    #[test]
    fn test_new_matches_nothing() {
        let msg = Message::new();
        assert!(!msg.matches(0));
        assert_eq!(msg.tag(), None);
    }

    #[test]
    fn test_clear() {
        let mut msg = Message::new();
        msg.reinit(1, b"text");
        msg.clear();
        assert_eq!(msg.tag(), None);
        assert_eq!(msg.memory_bytes(), 0);
    }
}
