//! Black list of phrases
//!
//! A message containing any black-listed phrase (case-insensitively) is
//! spam regardless of its word statistics. Phrases are stored trimmed and
//! lowercased; the on-disk form is the phrases joined by `\n`.

use std::collections::BTreeSet;

/// Set of black-listed phrases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlackList {
    phrases: BTreeSet<String>,
}

/// Canonical form of a phrase, or `None` if nothing is left of it.
pub fn normalize_phrase(phrase: &str) -> Option<String> {
    let phrase = phrase.trim().to_lowercase();
    if phrase.is_empty() || phrase.contains('\n') {
        None
    } else {
        Some(phrase)
    }
}

impl BlackList {
    /// Empty black list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the on-disk form.
    pub fn decode(bytes: &[u8]) -> Result<Self, std::str::Utf8Error> {
        let text = std::str::from_utf8(bytes)?;
        Ok(BlackList {
            phrases: text.split('\n').filter_map(normalize_phrase).collect(),
        })
    }

    /// Encode to the on-disk form.
    pub fn encode(&self) -> Vec<u8> {
        self.render().into_bytes()
    }

    /// Phrases joined by `\n`.
    pub fn render(&self) -> String {
        self.phrases
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Add a phrase; false if it was already present or empty.
    pub fn insert(&mut self, phrase: &str) -> bool {
        match normalize_phrase(phrase) {
            Some(p) => self.phrases.insert(p),
            None => false,
        }
    }

    /// Remove a phrase; false if it was absent.
    pub fn remove(&mut self, phrase: &str) -> bool {
        match normalize_phrase(phrase) {
            Some(p) => self.phrases.remove(&p),
            None => false,
        }
    }

    /// Whether a phrase is listed.
    pub fn contains(&self, phrase: &str) -> bool {
        normalize_phrase(phrase).is_some_and(|p| self.phrases.contains(&p))
    }

    /// First listed phrase occurring in `text`.
    pub fn find_in(&self, text: &str) -> Option<&str> {
        if self.phrases.is_empty() {
            return None;
        }
        let text = text.to_lowercase();
        self.phrases
            .iter()
            .find(|p| text.contains(p.as_str()))
            .map(String::as_str)
    }

    /// Number of phrases.
    pub fn len(&self) -> usize {
        self.phrases.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }

    /// Estimated resident size.
    pub fn memory_bytes(&self) -> usize {
        self.phrases.iter().map(|p| p.capacity() + 32).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove() {
        let mut list = BlackList::new();
        assert!(list.insert("  Cheap Pills "));
        assert!(!list.insert("cheap pills"));
        assert!(list.contains("CHEAP PILLS"));
        assert!(list.remove("cheap pills"));
        assert!(!list.remove("cheap pills"));
        assert!(list.is_empty());
    }

    #[test]
    fn test_empty_phrase_rejected() {
        let mut list = BlackList::new();
        assert!(!list.insert("   "));
        assert!(!list.insert("two\nlines"));
    }

    #[test]
    fn test_find_in() {
        let mut list = BlackList::new();
        list.insert("viagra");
        assert_eq!(list.find_in("Buy VIAGRA today"), Some("viagra"));
        assert_eq!(list.find_in("nothing here"), None);
    }

    #[test]
    fn test_encode_decode() {
        let mut list = BlackList::new();
        list.insert("b phrase");
        list.insert("a phrase");
        assert_eq!(list.render(), "a phrase\nb phrase");
        assert_eq!(BlackList::decode(&list.encode()).unwrap(), list);
        assert!(BlackList::decode(b"").unwrap().is_empty());
    }
}
