//! Message tokenizer
//!
//! A word is a maximal run of ASCII letters, digits, `'`, `$`, `-` or
//! non-ASCII bytes, folded to ASCII lowercase. Each word is identified by
//! its xxh3 hash; the text is kept only for debug output.

use rustc_hash::FxHashSet;
use xxhash_rust::xxh3::xxh3_64;

/// Words longer than this are cut (at a character boundary).
pub const MAX_WORD_LEN: usize = 64;

/// A distinct word of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word {
    /// Lowercased text
    pub text: String,
    /// Stable word identity
    pub hash: u64,
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b >= 0x80 || matches!(b, b'\'' | b'$' | b'-')
}

/// Hash of a word as it is stored in the model.
pub fn word_hash(word: &str) -> u64 {
    xxh3_64(word.as_bytes())
}

/// Split text into distinct words, in order of first appearance.
pub fn tokenize(text: &[u8]) -> Vec<Word> {
    let mut seen = FxHashSet::default();
    let mut words = Vec::new();

    for run in text.split(|b| !is_word_byte(*b)) {
        let run = trim_punctuation(run);
        if run.is_empty() {
            continue;
        }

        let mut text = String::from_utf8_lossy(run).to_ascii_lowercase();
        if text.len() > MAX_WORD_LEN {
            let mut cut = MAX_WORD_LEN;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }

        let hash = word_hash(&text);
        if seen.insert(hash) {
            words.push(Word { text, hash });
        }
    }
    words
}

/// Leading and trailing `'` / `-` are quoting, not part of the word.
fn trim_punctuation(run: &[u8]) -> &[u8] {
    let is_edge = |b: &u8| matches!(b, b'\'' | b'-');
    let start = run.iter().position(|b| !is_edge(b)).unwrap_or(run.len());
    let end = run.iter().rposition(|b| !is_edge(b)).map_or(start, |e| e + 1);
    &run[start..end]
}
