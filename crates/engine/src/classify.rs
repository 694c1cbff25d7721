//! Spam probability
//!
//! Paul Graham's "A Plan for Spam" combination: every known word gets a
//! spam probability from its counts (ham counted double), the most
//! decisive words are combined with the naive Bayes product, and the
//! message is spam above a fixed threshold.

use std::fmt::Write as _;

use crate::bucket::WordCounts;

/// Probability of a word too rare to judge.
pub const UNKNOWN_WORD_PROB: f64 = 0.4;

/// Lower clamp for a word probability.
pub const MIN_WORD_PROB: f64 = 0.01;

/// Upper clamp for a word probability.
pub const MAX_WORD_PROB: f64 = 0.99;

/// Weight of a ham occurrence relative to a spam occurrence.
pub const HAM_WEIGHT: f64 = 2.0;

/// Weighted occurrences needed before a word is judged.
pub const MIN_OCCURRENCES: f64 = 1.0;

/// Number of most decisive words combined.
pub const INTERESTING_WORDS: usize = 15;

/// A message is spam when its probability exceeds this.
pub const SPAM_THRESHOLD: f64 = 0.9;

/// Spam probability of one word.
pub fn word_probability(counts: WordCounts, spam_messages: u64, ham_messages: u64) -> f64 {
    let good = HAM_WEIGHT * counts.ham as f64;
    let bad = counts.spam as f64;
    if good + bad < MIN_OCCURRENCES {
        return UNKNOWN_WORD_PROB;
    }

    let bad_freq = (bad / spam_messages.max(1) as f64).min(1.0);
    let good_freq = (good / ham_messages.max(1) as f64).min(1.0);
    let p = bad_freq / (good_freq + bad_freq);
    p.clamp(MIN_WORD_PROB, MAX_WORD_PROB)
}

/// Combine word probabilities into a message probability.
pub fn combine(probabilities: impl IntoIterator<Item = f64>) -> f64 {
    let mut spam = 1.0f64;
    let mut ham = 1.0f64;
    let mut any = false;
    for p in probabilities {
        spam *= p;
        ham *= 1.0 - p;
        any = true;
    }
    if !any {
        return 0.5;
    }
    spam / (spam + ham)
}

/// One word's contribution to a verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct WordScore {
    /// Word text
    pub word: String,
    /// Word hash
    pub hash: u64,
    /// Counts seen
    pub counts: WordCounts,
    /// Word probability
    pub probability: f64,
}

/// Verdict for a message.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Spam probability in `[0, 1]`
    pub probability: f64,
    /// Black-listed phrase found in the message, if any
    pub black_listed: Option<String>,
    /// Words that decided the verdict, most decisive first
    pub decisive: Vec<WordScore>,
}

impl Classification {
    /// Build a verdict from every scored word of a message.
    pub fn from_scores(mut scores: Vec<WordScore>, black_listed: Option<String>) -> Self {
        scores.sort_by(|a, b| {
            let da = (a.probability - 0.5).abs();
            let db = (b.probability - 0.5).abs();
            db.total_cmp(&da).then(a.hash.cmp(&b.hash))
        });
        scores.truncate(INTERESTING_WORDS);

        let probability = if black_listed.is_some() {
            1.0
        } else {
            combine(scores.iter().map(|s| s.probability))
        };

        Classification {
            probability,
            black_listed,
            decisive: scores,
        }
    }

    /// Whether the message is spam.
    pub fn is_spam(&self) -> bool {
        self.probability > SPAM_THRESHOLD
    }

    /// `spam` or `ham`.
    pub fn label(&self) -> &'static str {
        if self.is_spam() {
            "spam"
        } else {
            "ham"
        }
    }

    /// Human-readable explanation, one decisive word per line.
    pub fn debug_report(&self) -> String {
        let mut out = String::new();
        if let Some(phrase) = &self.black_listed {
            let _ = writeln!(out, "black_list\t{}", phrase);
        }
        for score in &self.decisive {
            let _ = writeln!(
                out,
                "{}\t{}\t{}\t{:.6}",
                score.word, score.counts.spam, score.counts.ham, score.probability
            );
        }
        let _ = write!(out, "{}\t{:.6}", self.label(), self.probability);
        out
    }
}
