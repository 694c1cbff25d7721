//! Key names
//!
//! A key carries the command. Front ends may prefix it with a routing
//! marker `^` and a shard prefix `<digits>@` (optionally negative,
//! optionally followed by another `^`); both are stripped before dispatch.
//! The remainder is matched against a fixed vocabulary by longest literal
//! prefix, and most commands take a decimal tag right after the literal,
//! e.g. `set_spam42`.

use bayes_durability::RecordKind;

/// Command selected by a `get` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetCommand {
    /// Learn the message as spam
    SetSpam(i32),
    /// Learn the message as ham
    SetHam(i32),
    /// Undo a `set_spam`
    UnsetSpam(i32),
    /// Undo a `set_ham`
    UnsetHam(i32),
    /// Relabel a message learned as spam
    ResetSpam(i32),
    /// Relabel a message learned as ham
    ResetHam(i32),
    /// `spam` or `ham`
    Test(i32),
    /// Spam probability
    TestProb(i32),
    /// Per-word explanation
    TestDebug(i32),
    /// Black-listed phrases
    BlackList,
    /// Stats report
    Stats,
}

impl GetCommand {
    /// Binlog record kind and tag of a teach command.
    pub fn teach(&self) -> Option<(RecordKind, i32)> {
        match *self {
            GetCommand::SetSpam(tag) => Some((RecordKind::SetSpam, tag)),
            GetCommand::SetHam(tag) => Some((RecordKind::SetHam, tag)),
            GetCommand::UnsetSpam(tag) => Some((RecordKind::UnsetSpam, tag)),
            GetCommand::UnsetHam(tag) => Some((RecordKind::UnsetHam, tag)),
            GetCommand::ResetSpam(tag) => Some((RecordKind::ResetSpam, tag)),
            GetCommand::ResetHam(tag) => Some((RecordKind::ResetHam, tag)),
            _ => None,
        }
    }
}

/// Command selected by a `set` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreCommand {
    /// Replace the connection's message
    CurrentText(i32),
    /// Add the payload to the black list
    AddBlackList,
    /// Remove the payload from the black list
    DeleteBlackList,
}

/// Why a key selects no command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// No vocabulary entry is a prefix of the key
    #[error("unknown key")]
    Unknown,

    /// The command needs a tag and none parses
    #[error("malformed tag for {command}")]
    MalformedTag {
        /// Command literal
        command: &'static str,
    },
}

/// Strip the routing marker and shard prefix from a key.
pub fn strip_routing(key: &str) -> &str {
    let key = key.strip_prefix('^').unwrap_or(key);
    let bytes = key.as_bytes();

    let digits_from = match bytes {
        [b'0'..=b'9', ..] => 1,
        [b'-', b'0'..=b'9', ..] => 2,
        _ => return key,
    };
    let digits_end = digits_from
        + bytes[digits_from..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();

    match bytes.get(digits_end) {
        Some(b'@') => {
            let rest = &key[digits_end + 1..];
            rest.strip_prefix('^').unwrap_or(rest)
        }
        _ => key,
    }
}

/// Leading decimal integer, `sscanf("%d")` style: optional whitespace and
/// sign, at least one digit, anything after the digits ignored.
pub fn parse_tag(s: &str) -> Option<i32> {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let len = digits.bytes().take_while(|b| b.is_ascii_digit()).count();
    if len == 0 {
        return None;
    }
    let magnitude: i64 = digits[..len].parse().ok()?;
    let value = if negative { -magnitude } else { magnitude };
    i32::try_from(value).ok()
}

#[derive(Clone, Copy)]
enum GetLiteral {
    Tagged(&'static str, fn(i32) -> GetCommand),
    Plain(&'static str, GetCommand),
}

impl GetLiteral {
    fn literal(&self) -> &'static str {
        match self {
            GetLiteral::Tagged(l, _) | GetLiteral::Plain(l, _) => l,
        }
    }
}

const GET_VOCABULARY: &[GetLiteral] = &[
    GetLiteral::Tagged("set_spam", GetCommand::SetSpam),
    GetLiteral::Tagged("set_ham", GetCommand::SetHam),
    GetLiteral::Tagged("unset_spam", GetCommand::UnsetSpam),
    GetLiteral::Tagged("unset_ham", GetCommand::UnsetHam),
    GetLiteral::Tagged("reset_spam", GetCommand::ResetSpam),
    GetLiteral::Tagged("reset_ham", GetCommand::ResetHam),
    GetLiteral::Tagged("test", GetCommand::Test),
    GetLiteral::Tagged("test_prob", GetCommand::TestProb),
    GetLiteral::Tagged("test_debug", GetCommand::TestDebug),
    GetLiteral::Plain("black_list", GetCommand::BlackList),
    GetLiteral::Plain("stats", GetCommand::Stats),
];

/// Longest vocabulary entry that prefixes `key`.
fn longest_prefix<T: Copy>(key: &str, vocabulary: &[T], literal: impl Fn(&T) -> &str) -> Option<T> {
    vocabulary
        .iter()
        .filter(|entry| key.starts_with(literal(entry)))
        .max_by_key(|entry| literal(entry).len())
        .copied()
}

/// Parse a `get` key (routing prefixes included).
pub fn parse_get_key(key: &str) -> Result<GetCommand, KeyError> {
    let key = strip_routing(key);
    match longest_prefix(key, GET_VOCABULARY, |e| e.literal()).ok_or(KeyError::Unknown)? {
        GetLiteral::Plain(_, command) => Ok(command),
        GetLiteral::Tagged(literal, make) => parse_tag(&key[literal.len()..])
            .map(make)
            .ok_or(KeyError::MalformedTag { command: literal }),
    }
}

/// Parse a `set` key (routing prefixes included).
pub fn parse_store_key(key: &str) -> Result<StoreCommand, KeyError> {
    const STORE_VOCABULARY: &[&str] = &["current_text", "add_black_list", "delete_black_list"];

    let key = strip_routing(key);
    match longest_prefix(key, STORE_VOCABULARY, |l| *l).ok_or(KeyError::Unknown)? {
        "current_text" => parse_tag(&key["current_text".len()..])
            .map(StoreCommand::CurrentText)
            .ok_or(KeyError::MalformedTag {
                command: "current_text",
            }),
        "add_black_list" => Ok(StoreCommand::AddBlackList),
        _ => Ok(StoreCommand::DeleteBlackList),
    }
}
