//! Memcache text protocol
//!
//! Framing follows a check-then-parse shape: [`parse_request`] looks at the
//! bytes buffered so far and either returns one complete request with the
//! number of bytes it spans, or [`ProtocolError::Incomplete`] without
//! consuming anything.
//!
//! Storage commands declare their payload size up front. A size over the
//! value limit is reported as [`Payload::TooLarge`] after the command line
//! alone, so the caller can skip the payload bytes as they arrive instead
//! of buffering them.

use bayes_core::Limits;

/// Longest command line accepted, terminator included.
pub const MAX_COMMAND_LINE: usize = 2048;

/// Largest payload size a storage command may declare. Anything larger
/// cannot be skipped sensibly and closes the connection.
pub const MAX_DECLARED_PAYLOAD: usize = i32::MAX as usize;

/// Version string reported by `version`.
pub const VERSION: &str = "0.99";

/// Storage verb. All three behave the same here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreVerb {
    /// `set`
    Set,
    /// `add`
    Add,
    /// `replace`
    Replace,
}

/// Payload of a storage command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Complete payload, terminator stripped
    Data(Vec<u8>),
    /// Declared size over the limit; that many bytes plus `\r\n` follow
    TooLarge(usize),
}

/// A storage command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRequest {
    /// Verb used
    pub verb: StoreVerb,
    /// Key, routing prefixes included
    pub key: String,
    /// Client flags (ignored)
    pub flags: u32,
    /// Expiration (ignored)
    pub exptime: i64,
    /// Suppress the reply
    pub noreply: bool,
    /// Payload
    pub payload: Payload,
}

/// One parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `get`/`gets` with one or more keys
    Get(Vec<String>),
    /// `set`/`add`/`replace`
    Store(StoreRequest),
    /// `delete`
    Delete {
        /// Key
        key: String,
        /// Suppress the reply
        noreply: bool,
    },
    /// `version`
    Version,
    /// `stats`
    Stats,
    /// `quit`
    Quit,
}

/// Framing and syntax errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// More bytes are needed
    #[error("incomplete request")]
    Incomplete,

    /// Unknown command verb
    #[error("unknown command")]
    UnknownCommand {
        /// Bytes to skip
        consumed: usize,
    },

    /// Known verb, bad arguments
    #[error("{message}")]
    Client {
        /// Reply text after `CLIENT_ERROR `
        message: &'static str,
        /// Bytes to skip
        consumed: usize,
    },

    /// No line terminator within [`MAX_COMMAND_LINE`]; the stream cannot be
    /// resynchronized
    #[error("line too long")]
    LineTooLong,

    /// Payload not followed by `\r\n`; the stream cannot be resynchronized
    #[error("bad data chunk")]
    BadDataChunk,

    /// Declared payload size beyond [`MAX_DECLARED_PAYLOAD`]
    #[error("declared size {0} out of range")]
    SizeOutOfRange(usize),
}

impl ProtocolError {
    /// Append the reply line for this error.
    pub fn write_reply(&self, out: &mut Vec<u8>) {
        match self {
            ProtocolError::Incomplete => {}
            ProtocolError::UnknownCommand { .. } => out.extend_from_slice(b"ERROR\r\n"),
            ProtocolError::Client { message, .. } => {
                out.extend_from_slice(b"CLIENT_ERROR ");
                out.extend_from_slice(message.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            ProtocolError::LineTooLong => out.extend_from_slice(b"CLIENT_ERROR line too long\r\n"),
            ProtocolError::BadDataChunk | ProtocolError::SizeOutOfRange(_) => {
                out.extend_from_slice(b"CLIENT_ERROR bad data chunk\r\n")
            }
        }
    }

    /// Bytes to skip past the offending request, when the stream survives.
    pub fn consumed(&self) -> Option<usize> {
        match self {
            ProtocolError::UnknownCommand { consumed } | ProtocolError::Client { consumed, .. } => {
                Some(*consumed)
            }
            _ => None,
        }
    }

    /// Whether the connection must be closed after replying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::LineTooLong
                | ProtocolError::BadDataChunk
                | ProtocolError::SizeOutOfRange(_)
        )
    }
}

fn find_line(buf: &[u8]) -> Result<usize, ProtocolError> {
    let window = &buf[..buf.len().min(MAX_COMMAND_LINE)];
    match window.iter().position(|&b| b == b'\n') {
        Some(pos) => Ok(pos + 1),
        None if buf.len() >= MAX_COMMAND_LINE => Err(ProtocolError::LineTooLong),
        None => Err(ProtocolError::Incomplete),
    }
}

/// Parse one request from the front of `buf`, returning it and its length.
pub fn parse_request(buf: &[u8], limits: &Limits) -> Result<(Request, usize), ProtocolError> {
    let line_len = find_line(buf)?;
    let line = String::from_utf8_lossy(&buf[..line_len]);
    let mut words = line.split_ascii_whitespace();

    let bad_format = ProtocolError::Client {
        message: "bad command line format",
        consumed: line_len,
    };
    let check_key = |key: &str| -> Result<(), ProtocolError> {
        limits
            .validate_key(key.as_bytes())
            .map_err(|_| ProtocolError::Client {
                message: "key too long",
                consumed: line_len,
            })
    };

    let verb = match words.next() {
        Some(verb) => verb,
        None => return Err(ProtocolError::UnknownCommand { consumed: line_len }),
    };

    let request = match verb {
        "get" | "gets" => {
            let keys: Vec<String> = words.map(str::to_string).collect();
            if keys.is_empty() {
                return Err(bad_format);
            }
            for key in &keys {
                check_key(key)?;
            }
            Request::Get(keys)
        }
        "set" | "add" | "replace" => {
            let verb = match verb {
                "set" => StoreVerb::Set,
                "add" => StoreVerb::Add,
                _ => StoreVerb::Replace,
            };
            let args: Vec<&str> = words.collect();
            if !(4..=5).contains(&args.len()) {
                return Err(bad_format);
            }
            let key = args[0];
            check_key(key)?;
            let (Ok(flags), Ok(exptime), Ok(bytes)) = (
                args[1].parse::<u32>(),
                args[2].parse::<i64>(),
                args[3].parse::<usize>(),
            ) else {
                return Err(bad_format);
            };
            if bytes > MAX_DECLARED_PAYLOAD {
                return Err(ProtocolError::SizeOutOfRange(bytes));
            }
            let noreply = args.get(4) == Some(&"noreply");

            if limits.validate_value_len(bytes).is_err() {
                let request = Request::Store(StoreRequest {
                    verb,
                    key: key.to_string(),
                    flags,
                    exptime,
                    noreply,
                    payload: Payload::TooLarge(bytes),
                });
                return Ok((request, line_len));
            }

            let total = line_len + bytes + 2;
            if buf.len() < total {
                return Err(ProtocolError::Incomplete);
            }
            if &buf[line_len + bytes..total] != b"\r\n" {
                return Err(ProtocolError::BadDataChunk);
            }
            let request = Request::Store(StoreRequest {
                verb,
                key: key.to_string(),
                flags,
                exptime,
                noreply,
                payload: Payload::Data(buf[line_len..line_len + bytes].to_vec()),
            });
            return Ok((request, total));
        }
        "delete" => {
            let key = words.next().ok_or(bad_format.clone())?;
            check_key(key)?;
            let noreply = words.any(|w| w == "noreply");
            Request::Delete {
                key: key.to_string(),
                noreply,
            }
        }
        "version" => Request::Version,
        "stats" => Request::Stats,
        "quit" => Request::Quit,
        _ => return Err(ProtocolError::UnknownCommand { consumed: line_len }),
    };
    Ok((request, line_len))
}

/// Append `VALUE <key> 0 <len>\r\n<data>\r\n`.
pub fn write_value(out: &mut Vec<u8>, key: &str, data: &[u8]) {
    out.extend_from_slice(b"VALUE ");
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(format!(" 0 {}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Append `END\r\n`.
pub fn write_end(out: &mut Vec<u8>) {
    out.extend_from_slice(b"END\r\n");
}
