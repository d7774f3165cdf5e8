//! Command-line tokenizing and dispatch table.
//!
//! Parsing happens in two tiers. Commands that complete within a single call
//! (`get`, `delete`, `incr`, ...) borrow their key bytes straight out of the
//! connection's read buffer — valid only for the duration of the dispatch
//! that produced them. `add`/`set`/`replace` need to survive a suspension
//! while the payload bytes are still arriving (the `nread` state), so their
//! key is copied into an owned buffer up front; 250 bytes copied once per
//! store is immaterial next to the read() that follows it.

use thiserror::Error;
use wireline_store::StorePolicy;
use wireline_util::ArrayVec;

pub const MAX_KEY_LEN: usize = 250;
pub const MAX_TOKENS: usize = 24;
pub const MAX_MULTIGET_KEYS: usize = MAX_TOKENS - 1;

#[derive(Clone, Copy, Debug)]
pub struct Token {
    pub start: usize,
    pub len: usize,
}

impl Token {
    #[inline]
    fn slice<'a>(self, line: &'a [u8]) -> &'a [u8] {
        &line[self.start..self.start + self.len]
    }
}

/// Splits `line` on ASCII spaces into up to [`MAX_TOKENS`] tokens.
///
/// The last entry returned is always a "terminal" token: it points at
/// whatever remains unconsumed, with length 0 if the whole line was
/// tokenized. A command handler never sees that remainder as an argument —
/// its presence only signals "the line had more tokens than we needed" vs.
/// "the line ended exactly here", which dispatch uses to distinguish wrong
/// arity from a word that happened to contain no further arguments.
#[must_use]
pub fn tokenize(line: &[u8]) -> ArrayVec<Token, MAX_TOKENS> {
    let mut tokens: ArrayVec<Token, MAX_TOKENS> = ArrayVec::new();
    let n = line.len();
    let mut i = 0;
    while i < n && tokens.len() + 1 < MAX_TOKENS {
        while i < n && line[i] == b' ' {
            i += 1;
        }
        if i >= n {
            break;
        }
        let start = i;
        while i < n && line[i] != b' ' {
            i += 1;
        }
        tokens.push(Token { start, len: i - start });
    }
    while i < n && line[i] == b' ' {
        i += 1;
    }
    tokens.push(Token { start: i, len: n.saturating_sub(i) });
    tokens
}

#[derive(Error, Clone, Debug)]
pub enum ProtocolError {
    /// Wrong verb entirely.
    #[error("ERROR")]
    UnknownCommand,
    /// Right verb, wrong number of arguments, or a malformed numeric field.
    #[error("CLIENT_ERROR {0}")]
    ClientError(String),
}

/// Everything a store-family command (`add`/`set`/`replace`) needs to carry
/// across the `nread` wait for its payload bytes.
#[derive(Clone, Debug)]
pub struct PendingStore {
    pub key: Vec<u8>,
    pub flags: u32,
    pub exptime: i64,
    pub len: usize,
    pub policy: StorePolicy,
    pub noreply: bool,
}

#[derive(Debug)]
pub enum Dispatch<'a> {
    Get { bget: bool, keys: ArrayVec<&'a [u8], MAX_MULTIGET_KEYS> },
    MetaGet { key: &'a [u8] },
    BeginStore(PendingStore),
    Incr { key: &'a [u8], delta: u64, noreply: bool },
    Decr { key: &'a [u8], delta: u64, noreply: bool },
    Delete { key: &'a [u8], grace: Option<u32>, noreply: bool },
    FlushAll { delay: Option<i64>, noreply: bool },
    FlushRegex { pattern: &'a [u8] },
    Stats { sub: Option<&'a [u8]> },
    Verbosity { level: u32, noreply: bool },
    Version,
    Quit,
    Own { bucket: u32, generation: u32 },
    Disown { bucket: u32 },
    Bg { bucket: u32, generation: u32 },
}

fn parse_u32(bytes: &[u8]) -> Option<u32> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

fn parse_usize(bytes: &[u8]) -> Option<usize> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

fn check_key(key: &[u8]) -> Result<(), ProtocolError> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(ProtocolError::ClientError("bad command line format".to_owned()));
    }
    Ok(())
}

fn is_noreply(tok: Option<&[u8]>) -> bool {
    tok == Some(b"noreply".as_slice())
}

/// Parses one already-CRLF-stripped command line.
///
/// `line` is the full command line (verb plus arguments, no trailing
/// `\r\n`). Returns `Ok(None)` for a blank line (nothing to dispatch, just
/// re-enter `reading`).
pub fn parse(line: &[u8]) -> Result<Option<Dispatch<'_>>, ProtocolError> {
    let tokens = tokenize(line);
    if tokens.len() <= 1 {
        return Ok(None);
    }
    // ntokens excludes the terminal token.
    let ntokens = tokens.len() - 1;
    let tok = |i: usize| -> &[u8] { tokens[i].slice(line) };
    let verb = tok(0);

    match verb {
        b"get" | b"bget" if ntokens >= 2 => {
            let bget = verb == b"bget";
            let mut keys: ArrayVec<&[u8], MAX_MULTIGET_KEYS> = ArrayVec::new();
            for i in 1..ntokens {
                let key = tok(i);
                check_key(key)?;
                if keys.try_push(key).is_some() {
                    break;
                }
            }
            Ok(Some(Dispatch::Get { bget, keys }))
        }
        b"metaget" if ntokens == 2 => {
            let key = tok(1);
            check_key(key)?;
            Ok(Some(Dispatch::MetaGet { key }))
        }
        b"add" | b"set" | b"replace" if ntokens == 5 || ntokens == 6 => {
            let key = tok(1);
            check_key(key)?;
            let flags =
                parse_u32(tok(2)).ok_or_else(|| ProtocolError::ClientError("bad command line format".to_owned()))?;
            let exptime =
                parse_i64(tok(3)).ok_or_else(|| ProtocolError::ClientError("bad command line format".to_owned()))?;
            let len = parse_usize(tok(4))
                .ok_or_else(|| ProtocolError::ClientError("bad command line format".to_owned()))?;
            let noreply = ntokens == 6 && is_noreply(Some(tok(5)));
            if ntokens == 6 && !noreply {
                return Err(ProtocolError::ClientError("bad command line format".to_owned()));
            }
            let policy = match verb {
                b"add" => StorePolicy::Add,
                b"set" => StorePolicy::Set,
                _ => StorePolicy::Replace,
            };
            Ok(Some(Dispatch::BeginStore(PendingStore {
                key: key.to_vec(),
                flags,
                exptime,
                len,
                policy,
                noreply,
            })))
        }
        b"incr" | b"decr" if ntokens == 3 || ntokens == 4 => {
            let key = tok(1);
            check_key(key)?;
            let delta = parse_u32(tok(2))
                .map(u64::from)
                .ok_or_else(|| ProtocolError::ClientError("invalid numeric delta argument".to_owned()))?;
            let noreply = ntokens == 4 && is_noreply(Some(tok(3)));
            if ntokens == 4 && !noreply {
                return Err(ProtocolError::ClientError("bad command line format".to_owned()));
            }
            if verb == b"incr" {
                Ok(Some(Dispatch::Incr { key, delta, noreply }))
            } else {
                Ok(Some(Dispatch::Decr { key, delta, noreply }))
            }
        }
        b"delete" if ntokens == 2 || ntokens == 3 => {
            let key = tok(1);
            check_key(key)?;
            let (grace, noreply) = if ntokens == 3 {
                let arg = tok(2);
                if is_noreply(Some(arg)) {
                    (None, true)
                } else {
                    let secs = parse_u32(arg)
                        .ok_or_else(|| ProtocolError::ClientError("bad command line format".to_owned()))?;
                    (Some(secs), false)
                }
            } else {
                (None, false)
            };
            Ok(Some(Dispatch::Delete { key, grace, noreply }))
        }
        b"flush_all" if ntokens == 1 || ntokens == 2 => {
            let (delay, noreply) = if ntokens == 2 {
                let arg = tok(1);
                if is_noreply(Some(arg)) {
                    (None, true)
                } else {
                    let d = parse_i64(arg)
                        .ok_or_else(|| ProtocolError::ClientError("bad command line format".to_owned()))?;
                    (Some(d), false)
                }
            } else {
                (None, false)
            };
            Ok(Some(Dispatch::FlushAll { delay, noreply }))
        }
        b"flush_regex" if ntokens == 2 => Ok(Some(Dispatch::FlushRegex { pattern: tok(1) })),
        b"stats" if ntokens >= 1 => {
            let sub = if ntokens >= 2 { Some(tok(1)) } else { None };
            Ok(Some(Dispatch::Stats { sub }))
        }
        b"verbosity" if ntokens == 2 || ntokens == 3 => {
            let level = parse_u32(tok(1))
                .ok_or_else(|| ProtocolError::ClientError("bad command line format".to_owned()))?;
            let noreply = ntokens == 3 && is_noreply(Some(tok(2)));
            Ok(Some(Dispatch::Verbosity { level, noreply }))
        }
        b"version" if ntokens == 1 => Ok(Some(Dispatch::Version)),
        b"quit" if ntokens == 1 => Ok(Some(Dispatch::Quit)),
        b"own" if ntokens == 3 => {
            let bucket = parse_u32(tok(1))
                .ok_or_else(|| ProtocolError::ClientError("bad command line format".to_owned()))?;
            let generation = parse_u32(tok(2))
                .ok_or_else(|| ProtocolError::ClientError("bad command line format".to_owned()))?;
            Ok(Some(Dispatch::Own { bucket, generation }))
        }
        b"disown" if ntokens == 2 => {
            let bucket = parse_u32(tok(1))
                .ok_or_else(|| ProtocolError::ClientError("bad command line format".to_owned()))?;
            Ok(Some(Dispatch::Disown { bucket }))
        }
        b"bg" if ntokens == 3 => {
            let bucket = parse_u32(tok(1))
                .ok_or_else(|| ProtocolError::ClientError("bad command line format".to_owned()))?;
            let generation = parse_u32(tok(2))
                .ok_or_else(|| ProtocolError::ClientError("bad command line format".to_owned()))?;
            Ok(Some(Dispatch::Bg { bucket, generation }))
        }
        b"get" | b"bget" | b"metaget" | b"add" | b"set" | b"replace" | b"incr" | b"decr" | b"delete"
        | b"flush_all" | b"flush_regex" | b"verbosity" | b"own" | b"disown" | b"bg" => {
            Err(ProtocolError::ClientError("bad command line format".to_owned()))
        }
        _ => Err(ProtocolError::UnknownCommand),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_counts_words_and_marks_terminal() {
        let tokens = tokenize(b"get a b c");
        assert_eq!(tokens.len(), 5); // get, a, b, c, terminal
        assert_eq!(tokens[4].len, 0);
    }

    #[test]
    fn tokenize_skips_runs_of_spaces() {
        let tokens = tokenize(b"get   a    b");
        assert_eq!(tokens.len(), 4);
    }

    #[test]
    fn parses_multiget() {
        match parse(b"get a b c").unwrap().unwrap() {
            Dispatch::Get { bget, keys } => {
                assert!(!bget);
                assert_eq!(keys.as_slice(), &[b"a".as_slice(), b"b", b"c"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_set_with_noreply() {
        match parse(b"set k 1 0 3 noreply").unwrap().unwrap() {
            Dispatch::BeginStore(p) => {
                assert_eq!(p.key, b"k");
                assert_eq!(p.flags, 1);
                assert_eq!(p.len, 3);
                assert!(p.noreply);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rejects_oversize_key() {
        let long_key = vec![b'k'; MAX_KEY_LEN + 1];
        let mut line = b"get ".to_vec();
        line.extend_from_slice(&long_key);
        let err = parse(&line).unwrap_err();
        assert!(matches!(err, ProtocolError::ClientError(_)));
    }

    #[test]
    fn unknown_verb_is_unknown_command() {
        assert!(matches!(parse(b"frobnicate x").unwrap_err(), ProtocolError::UnknownCommand));
    }

    #[test]
    fn blank_line_dispatches_nothing() {
        assert!(parse(b"").unwrap().is_none());
    }
}
