//! Line-oriented wire protocol: `TYPE CMD (KEY=VALUE)*`.
//!
//! Parsing is pure and allocation-light; the server owns framing (newline
//! splitting, length limits) one layer up in `prsi-server::codec`. This
//! module only ever sees one already-delimited line.

use std::fmt;

/// Maximum number of key=value pairs kept from a single line; extras are
/// silently dropped, matching the original's fixed-size `KV` array.
pub const MAX_KV: usize = 31;
/// Maximum key length kept; longer keys are dropped rather than truncated,
/// since the original truncates into a fixed buffer and we have no such
/// buffer to truncate into.
pub const MAX_KEY: usize = 31;
/// Maximum value length kept, truncated like the original's `MAX_VAL - 1`.
pub const MAX_VAL: usize = 127;

/// Message direction/role, the first token on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Req,
    Resp,
    Evt,
    Err,
}

impl MsgType {
    fn from_token(tok: &str) -> Option<MsgType> {
        match tok {
            "REQ" => Some(MsgType::Req),
            "RESP" => Some(MsgType::Resp),
            "EVT" => Some(MsgType::Evt),
            "ERR" => Some(MsgType::Err),
            _ => None,
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MsgType::Req => "REQ",
            MsgType::Resp => "RESP",
            MsgType::Evt => "EVT",
            MsgType::Err => "ERR",
        };
        f.write_str(s)
    }
}

/// A parsed protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MsgType,
    pub cmd: String,
    kv: Vec<(String, String)>,
}

impl Message {
    /// Look up a key's value. First occurrence wins on duplicate keys.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.kv
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Parses one line (already stripped of its terminator) into a [`Message`].
///
/// Returns `None` ("BAD" in spec terms) if fewer than two tokens are
/// present or the first token isn't a known [`MsgType`].
pub fn parse(line: &str) -> Option<Message> {
    let mut tokens = line.split_whitespace();

    let type_tok = tokens.next()?;
    let msg_type = MsgType::from_token(type_tok)?;
    let cmd = tokens.next()?.to_string();

    let mut kv = Vec::new();
    for tok in tokens {
        if kv.len() >= MAX_KV {
            break;
        }
        let Some(eq) = tok.find('=') else { continue };
        let (key, rest) = tok.split_at(eq);
        let value = &rest[1..];
        if key.is_empty() || key.len() > MAX_KEY {
            continue;
        }
        let value = if value.len() > MAX_VAL {
            &value[..MAX_VAL]
        } else {
            value
        };
        kv.push((key.to_string(), value.to_string()));
    }

    Some(Message { msg_type, cmd, kv })
}

/// Every wire error token, shared by the engine and the server's room/session
/// layer so there is exactly one Rust spelling per token in the public
/// contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadFormat,
    InvalidValue,
    NickTaken,
    BadSession,
    AlreadyOnline,
    NotLogged,
    BadState,
    NoSuchRoom,
    RoomFull,
    NotHost,
    NotEnoughPlayers,
    LimitReached,
    NotYourTurn,
    NoSuchCard,
    MustStackOrDraw,
    WishRequired,
    BadWish,
    IllegalCard,
    Paused,
    UnknownCmd,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BadFormat => "BAD_FORMAT",
            ErrorCode::InvalidValue => "INVALID_VALUE",
            ErrorCode::NickTaken => "NICK_TAKEN",
            ErrorCode::BadSession => "BAD_SESSION",
            ErrorCode::AlreadyOnline => "ALREADY_ONLINE",
            ErrorCode::NotLogged => "NOT_LOGGED",
            ErrorCode::BadState => "BAD_STATE",
            ErrorCode::NoSuchRoom => "NO_SUCH_ROOM",
            ErrorCode::RoomFull => "ROOM_FULL",
            ErrorCode::NotHost => "NOT_HOST",
            ErrorCode::NotEnoughPlayers => "NOT_ENOUGH_PLAYERS",
            ErrorCode::LimitReached => "LIMIT_REACHED",
            ErrorCode::NotYourTurn => "NOT_YOUR_TURN",
            ErrorCode::NoSuchCard => "NO_SUCH_CARD",
            ErrorCode::MustStackOrDraw => "MUST_STACK_OR_DRAW",
            ErrorCode::WishRequired => "WISH_REQUIRED",
            ErrorCode::BadWish => "BAD_WISH",
            ErrorCode::IllegalCard => "ILLEGAL_CARD",
            ErrorCode::Paused => "PAUSED",
            ErrorCode::UnknownCmd => "UNKNOWN_CMD",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_with_fields() {
        let m = parse("REQ PLAY card=HA wish=S").unwrap();
        assert_eq!(m.msg_type, MsgType::Req);
        assert_eq!(m.cmd, "PLAY");
        assert_eq!(m.get("card"), Some("HA"));
        assert_eq!(m.get("wish"), Some("S"));
        assert_eq!(m.get("missing"), None);
    }

    #[test]
    fn bad_when_too_few_tokens() {
        assert!(parse("").is_none());
        assert!(parse("REQ").is_none());
    }

    #[test]
    fn bad_when_unknown_type() {
        assert!(parse("FOO BAR").is_none());
    }

    #[test]
    fn first_duplicate_key_wins() {
        let m = parse("REQ LOGIN nick=alice nick=bob").unwrap();
        assert_eq!(m.get("nick"), Some("alice"));
    }

    #[test]
    fn tokens_without_equals_are_ignored_not_fatal() {
        let m = parse("REQ PING stray").unwrap();
        assert_eq!(m.cmd, "PING");
        assert_eq!(m.get("stray"), None);
    }

    #[test]
    fn excess_kv_pairs_are_dropped() {
        let mut line = String::from("REQ X");
        for i in 0..40 {
            line.push_str(&format!(" k{i}=v"));
        }
        let m = parse(&line).unwrap();
        assert!((0..31).all(|i| m.get(&format!("k{i}")).is_some()));
        assert!(m.get("k31").is_none());
    }
}
