//! Memcache ASCII protocol.
//!
//! Command lines are parsed from a complete line with the trailing CRLF
//! already stripped; storage commands report the length of the value body
//! that follows so the caller can read it off the stream. Responses are
//! encoded into a caller-provided `BytesMut`.

use bytes::BytesMut;

use crate::{CRLF, MAX_KEY_SIZE, MAX_VALUE_SIZE, ParseError};

/// Storage verb carried by a `set`-shaped command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreVerb {
    Set,
    Add,
    Replace,
}

impl StoreVerb {
    /// Command name on the wire.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            StoreVerb::Set => b"set",
            StoreVerb::Add => b"add",
            StoreVerb::Replace => b"replace",
        }
    }
}

/// A parsed client command line.
///
/// For [`Command::Store`] the value body (`bytes` bytes plus CRLF) follows
/// the command line on the wire and is read separately by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Get {
        keys: Vec<&'a [u8]>,
    },
    Gat {
        exptime: u32,
        keys: Vec<&'a [u8]>,
    },
    Store {
        verb: StoreVerb,
        key: &'a [u8],
        flags: u32,
        exptime: u32,
        bytes: usize,
        noreply: bool,
    },
    Delete {
        key: &'a [u8],
        noreply: bool,
    },
    Touch {
        key: &'a [u8],
        exptime: u32,
        noreply: bool,
    },
    Version,
    Quit,
    /// A syntactically valid line naming a command this server does not
    /// implement. Answered with `ERROR`; the connection stays open.
    Unknown,
}

/// Parse one command line (CRLF already stripped).
pub fn parse_command(line: &[u8]) -> Result<Command<'_>, ParseError> {
    let mut fields = line.split(|b| *b == b' ').filter(|f| !f.is_empty());
    let verb = fields
        .next()
        .ok_or(ParseError::Malformed("empty command line"))?;

    match verb {
        b"get" | b"gets" => {
            let keys = collect_keys(fields)?;
            Ok(Command::Get { keys })
        }
        b"gat" | b"gats" => {
            let exptime = parse_u32(
                fields.next().ok_or(ParseError::Malformed("missing exptime"))?,
            )?;
            let keys = collect_keys(fields)?;
            Ok(Command::Gat { exptime, keys })
        }
        b"set" | b"add" | b"replace" => {
            let verb = match verb {
                b"set" => StoreVerb::Set,
                b"add" => StoreVerb::Add,
                _ => StoreVerb::Replace,
            };
            let key = parse_key(fields.next().ok_or(ParseError::Malformed("missing key"))?)?;
            let flags = parse_u32(
                fields.next().ok_or(ParseError::Malformed("missing flags"))?,
            )?;
            let exptime = parse_u32(
                fields.next().ok_or(ParseError::Malformed("missing exptime"))?,
            )?;
            let bytes = parse_u32(
                fields.next().ok_or(ParseError::Malformed("missing length"))?,
            )? as usize;
            if bytes > MAX_VALUE_SIZE {
                return Err(ParseError::Malformed("object too large for cache"));
            }
            let noreply = parse_noreply(&mut fields)?;
            expect_end(fields)?;
            Ok(Command::Store {
                verb,
                key,
                flags,
                exptime,
                bytes,
                noreply,
            })
        }
        b"delete" => {
            let key = parse_key(fields.next().ok_or(ParseError::Malformed("missing key"))?)?;
            let noreply = parse_noreply(&mut fields)?;
            expect_end(fields)?;
            Ok(Command::Delete { key, noreply })
        }
        b"touch" => {
            let key = parse_key(fields.next().ok_or(ParseError::Malformed("missing key"))?)?;
            let exptime = parse_u32(
                fields.next().ok_or(ParseError::Malformed("missing exptime"))?,
            )?;
            let noreply = parse_noreply(&mut fields)?;
            expect_end(fields)?;
            Ok(Command::Touch {
                key,
                exptime,
                noreply,
            })
        }
        b"version" => Ok(Command::Version),
        b"quit" => Ok(Command::Quit),
        _ => Ok(Command::Unknown),
    }
}

fn collect_keys<'a>(
    fields: impl Iterator<Item = &'a [u8]>,
) -> Result<Vec<&'a [u8]>, ParseError> {
    let mut keys = Vec::new();
    for field in fields {
        keys.push(parse_key(field)?);
    }
    if keys.is_empty() {
        return Err(ParseError::Malformed("missing key"));
    }
    Ok(keys)
}

fn parse_key(field: &[u8]) -> Result<&[u8], ParseError> {
    if field.is_empty() || field.len() > MAX_KEY_SIZE {
        return Err(ParseError::Malformed("bad key length"));
    }
    if field.iter().any(|b| b.is_ascii_control()) {
        return Err(ParseError::Malformed("control byte in key"));
    }
    Ok(field)
}

fn parse_u32(field: &[u8]) -> Result<u32, ParseError> {
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ParseError::Malformed("bad numeric field"))
}

fn parse_noreply<'a>(
    fields: &mut impl Iterator<Item = &'a [u8]>,
) -> Result<bool, ParseError> {
    match fields.next() {
        None => Ok(false),
        Some(b"noreply") => Ok(true),
        Some(_) => Err(ParseError::Malformed("bad command line format")),
    }
}

fn expect_end<'a>(mut fields: impl Iterator<Item = &'a [u8]>) -> Result<(), ParseError> {
    if fields.next().is_some() {
        return Err(ParseError::Malformed("bad command line format"));
    }
    Ok(())
}

// ── Server-side response encoding ───────────────────────────────────────

/// `VALUE <key> <flags> <bytes>\r\n<data>\r\n`
pub fn write_value(buf: &mut BytesMut, key: &[u8], flags: u32, data: &[u8]) {
    buf.extend_from_slice(b"VALUE ");
    buf.extend_from_slice(key);
    buf.extend_from_slice(b" ");
    write_u32(buf, flags);
    buf.extend_from_slice(b" ");
    write_u32(buf, data.len() as u32);
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(data);
    buf.extend_from_slice(CRLF);
}

pub fn write_end(buf: &mut BytesMut) {
    buf.extend_from_slice(b"END\r\n");
}

pub fn write_stored(buf: &mut BytesMut) {
    buf.extend_from_slice(b"STORED\r\n");
}

pub fn write_not_stored(buf: &mut BytesMut) {
    buf.extend_from_slice(b"NOT_STORED\r\n");
}

pub fn write_exists(buf: &mut BytesMut) {
    buf.extend_from_slice(b"EXISTS\r\n");
}

pub fn write_not_found(buf: &mut BytesMut) {
    buf.extend_from_slice(b"NOT_FOUND\r\n");
}

pub fn write_deleted(buf: &mut BytesMut) {
    buf.extend_from_slice(b"DELETED\r\n");
}

pub fn write_touched(buf: &mut BytesMut) {
    buf.extend_from_slice(b"TOUCHED\r\n");
}

pub fn write_error(buf: &mut BytesMut) {
    buf.extend_from_slice(b"ERROR\r\n");
}

pub fn write_client_error(buf: &mut BytesMut, reason: &str) {
    buf.extend_from_slice(b"CLIENT_ERROR ");
    buf.extend_from_slice(reason.as_bytes());
    buf.extend_from_slice(CRLF);
}

pub fn write_server_error(buf: &mut BytesMut, reason: &str) {
    buf.extend_from_slice(b"SERVER_ERROR ");
    buf.extend_from_slice(reason.as_bytes());
    buf.extend_from_slice(CRLF);
}

pub fn write_version(buf: &mut BytesMut, version: &str) {
    buf.extend_from_slice(b"VERSION ");
    buf.extend_from_slice(version.as_bytes());
    buf.extend_from_slice(CRLF);
}

fn write_u32(buf: &mut BytesMut, n: u32) {
    let mut digits = itoa::Buffer::new();
    buf.extend_from_slice(digits.format(n).as_bytes());
}

// ── Client-side request encoding ────────────────────────────────────────

/// `get <key>\r\n`
pub fn encode_get(buf: &mut BytesMut, key: &[u8]) {
    buf.extend_from_slice(b"get ");
    buf.extend_from_slice(key);
    buf.extend_from_slice(CRLF);
}

/// `gat <exptime> <key>\r\n`
pub fn encode_gat(buf: &mut BytesMut, exptime: u32, key: &[u8]) {
    buf.extend_from_slice(b"gat ");
    write_u32(buf, exptime);
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(key);
    buf.extend_from_slice(CRLF);
}

/// `<verb> <key> <flags> <exptime> <bytes>\r\n`
///
/// Only the command line; the caller appends the value body and CRLF.
pub fn encode_store_line(
    buf: &mut BytesMut,
    verb: StoreVerb,
    key: &[u8],
    flags: u32,
    exptime: u32,
    bytes: usize,
) {
    buf.extend_from_slice(verb.as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(key);
    buf.extend_from_slice(b" ");
    write_u32(buf, flags);
    buf.extend_from_slice(b" ");
    write_u32(buf, exptime);
    buf.extend_from_slice(b" ");
    write_u32(buf, bytes as u32);
    buf.extend_from_slice(CRLF);
}

/// `delete <key>\r\n`
pub fn encode_delete(buf: &mut BytesMut, key: &[u8]) {
    buf.extend_from_slice(b"delete ");
    buf.extend_from_slice(key);
    buf.extend_from_slice(CRLF);
}

/// `touch <key> <exptime>\r\n`
pub fn encode_touch(buf: &mut BytesMut, key: &[u8], exptime: u32) {
    buf.extend_from_slice(b"touch ");
    buf.extend_from_slice(key);
    buf.extend_from_slice(b" ");
    write_u32(buf, exptime);
    buf.extend_from_slice(CRLF);
}

// ── Client-side reply parsing ───────────────────────────────────────────

/// One reply line from a downstream server (CRLF already stripped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyLine<'a> {
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Touched,
    End,
    /// `VALUE <key> <flags> <bytes>`; the data block follows on the stream.
    Value {
        key: &'a [u8],
        flags: u32,
        bytes: usize,
    },
    Error,
    ClientError(&'a [u8]),
    ServerError(&'a [u8]),
    Version(&'a [u8]),
}

/// Parse one downstream reply line (CRLF already stripped).
pub fn parse_reply_line(line: &[u8]) -> Result<ReplyLine<'_>, ParseError> {
    match line {
        b"STORED" => return Ok(ReplyLine::Stored),
        b"NOT_STORED" => return Ok(ReplyLine::NotStored),
        b"EXISTS" => return Ok(ReplyLine::Exists),
        b"NOT_FOUND" => return Ok(ReplyLine::NotFound),
        b"DELETED" => return Ok(ReplyLine::Deleted),
        b"TOUCHED" => return Ok(ReplyLine::Touched),
        b"END" => return Ok(ReplyLine::End),
        b"ERROR" => return Ok(ReplyLine::Error),
        _ => {}
    }

    if let Some(rest) = line.strip_prefix(b"VALUE ") {
        let mut fields = rest.split(|b| *b == b' ').filter(|f| !f.is_empty());
        let key = fields.next().ok_or(ParseError::Malformed("bad VALUE line"))?;
        let flags = parse_u32(fields.next().ok_or(ParseError::Malformed("bad VALUE line"))?)?;
        let bytes = parse_u32(fields.next().ok_or(ParseError::Malformed("bad VALUE line"))?)?
            as usize;
        // a trailing cas column (from `gets`) is tolerated and ignored
        return Ok(ReplyLine::Value { key, flags, bytes });
    }
    if let Some(reason) = line.strip_prefix(b"CLIENT_ERROR ") {
        return Ok(ReplyLine::ClientError(reason));
    }
    if let Some(reason) = line.strip_prefix(b"SERVER_ERROR ") {
        return Ok(ReplyLine::ServerError(reason));
    }
    if let Some(version) = line.strip_prefix(b"VERSION ") {
        return Ok(ReplyLine::Version(version));
    }

    Err(ParseError::Malformed("unrecognized reply line"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_get_single_key() {
        let cmd = parse_command(b"get foo").unwrap();
        assert_eq!(
            cmd,
            Command::Get {
                keys: vec![b"foo".as_slice()]
            }
        );
    }

    #[test]
    fn parse_get_multiple_keys() {
        let cmd = parse_command(b"get a b c").unwrap();
        assert_eq!(
            cmd,
            Command::Get {
                keys: vec![b"a".as_slice(), b"b".as_slice(), b"c".as_slice()]
            }
        );
    }

    #[test]
    fn parse_get_without_key_is_malformed() {
        assert!(parse_command(b"get").is_err());
    }

    #[test]
    fn parse_set() {
        let cmd = parse_command(b"set foo 7 0 5").unwrap();
        assert_eq!(
            cmd,
            Command::Store {
                verb: StoreVerb::Set,
                key: b"foo",
                flags: 7,
                exptime: 0,
                bytes: 5,
                noreply: false,
            }
        );
    }

    #[test]
    fn parse_set_noreply() {
        let cmd = parse_command(b"set foo 0 0 5 noreply").unwrap();
        assert!(matches!(cmd, Command::Store { noreply: true, .. }));
    }

    #[test]
    fn parse_set_rejects_trailing_garbage() {
        assert!(parse_command(b"set foo 0 0 5 norply").is_err());
        assert!(parse_command(b"set foo 0 0 5 noreply extra").is_err());
    }

    #[test]
    fn parse_set_rejects_oversized_value() {
        assert!(parse_command(b"set foo 0 0 99999999").is_err());
    }

    #[test]
    fn parse_add_and_replace() {
        assert!(matches!(
            parse_command(b"add k 0 0 1").unwrap(),
            Command::Store {
                verb: StoreVerb::Add,
                ..
            }
        ));
        assert!(matches!(
            parse_command(b"replace k 0 0 1").unwrap(),
            Command::Store {
                verb: StoreVerb::Replace,
                ..
            }
        ));
    }

    #[test]
    fn parse_delete_touch_gat() {
        assert_eq!(
            parse_command(b"delete foo").unwrap(),
            Command::Delete {
                key: b"foo",
                noreply: false
            }
        );
        assert_eq!(
            parse_command(b"touch foo 60").unwrap(),
            Command::Touch {
                key: b"foo",
                exptime: 60,
                noreply: false
            }
        );
        assert_eq!(
            parse_command(b"gat 60 foo bar").unwrap(),
            Command::Gat {
                exptime: 60,
                keys: vec![b"foo".as_slice(), b"bar".as_slice()]
            }
        );
    }

    #[test]
    fn parse_key_limits() {
        let long = vec![b'x'; 251];
        let line = [b"get ".as_slice(), &long].concat();
        assert!(parse_command(&line).is_err());

        let ok = vec![b'x'; 250];
        let line = [b"get ".as_slice(), &ok].concat();
        assert!(parse_command(&line).is_ok());
    }

    #[test]
    fn parse_unknown_command() {
        assert_eq!(parse_command(b"stats").unwrap(), Command::Unknown);
    }

    #[test]
    fn encode_value_response() {
        let mut buf = BytesMut::new();
        write_value(&mut buf, b"foo", 7, b"hello");
        write_end(&mut buf);
        assert_eq!(&buf[..], b"VALUE foo 7 5\r\nhello\r\nEND\r\n");
    }

    #[test]
    fn encode_simple_responses() {
        let mut buf = BytesMut::new();
        write_stored(&mut buf);
        write_deleted(&mut buf);
        write_client_error(&mut buf, "bad data chunk");
        assert_eq!(
            &buf[..],
            b"STORED\r\nDELETED\r\nCLIENT_ERROR bad data chunk\r\n".as_slice()
        );
    }

    #[test]
    fn encode_requests() {
        let mut buf = BytesMut::new();
        encode_get(&mut buf, b"k");
        assert_eq!(&buf[..], b"get k\r\n");

        buf.clear();
        encode_store_line(&mut buf, StoreVerb::Set, b"k", 1, 2, 3);
        assert_eq!(&buf[..], b"set k 1 2 3\r\n");

        buf.clear();
        encode_gat(&mut buf, 60, b"k");
        assert_eq!(&buf[..], b"gat 60 k\r\n");

        buf.clear();
        encode_touch(&mut buf, b"k", 30);
        assert_eq!(&buf[..], b"touch k 30\r\n");
    }

    #[test]
    fn parse_reply_lines() {
        assert_eq!(parse_reply_line(b"STORED").unwrap(), ReplyLine::Stored);
        assert_eq!(parse_reply_line(b"END").unwrap(), ReplyLine::End);
        assert_eq!(
            parse_reply_line(b"VALUE foo 7 5").unwrap(),
            ReplyLine::Value {
                key: b"foo",
                flags: 7,
                bytes: 5
            }
        );
        assert_eq!(
            parse_reply_line(b"SERVER_ERROR out of memory").unwrap(),
            ReplyLine::ServerError(b"out of memory")
        );
        assert!(parse_reply_line(b"WHATEVER").is_err());
    }

    #[test]
    fn parse_reply_value_with_cas_column() {
        assert_eq!(
            parse_reply_line(b"VALUE foo 7 5 12345").unwrap(),
            ReplyLine::Value {
                key: b"foo",
                flags: 7,
                bytes: 5
            }
        );
    }
}
