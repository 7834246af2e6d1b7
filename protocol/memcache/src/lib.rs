//! Memcache wire protocol support.
//!
//! Two codecs over the same abstract command vocabulary:
//!
//! - [`text`]: the ASCII protocol. Line-oriented; the caller reads one
//!   command line (and, for storage commands, the value body that follows)
//!   and hands complete frames to the parser.
//! - [`binary`]: the binary protocol (magic `0x80`/`0x81`). Fixed 24-byte
//!   headers followed by extras/key/value.
//!
//! Both modules are pure: they parse from byte slices and encode into
//! caller-provided buffers, and never touch a socket. Each carries the
//! server-facing half (parse requests, encode responses) and the
//! client-facing half (encode requests, parse replies) so the same crate
//! serves the listener and the downstream connection.

pub mod binary;
pub mod text;

/// Largest value accepted on a single item.
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

/// Largest key accepted, in bytes.
pub const MAX_KEY_SIZE: usize = 250;

pub(crate) const CRLF: &[u8] = b"\r\n";

/// Errors produced while decoding wire data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The frame is truncated; more data is required.
    #[error("incomplete frame")]
    Incomplete,
    /// The frame is syntactically invalid and the connection cannot recover.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}
