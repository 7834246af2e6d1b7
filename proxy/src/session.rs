//! Per-connection protocol sessions.
//!
//! One session per client connection, bound to exactly one codec for the
//! connection's lifetime. Requests are processed strictly in order: a
//! request's response is written and flushed before the next request is
//! parsed. All synchronous work between socket reads runs to completion;
//! nothing is held across a suspension point except the session's own
//! buffers.

use bytes::BytesMut;
use protocol_memcache::binary::{
    self, HEADER_SIZE, Opcode, RequestHeader, Status, StoreExtras, parse_exptime_extras,
};
use protocol_memcache::text::{self, Command, StoreVerb};
use protocol_memcache::ParseError;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::backend::{BackendError, DeleteOutcome, GetOutcome, Handler, StoreOutcome, TouchOutcome};
use crate::metrics::{
    BACKEND_ERRORS, BYTES_IN, BYTES_OUT, DELETE_REQUESTS, GAT_REQUESTS, GET_REQUESTS, HITS,
    MISSES, PARSE_ERRORS, SET_REQUESTS, TOUCH_REQUESTS,
};
use crate::orchestrator::Orchestrator;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Why a session ended. Every variant closes the connection.
#[derive(Debug)]
pub enum SessionEnd {
    /// Clean EOF or an explicit quit.
    Closed,
    /// The client sent something unrecoverable.
    Malformed,
    /// A tier failed; the error reply has already been written.
    Backend(BackendError),
}

/// Run the ASCII protocol loop until the connection ends.
pub async fn run_text<R, W, L1, L2>(
    reader: &mut R,
    writer: &mut W,
    orca: &mut Orchestrator<L1, L2>,
) -> io::Result<SessionEnd>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    L1: Handler,
    L2: Handler,
{
    let mut line = Vec::with_capacity(512);
    let mut wbuf = BytesMut::with_capacity(16 * 1024);

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Ok(SessionEnd::Closed);
        }
        BYTES_IN.add(n as u64);

        let mut end = line.len();
        while end > 0 && matches!(line[end - 1], b'\r' | b'\n') {
            end -= 1;
        }

        wbuf.clear();
        let command = match text::parse_command(&line[..end]) {
            Ok(command) => command,
            Err(e) => {
                PARSE_ERRORS.increment();
                let reason = match e {
                    ParseError::Malformed(reason) => reason,
                    ParseError::Incomplete => "truncated request",
                };
                text::write_client_error(&mut wbuf, reason);
                flush(writer, &wbuf).await?;
                return Ok(SessionEnd::Malformed);
            }
        };

        match command {
            Command::Get { keys } => {
                GET_REQUESTS.increment();
                for key in keys {
                    match orca.get(key).await {
                        Ok(GetOutcome::Hit { flags, value }) => {
                            HITS.increment();
                            text::write_value(&mut wbuf, key, flags, &value);
                        }
                        Ok(GetOutcome::Miss) => {
                            MISSES.increment();
                        }
                        Err(e) => return backend_failure(writer, &mut wbuf, e).await,
                    }
                }
                text::write_end(&mut wbuf);
            }
            Command::Gat { exptime, keys } => {
                GAT_REQUESTS.increment();
                for key in keys {
                    match orca.gat(key, exptime).await {
                        Ok(GetOutcome::Hit { flags, value }) => {
                            HITS.increment();
                            text::write_value(&mut wbuf, key, flags, &value);
                        }
                        Ok(GetOutcome::Miss) => {
                            MISSES.increment();
                        }
                        Err(e) => return backend_failure(writer, &mut wbuf, e).await,
                    }
                }
                text::write_end(&mut wbuf);
            }
            Command::Store {
                verb,
                key,
                flags,
                exptime,
                bytes,
                noreply,
            } => {
                SET_REQUESTS.increment();
                let mut value = vec![0u8; bytes + 2];
                reader.read_exact(&mut value).await?;
                BYTES_IN.add(value.len() as u64);
                if !value.ends_with(b"\r\n") {
                    PARSE_ERRORS.increment();
                    text::write_client_error(&mut wbuf, "bad data chunk");
                    flush(writer, &wbuf).await?;
                    return Ok(SessionEnd::Malformed);
                }
                value.truncate(bytes);

                match orca.store(verb, key, flags, exptime, &value).await {
                    Ok(outcome) => {
                        if !noreply {
                            match outcome {
                                StoreOutcome::Stored => text::write_stored(&mut wbuf),
                                StoreOutcome::NotStored => text::write_not_stored(&mut wbuf),
                                StoreOutcome::Exists => text::write_exists(&mut wbuf),
                                StoreOutcome::NotFound => text::write_not_found(&mut wbuf),
                            }
                        }
                    }
                    Err(e) => return backend_failure(writer, &mut wbuf, e).await,
                }
            }
            Command::Delete { key, noreply } => {
                DELETE_REQUESTS.increment();
                match orca.delete(key).await {
                    Ok(outcome) => {
                        if !noreply {
                            match outcome {
                                DeleteOutcome::Deleted => text::write_deleted(&mut wbuf),
                                DeleteOutcome::NotFound => text::write_not_found(&mut wbuf),
                            }
                        }
                    }
                    Err(e) => return backend_failure(writer, &mut wbuf, e).await,
                }
            }
            Command::Touch {
                key,
                exptime,
                noreply,
            } => {
                TOUCH_REQUESTS.increment();
                match orca.touch(key, exptime).await {
                    Ok(outcome) => {
                        if !noreply {
                            match outcome {
                                TouchOutcome::Touched => text::write_touched(&mut wbuf),
                                TouchOutcome::NotFound => text::write_not_found(&mut wbuf),
                            }
                        }
                    }
                    Err(e) => return backend_failure(writer, &mut wbuf, e).await,
                }
            }
            Command::Version => {
                text::write_version(&mut wbuf, VERSION);
            }
            Command::Quit => {
                return Ok(SessionEnd::Closed);
            }
            Command::Unknown => {
                text::write_error(&mut wbuf);
            }
        }

        flush(writer, &wbuf).await?;
    }
}

/// Run the binary protocol loop until the connection ends.
pub async fn run_binary<R, W, L1, L2>(
    reader: &mut R,
    writer: &mut W,
    orca: &mut Orchestrator<L1, L2>,
) -> io::Result<SessionEnd>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    L1: Handler,
    L2: Handler,
{
    let mut head = [0u8; HEADER_SIZE];
    let mut wbuf = BytesMut::with_capacity(16 * 1024);

    loop {
        match reader.read_exact(&mut head).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(SessionEnd::Closed),
            Err(e) => return Err(e),
        }
        let header = match RequestHeader::parse(&head) {
            Ok(header) => header,
            Err(_) => {
                // framing is gone; nothing trustworthy to echo back
                PARSE_ERRORS.increment();
                return Ok(SessionEnd::Malformed);
            }
        };
        let mut body = vec![0u8; header.body_len as usize];
        reader.read_exact(&mut body).await?;
        BYTES_IN.add((HEADER_SIZE + body.len()) as u64);

        wbuf.clear();
        let Some(opcode) = Opcode::from_u8(header.opcode) else {
            binary::write_status(&mut wbuf, header.opcode, Status::UnknownCommand, header.opaque);
            flush(writer, &wbuf).await?;
            continue;
        };
        let (extras, key, value) = header.split_body(&body);

        match opcode {
            Opcode::Get | Opcode::GetQ | Opcode::GetK | Opcode::GetKQ => {
                GET_REQUESTS.increment();
                match orca.get(key).await {
                    Ok(GetOutcome::Hit { flags, value }) => {
                        HITS.increment();
                        let echoed = if opcode.echoes_key() { key } else { &[] };
                        binary::write_value(&mut wbuf, header.opcode, header.opaque, flags, echoed, &value);
                    }
                    Ok(GetOutcome::Miss) => {
                        MISSES.increment();
                        if !opcode.is_quiet() {
                            binary::write_status(
                                &mut wbuf,
                                header.opcode,
                                Status::KeyNotFound,
                                header.opaque,
                            );
                        }
                    }
                    Err(e) => return binary_backend_failure(writer, &mut wbuf, &header, e).await,
                }
            }
            Opcode::Gat | Opcode::GatQ => {
                GAT_REQUESTS.increment();
                let Ok(exptime) = parse_exptime_extras(extras) else {
                    return malformed_binary(writer, &mut wbuf, &header).await;
                };
                match orca.gat(key, exptime).await {
                    Ok(GetOutcome::Hit { flags, value }) => {
                        HITS.increment();
                        binary::write_value(&mut wbuf, header.opcode, header.opaque, flags, &[], &value);
                    }
                    Ok(GetOutcome::Miss) => {
                        MISSES.increment();
                        if !opcode.is_quiet() {
                            binary::write_status(
                                &mut wbuf,
                                header.opcode,
                                Status::KeyNotFound,
                                header.opaque,
                            );
                        }
                    }
                    Err(e) => return binary_backend_failure(writer, &mut wbuf, &header, e).await,
                }
            }
            Opcode::Set | Opcode::Add | Opcode::Replace => {
                SET_REQUESTS.increment();
                let Ok(extras) = StoreExtras::parse(extras) else {
                    return malformed_binary(writer, &mut wbuf, &header).await;
                };
                let verb = match opcode {
                    Opcode::Set => StoreVerb::Set,
                    Opcode::Add => StoreVerb::Add,
                    _ => StoreVerb::Replace,
                };
                match orca.store(verb, key, extras.flags, extras.exptime, value).await {
                    Ok(outcome) => {
                        let status = match outcome {
                            StoreOutcome::Stored => Status::Ok,
                            StoreOutcome::NotStored => Status::NotStored,
                            StoreOutcome::Exists => Status::KeyExists,
                            StoreOutcome::NotFound => Status::KeyNotFound,
                        };
                        binary::write_status(&mut wbuf, header.opcode, status, header.opaque);
                    }
                    Err(e) => return binary_backend_failure(writer, &mut wbuf, &header, e).await,
                }
            }
            Opcode::Delete => {
                DELETE_REQUESTS.increment();
                match orca.delete(key).await {
                    Ok(outcome) => {
                        let status = match outcome {
                            DeleteOutcome::Deleted => Status::Ok,
                            DeleteOutcome::NotFound => Status::KeyNotFound,
                        };
                        binary::write_status(&mut wbuf, header.opcode, status, header.opaque);
                    }
                    Err(e) => return binary_backend_failure(writer, &mut wbuf, &header, e).await,
                }
            }
            Opcode::Touch => {
                TOUCH_REQUESTS.increment();
                let Ok(exptime) = parse_exptime_extras(extras) else {
                    return malformed_binary(writer, &mut wbuf, &header).await;
                };
                match orca.touch(key, exptime).await {
                    Ok(outcome) => {
                        let status = match outcome {
                            TouchOutcome::Touched => Status::Ok,
                            TouchOutcome::NotFound => Status::KeyNotFound,
                        };
                        binary::write_status(&mut wbuf, header.opcode, status, header.opaque);
                    }
                    Err(e) => return binary_backend_failure(writer, &mut wbuf, &header, e).await,
                }
            }
            Opcode::Noop => {
                binary::write_status(&mut wbuf, header.opcode, Status::Ok, header.opaque);
            }
            Opcode::Version => {
                binary::write_response(
                    &mut wbuf,
                    header.opcode,
                    Status::Ok,
                    header.opaque,
                    &[],
                    &[],
                    VERSION.as_bytes(),
                );
            }
            Opcode::Quit => {
                binary::write_status(&mut wbuf, header.opcode, Status::Ok, header.opaque);
                flush(writer, &wbuf).await?;
                return Ok(SessionEnd::Closed);
            }
            Opcode::QuitQ => {
                return Ok(SessionEnd::Closed);
            }
        }

        flush(writer, &wbuf).await?;
    }
}

async fn flush<W: AsyncWrite + Unpin>(writer: &mut W, wbuf: &BytesMut) -> io::Result<()> {
    if wbuf.is_empty() {
        return Ok(());
    }
    writer.write_all(wbuf).await?;
    writer.flush().await?;
    BYTES_OUT.add(wbuf.len() as u64);
    Ok(())
}

/// Reply `SERVER_ERROR` with a terse diagnostic and end the session. Derived
/// key names never appear in the reply; the detail goes to the log.
async fn backend_failure<W: AsyncWrite + Unpin>(
    writer: &mut W,
    wbuf: &mut BytesMut,
    error: BackendError,
) -> io::Result<SessionEnd> {
    BACKEND_ERRORS.increment();
    tracing::error!(error = %error, "backend failure");
    wbuf.clear();
    text::write_server_error(wbuf, "backend failure");
    let _ = flush(writer, wbuf).await;
    Ok(SessionEnd::Backend(error))
}

async fn binary_backend_failure<W: AsyncWrite + Unpin>(
    writer: &mut W,
    wbuf: &mut BytesMut,
    header: &RequestHeader,
    error: BackendError,
) -> io::Result<SessionEnd> {
    BACKEND_ERRORS.increment();
    tracing::error!(error = %error, "backend failure");
    wbuf.clear();
    binary::write_status(wbuf, header.opcode, Status::InternalError, header.opaque);
    let _ = flush(writer, wbuf).await;
    Ok(SessionEnd::Backend(error))
}

async fn malformed_binary<W: AsyncWrite + Unpin>(
    writer: &mut W,
    wbuf: &mut BytesMut,
    header: &RequestHeader,
) -> io::Result<SessionEnd> {
    PARSE_ERRORS.increment();
    wbuf.clear();
    binary::write_status(wbuf, header.opcode, Status::InvalidArguments, header.opaque);
    let _ = flush(writer, wbuf).await;
    Ok(SessionEnd::Malformed)
}
