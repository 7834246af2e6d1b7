//! Memcached text-protocol backend connection.

use bytes::BytesMut;
use protocol_memcache::text::{self, ReplyLine, StoreVerb};
use std::io;
use std::net::SocketAddr;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
    ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;

use super::{
    BackendError, Connect, DeleteOutcome, GetOutcome, Handler, StoreOutcome, TouchOutcome,
};

/// One reply line with its borrowed fields copied out, so the line buffer
/// can be reused for the data block read that may follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Touched,
    End,
    Value { flags: u32, bytes: usize },
}

/// A buffered single-connection client speaking the memcached text protocol.
///
/// Requests are written and flushed before the reply is read; one request is
/// in flight at a time.
pub struct TextConn<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: BufWriter<WriteHalf<S>>,
    wbuf: BytesMut,
    line: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Send> TextConn<S> {
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            wbuf: BytesMut::with_capacity(4096),
            line: Vec::with_capacity(256),
        }
    }

    async fn flush_request(&mut self) -> Result<(), BackendError> {
        self.writer.write_all(&self.wbuf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<Reply, BackendError> {
        self.line.clear();
        let n = self.reader.read_until(b'\n', &mut self.line).await?;
        if n == 0 {
            return Err(BackendError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        let mut end = self.line.len();
        while end > 0 && matches!(self.line[end - 1], b'\r' | b'\n') {
            end -= 1;
        }
        match text::parse_reply_line(&self.line[..end]).map_err(|_| BackendError::Protocol)? {
            ReplyLine::Stored => Ok(Reply::Stored),
            ReplyLine::NotStored => Ok(Reply::NotStored),
            ReplyLine::Exists => Ok(Reply::Exists),
            ReplyLine::NotFound => Ok(Reply::NotFound),
            ReplyLine::Deleted => Ok(Reply::Deleted),
            ReplyLine::Touched => Ok(Reply::Touched),
            ReplyLine::End => Ok(Reply::End),
            ReplyLine::Value { flags, bytes, .. } => Ok(Reply::Value { flags, bytes }),
            ReplyLine::Error => Err(BackendError::Server("ERROR".to_string())),
            ReplyLine::ClientError(reason) | ReplyLine::ServerError(reason) => Err(
                BackendError::Server(String::from_utf8_lossy(reason).into_owned()),
            ),
            ReplyLine::Version(_) => Err(BackendError::Protocol),
        }
    }

    /// Read the data block and terminating `END` that follow a VALUE line.
    async fn read_value_body(&mut self, bytes: usize) -> Result<Vec<u8>, BackendError> {
        let mut value = vec![0u8; bytes];
        self.reader.read_exact(&mut value).await?;
        let mut crlf = [0u8; 2];
        self.reader.read_exact(&mut crlf).await?;
        if crlf != *b"\r\n" {
            return Err(BackendError::Protocol);
        }
        match self.read_reply().await? {
            Reply::End => Ok(value),
            _ => Err(BackendError::Protocol),
        }
    }

    async fn fetch(&mut self) -> Result<GetOutcome, BackendError> {
        self.flush_request().await?;
        match self.read_reply().await? {
            Reply::End => Ok(GetOutcome::Miss),
            Reply::Value { flags, bytes } => {
                let value = self.read_value_body(bytes).await?;
                Ok(GetOutcome::Hit { flags, value })
            }
            _ => Err(BackendError::Protocol),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Send> Handler for TextConn<S> {
    async fn store(
        &mut self,
        verb: StoreVerb,
        key: &[u8],
        flags: u32,
        exptime: u32,
        value: &[u8],
    ) -> Result<StoreOutcome, BackendError> {
        self.wbuf.clear();
        text::encode_store_line(&mut self.wbuf, verb, key, flags, exptime, value.len());
        self.writer.write_all(&self.wbuf).await?;
        self.writer.write_all(value).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        match self.read_reply().await? {
            Reply::Stored => Ok(StoreOutcome::Stored),
            Reply::NotStored => Ok(StoreOutcome::NotStored),
            Reply::Exists => Ok(StoreOutcome::Exists),
            Reply::NotFound => Ok(StoreOutcome::NotFound),
            _ => Err(BackendError::Protocol),
        }
    }

    async fn get(&mut self, key: &[u8]) -> Result<GetOutcome, BackendError> {
        self.wbuf.clear();
        text::encode_get(&mut self.wbuf, key);
        self.fetch().await
    }

    async fn delete(&mut self, key: &[u8]) -> Result<DeleteOutcome, BackendError> {
        self.wbuf.clear();
        text::encode_delete(&mut self.wbuf, key);
        self.flush_request().await?;
        match self.read_reply().await? {
            Reply::Deleted => Ok(DeleteOutcome::Deleted),
            Reply::NotFound => Ok(DeleteOutcome::NotFound),
            _ => Err(BackendError::Protocol),
        }
    }

    async fn touch(&mut self, key: &[u8], exptime: u32) -> Result<TouchOutcome, BackendError> {
        self.wbuf.clear();
        text::encode_touch(&mut self.wbuf, key, exptime);
        self.flush_request().await?;
        match self.read_reply().await? {
            Reply::Touched => Ok(TouchOutcome::Touched),
            Reply::NotFound => Ok(TouchOutcome::NotFound),
            _ => Err(BackendError::Protocol),
        }
    }

    async fn gat(&mut self, key: &[u8], exptime: u32) -> Result<GetOutcome, BackendError> {
        self.wbuf.clear();
        text::encode_gat(&mut self.wbuf, exptime, key);
        self.fetch().await
    }
}

/// Connects tier handlers to a memcached endpoint over TCP.
#[derive(Debug, Clone)]
pub struct TcpBackend {
    addr: SocketAddr,
}

impl TcpBackend {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl Connect for TcpBackend {
    type Handler = TextConn<TcpStream>;

    async fn connect(&self) -> io::Result<Self::Handler> {
        let stream = TcpStream::connect(self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(TextConn::new(stream))
    }
}
