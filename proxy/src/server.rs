//! Connection server: listeners, accept loop, protocol detection.
//!
//! Each accepted connection gets its own task and its own pair of backend
//! handlers, so a slow backend stalls only the connection that hit it. The
//! first byte of the first request picks the codec for the connection's
//! whole lifetime.

use protocol_memcache::binary::REQUEST_MAGIC;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tracing::{debug, info, warn};

use crate::backend::{Connect, TcpBackend};
use crate::chunk::ChunkStore;
use crate::config::{Config, ListenerConfig};
use crate::metrics::{
    CONNECTIONS_ACTIVE, CONNECTIONS_EXTERNAL, CONNECTIONS_L1, CONNECTIONS_L2,
};
use crate::orchestrator::Orchestrator;
use crate::session::{self, SessionEnd};
use crate::token::TokenSource;

const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// Everything a connection task needs, cloned per accept.
#[derive(Clone)]
pub struct ServerContext<C1, C2> {
    pub l1: C1,
    pub l2: C2,
    pub chunk_size: usize,
    pub tokens: Arc<TokenSource>,
}

impl<C1: Connect, C2: Connect> ServerContext<C1, C2> {
    pub fn new(l1: C1, l2: C2, chunk_size: usize, tokens: Arc<TokenSource>) -> Self {
        Self {
            l1,
            l2,
            chunk_size,
            tokens,
        }
    }
}

/// Run the proxy with the given configuration until the shutdown flag is
/// set.
pub fn run(config: &Config, shutdown: Arc<AtomicBool>) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let l1 = TcpBackend::new(config.l1_address());
    let l2 = TcpBackend::new(config.l2.address);
    let ctx = ServerContext::new(
        l1,
        l2,
        config.chunking.chunk_size,
        Arc::new(TokenSource::new()),
    );
    let listener = config.listener.clone();

    runtime.block_on(async move {
        match listener {
            ListenerConfig::Tcp { port } => {
                let listener = TcpListener::bind(("0.0.0.0", port)).await?;
                info!(port, "listening on tcp");
                tokio::spawn(serve(listener, ctx));
            }
            ListenerConfig::Unix { path } => {
                // a stale socket file from a previous run refuses the bind
                let _ = std::fs::remove_file(&path);
                let listener = UnixListener::bind(&path)?;
                info!(path = %path.display(), "listening on unix socket");
                tokio::spawn(serve_unix(listener, ctx));
            }
        }

        while !shutdown.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("shutdown signal received");
        Ok::<(), io::Error>(())
    })?;

    Ok(())
}

/// Accept loop for a TCP listener.
pub async fn serve<C1: Connect, C2: Connect>(
    listener: TcpListener,
    ctx: ServerContext<C1, C2>,
) -> io::Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                CONNECTIONS_EXTERNAL.increment();
                if let Err(e) = configure_stream(&stream) {
                    warn!(error = %e, "failed to configure client socket");
                }
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    CONNECTIONS_ACTIVE.increment();
                    if let Err(e) = handle_connection(stream, ctx).await
                        && !is_connection_reset(&e)
                    {
                        debug!(client = %addr, error = %e, "connection error");
                    }
                    CONNECTIONS_ACTIVE.decrement();
                });
            }
            Err(e) => {
                warn!(error = %e, "accept error");
            }
        }
    }
}

/// Accept loop for a UNIX-domain listener.
pub async fn serve_unix<C1: Connect, C2: Connect>(
    listener: UnixListener,
    ctx: ServerContext<C1, C2>,
) -> io::Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                CONNECTIONS_EXTERNAL.increment();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    CONNECTIONS_ACTIVE.increment();
                    if let Err(e) = handle_connection(stream, ctx).await
                        && !is_connection_reset(&e)
                    {
                        debug!(error = %e, "connection error");
                    }
                    CONNECTIONS_ACTIVE.decrement();
                });
            }
            Err(e) => {
                warn!(error = %e, "accept error");
            }
        }
    }
}

fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Drive one client connection to completion.
///
/// Both tier handlers are constructed up front; if either construction
/// fails the client is dropped and whatever was built goes with it. The
/// handlers live exactly as long as the connection.
async fn handle_connection<S, C1, C2>(stream: S, ctx: ServerContext<C1, C2>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send,
    C1: Connect,
    C2: Connect,
{
    let l1 = match ctx.l1.connect().await {
        Ok(handler) => {
            CONNECTIONS_L1.increment();
            handler
        }
        Err(e) => {
            warn!(error = %e, "l1 connect failed, dropping client");
            return Ok(());
        }
    };
    let l2 = match ctx.l2.connect().await {
        Ok(handler) => {
            CONNECTIONS_L2.increment();
            handler
        }
        Err(e) => {
            warn!(error = %e, "l2 connect failed, dropping client");
            return Ok(());
        }
    };

    let mut orca = Orchestrator::new(
        ChunkStore::new(l1, ctx.chunk_size),
        ChunkStore::new(l2, ctx.chunk_size),
        ctx.tokens,
    );

    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    // Peek at the first byte without consuming it; the codec choice is
    // permanent for this connection.
    let first = {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(());
        }
        buf[0]
    };

    let end = if first == REQUEST_MAGIC {
        session::run_binary(&mut reader, &mut writer, &mut orca).await?
    } else {
        session::run_text(&mut reader, &mut writer, &mut orca).await?
    };

    match end {
        SessionEnd::Closed => {}
        SessionEnd::Malformed => debug!("connection closed after malformed request"),
        SessionEnd::Backend(error) => debug!(error = %error, "connection closed after backend failure"),
    }
    Ok(())
}

fn is_connection_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}
