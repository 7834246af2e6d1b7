//! Chunked storage over a backend handler.
//!
//! One logical item is stored as a fixed-size metadata record plus a run of
//! uniformly sized chunk items. Every chunk carries a 16-byte token prefix
//! matching the token in the metadata record, which is how a read detects
//! chunks left behind by a different write. Metadata is written before any
//! chunk and deleted before any chunk: a reader that finds no metadata, or
//! metadata with a missing or mismatched chunk, reports a clean miss.

use protocol_memcache::text::StoreVerb;

use crate::backend::{
    BackendError, DeleteOutcome, GetOutcome, Handler, StoreOutcome, TouchOutcome,
};
use crate::metrics::INVARIANT_VIOLATIONS;
use crate::token::{TOKEN_SIZE, TokenSource};

/// Size of the packed metadata record.
pub const METADATA_SIZE: usize = 32;

/// Metadata record stored under the derived `_meta` key.
///
/// Packed little-endian; `chunk_size` is recorded per item so values remain
/// readable across reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub length: i32,
    pub orig_flags: i32,
    pub num_chunks: i32,
    pub chunk_size: i32,
    pub token: [u8; TOKEN_SIZE],
}

impl Metadata {
    pub fn pack(&self) -> [u8; METADATA_SIZE] {
        let mut buf = [0u8; METADATA_SIZE];
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.orig_flags.to_le_bytes());
        buf[8..12].copy_from_slice(&self.num_chunks.to_le_bytes());
        buf[12..16].copy_from_slice(&self.chunk_size.to_le_bytes());
        buf[16..32].copy_from_slice(&self.token);
        buf
    }

    pub fn unpack(buf: &[u8]) -> Option<Self> {
        if buf.len() != METADATA_SIZE {
            return None;
        }
        let mut token = [0u8; TOKEN_SIZE];
        token.copy_from_slice(&buf[16..32]);
        Some(Self {
            length: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            orig_flags: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
            num_chunks: i32::from_le_bytes(buf[8..12].try_into().unwrap()),
            chunk_size: i32::from_le_bytes(buf[12..16].try_into().unwrap()),
            token,
        })
    }

    /// Arithmetic self-check: the recorded chunks must cover the recorded
    /// length. Records that fail are treated as misses, never assembled.
    fn is_coherent(&self) -> bool {
        if self.length < 0 || self.num_chunks < 0 || self.chunk_size <= 0 {
            return false;
        }
        self.num_chunks as u64 * self.chunk_size as u64 >= self.length as u64
    }
}

/// Derived key for the metadata item.
pub fn meta_key(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 5);
    out.extend_from_slice(key);
    out.extend_from_slice(b"_meta");
    out
}

/// Derived key for chunk `index`.
pub fn chunk_key(key: &[u8], index: u32) -> Vec<u8> {
    let mut digits = itoa::Buffer::new();
    let index = digits.format(index).as_bytes();
    let mut out = Vec::with_capacity(key.len() + 1 + index.len());
    out.extend_from_slice(key);
    out.push(b'_');
    out.extend_from_slice(index);
    out
}

/// Chunked view of one backend tier.
///
/// Expands each logical operation into metadata and chunk sub-operations
/// against the tier's handler, aborting on the first backend failure.
#[derive(Debug)]
pub struct ChunkStore<H> {
    handler: H,
    chunk_size: usize,
}

impl<H: Handler> ChunkStore<H> {
    pub fn new(handler: H, chunk_size: usize) -> Self {
        Self {
            handler,
            chunk_size,
        }
    }

    /// Store one logical item as metadata plus chunks.
    ///
    /// The client's verb applies to the metadata item only, so existence
    /// semantics are decided by the backend in one operation; chunks are
    /// always plain sets. A non-Stored metadata outcome returns before any
    /// chunk is written. On a chunk failure the operation aborts with no
    /// rollback: the already-written items age out by TTL and can never be
    /// assembled, because a reader requires every chunk to be present.
    pub async fn store(
        &mut self,
        verb: StoreVerb,
        key: &[u8],
        flags: u32,
        exptime: u32,
        value: &[u8],
        tokens: &TokenSource,
    ) -> Result<StoreOutcome, BackendError> {
        let num_chunks = value.len().div_ceil(self.chunk_size);
        let token = tokens.next();
        let metadata = Metadata {
            length: value.len() as i32,
            orig_flags: flags as i32,
            num_chunks: num_chunks as i32,
            chunk_size: self.chunk_size as i32,
            token,
        };

        let outcome = self
            .handler
            .store(verb, &meta_key(key), 0, exptime, &metadata.pack())
            .await?;
        if outcome != StoreOutcome::Stored {
            return Ok(outcome);
        }

        let mut chunk = vec![0u8; TOKEN_SIZE + self.chunk_size];
        chunk[..TOKEN_SIZE].copy_from_slice(&token);
        for i in 0..num_chunks {
            let start = i * self.chunk_size;
            let end = usize::min(start + self.chunk_size, value.len());
            let payload = &mut chunk[TOKEN_SIZE..];
            payload[..end - start].copy_from_slice(&value[start..end]);
            payload[end - start..].fill(0);

            let outcome = self
                .handler
                .store(StoreVerb::Set, &chunk_key(key, i as u32), 0, exptime, &chunk)
                .await?;
            if outcome != StoreOutcome::Stored {
                return Err(BackendError::Server("chunk write refused".to_string()));
            }
        }
        Ok(StoreOutcome::Stored)
    }

    /// Fetch and reassemble one logical item.
    pub async fn get(&mut self, key: &[u8]) -> Result<GetOutcome, BackendError> {
        let Some(metadata) = self.read_metadata(key).await? else {
            return Ok(GetOutcome::Miss);
        };
        self.assemble(key, metadata, None).await
    }

    /// Fetch and reassemble, extending the expiration of every chunk and
    /// then the metadata. The metadata extension runs last so a concurrent
    /// reader that re-fetches metadata still finds every chunk present.
    pub async fn gat(&mut self, key: &[u8], exptime: u32) -> Result<GetOutcome, BackendError> {
        let Some(metadata) = self.read_metadata(key).await? else {
            return Ok(GetOutcome::Miss);
        };
        let outcome = self.assemble(key, metadata, Some(exptime)).await?;
        if matches!(outcome, GetOutcome::Miss) {
            return Ok(GetOutcome::Miss);
        }
        match self.handler.gat(&meta_key(key), exptime).await? {
            // The metadata vanished while we were reading: a concurrent
            // delete or eviction won the race. Report the miss it implies.
            GetOutcome::Miss => Ok(GetOutcome::Miss),
            GetOutcome::Hit { .. } => Ok(outcome),
        }
    }

    /// Remove one logical item. Metadata goes first, mirroring the write
    /// order; chunks already missing are not an error (they indicate an
    /// earlier partial write).
    pub async fn delete(&mut self, key: &[u8]) -> Result<DeleteOutcome, BackendError> {
        let Some(metadata) = self.read_metadata_for_removal(key).await? else {
            return Ok(DeleteOutcome::NotFound);
        };

        match self.handler.delete(&meta_key(key)).await? {
            DeleteOutcome::Deleted | DeleteOutcome::NotFound => {}
        }
        for i in 0..metadata.num_chunks as u32 {
            match self.handler.delete(&chunk_key(key, i)).await? {
                DeleteOutcome::Deleted | DeleteOutcome::NotFound => {}
            }
        }
        Ok(DeleteOutcome::Deleted)
    }

    /// Extend the expiration of one logical item: chunks first, metadata
    /// last, so a reader that finds refreshed metadata finds refreshed
    /// chunks too.
    pub async fn touch(&mut self, key: &[u8], exptime: u32) -> Result<TouchOutcome, BackendError> {
        let Some(metadata) = self.read_metadata(key).await? else {
            return Ok(TouchOutcome::NotFound);
        };

        for i in 0..metadata.num_chunks as u32 {
            match self.handler.touch(&chunk_key(key, i), exptime).await? {
                // Missing chunks belong to a partial write; the item is
                // already unreadable, so keep refreshing what exists.
                TouchOutcome::Touched | TouchOutcome::NotFound => {}
            }
        }
        self.handler.touch(&meta_key(key), exptime).await
    }

    /// Read and decode the metadata record; incoherent records count as
    /// misses.
    async fn read_metadata(&mut self, key: &[u8]) -> Result<Option<Metadata>, BackendError> {
        match self.handler.get(&meta_key(key)).await? {
            GetOutcome::Miss => Ok(None),
            GetOutcome::Hit { value, .. } => match Metadata::unpack(&value) {
                Some(metadata) if metadata.is_coherent() => Ok(Some(metadata)),
                _ => {
                    INVARIANT_VIOLATIONS.increment();
                    Ok(None)
                }
            },
        }
    }

    /// Like [`read_metadata`], but an incoherent record is still worth
    /// deleting: removing the metadata item stops the garbage being found.
    /// The dummy record's zero chunk count makes the delete loop a no-op.
    async fn read_metadata_for_removal(
        &mut self,
        key: &[u8],
    ) -> Result<Option<Metadata>, BackendError> {
        match self.handler.get(&meta_key(key)).await? {
            GetOutcome::Miss => Ok(None),
            GetOutcome::Hit { value, .. } => match Metadata::unpack(&value) {
                Some(metadata) if metadata.is_coherent() => Ok(Some(metadata)),
                _ => {
                    INVARIANT_VIOLATIONS.increment();
                    Ok(Some(Metadata {
                        length: 0,
                        orig_flags: 0,
                        num_chunks: 0,
                        chunk_size: 1,
                        token: [0; TOKEN_SIZE],
                    }))
                }
            },
        }
    }

    /// Read every chunk named by `metadata`, verify its token, and copy its
    /// payload into place. Slicing is driven by the record's own chunk
    /// size, not the configured one.
    async fn assemble(
        &mut self,
        key: &[u8],
        metadata: Metadata,
        extend: Option<u32>,
    ) -> Result<GetOutcome, BackendError> {
        let length = metadata.length as usize;
        let chunk_size = metadata.chunk_size as usize;
        let mut buffer = vec![0u8; length];

        for i in 0..metadata.num_chunks as u32 {
            let chunk = match extend {
                Some(exptime) => self.handler.gat(&chunk_key(key, i), exptime).await?,
                None => self.handler.get(&chunk_key(key, i)).await?,
            };
            let chunk = match chunk {
                GetOutcome::Miss => return Ok(GetOutcome::Miss),
                GetOutcome::Hit { value, .. } => value,
            };
            if chunk.len() < TOKEN_SIZE || chunk[..TOKEN_SIZE] != metadata.token {
                return Ok(GetOutcome::Miss);
            }

            // chunks past the recorded length are all padding; they are
            // still read and token-checked, but nothing is copied
            let start = usize::min(i as usize * chunk_size, length);
            let end = usize::min(start + chunk_size, length);
            if chunk.len() - TOKEN_SIZE < end - start {
                INVARIANT_VIOLATIONS.increment();
                return Ok(GetOutcome::Miss);
            }
            buffer[start..end].copy_from_slice(&chunk[TOKEN_SIZE..TOKEN_SIZE + (end - start)]);
        }

        Ok(GetOutcome::Hit {
            flags: metadata.orig_flags as u32,
            value: buffer,
        })
    }
}
