//! Two-tier request sequencing.
//!
//! L1 is the local tier, consulted first on reads; L2 is the remote,
//! authoritative tier, written first on writes. A single-tier deployment
//! wires both slots to the same backend and everything below still holds.

use protocol_memcache::text::StoreVerb;
use std::sync::Arc;
use tracing::warn;

use crate::backend::{
    BackendError, DeleteOutcome, GetOutcome, Handler, StoreOutcome, TouchOutcome,
};
use crate::chunk::ChunkStore;
use crate::token::TokenSource;

/// Sequences one connection's logical requests across the two tiers.
pub struct Orchestrator<L1, L2> {
    l1: ChunkStore<L1>,
    l2: ChunkStore<L2>,
    tokens: Arc<TokenSource>,
}

impl<L1: Handler, L2: Handler> Orchestrator<L1, L2> {
    pub fn new(l1: ChunkStore<L1>, l2: ChunkStore<L2>, tokens: Arc<TokenSource>) -> Self {
        Self { l1, l2, tokens }
    }

    /// Write L2 first; only an L2 success is reported as stored. The L1
    /// copy is a plain set (repopulation) and its failure is not the
    /// client's problem: the next read falls through to L2.
    pub async fn store(
        &mut self,
        verb: StoreVerb,
        key: &[u8],
        flags: u32,
        exptime: u32,
        value: &[u8],
    ) -> Result<StoreOutcome, BackendError> {
        let outcome = self
            .l2
            .store(verb, key, flags, exptime, value, &self.tokens)
            .await?;
        if outcome != StoreOutcome::Stored {
            return Ok(outcome);
        }

        if let Err(e) = self
            .l1
            .store(StoreVerb::Set, key, flags, exptime, value, &self.tokens)
            .await
        {
            warn!(error = %e, "l1 write failed after l2 success");
        }
        Ok(StoreOutcome::Stored)
    }

    /// Read L1 first; fall through to L2 on a miss (or an L1 failure) and
    /// repopulate L1 with what L2 returned before replying.
    pub async fn get(&mut self, key: &[u8]) -> Result<GetOutcome, BackendError> {
        match self.l1.get(key).await {
            Ok(hit @ GetOutcome::Hit { .. }) => return Ok(hit),
            Ok(GetOutcome::Miss) => {}
            Err(e) => warn!(error = %e, "l1 read failed, trying l2"),
        }

        match self.l2.get(key).await? {
            GetOutcome::Hit { flags, value } => {
                if let Err(e) = self
                    .l1
                    .store(StoreVerb::Set, key, flags, 0, &value, &self.tokens)
                    .await
                {
                    warn!(error = %e, "l1 populate failed");
                }
                Ok(GetOutcome::Hit { flags, value })
            }
            GetOutcome::Miss => Ok(GetOutcome::Miss),
        }
    }

    /// Delete from both tiers. Deleted if either tier had the key; a tier
    /// failure surfaces only when the other tier did not delete.
    pub async fn delete(&mut self, key: &[u8]) -> Result<DeleteOutcome, BackendError> {
        let l1 = self.l1.delete(key).await;
        let l2 = self.l2.delete(key).await;
        match (l1, l2) {
            (Ok(DeleteOutcome::Deleted), _) | (_, Ok(DeleteOutcome::Deleted)) => {
                Ok(DeleteOutcome::Deleted)
            }
            (_, Err(e)) => Err(e),
            (Err(e), _) => Err(e),
            (Ok(DeleteOutcome::NotFound), Ok(DeleteOutcome::NotFound)) => {
                Ok(DeleteOutcome::NotFound)
            }
        }
    }

    /// Touch both tiers; L2 decides the outcome.
    pub async fn touch(&mut self, key: &[u8], exptime: u32) -> Result<TouchOutcome, BackendError> {
        if let Err(e) = self.l1.touch(key, exptime).await {
            warn!(error = %e, "l1 touch failed");
        }
        self.l2.touch(key, exptime).await
    }

    /// Get-and-touch. An L1 hit still extends L2's expiration so the
    /// authoritative copy does not outlive its local one; an L1 miss falls
    /// through to an L2 GAT and repopulates L1 with the extended TTL.
    pub async fn gat(&mut self, key: &[u8], exptime: u32) -> Result<GetOutcome, BackendError> {
        match self.l1.gat(key, exptime).await {
            Ok(hit @ GetOutcome::Hit { .. }) => {
                if let Err(e) = self.l2.touch(key, exptime).await {
                    warn!(error = %e, "l2 touch failed after l1 gat hit");
                }
                return Ok(hit);
            }
            Ok(GetOutcome::Miss) => {}
            Err(e) => warn!(error = %e, "l1 gat failed, trying l2"),
        }

        match self.l2.gat(key, exptime).await? {
            GetOutcome::Hit { flags, value } => {
                if let Err(e) = self
                    .l1
                    .store(StoreVerb::Set, key, flags, exptime, &value, &self.tokens)
                    .await
                {
                    warn!(error = %e, "l1 populate failed");
                }
                Ok(GetOutcome::Hit { flags, value })
            }
            GetOutcome::Miss => Ok(GetOutcome::Miss),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Connect, MemoryBackend, MemoryHandler};

    async fn orchestrator(
        l1: &MemoryBackend,
        l2: &MemoryBackend,
    ) -> Orchestrator<MemoryHandler, MemoryHandler> {
        Orchestrator::new(
            ChunkStore::new(l1.connect().await.unwrap(), 8),
            ChunkStore::new(l2.connect().await.unwrap(), 8),
            Arc::new(TokenSource::new()),
        )
    }

    #[tokio::test]
    async fn store_writes_both_tiers() {
        let (l1, l2) = (MemoryBackend::new(), MemoryBackend::new());
        let mut orca = orchestrator(&l1, &l2).await;

        orca.store(StoreVerb::Set, b"k", 0, 0, &vec![1u8; 20])
            .await
            .unwrap();
        assert!(l1.contains(b"k_meta"));
        assert!(l2.contains(b"k_meta"));
    }

    #[tokio::test]
    async fn get_prefers_l1() {
        let (l1, l2) = (MemoryBackend::new(), MemoryBackend::new());
        let mut orca = orchestrator(&l1, &l2).await;

        // seed the tiers with different values under the same key
        let mut seed_l1 = orchestrator(&l1, &l1).await;
        seed_l1
            .store(StoreVerb::Set, b"k", 0, 0, b"local")
            .await
            .unwrap();
        let mut seed_l2 = orchestrator(&l2, &l2).await;
        seed_l2
            .store(StoreVerb::Set, b"k", 0, 0, b"remote")
            .await
            .unwrap();

        match orca.get(b"k").await.unwrap() {
            GetOutcome::Hit { value, .. } => assert_eq!(value, b"local"),
            GetOutcome::Miss => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn l2_hit_populates_l1() {
        let (l1, l2) = (MemoryBackend::new(), MemoryBackend::new());

        let mut seed = orchestrator(&l2, &l2).await;
        seed.store(StoreVerb::Set, b"k", 5, 0, b"payload")
            .await
            .unwrap();

        let mut orca = orchestrator(&l1, &l2).await;
        match orca.get(b"k").await.unwrap() {
            GetOutcome::Hit { flags, value } => {
                assert_eq!(flags, 5);
                assert_eq!(value, b"payload");
            }
            GetOutcome::Miss => panic!("expected hit"),
        }
        assert!(l1.contains(b"k_meta"));

        // now served locally
        match orca.get(b"k").await.unwrap() {
            GetOutcome::Hit { value, .. } => assert_eq!(value, b"payload"),
            GetOutcome::Miss => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn miss_in_both_tiers() {
        let (l1, l2) = (MemoryBackend::new(), MemoryBackend::new());
        let mut orca = orchestrator(&l1, &l2).await;
        assert_eq!(orca.get(b"nope").await.unwrap(), GetOutcome::Miss);
    }

    #[tokio::test]
    async fn delete_covers_both_tiers() {
        let (l1, l2) = (MemoryBackend::new(), MemoryBackend::new());
        let mut orca = orchestrator(&l1, &l2).await;

        orca.store(StoreVerb::Set, b"k", 0, 0, b"v").await.unwrap();
        assert_eq!(orca.delete(b"k").await.unwrap(), DeleteOutcome::Deleted);
        assert!(l1.is_empty());
        assert!(l2.is_empty());
        assert_eq!(orca.delete(b"k").await.unwrap(), DeleteOutcome::NotFound);
    }

    #[tokio::test]
    async fn delete_present_only_in_l2() {
        let (l1, l2) = (MemoryBackend::new(), MemoryBackend::new());
        let mut seed = orchestrator(&l2, &l2).await;
        seed.store(StoreVerb::Set, b"k", 0, 0, b"v").await.unwrap();

        let mut orca = orchestrator(&l1, &l2).await;
        assert_eq!(orca.delete(b"k").await.unwrap(), DeleteOutcome::Deleted);
        assert!(l2.is_empty());
    }

    #[tokio::test]
    async fn touch_follows_l2() {
        let (l1, l2) = (MemoryBackend::new(), MemoryBackend::new());
        let mut orca = orchestrator(&l1, &l2).await;

        orca.store(StoreVerb::Set, b"k", 0, 1, b"v").await.unwrap();
        assert_eq!(orca.touch(b"k", 60).await.unwrap(), TouchOutcome::Touched);
        assert_eq!(l2.exptime(b"k_meta"), Some(60));
        assert_eq!(l1.exptime(b"k_meta"), Some(60));

        assert_eq!(
            orca.touch(b"absent", 60).await.unwrap(),
            TouchOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn gat_extends_both_tiers() {
        let (l1, l2) = (MemoryBackend::new(), MemoryBackend::new());
        let mut orca = orchestrator(&l1, &l2).await;

        orca.store(StoreVerb::Set, b"k", 0, 1, b"v").await.unwrap();
        match orca.gat(b"k", 120).await.unwrap() {
            GetOutcome::Hit { value, .. } => assert_eq!(value, b"v"),
            GetOutcome::Miss => panic!("expected hit"),
        }
        assert_eq!(l1.exptime(b"k_meta"), Some(120));
        assert_eq!(l2.exptime(b"k_meta"), Some(120));
    }
}
