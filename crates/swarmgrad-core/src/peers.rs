//! Peer identities and the directory of reachable peer stores.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use swarmgrad_store::ObjectStore;
use tracing::debug;

/// Ledger-assigned participant id. Doubles as the storage `role_id`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(pub u16);

impl PeerId {
    /// Storage role id for this peer.
    pub fn role_id(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for PeerId {
    fn from(id: u16) -> Self {
        PeerId(id)
    }
}

/// Which peers can be read from and which took part recently.
///
/// A peer is *reachable* once its store is registered. Activity is refreshed
/// once per window from the ledger's candidate list; a peer that drops out is
/// remembered as inactive since that window until it reappears.
#[derive(Default)]
pub struct PeerDirectory {
    endpoints: BTreeMap<PeerId, Arc<ObjectStore>>,
    active: BTreeSet<PeerId>,
    inactive_since: BTreeMap<PeerId, u64>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, peer: PeerId, store: Arc<ObjectStore>) {
        self.endpoints.insert(peer, store);
    }

    pub fn unregister(&mut self, peer: PeerId) {
        self.endpoints.remove(&peer);
    }

    pub fn endpoint(&self, peer: PeerId) -> Option<Arc<ObjectStore>> {
        self.endpoints.get(&peer).cloned()
    }

    pub fn is_reachable(&self, peer: PeerId) -> bool {
        self.endpoints.contains_key(&peer)
    }

    pub fn reachable(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.endpoints.keys().copied()
    }

    /// Record this window's active set.
    pub fn refresh_activity(&mut self, window: u64, active: impl IntoIterator<Item = PeerId>) {
        let active: BTreeSet<PeerId> = active.into_iter().collect();
        for peer in self.active.difference(&active) {
            self.inactive_since.entry(*peer).or_insert(window);
        }
        for peer in &active {
            if self.inactive_since.remove(peer).is_some() {
                debug!(peer = %peer, window, "peer reactivated");
            }
        }
        self.active = active;
    }

    pub fn is_active(&self, peer: PeerId) -> bool {
        self.active.contains(&peer)
    }

    pub fn inactive_since(&self, peer: PeerId) -> Option<u64> {
        self.inactive_since.get(&peer).copied()
    }

    pub fn inactive(&self) -> impl Iterator<Item = (PeerId, u64)> + '_ {
        self.inactive_since.iter().map(|(p, w)| (*p, *w))
    }

    /// Candidates we can actually fetch from, in id order, excluding `own`.
    pub fn gather_peers(&self, candidates: &[PeerId], own: Option<PeerId>) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = candidates
            .iter()
            .copied()
            .filter(|p| Some(*p) != own && self.is_reachable(*p))
            .collect();
        peers.sort_unstable();
        peers.dedup();
        peers
    }

    /// Up to `n` reachable eligible peers chosen uniformly at random, sorted.
    pub fn sample_evaluation_peers<R: Rng + ?Sized>(
        &self,
        eligible: &[PeerId],
        n: usize,
        rng: &mut R,
    ) -> Vec<PeerId> {
        let pool = self.gather_peers(eligible, None);
        let mut sample: Vec<PeerId> = pool.choose_multiple(rng, n).copied().collect();
        sample.sort_unstable();
        sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use swarmgrad_store::fakes::MemoryBackend;

    fn store() -> Arc<ObjectStore> {
        Arc::new(ObjectStore::new(Arc::new(MemoryBackend::new()), "1", 5))
    }

    fn ids(raw: &[u16]) -> Vec<PeerId> {
        raw.iter().copied().map(PeerId).collect()
    }

    #[test]
    fn gather_peers_requires_endpoint_and_skips_self() {
        let mut dir = PeerDirectory::new();
        dir.register(PeerId(1), store());
        dir.register(PeerId(2), store());
        dir.register(PeerId(9), store());
        let peers = dir.gather_peers(&ids(&[9, 2, 3, 1, 2]), Some(PeerId(9)));
        assert_eq!(peers, ids(&[1, 2]));
    }

    #[test]
    fn activity_tracks_inactive_since() {
        let mut dir = PeerDirectory::new();
        dir.refresh_activity(1, ids(&[1, 2]));
        dir.refresh_activity(2, ids(&[1]));
        assert_eq!(dir.inactive_since(PeerId(2)), Some(2));
        dir.refresh_activity(3, ids(&[1]));
        assert_eq!(dir.inactive_since(PeerId(2)), Some(2));
        dir.refresh_activity(4, ids(&[1, 2]));
        assert_eq!(dir.inactive_since(PeerId(2)), None);
        assert!(dir.is_active(PeerId(2)));
    }

    #[test]
    fn evaluation_sample_is_bounded_subset() {
        let mut dir = PeerDirectory::new();
        for id in 1..=10 {
            dir.register(PeerId(id), store());
        }
        let eligible = ids(&[1, 2, 3, 4, 5, 6, 11]);
        let mut rng = StdRng::seed_from_u64(7);
        let sample = dir.sample_evaluation_peers(&eligible, 3, &mut rng);
        assert_eq!(sample.len(), 3);
        assert!(sample.iter().all(|p| eligible.contains(p) && p.0 != 11));
        assert!(sample.windows(2).all(|w| w[0] < w[1]));

        let all = dir.sample_evaluation_peers(&eligible, 100, &mut rng);
        assert_eq!(all, ids(&[1, 2, 3, 4, 5, 6]));
    }
}
