//! Identity-keyed peer table and derived relationships.
//!
//! Records never point at each other. A parent is stored as an identity and
//! resolved through the table at read time; a reference that does not
//! resolve reads as "no parent".

use std::collections::BTreeMap;

use crate::{DomainError, DomainResult, PeerId, PeerRecord, PeerView};

/// All peers known to one process, including the local one.
#[derive(Debug, Clone)]
pub struct PeerTable {
    local_id: PeerId,
    peers: BTreeMap<PeerId, PeerRecord>,
}

impl PeerTable {
    /// Creates a table holding only the local record.
    ///
    /// # Errors
    /// `DomainError::NotLocal` if `local` is a mirror record.
    pub fn new(local: PeerRecord) -> DomainResult<Self> {
        if !local.is_local() {
            return Err(DomainError::NotLocal {
                peer_id: local.id().clone(),
            });
        }
        let local_id = local.id().clone();
        let mut peers = BTreeMap::new();
        peers.insert(local_id.clone(), local);
        Ok(Self { local_id, peers })
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Returns the local record.
    ///
    /// The local record is inserted at construction and never removed, so
    /// the lookup only fails on a corrupted table.
    pub fn local(&self) -> DomainResult<&PeerRecord> {
        self.peers
            .get(&self.local_id)
            .ok_or_else(|| DomainError::PeerNotFound {
                peer_id: self.local_id.clone(),
            })
    }

    pub fn local_mut(&mut self) -> DomainResult<&mut PeerRecord> {
        self.peers
            .get_mut(&self.local_id)
            .ok_or_else(|| DomainError::PeerNotFound {
                peer_id: self.local_id.clone(),
            })
    }

    pub fn is_local(&self, id: &PeerId) -> bool {
        &self.local_id == id
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &PeerId) -> Option<&mut PeerRecord> {
        self.peers.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Always false: the local record is always present.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    /// Inserts a mirror record for a peer not seen before.
    ///
    /// # Errors
    /// `DomainError::PeerAlreadyExists` if the identity is already known
    /// (including the local identity).
    pub fn insert_remote(&mut self, record: PeerRecord) -> DomainResult<()> {
        if self.peers.contains_key(record.id()) {
            return Err(DomainError::PeerAlreadyExists {
                peer_id: record.id().clone(),
            });
        }
        self.peers.insert(record.id().clone(), record);
        Ok(())
    }

    /// Removes a mirror record.
    ///
    /// # Errors
    /// - `DomainError::LocalPeerPermanent` for the local identity
    /// - `DomainError::PeerNotFound` if the identity is unknown
    pub fn remove(&mut self, id: &PeerId) -> DomainResult<PeerRecord> {
        if self.is_local(id) {
            return Err(DomainError::LocalPeerPermanent {
                peer_id: id.clone(),
            });
        }
        self.peers
            .remove(id)
            .ok_or_else(|| DomainError::PeerNotFound { peer_id: id.clone() })
    }

    // ========================================================================
    // Derived relationships
    // ========================================================================

    /// Resolves a peer's parent. Dangling references resolve to `None`.
    pub fn parent_of(&self, id: &PeerId) -> Option<&PeerRecord> {
        let parent_id = self.peers.get(id)?.state().parent_id.as_ref()?;
        self.peers.get(parent_id)
    }

    /// All peers naming `id` as parent. Full scan on every call.
    pub fn children_of(&self, id: &PeerId) -> Vec<&PeerRecord> {
        self.peers
            .values()
            .filter(|peer| peer.state().parent_id.as_ref() == Some(id))
            .collect()
    }

    /// All peers with no resolvable parent.
    pub fn orphans(&self) -> Vec<&PeerRecord> {
        self.peers
            .values()
            .filter(|peer| self.parent_of(peer.id()).is_none())
            .collect()
    }

    /// Builds a snapshot view with relationships resolved.
    pub fn view(&self, id: &PeerId) -> Option<PeerView> {
        let record = self.peers.get(id)?;
        let infra = record.infra();
        Some(PeerView {
            id: record.id().clone(),
            info: record.info().clone(),
            state: record.state().clone(),
            is_local: record.is_local(),
            parent: self.parent_of(id).map(|parent| parent.id().clone()),
            children: self
                .children_of(id)
                .into_iter()
                .map(|child| child.id().clone())
                .collect(),
            first_seen: infra.first_seen,
            last_update: infra.last_update,
            update_count: infra.update_count,
        })
    }

    /// Snapshot views of every peer, ordered by identity.
    pub fn views(&self) -> Vec<PeerView> {
        self.peers.keys().filter_map(|id| self.view(id)).collect()
    }
}
