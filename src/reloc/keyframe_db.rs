use std::{collections::BTreeMap, sync::Arc};

use parking_lot::RwLock;

use crate::{
    error::RelocError,
    reloc::frame::{FrameId, SharedFrame},
};

/// A stored keyframe together with the appearance descriptor computed when it
/// was inserted.
pub struct Keyframe<D> {
    pub frame: SharedFrame,
    pub descriptor: D,
}

impl<D> Keyframe<D> {
    pub fn id(&self) -> FrameId {
        self.frame.id()
    }
}

struct Entries<D> {
    keyframes: Vec<Arc<Keyframe<D>>>,
    by_id: BTreeMap<FrameId, usize>,
}

/// Append-only store of keyframes, keyed by frame id.
///
/// Readers get `Arc` snapshots of individual keyframes, so a long verification
/// never holds the lock.
pub struct KeyframeDatabase<D> {
    entries: RwLock<Entries<D>>,
}

impl<D> Default for KeyframeDatabase<D> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Entries {
                keyframes: Vec::new(),
                by_id: BTreeMap::new(),
            }),
        }
    }
}

impl<D> KeyframeDatabase<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a keyframe and the descriptor computed from it. Returns the slot
    /// the keyframe now occupies.
    pub fn insert(&self, frame: SharedFrame, descriptor: D) -> Result<usize, RelocError> {
        let id = frame.id();
        let mut entries = self.entries.write();
        if entries.by_id.contains_key(&id) {
            return Err(RelocError::DuplicateId(id));
        }

        let slot = entries.keyframes.len();
        entries.keyframes.push(Arc::new(Keyframe { frame, descriptor }));
        entries.by_id.insert(id, slot);
        Ok(slot)
    }

    pub fn get(&self, id: FrameId) -> Result<Arc<Keyframe<D>>, RelocError> {
        let entries = self.entries.read();
        entries
            .by_id
            .get(&id)
            .map(|&slot| Arc::clone(&entries.keyframes[slot]))
            .ok_or(RelocError::NotFound(id))
    }

    pub fn contains(&self, id: FrameId) -> bool {
        self.entries.read().by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().keyframes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of every stored keyframe, ascending.
    pub fn entries(&self) -> Vec<FrameId> {
        self.entries.read().by_id.keys().copied().collect()
    }
}
